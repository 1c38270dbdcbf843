//! Coordination store abstraction.
//!
//! The store holds one [`LeaseRecord`] per lock and provides compare-and-swap
//! writes: every update names the version it was based on, and the store
//! rejects it with [`StoreError::Conflict`] when that version is stale. This is
//! the only concurrency control between replicas.

#[cfg(feature = "kube")]
pub mod kube;
pub mod memory;

use async_trait::async_trait;

pub use crate::error::StoreError;
use crate::record::{LeaseRecord, LockId, Version};
pub use memory::MemoryStore;

/// A value together with the store version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Fetch the record, or `None` if it was never created.
    async fn get(&self, lock: &LockId) -> Result<Option<Versioned<LeaseRecord>>, StoreError>;

    /// Create the record. Fails with `Conflict` if it already exists.
    async fn create(&self, lock: &LockId, record: &LeaseRecord) -> Result<Version, StoreError>;

    /// Replace the record if its current version is still `expected`.
    async fn update(
        &self,
        lock: &LockId,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version, StoreError>;
}

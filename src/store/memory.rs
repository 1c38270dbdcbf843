//! In-process coordination store.
//!
//! Shared between candidates through an `Arc`, it gives the same atomic
//! compare-and-swap guarantees as a real store. Availability can be toggled to
//! simulate a partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CoordinationStore, StoreError, Versioned};
use crate::record::{LeaseRecord, LockId, Version};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<LockId, Versioned<LeaseRecord>>>,
    next_version: Mutex<u64>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable, every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Current contents, bypassing availability.
    pub fn snapshot(&self, lock: &LockId) -> Option<Versioned<LeaseRecord>> {
        self.lock_records().get(lock).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store partitioned".into()));
        }
        Ok(())
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<LockId, Versioned<LeaseRecord>>> {
        // A poisoned map is still consistent: every mutation is a single insert.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_version(&self) -> Version {
        let mut next = self.next_version.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        Version(next.to_string())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, lock: &LockId) -> Result<Option<Versioned<LeaseRecord>>, StoreError> {
        self.check_available()?;
        Ok(self.lock_records().get(lock).cloned())
    }

    async fn create(&self, lock: &LockId, record: &LeaseRecord) -> Result<Version, StoreError> {
        self.check_available()?;
        let mut records = self.lock_records();
        if records.contains_key(lock) {
            return Err(StoreError::Conflict);
        }
        let version = self.bump_version();
        records.insert(
            lock.clone(),
            Versioned {
                value: record.clone(),
                version: version.clone(),
            },
        );
        Ok(version)
    }

    async fn update(
        &self,
        lock: &LockId,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version, StoreError> {
        self.check_available()?;
        let mut records = self.lock_records();
        let current = records.get_mut(lock).ok_or(StoreError::NotFound)?;
        if &current.version != expected {
            return Err(StoreError::Conflict);
        }
        let version = self.bump_version();
        current.value = record.clone();
        current.version = version.clone();
        Ok(version)
    }
}

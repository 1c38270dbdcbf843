//! Kubernetes `Lease` backend.
//!
//! Records live in `coordination.k8s.io/v1` Lease objects. The object's
//! `resourceVersion` is the version token, and `replace` with that version set
//! is the compare-and-swap: the API server answers 409 when it is stale.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use log::debug;

use super::{CoordinationStore, StoreError, Versioned};
use crate::record::{LeaseRecord, LockId, Version};

#[derive(Clone)]
pub struct KubeLeaseStore {
    client: Client,
}

impl KubeLeaseStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn leases(&self, lock: &LockId) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &lock.namespace)
    }
}

#[async_trait]
impl CoordinationStore for KubeLeaseStore {
    async fn get(&self, lock: &LockId) -> Result<Option<Versioned<LeaseRecord>>, StoreError> {
        let lease = self
            .leases(lock)
            .get_opt(&lock.name)
            .await
            .map_err(classify)?;
        match lease {
            None => Ok(None),
            Some(lease) => {
                let version = resource_version(&lease)?;
                Ok(Some(Versioned {
                    value: record_from_lease(&lease),
                    version,
                }))
            }
        }
    }

    async fn create(&self, lock: &LockId, record: &LeaseRecord) -> Result<Version, StoreError> {
        let lease = lease_from_record(lock, record, None);
        let created = self
            .leases(lock)
            .create(&PostParams::default(), &lease)
            .await
            .map_err(classify)?;
        debug!("created lease {}", lock);
        resource_version(&created)
    }

    async fn update(
        &self,
        lock: &LockId,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version, StoreError> {
        let lease = lease_from_record(lock, record, Some(expected));
        let replaced = self
            .leases(lock)
            .replace(&lock.name, &PostParams::default(), &lease)
            .await
            .map_err(classify)?;
        resource_version(&replaced)
    }
}

fn resource_version(lease: &Lease) -> Result<Version, StoreError> {
    lease
        .metadata
        .resource_version
        .clone()
        .map(Version)
        .ok_or_else(|| StoreError::Unavailable("lease has no resourceVersion".into()))
}

/// Map an API failure onto the store taxonomy.
pub(crate) fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            409 => StoreError::Conflict,
            404 => StoreError::NotFound,
            400 | 401 | 403 | 422 => StoreError::Rejected(resp.message),
            _ => StoreError::Unavailable(resp.message),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}

pub(crate) fn record_from_lease(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.clone().unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity.unwrap_or_default(),
        lease_duration_seconds: spec
            .lease_duration_seconds
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(0),
        acquire_time: spec.acquire_time.map(|t| t.0).unwrap_or(DateTime::<Utc>::MIN_UTC),
        renew_time: spec.renew_time.map(|t| t.0).unwrap_or(DateTime::<Utc>::MIN_UTC),
        leader_transitions: spec
            .lease_transitions
            .and_then(|t| u32::try_from(t).ok())
            .unwrap_or(0),
    }
}

pub(crate) fn lease_from_record(lock: &LockId, record: &LeaseRecord, version: Option<&Version>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(lock.name.clone()),
            namespace: Some(lock.namespace.clone()),
            resource_version: version.map(|v| v.0.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(record.holder_identity.clone()),
            lease_duration_seconds: Some(i32::try_from(record.lease_duration_seconds).unwrap_or(i32::MAX)),
            acquire_time: Some(MicroTime(record.acquire_time)),
            renew_time: Some(MicroTime(record.renew_time)),
            lease_transitions: Some(i32::try_from(record.leader_transitions).unwrap_or(i32::MAX)),
            ..Default::default()
        }),
    }
}

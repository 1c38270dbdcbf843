//! Publishing the leader's address for service discovery.

#[cfg(feature = "kube")]
pub mod kube;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

pub use crate::error::RegistrarError;

/// One port of the published endpoint, in the shape of a Kubernetes
/// `EndpointPort`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
}

impl EndpointPort {
    /// Parse a JSON array of ports.
    pub fn parse_list(json: &str) -> Result<Vec<EndpointPort>, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The address record a leader publishes for its service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub name: String,
    pub namespace: String,
    pub address: String,
    pub node_name: Option<String>,
    pub ports: Vec<EndpointPort>,
}

#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    /// Make `endpoint` the only address of its service. Must be idempotent.
    async fn publish_address(&self, endpoint: &ServiceEndpoint) -> Result<(), RegistrarError>;
}

/// Publishes this instance's endpoint on each leadership gain, or does
/// nothing when no service is configured.
#[derive(Clone, Default)]
pub struct EndpointRegistrar {
    target: Option<(Arc<dyn ServiceRegistrar>, ServiceEndpoint)>,
}

impl EndpointRegistrar {
    pub fn new(registrar: Arc<dyn ServiceRegistrar>, endpoint: ServiceEndpoint) -> Self {
        Self {
            target: Some((registrar, endpoint)),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub async fn publish(&self) -> Result<(), RegistrarError> {
        let Some((registrar, endpoint)) = &self.target else {
            return Ok(());
        };
        registrar.publish_address(endpoint).await?;
        info!(
            "published {} as endpoint of service {}/{}",
            endpoint.address, endpoint.namespace, endpoint.name
        );
        Ok(())
    }
}

/// In-process registrar keyed by `(namespace, name)`.
#[derive(Debug, Default)]
pub struct MemoryRegistrar {
    records: Mutex<HashMap<(String, String), ServiceEndpoint>>,
    publishes: AtomicUsize,
}

impl MemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<ServiceEndpoint> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceRegistrar for MemoryRegistrar {
    async fn publish_address(&self, endpoint: &ServiceEndpoint) -> Result<(), RegistrarError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (endpoint.namespace.clone(), endpoint.name.clone()),
                endpoint.clone(),
            );
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

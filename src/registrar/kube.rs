//! Kubernetes `Endpoints` registrar.
//!
//! The leader writes a selector-less service's `Endpoints` object so that the
//! service routes to it. Create first; on `AlreadyExists` replace without a
//! resource version, which overwrites whatever a previous leader left.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort as KubeEndpointPort, EndpointSubset, Endpoints};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use log::debug;

use super::{RegistrarError, ServiceEndpoint, ServiceRegistrar};

#[derive(Clone)]
pub struct KubeEndpointsRegistrar {
    client: Client,
}

impl KubeEndpointsRegistrar {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceRegistrar for KubeEndpointsRegistrar {
    async fn publish_address(&self, endpoint: &ServiceEndpoint) -> Result<(), RegistrarError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &endpoint.namespace);
        let object = endpoints_object(endpoint);

        match api.create(&PostParams::default(), &object).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!("endpoints {}/{} exist, replacing", endpoint.namespace, endpoint.name);
            }
            Err(e) => return Err(classify(e)),
        }

        match api.replace(&endpoint.name, &PostParams::default(), &object).await {
            Ok(_) => Ok(()),
            // deleted between our create and replace
            Err(kube::Error::Api(resp)) if resp.code == 404 => api
                .create(&PostParams::default(), &object)
                .await
                .map(|_| ())
                .map_err(classify),
            Err(e) => Err(classify(e)),
        }
    }
}

fn classify(err: kube::Error) -> RegistrarError {
    match err {
        kube::Error::Api(resp) if matches!(resp.code, 400 | 401 | 403 | 422) => {
            RegistrarError::Rejected(resp.message)
        }
        kube::Error::Api(resp) => RegistrarError::Unavailable(resp.message),
        other => RegistrarError::Unavailable(other.to_string()),
    }
}

pub(crate) fn endpoints_object(endpoint: &ServiceEndpoint) -> Endpoints {
    let ports = endpoint
        .ports
        .iter()
        .map(|p| KubeEndpointPort {
            name: p.name.clone(),
            port: i32::from(p.port),
            protocol: p.protocol.clone(),
            app_protocol: p.app_protocol.clone(),
        })
        .collect();

    Endpoints {
        metadata: ObjectMeta {
            name: Some(endpoint.name.clone()),
            namespace: Some(endpoint.namespace.clone()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: endpoint.address.clone(),
                node_name: endpoint.node_name.clone(),
                ..Default::default()
            }]),
            ports: Some(ports),
            ..Default::default()
        }]),
    }
}

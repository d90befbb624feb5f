//! The mesh API the driver reconciles against.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::resources::*;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("mesh call timed out: {0}")]
    Timeout(String),

    #[error("mesh api error: {0}")]
    Api(String),

    #[error("mesh object conversion error: {0}")]
    Serialize(String),

    #[error("mesh client error: {0}")]
    Client(String),
}

impl MeshError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MeshError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, MeshError::AlreadyExists { .. })
    }
}

/// Deployment snapshots delivered by a watch, in event order.
pub type DeploymentStream = BoxStream<'static, MeshResult<Deployment>>;

/// Typed access to the Kubernetes and Istio objects of a namespace.
///
/// `get_*` returns `MeshError::NotFound` for a missing object and
/// `create_*` returns `MeshError::AlreadyExists` for a duplicate; callers
/// branch on both.
#[async_trait]
pub trait MeshApi: Send + Sync {
    async fn create_namespace(&self, namespace: &Namespace) -> MeshResult<()>;

    async fn get_service_account(&self, ns: &str, name: &str) -> MeshResult<ServiceAccount>;
    async fn create_service_account(&self, ns: &str, account: &ServiceAccount) -> MeshResult<()>;

    async fn get_deployment(&self, ns: &str, name: &str) -> MeshResult<Deployment>;
    async fn create_deployment(&self, ns: &str, deployment: &Deployment) -> MeshResult<()>;
    async fn update_deployment(&self, ns: &str, deployment: &Deployment) -> MeshResult<()>;

    /// Watch deployments matching a label selector. The stream starts with
    /// the current state of every match and ends when `timeout` elapses.
    async fn watch_deployments(
        &self,
        ns: &str,
        label_selector: &str,
        timeout: Duration,
    ) -> MeshResult<DeploymentStream>;

    async fn get_kube_service(&self, ns: &str, name: &str) -> MeshResult<KubeService>;
    async fn create_kube_service(&self, ns: &str, service: &KubeService) -> MeshResult<()>;
    async fn update_kube_service(&self, ns: &str, service: &KubeService) -> MeshResult<()>;

    async fn get_virtual_service(&self, ns: &str, name: &str) -> MeshResult<VirtualService>;
    async fn create_virtual_service(&self, ns: &str, vs: &VirtualService) -> MeshResult<()>;
    async fn update_virtual_service(&self, ns: &str, vs: &VirtualService) -> MeshResult<()>;

    async fn create_destination_rule(&self, ns: &str, rule: &DestinationRule) -> MeshResult<()>;

    async fn get_gateway(&self, ns: &str, name: &str) -> MeshResult<Gateway>;
    async fn create_gateway(&self, ns: &str, gateway: &Gateway) -> MeshResult<()>;
    async fn update_gateway(&self, ns: &str, gateway: &Gateway) -> MeshResult<()>;

    async fn get_authorization_policy(
        &self,
        ns: &str,
        name: &str,
    ) -> MeshResult<AuthorizationPolicy>;
    async fn create_authorization_policy(
        &self,
        ns: &str,
        policy: &AuthorizationPolicy,
    ) -> MeshResult<()>;
    async fn update_authorization_policy(
        &self,
        ns: &str,
        policy: &AuthorizationPolicy,
    ) -> MeshResult<()>;

    async fn get_sidecar(&self, ns: &str, name: &str) -> MeshResult<Sidecar>;
    async fn create_sidecar(&self, ns: &str, sidecar: &Sidecar) -> MeshResult<()>;
    async fn update_sidecar(&self, ns: &str, sidecar: &Sidecar) -> MeshResult<()>;
}

/// Parse a `k=v,k2=v2` equality selector.
pub fn parse_label_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

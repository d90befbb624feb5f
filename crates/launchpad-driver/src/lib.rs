//! launchpad-driver: reconciles services onto a Kubernetes/Istio mesh.
//!
//! `generate` turns a `Service` into mesh resources, `IstioDriver` applies
//! them through a `MeshApi` and owns replica scaling, including the
//! scale-to-zero redirect through the cold-start proxy.
//!
//! ```text
//! Cold ──adjust_scale(n > 0)──▶ Scaling ──replica ready──▶ Warm
//!  ▲                                                        │
//!  │                                          routes reverted│
//!  └────────adjust_scale(0), routes → proxy────── Steady ◀───┘
//! ```

pub mod generate;
pub mod istio;
pub mod kubernetes;
pub mod lock;
pub mod memory;
pub mod mesh;
pub mod resources;
pub mod routing;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use launchpad_core::{DriverConfig, Project, ScaleError, Service, ServiceKey};

pub use generate::{generate, GeneratorConfig};
pub use istio::IstioDriver;
pub use kubernetes::KubeMesh;
pub use lock::{ScaleGuard, ScaleLock};
pub use memory::InMemoryMesh;
pub use mesh::{MeshApi, MeshError, MeshResult};
pub use resources::MeshResources;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error("deployment {deployment} has an invalid {label} label: {value:?}")]
    InvalidScaleLabel {
        deployment: String,
        label: &'static str,
        value: Option<String>,
    },

    #[error("service {service} has an invalid scale policy: {source}")]
    InvalidScale {
        service: String,
        #[source]
        source: ScaleError,
    },

    #[error("service ({0}) could not be started")]
    ServiceNotStarted(ServiceKey),

    #[error("unknown driver type: {0}")]
    UnknownDriverType(String),
}

/// Deployment targets the runner can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    Istio,
}

impl DriverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::Istio => "istio",
        }
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverType {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "istio" => Ok(DriverType::Istio),
            other => Err(DriverError::UnknownDriverType(other.to_string())),
        }
    }
}

/// What an `adjust_scale` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// Another adjustment for the same service was in progress.
    Skipped,
    /// The deployment already runs the desired replica count.
    Unchanged,
    Scaled { from: u32, to: u32 },
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Create the namespace of a project. An existing namespace is not an
    /// error.
    async fn create_project(&self, project: &Project) -> DriverResult<()>;

    /// Create or update every mesh resource of a service.
    async fn apply_service(&self, service: &Service) -> DriverResult<()>;

    /// Size a service for `active_requests` concurrent requests.
    async fn adjust_scale(&self, key: &ServiceKey, active_requests: u64)
    -> DriverResult<ScaleOutcome>;

    /// Scale a service up from zero and wait until a replica is ready.
    async fn wait_for_service(&self, key: &ServiceKey) -> DriverResult<()>;

    fn driver_type(&self) -> DriverType;
}

/// Build the driver selected by `config.driver_type`.
pub fn new(config: &DriverConfig, mesh: Arc<dyn MeshApi>) -> DriverResult<Arc<dyn Driver>> {
    match config.driver_type.parse::<DriverType>()? {
        DriverType::Istio => Ok(Arc::new(IstioDriver::new(config.clone(), mesh))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_type_parsing() {
        assert_eq!("istio".parse::<DriverType>().unwrap(), DriverType::Istio);
        assert_eq!(DriverType::Istio.to_string(), "istio");
        assert!(matches!(
            "docker".parse::<DriverType>(),
            Err(DriverError::UnknownDriverType(_))
        ));
    }

    #[test]
    fn new_selects_istio() {
        let mesh: Arc<dyn MeshApi> = Arc::new(InMemoryMesh::new());
        let driver = new(&DriverConfig::default(), mesh.clone()).unwrap();
        assert_eq!(driver.driver_type(), DriverType::Istio);

        let config = DriverConfig {
            driver_type: "swarm".to_string(),
            ..Default::default()
        };
        assert!(new(&config, mesh).is_err());
    }
}

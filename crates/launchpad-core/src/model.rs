//! Shared types used across Launchpad crates.
//!
//! Everything here is part of the runner's JSON surface: services and
//! projects arrive through the front door, access events arrive from the
//! cold-start proxy and from metric reporters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Version assigned to services that don't name one.
pub const DEFAULT_VERSION: &str = "v1";

/// Requests a single replica is expected to absorb when unset.
pub const DEFAULT_CONCURRENCY: u32 = 50;

// ── Service ────────────────────────────────────────────────────────

/// Declarative description of a service deployed on the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub scale: ScaleConfig,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub whitelists: Vec<Whitelist>,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub runtime: Runtime,
}

impl Service {
    /// Fill in the defaults the reconciler relies on.
    pub fn normalize(&mut self) {
        if self.version.is_empty() {
            self.version = DEFAULT_VERSION.to_string();
        }
        if self.scale.concurrency == 0 {
            self.scale.concurrency = DEFAULT_CONCURRENCY;
        }
    }

    /// Identity used for scale decisions.
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.project_id, &self.id, &self.version)
    }
}

/// Replica policy of a service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScaleConfig {
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub min_replicas: u32,
    #[serde(default)]
    pub max_replicas: u32,
    /// Active requests a single replica should handle.
    #[serde(default)]
    pub concurrency: u32,
}

/// A scale policy the reconciler cannot honour.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    #[error("maxReplicas must be at least 1")]
    NoReplicas,

    #[error("minReplicas ({min}) is greater than maxReplicas ({max})")]
    MinAboveMax { min: u32, max: u32 },
}

impl ScaleConfig {
    /// A service must be able to run at least one replica, within bounds
    /// that agree with each other.
    pub fn validate(&self) -> Result<(), ScaleError> {
        if self.max_replicas == 0 {
            return Err(ScaleError::NoReplicas);
        }
        if self.min_replicas > self.max_replicas {
            return Err(ScaleError::MinAboveMax {
                min: self.min_replicas,
                max: self.max_replicas,
            });
        }
        Ok(())
    }
}

/// A container running inside each replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub resources: Resources,
    pub docker: Docker,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Port {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
}

/// Resource limits per task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    /// CPU in millicores.
    pub cpu: u64,
    /// Memory in MiB.
    pub memory: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: 250,
            memory: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Docker {
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
}

/// Who may call this service. `"*"` matches anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Whitelist {
    pub project_id: String,
    pub service: String,
}

/// A service this service depends on. `"*"` matches anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub project_id: String,
    pub service: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    #[default]
    Image,
    Code,
}

// ── Project ────────────────────────────────────────────────────────

/// An isolation boundary; maps to one mesh namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub default_environment: Option<String>,
}

// ── Scale identity ─────────────────────────────────────────────────

/// (project, service, version) triple that scale decisions are keyed on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ServiceKey {
    pub project_id: String,
    pub service_id: String,
    pub version: String,
}

impl ServiceKey {
    pub fn new(project_id: &str, service_id: &str, version: &str) -> Self {
        let version = if version.is_empty() {
            DEFAULT_VERSION
        } else {
            version
        };
        Self {
            project_id: project_id.to_string(),
            service_id: service_id.to_string(),
            version: version.to_string(),
        }
    }

    /// Stable string form, used as lock and store key.
    pub fn unique_name(&self) -> String {
        format!("{}:{}:{}", self.project_id, self.service_id, self.version)
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.project_id, self.service_id)
    }
}

// ── Access events ──────────────────────────────────────────────────

/// Node id the cold-start proxy reports under.
pub const PROXY_NODE_ID: &str = "runner-proxy";

/// Active-request observation for one service, as pushed by the cold-start
/// proxy or a metric reporter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessEvent {
    pub project: String,
    pub service: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub node_id: String,
    pub active_requests: u64,
}

impl AccessEvent {
    /// A single request observed by the proxy.
    pub fn proxied(key: &ServiceKey) -> Self {
        Self {
            project: key.project_id.clone(),
            service: key.service_id.clone(),
            version: key.version.clone(),
            node_id: PROXY_NODE_ID.to_string(),
            active_requests: 1,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.project, &self.service, &self.version)
    }
}

// ── Routing headers ────────────────────────────────────────────────

/// Headers a scaled-to-zero route sets so the cold-start proxy can find the
/// original destination. They are never forwarded to the service.
pub const HEADER_PROJECT: &str = "x-og-project";
pub const HEADER_SERVICE: &str = "x-og-service";
pub const HEADER_ENV: &str = "x-og-env";
pub const HEADER_VERSION: &str = "x-og-version";
pub const HEADER_HOST: &str = "x-og-host";
pub const HEADER_PORT: &str = "x-og-port";

/// Prefix shared by all routing headers.
pub const HEADER_PREFIX: &str = "x-og-";

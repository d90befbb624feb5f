//! Mesh resource types.
//!
//! Kubernetes core kinds come straight from `k8s-openapi`. The Istio kinds
//! are not covered by it, so they are modelled here with just the fields
//! the runner generates and rewrites. They travel to the API server as
//! dynamic objects, so every struct keeps its `apiVersion` and `kind`.
//!
//! Virtual services are read back and replaced on every scale-to-zero, so
//! their structs carry an `extra` map with the fields they do not model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use k8s_openapi::api::apps::v1::Deployment;
pub use k8s_openapi::api::core::v1::{Namespace, Service as KubeService, ServiceAccount};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const ISTIO_NETWORKING_API: &str = "networking.istio.io/v1beta1";
pub const ISTIO_SECURITY_API: &str = "security.istio.io/v1beta1";

/// Everything `generate` produces for one service.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshResources {
    pub service_account: ServiceAccount,
    pub deployment: Deployment,
    pub kube_service: KubeService,
    pub virtual_service: VirtualService,
    pub destination_rule: DestinationRule,
    pub gateway: Gateway,
    pub authorization_policy: AuthorizationPolicy,
    pub sidecar: Sidecar,
}

/// An Istio custom resource with a typed spec.
pub trait IstioResource: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync {
    const KIND: &'static str;
    const PLURAL: &'static str;
    const GROUP: &'static str;
    const VERSION: &'static str = "v1beta1";

    fn metadata(&self) -> &ObjectMeta;

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }
}

macro_rules! istio_resource {
    ($ty:ident, $spec:ident, $kind:literal, $plural:literal, $group:literal, $api:expr) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        #[serde(rename_all = "camelCase")]
        pub struct $ty {
            pub api_version: String,
            pub kind: String,
            #[serde(default)]
            pub metadata: ObjectMeta,
            #[serde(default)]
            pub spec: $spec,
        }

        impl $ty {
            pub fn new(metadata: ObjectMeta, spec: $spec) -> Self {
                Self {
                    api_version: $api.to_string(),
                    kind: $kind.to_string(),
                    metadata,
                    spec,
                }
            }
        }

        impl IstioResource for $ty {
            const KIND: &'static str = $kind;
            const PLURAL: &'static str = $plural;
            const GROUP: &'static str = $group;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }
        }
    };
}

istio_resource!(
    VirtualService,
    VirtualServiceSpec,
    "VirtualService",
    "virtualservices",
    "networking.istio.io",
    ISTIO_NETWORKING_API
);
istio_resource!(
    DestinationRule,
    DestinationRuleSpec,
    "DestinationRule",
    "destinationrules",
    "networking.istio.io",
    ISTIO_NETWORKING_API
);
istio_resource!(
    Gateway,
    GatewaySpec,
    "Gateway",
    "gateways",
    "networking.istio.io",
    ISTIO_NETWORKING_API
);
istio_resource!(
    AuthorizationPolicy,
    AuthorizationPolicySpec,
    "AuthorizationPolicy",
    "authorizationpolicies",
    "security.istio.io",
    ISTIO_SECURITY_API
);
istio_resource!(
    Sidecar,
    SidecarSpec,
    "Sidecar",
    "sidecars",
    "networking.istio.io",
    ISTIO_NETWORKING_API
);

// ── VirtualService ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceSpec {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,
    #[serde(default)]
    pub http: Vec<HttpRoute>,
    /// Fields set on the live object that are not modelled above.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpMatchRequest>,
    #[serde(default)]
    pub route: Vec<HttpRouteDestination>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteDestination {
    pub destination: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PortSelector {
    pub number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOperations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HeaderOperations>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeaderOperations {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ── DestinationRule ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRuleSpec {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<TrafficPolicy>,
    #[serde(default)]
    pub subsets: Vec<Subset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrafficPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClientTlsSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientTlsSettings {
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Subset {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

// ── Gateway ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GatewaySpec {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub servers: Vec<GatewayServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GatewayServer {
    pub port: GatewayPort,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GatewayPort {
    pub number: u32,
    pub name: String,
    pub protocol: String,
}

// ── AuthorizationPolicy ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<WorkloadSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Rule {
    #[serde(default)]
    pub from: Vec<RuleFrom>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuleFrom {
    pub source: Source,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

// ── Sidecar ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<SidecarWorkloadSelector>,
    #[serde(default)]
    pub egress: Vec<EgressListener>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SidecarWorkloadSelector {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EgressListener {
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Replica counts reported in a deployment's status.
pub fn ready_replicas(deployment: &Deployment) -> (i32, i32) {
    deployment
        .status
        .as_ref()
        .map(|s| {
            (
                s.available_replicas.unwrap_or(0),
                s.ready_replicas.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0))
}

/// Desired replica count of a deployment.
pub fn spec_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0)
}

//! Translate a `Service` into the mesh resources that run it.
//!
//! Pure and deterministic: the same service and configuration always
//! produce the same objects, so re-applying a service is a no-op on the
//! mesh.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use launchpad_core::{DriverConfig, Protocol, Service, Task};

use crate::resources::*;
use crate::routing;

pub const LABEL_APP: &str = "app";
pub const LABEL_VERSION: &str = "version";
pub const LABEL_ENVIRONMENT: &str = "environment";
pub const LABEL_MIN_REPLICAS: &str = "minReplicas";
pub const LABEL_MAX_REPLICAS: &str = "maxReplicas";
pub const LABEL_CONCURRENCY: &str = "concurrency";

/// Settings the generator needs from the runner's own deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub runner_namespace: String,
}

impl From<&DriverConfig> for GeneratorConfig {
    fn from(config: &DriverConfig) -> Self {
        Self {
            proxy_host: config.proxy_host.clone(),
            proxy_port: config.proxy_port,
            runner_namespace: config.runner_namespace.clone(),
        }
    }
}

/// Deployment name of a service version.
pub fn deployment_name(service_id: &str, version: &str) -> String {
    format!("{service_id}-{version}")
}

/// In-mesh host of a service.
pub fn service_host(service_id: &str, project_id: &str) -> String {
    format!("{service_id}.{project_id}.svc.cluster.local")
}

/// Clamp a replica count into `[min, max]`; `max` wins when they conflict.
pub fn clamp_replicas(desired: u32, min: u32, max: u32) -> u32 {
    desired.max(min).min(max)
}

/// Generate all mesh resources for a normalized service.
pub fn generate(service: &Service, config: &GeneratorConfig) -> MeshResources {
    let initial = clamp_replicas(
        service.scale.replicas,
        service.scale.min_replicas,
        service.scale.max_replicas,
    );

    let mut virtual_service = generate_virtual_service(service);
    if initial == 0 {
        let env = (!service.environment.is_empty()).then_some(service.environment.as_str());
        routing::make_scale_zero(
            &mut virtual_service,
            &service.key(),
            env,
            &config.proxy_host,
            config.proxy_port,
        );
    }

    MeshResources {
        service_account: generate_service_account(service),
        deployment: generate_deployment(service, initial),
        kube_service: generate_kube_service(service),
        virtual_service,
        destination_rule: generate_destination_rule(service),
        gateway: generate_gateway(service),
        authorization_policy: generate_authorization_policy(service, config),
        sidecar: generate_sidecar(service, config),
    }
}

fn labels(service: &Service) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), service.id.clone());
    labels.insert(LABEL_VERSION.to_string(), service.version.clone());
    if !service.environment.is_empty() {
        labels.insert(LABEL_ENVIRONMENT.to_string(), service.environment.clone());
    }
    labels
}

fn metadata(service: &Service, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(service.project_id.clone()),
        labels: Some(labels),
        ..Default::default()
    }
}

fn http_ports(service: &Service) -> impl Iterator<Item = u16> + '_ {
    service
        .tasks
        .iter()
        .flat_map(|task| task.ports.iter())
        .filter(|port| port.protocol == Protocol::Http)
        .map(|port| port.port)
}

fn port_name(name: &str, protocol: Protocol, port: u16) -> String {
    if !name.is_empty() {
        return name.to_string();
    }
    match protocol {
        Protocol::Http => format!("http-{port}"),
        Protocol::Tcp => format!("tcp-{port}"),
    }
}

fn generate_service_account(service: &Service) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(service, service.id.clone(), labels(service)),
        ..Default::default()
    }
}

fn generate_deployment(service: &Service, replicas: u32) -> Deployment {
    let mut deployment_labels = labels(service);
    deployment_labels.insert(
        LABEL_MIN_REPLICAS.to_string(),
        service.scale.min_replicas.to_string(),
    );
    deployment_labels.insert(
        LABEL_MAX_REPLICAS.to_string(),
        service.scale.max_replicas.to_string(),
    );
    deployment_labels.insert(
        LABEL_CONCURRENCY.to_string(),
        service.scale.concurrency.to_string(),
    );

    let mut selector = BTreeMap::new();
    selector.insert(LABEL_APP.to_string(), service.id.clone());
    selector.insert(LABEL_VERSION.to_string(), service.version.clone());

    Deployment {
        metadata: metadata(
            service,
            deployment_name(&service.id, &service.version),
            deployment_labels,
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas as i32),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(service)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service.id.clone()),
                    containers: service.tasks.iter().map(container).collect(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn container(task: &Task) -> Container {
    let mut env: Vec<EnvVar> = task
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));

    let ports = task
        .ports
        .iter()
        .map(|port| ContainerPort {
            name: Some(port_name(&port.name, port.protocol, port.port)),
            container_port: i32::from(port.port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let mut limits = BTreeMap::new();
    limits.insert(
        "cpu".to_string(),
        Quantity(format!("{}m", task.resources.cpu)),
    );
    limits.insert(
        "memory".to_string(),
        Quantity(format!("{}Mi", task.resources.memory)),
    );

    Container {
        name: task.id.clone(),
        image: Some(task.docker.image.clone()),
        command: (!task.docker.cmd.is_empty()).then(|| task.docker.cmd.clone()),
        env: Some(env),
        ports: Some(ports),
        resources: Some(ResourceRequirements {
            limits: Some(limits),
            ..Default::default()
        }),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ..Default::default()
    }
}

fn generate_kube_service(service: &Service) -> KubeService {
    let ports = service
        .tasks
        .iter()
        .flat_map(|task| task.ports.iter())
        .map(|port| ServicePort {
            name: Some(port_name(&port.name, port.protocol, port.port)),
            port: i32::from(port.port),
            target_port: Some(IntOrString::Int(i32::from(port.port))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let mut selector = BTreeMap::new();
    selector.insert(LABEL_APP.to_string(), service.id.clone());

    KubeService {
        metadata: metadata(service, service.id.clone(), labels(service)),
        spec: Some(ServiceSpec {
            ports: Some(ports),
            selector: Some(selector),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

fn generate_virtual_service(service: &Service) -> VirtualService {
    let host = service_host(&service.id, &service.project_id);
    let http = http_ports(service)
        .map(|port| HttpRoute {
            name: Some(format!("http-{port}")),
            matches: vec![HttpMatchRequest {
                port: Some(u32::from(port)),
                ..Default::default()
            }],
            route: vec![HttpRouteDestination {
                destination: Destination {
                    host: host.clone(),
                    subset: Some(service.version.clone()),
                    port: Some(PortSelector {
                        number: u32::from(port),
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        })
        .collect();

    VirtualService::new(
        metadata(service, service.id.clone(), labels(service)),
        VirtualServiceSpec {
            hosts: vec![host],
            gateways: vec!["mesh".to_string(), service.id.clone()],
            http,
            ..Default::default()
        },
    )
}

fn generate_destination_rule(service: &Service) -> DestinationRule {
    let mut subset_labels = BTreeMap::new();
    subset_labels.insert(LABEL_VERSION.to_string(), service.version.clone());

    DestinationRule::new(
        metadata(service, service.id.clone(), labels(service)),
        DestinationRuleSpec {
            host: service_host(&service.id, &service.project_id),
            traffic_policy: Some(TrafficPolicy {
                tls: Some(ClientTlsSettings {
                    mode: "ISTIO_MUTUAL".to_string(),
                }),
            }),
            subsets: vec![Subset {
                name: service.version.clone(),
                labels: subset_labels,
            }],
        },
    )
}

fn generate_gateway(service: &Service) -> Gateway {
    let mut selector = BTreeMap::new();
    selector.insert("istio".to_string(), "ingressgateway".to_string());

    let servers = http_ports(service)
        .map(|port| GatewayServer {
            port: GatewayPort {
                number: u32::from(port),
                name: format!("http-{port}"),
                protocol: "HTTP".to_string(),
            },
            hosts: vec!["*".to_string()],
        })
        .collect();

    Gateway::new(
        metadata(service, service.id.clone(), labels(service)),
        GatewaySpec { selector, servers },
    )
}

fn generate_authorization_policy(service: &Service, config: &GeneratorConfig) -> AuthorizationPolicy {
    let mut rules: Vec<Rule> = service
        .whitelists
        .iter()
        .map(|whitelist| {
            let source = if whitelist.project_id == "*" {
                Source {
                    principals: Vec::new(),
                    namespaces: vec!["*".to_string()],
                }
            } else if whitelist.service == "*" {
                Source {
                    principals: Vec::new(),
                    namespaces: vec![whitelist.project_id.clone()],
                }
            } else {
                Source {
                    principals: vec![format!(
                        "cluster.local/ns/{}/sa/{}",
                        whitelist.project_id, whitelist.service
                    )],
                    namespaces: Vec::new(),
                }
            };
            Rule {
                from: vec![RuleFrom { source }],
            }
        })
        .collect();

    // The cold-start proxy calls in from the runner namespace.
    rules.push(Rule {
        from: vec![RuleFrom {
            source: Source {
                principals: Vec::new(),
                namespaces: vec![config.runner_namespace.clone()],
            },
        }],
    });

    let mut match_labels = BTreeMap::new();
    match_labels.insert(LABEL_APP.to_string(), service.id.clone());

    AuthorizationPolicy::new(
        metadata(service, service.id.clone(), labels(service)),
        AuthorizationPolicySpec {
            selector: Some(WorkloadSelector { match_labels }),
            action: Some("ALLOW".to_string()),
            rules,
        },
    )
}

fn generate_sidecar(service: &Service, config: &GeneratorConfig) -> Sidecar {
    let mut hosts: Vec<String> = service
        .upstreams
        .iter()
        .map(|upstream| {
            if upstream.service == "*" {
                format!("{}/*", upstream.project_id)
            } else {
                format!(
                    "{}/{}",
                    upstream.project_id,
                    service_host(&upstream.service, &upstream.project_id)
                )
            }
        })
        .collect();
    hosts.push("istio-system/*".to_string());
    hosts.push(format!("{}/*", config.runner_namespace));

    let mut workload_labels = BTreeMap::new();
    workload_labels.insert(LABEL_APP.to_string(), service.id.clone());

    Sidecar::new(
        metadata(service, service.id.clone(), labels(service)),
        SidecarSpec {
            workload_selector: Some(SidecarWorkloadSelector {
                labels: workload_labels,
            }),
            egress: vec![EgressListener { hosts }],
        },
    )
}

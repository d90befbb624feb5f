//! Istio driver: reconciles services and scales deployments on an Istio mesh.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use launchpad_core::{DriverConfig, Project, Service, ServiceKey};

use crate::generate::{
    clamp_replicas, deployment_name, generate, GeneratorConfig, LABEL_CONCURRENCY,
    LABEL_ENVIRONMENT, LABEL_MAX_REPLICAS, LABEL_MIN_REPLICAS,
};
use crate::lock::ScaleLock;
use crate::mesh::{MeshApi, MeshResult};
use crate::resources::*;
use crate::routing;
use crate::{Driver, DriverError, DriverResult, DriverType, ScaleOutcome};

/// What a scale pass sizes a deployment for.
#[derive(Debug, Clone, Copy)]
enum Demand {
    /// Exactly this many concurrent requests.
    Active(u64),
    /// At least one replica. A deployment that already runs is left alone.
    Wake,
}

pub struct IstioDriver {
    mesh: Arc<dyn MeshApi>,
    generator: GeneratorConfig,
    wait_timeout: Duration,
    lock: ScaleLock,
}

impl IstioDriver {
    pub fn new(config: DriverConfig, mesh: Arc<dyn MeshApi>) -> Self {
        Self {
            mesh,
            generator: GeneratorConfig::from(&config),
            wait_timeout: Duration::from_secs(config.wait_timeout_secs),
            lock: ScaleLock::new(),
        }
    }

    /// Override how long `wait_for_service` waits for a ready replica.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn scale_lock(&self) -> &ScaleLock {
        &self.lock
    }

    /// One scale pass under the service's `ScaleLock`.
    async fn rescale(&self, key: &ServiceKey, demand: Demand) -> DriverResult<ScaleOutcome> {
        let Some(_guard) = self.lock.try_acquire(&key.unique_name()) else {
            info!(
                project = %key.project_id,
                service = %key.service_id,
                "ignoring adjust scale request, another one is in progress"
            );
            return Ok(ScaleOutcome::Skipped);
        };

        let active_requests = match demand {
            Demand::Active(n) => n,
            Demand::Wake => 1,
        };
        debug!(project = %key.project_id, service = %key.service_id, active_requests, "adjusting scale");
        let name = deployment_name(&key.service_id, &key.version);
        let mut deployment = self.mesh.get_deployment(&key.project_id, &name).await?;

        let labels = deployment.metadata.labels.clone().unwrap_or_default();
        let min = scale_label(&labels, LABEL_MIN_REPLICAS, &name)?;
        let max = scale_label(&labels, LABEL_MAX_REPLICAS, &name)?;
        let concurrency = scale_label(&labels, LABEL_CONCURRENCY, &name)?;
        if concurrency == 0 {
            return Err(DriverError::InvalidScaleLabel {
                deployment: name,
                label: LABEL_CONCURRENCY,
                value: Some("0".to_string()),
            });
        }

        let wanted = u32::try_from(active_requests.div_ceil(u64::from(concurrency)))
            .unwrap_or(u32::MAX);
        let desired = clamp_replicas(wanted, min, max);
        let current = u32::try_from(spec_replicas(&deployment)).unwrap_or(0);

        if matches!(demand, Demand::Wake) && current > 0 {
            debug!(
                project = %key.project_id,
                service = %key.service_id,
                replicas = current,
                "service already has replicas, leaving scale to the autoscaler"
            );
            return Ok(ScaleOutcome::Unchanged);
        }

        if desired == current {
            debug!(
                project = %key.project_id,
                service = %key.service_id,
                replicas = current,
                "desired scale is same as current scale"
            );
            return Ok(ScaleOutcome::Unchanged);
        }

        // Traffic must reach the proxy before the last replica goes away.
        if desired == 0 {
            let mut vs = self
                .mesh
                .get_virtual_service(&key.project_id, &key.service_id)
                .await
                .inspect_err(|e| {
                    error!(project = %key.project_id, service = %key.service_id, error = %e, "could not fetch virtual service to adjust scale")
                })?;
            routing::make_scale_zero(
                &mut vs,
                key,
                labels.get(LABEL_ENVIRONMENT).map(String::as_str),
                &self.generator.proxy_host,
                self.generator.proxy_port,
            );
            self.mesh
                .update_virtual_service(&key.project_id, &vs)
                .await
                .inspect_err(|e| {
                    error!(project = %key.project_id, service = %key.service_id, error = %e, "could not redirect virtual service to proxy")
                })?;
        }

        deployment
            .spec
            .get_or_insert_with(Default::default)
            .replicas = Some(desired as i32);
        self.mesh
            .update_deployment(&key.project_id, &deployment)
            .await
            .inspect_err(|e| {
                error!(project = %key.project_id, service = %key.service_id, error = %e, "could not adjust scale")
            })?;

        info!(
            project = %key.project_id,
            service = %key.service_id,
            from = current,
            to = desired,
            "scale adjusted"
        );
        Ok(ScaleOutcome::Scaled {
            from: current,
            to: desired,
        })
    }

    async fn create_resources(&self, ns: &str, service: &Service, r: &MeshResources) -> MeshResult<()> {
        debug!(project = ns, service = %service.id, "creating service account");
        self.mesh
            .create_service_account(ns, &r.service_account)
            .await?;

        debug!(project = ns, service = %service.id, "creating deployment");
        self.mesh.create_deployment(ns, &r.deployment).await?;

        debug!(project = ns, service = %service.id, "creating kubernetes service");
        self.mesh.create_kube_service(ns, &r.kube_service).await?;

        debug!(project = ns, service = %service.id, "creating virtual service");
        self.mesh
            .create_virtual_service(ns, &r.virtual_service)
            .await?;

        debug!(project = ns, service = %service.id, "creating destination rule");
        self.mesh
            .create_destination_rule(ns, &r.destination_rule)
            .await?;

        debug!(project = ns, service = %service.id, "creating gateway");
        self.mesh.create_gateway(ns, &r.gateway).await?;

        debug!(project = ns, service = %service.id, "creating authorization policy");
        self.mesh
            .create_authorization_policy(ns, &r.authorization_policy)
            .await?;

        debug!(project = ns, service = %service.id, "creating sidecar config");
        self.mesh.create_sidecar(ns, &r.sidecar).await?;
        Ok(())
    }

    async fn update_resources(&self, ns: &str, service: &Service, r: &MeshResources) -> MeshResult<()> {
        let name = service.id.as_str();

        debug!(project = ns, service = name, "updating deployment");
        self.mesh.update_deployment(ns, &r.deployment).await?;

        debug!(project = ns, service = name, "updating kubernetes service");
        let mut kube_service = self.mesh.get_kube_service(ns, name).await?;
        kube_service
            .spec
            .get_or_insert_with(Default::default)
            .ports = r.kube_service.spec.as_ref().and_then(|s| s.ports.clone());
        kube_service.metadata.labels = r.kube_service.metadata.labels.clone();
        self.mesh.update_kube_service(ns, &kube_service).await?;

        debug!(project = ns, service = name, "updating virtual service");
        let mut vs = self.mesh.get_virtual_service(ns, name).await?;
        vs.spec = r.virtual_service.spec.clone();
        vs.metadata.labels = r.virtual_service.metadata.labels.clone();
        self.mesh.update_virtual_service(ns, &vs).await?;

        debug!(project = ns, service = name, "updating gateway");
        let mut gateway = self.mesh.get_gateway(ns, name).await?;
        gateway.spec = r.gateway.spec.clone();
        gateway.metadata.labels = r.gateway.metadata.labels.clone();
        self.mesh.update_gateway(ns, &gateway).await?;

        debug!(project = ns, service = name, "updating authorization policy");
        let mut policy = self.mesh.get_authorization_policy(ns, name).await?;
        policy.spec = r.authorization_policy.spec.clone();
        policy.metadata.labels = r.authorization_policy.metadata.labels.clone();
        self.mesh.update_authorization_policy(ns, &policy).await?;

        debug!(project = ns, service = name, "updating sidecar config");
        let mut sidecar = self.mesh.get_sidecar(ns, name).await?;
        sidecar.spec = r.sidecar.spec.clone();
        sidecar.metadata.labels = r.sidecar.metadata.labels.clone();
        self.mesh.update_sidecar(ns, &sidecar).await?;
        Ok(())
    }

    /// Restore the service's routes once it is warm. Failures are logged and
    /// not retried; the next scale-up reverts again.
    fn spawn_revert(&self, key: &ServiceKey) {
        let mesh = self.mesh.clone();
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = revert_routing(mesh.as_ref(), &key).await {
                error!(
                    project = %key.project_id,
                    service = %key.service_id,
                    error = %e,
                    "could not revert virtual service back to original"
                );
            }
        });
    }
}

async fn revert_routing(mesh: &dyn MeshApi, key: &ServiceKey) -> MeshResult<()> {
    let mut vs = mesh
        .get_virtual_service(&key.project_id, &key.service_id)
        .await?;
    if !routing::is_scaled_to_zero(&vs) {
        return Ok(());
    }

    debug!(project = %key.project_id, service = %key.service_id, "reverting routing rules back to original");
    routing::make_original(&mut vs);
    mesh.update_virtual_service(&key.project_id, &vs).await?;
    info!(project = %key.project_id, service = %key.service_id, "routing rules reverted back to original");
    Ok(())
}

fn scale_label(
    labels: &BTreeMap<String, String>,
    label: &'static str,
    deployment: &str,
) -> DriverResult<u32> {
    let value = labels.get(label);
    value
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| DriverError::InvalidScaleLabel {
            deployment: deployment.to_string(),
            label,
            value: value.cloned(),
        })
}

#[async_trait]
impl Driver for IstioDriver {
    async fn create_project(&self, project: &Project) -> DriverResult<()> {
        let mut labels = BTreeMap::new();
        labels.insert("istio-injection".to_string(), "enabled".to_string());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(project.id.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };

        match self.mesh.create_namespace(&namespace).await {
            Ok(()) => info!(project = %project.id, "project created"),
            Err(e) if e.is_already_exists() => {
                info!(project = %project.id, "project namespace already exists")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn apply_service(&self, service: &Service) -> DriverResult<()> {
        let mut service = service.clone();
        service.normalize();
        service
            .scale
            .validate()
            .map_err(|source| DriverError::InvalidScale {
                service: service.id.clone(),
                source,
            })?;
        let resources = generate(&service, &self.generator);
        let ns = service.project_id.as_str();

        // The service account is created first, so it tells whether the
        // service exists at all.
        match self.mesh.get_service_account(ns, &service.id).await {
            Err(e) if e.is_not_found() => {
                self.create_resources(ns, &service, &resources).await?
            }
            Ok(_) => self.update_resources(ns, &service, &resources).await?,
            Err(e) => return Err(e.into()),
        }

        info!(project = ns, service = %service.id, version = %service.version, "service applied");
        Ok(())
    }

    async fn adjust_scale(
        &self,
        key: &ServiceKey,
        active_requests: u64,
    ) -> DriverResult<ScaleOutcome> {
        self.rescale(key, Demand::Active(active_requests)).await
    }

    async fn wait_for_service(&self, key: &ServiceKey) -> DriverResult<()> {
        debug!(project = %key.project_id, service = %key.service_id, "scaling up service from zero");
        self.rescale(key, Demand::Wake).await?;

        let selector = format!("app={},version={}", key.service_id, key.version);
        debug!(project = %key.project_id, service = %key.service_id, "watching for service to enter ready state");
        let mut events = self
            .mesh
            .watch_deployments(&key.project_id, &selector, self.wait_timeout)
            .await?;

        let watch = async {
            while let Some(event) = events.next().await {
                match event {
                    Ok(deployment) => {
                        let (available, ready) = ready_replicas(&deployment);
                        debug!(
                            project = %key.project_id,
                            service = %key.service_id,
                            available,
                            ready,
                            "received deployment watch event"
                        );
                        if available >= 1 && ready >= 1 {
                            return true;
                        }
                    }
                    Err(e) => {
                        warn!(project = %key.project_id, service = %key.service_id, error = %e, "deployment watch error")
                    }
                }
            }
            false
        };

        let ready = tokio::time::timeout(self.wait_timeout, watch)
            .await
            .unwrap_or(false);
        if !ready {
            return Err(DriverError::ServiceNotStarted(key.clone()));
        }

        self.spawn_revert(key);
        Ok(())
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Istio
    }
}

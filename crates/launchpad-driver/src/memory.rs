//! In-memory `MeshApi` for tests and local runs.
//!
//! Objects are kept as JSON keyed by (kind, namespace, name), so they go
//! through the same serde path as the real API server. Deployments get a
//! simulated status: scaling to zero clears it immediately, scaling up
//! marks replicas ready after the configured delay (or on `mark_ready`).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::apps::v1::DeploymentStatus;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::mesh::{parse_label_selector, DeploymentStream, MeshApi, MeshError, MeshResult};
use crate::resources::*;

/// Kind of mesh call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Update,
    Watch,
}

/// One recorded mesh call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshOp {
    pub verb: Verb,
    pub kind: &'static str,
    pub name: String,
    /// Requested replica count, for deployment writes.
    pub replicas: Option<i32>,
}

type ObjectKey = (&'static str, String, String);

struct Inner {
    objects: Mutex<BTreeMap<ObjectKey, serde_json::Value>>,
    ops: Mutex<Vec<MeshOp>>,
    failures: Mutex<Vec<(Verb, &'static str)>>,
    latency: Mutex<Duration>,
    auto_ready: Mutex<Option<Duration>>,
    deployments_changed: watch::Sender<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct InMemoryMesh {
    inner: Arc<Inner>,
}

impl Default for InMemoryMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMesh {
    pub fn new() -> Self {
        let (deployments_changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                objects: Mutex::new(BTreeMap::new()),
                ops: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                latency: Mutex::new(Duration::ZERO),
                auto_ready: Mutex::new(None),
                deployments_changed,
            }),
        }
    }

    /// Mark scaled-up deployments ready after `delay`; `None` leaves them
    /// pending until `mark_ready`.
    pub fn set_auto_ready(&self, delay: Option<Duration>) {
        *lock(&self.inner.auto_ready) = delay;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// Make every `verb` call on `kind` fail with an API error.
    pub fn fail_on(&self, verb: Verb, kind: &'static str) {
        lock(&self.inner.failures).push((verb, kind));
    }

    pub fn clear_failures(&self) {
        lock(&self.inner.failures).clear();
    }

    /// Every call made so far, in order.
    pub fn ops(&self) -> Vec<MeshOp> {
        lock(&self.inner.ops).clone()
    }

    /// Creates and updates made so far, in order.
    pub fn writes(&self) -> Vec<MeshOp> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op.verb, Verb::Create | Verb::Update))
            .collect()
    }

    pub fn clear_ops(&self) {
        lock(&self.inner.ops).clear();
    }

    pub fn object_count(&self) -> usize {
        lock(&self.inner.objects).len()
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.peek("Namespace", "", name)
    }

    pub fn deployment(&self, ns: &str, name: &str) -> Option<Deployment> {
        self.peek("Deployment", ns, name)
    }

    pub fn virtual_service(&self, ns: &str, name: &str) -> Option<VirtualService> {
        self.peek(VirtualService::KIND, ns, name)
    }

    pub fn kube_service(&self, ns: &str, name: &str) -> Option<KubeService> {
        self.peek("Service", ns, name)
    }

    /// Report every replica of a deployment as available and ready.
    pub fn mark_ready(&self, ns: &str, name: &str) {
        self.set_ready(ns, name);
    }

    fn peek<T: DeserializeOwned>(&self, kind: &'static str, ns: &str, name: &str) -> Option<T> {
        let objects = lock(&self.inner.objects);
        objects
            .get(&(kind, ns.to_string(), name.to_string()))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    async fn before(
        &self,
        verb: Verb,
        kind: &'static str,
        name: &str,
        replicas: Option<i32>,
    ) -> MeshResult<()> {
        lock(&self.inner.ops).push(MeshOp {
            verb,
            kind,
            name: name.to_string(),
            replicas,
        });

        let latency = *lock(&self.inner.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if lock(&self.inner.failures).contains(&(verb, kind)) {
            return Err(MeshError::Api(format!("injected failure: {verb:?} {kind} {name}")));
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, kind: &'static str, ns: &str, name: &str) -> MeshResult<T> {
        self.before(Verb::Get, kind, name, None).await?;
        let value = lock(&self.inner.objects)
            .get(&(kind, ns.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| MeshError::NotFound {
                kind,
                name: name.to_string(),
            })?;
        serde_json::from_value(value).map_err(|e| MeshError::Serialize(e.to_string()))
    }

    async fn create<T: Serialize>(
        &self,
        kind: &'static str,
        ns: &str,
        name: &str,
        obj: &T,
        replicas: Option<i32>,
    ) -> MeshResult<()> {
        self.before(Verb::Create, kind, name, replicas).await?;
        let value = serde_json::to_value(obj).map_err(|e| MeshError::Serialize(e.to_string()))?;
        let mut objects = lock(&self.inner.objects);
        let key = (kind, ns.to_string(), name.to_string());
        if objects.contains_key(&key) {
            return Err(MeshError::AlreadyExists {
                kind,
                name: name.to_string(),
            });
        }
        objects.insert(key, value);
        Ok(())
    }

    async fn update<T: Serialize>(
        &self,
        kind: &'static str,
        ns: &str,
        name: &str,
        obj: &T,
        replicas: Option<i32>,
    ) -> MeshResult<()> {
        self.before(Verb::Update, kind, name, replicas).await?;
        let value = serde_json::to_value(obj).map_err(|e| MeshError::Serialize(e.to_string()))?;
        let mut objects = lock(&self.inner.objects);
        let key = (kind, ns.to_string(), name.to_string());
        if !objects.contains_key(&key) {
            return Err(MeshError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        objects.insert(key, value);
        Ok(())
    }

    /// Simulate the deployment controller after a replica change.
    fn deployment_written(&self, ns: &str, name: &str, replicas: i32) {
        if replicas == 0 {
            self.update_status(ns, name, |_| Some(DeploymentStatus::default()));
            return;
        }

        self.notify_deployments();
        let Some(delay) = *lock(&self.inner.auto_ready) else {
            return;
        };
        let mesh = self.clone();
        let ns = ns.to_string();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mesh.set_ready(&ns, &name);
        });
    }

    fn set_ready(&self, ns: &str, name: &str) {
        self.update_status(ns, name, |deployment| {
            let replicas = spec_replicas(deployment);
            (replicas > 0).then(|| DeploymentStatus {
                replicas: Some(replicas),
                available_replicas: Some(replicas),
                ready_replicas: Some(replicas),
                ..Default::default()
            })
        });
    }

    fn update_status(
        &self,
        ns: &str,
        name: &str,
        status: impl FnOnce(&Deployment) -> Option<DeploymentStatus>,
    ) {
        {
            let mut objects = lock(&self.inner.objects);
            let key = ("Deployment", ns.to_string(), name.to_string());
            let Some(value) = objects.get_mut(&key) else {
                return;
            };
            let Ok(mut deployment) = serde_json::from_value::<Deployment>(value.clone()) else {
                return;
            };
            let Some(new_status) = status(&deployment) else {
                return;
            };
            deployment.status = Some(new_status);
            if let Ok(updated) = serde_json::to_value(&deployment) {
                *value = updated;
            }
        }
        debug!(namespace = ns, deployment = name, "simulated deployment status change");
        self.notify_deployments();
    }

    fn notify_deployments(&self) {
        self.inner.deployments_changed.send_modify(|version| *version += 1);
    }

    fn matching_deployments(&self, ns: &str, selector: &[(String, String)]) -> Vec<Deployment> {
        let objects = lock(&self.inner.objects);
        objects
            .iter()
            .filter(|((kind, object_ns, _), _)| *kind == "Deployment" && object_ns == ns)
            .filter_map(|(_, value)| serde_json::from_value::<Deployment>(value.clone()).ok())
            .filter(|deployment| {
                let labels = deployment.metadata.labels.clone().unwrap_or_default();
                selector
                    .iter()
                    .all(|(key, value)| labels.get(key) == Some(value))
            })
            .collect()
    }
}

#[async_trait]
impl MeshApi for InMemoryMesh {
    async fn create_namespace(&self, namespace: &Namespace) -> MeshResult<()> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        self.create("Namespace", "", &name, namespace, None).await
    }

    async fn get_service_account(&self, ns: &str, name: &str) -> MeshResult<ServiceAccount> {
        self.get("ServiceAccount", ns, name).await
    }

    async fn create_service_account(&self, ns: &str, account: &ServiceAccount) -> MeshResult<()> {
        let name = account.metadata.name.clone().unwrap_or_default();
        self.create("ServiceAccount", ns, &name, account, None).await
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> MeshResult<Deployment> {
        self.get("Deployment", ns, name).await
    }

    async fn create_deployment(&self, ns: &str, deployment: &Deployment) -> MeshResult<()> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let replicas = spec_replicas(deployment);
        self.create("Deployment", ns, &name, deployment, Some(replicas))
            .await?;
        self.deployment_written(ns, &name, replicas);
        Ok(())
    }

    async fn update_deployment(&self, ns: &str, deployment: &Deployment) -> MeshResult<()> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let replicas = spec_replicas(deployment);
        self.update("Deployment", ns, &name, deployment, Some(replicas))
            .await?;
        self.deployment_written(ns, &name, replicas);
        Ok(())
    }

    async fn watch_deployments(
        &self,
        ns: &str,
        label_selector: &str,
        timeout: Duration,
    ) -> MeshResult<DeploymentStream> {
        self.before(Verb::Watch, "Deployment", label_selector, None)
            .await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let selector = parse_label_selector(label_selector);
        let changes = self.inner.deployments_changed.subscribe();
        let state = (self.clone(), changes, ns.to_string(), selector, true);

        let batches = stream::unfold(
            state,
            move |(mesh, mut changes, ns, selector, first)| async move {
                // The first batch is the current state; later ones follow changes.
                if !first {
                    match tokio::time::timeout_at(deadline, changes.changed()).await {
                        Ok(Ok(())) => {}
                        _ => return None,
                    }
                }
                let batch = mesh.matching_deployments(&ns, &selector);
                Some((batch, (mesh, changes, ns, selector, false)))
            },
        );

        Ok(batches
            .flat_map(|batch| stream::iter(batch.into_iter().map(Ok)))
            .boxed())
    }

    async fn get_kube_service(&self, ns: &str, name: &str) -> MeshResult<KubeService> {
        self.get("Service", ns, name).await
    }

    async fn create_kube_service(&self, ns: &str, service: &KubeService) -> MeshResult<()> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.create("Service", ns, &name, service, None).await
    }

    async fn update_kube_service(&self, ns: &str, service: &KubeService) -> MeshResult<()> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.update("Service", ns, &name, service, None).await
    }

    async fn get_virtual_service(&self, ns: &str, name: &str) -> MeshResult<VirtualService> {
        self.get(VirtualService::KIND, ns, name).await
    }

    async fn create_virtual_service(&self, ns: &str, vs: &VirtualService) -> MeshResult<()> {
        self.create(VirtualService::KIND, ns, vs.name(), vs, None).await
    }

    async fn update_virtual_service(&self, ns: &str, vs: &VirtualService) -> MeshResult<()> {
        self.update(VirtualService::KIND, ns, vs.name(), vs, None).await
    }

    async fn create_destination_rule(&self, ns: &str, rule: &DestinationRule) -> MeshResult<()> {
        self.create(DestinationRule::KIND, ns, rule.name(), rule, None)
            .await
    }

    async fn get_gateway(&self, ns: &str, name: &str) -> MeshResult<Gateway> {
        self.get(Gateway::KIND, ns, name).await
    }

    async fn create_gateway(&self, ns: &str, gateway: &Gateway) -> MeshResult<()> {
        self.create(Gateway::KIND, ns, gateway.name(), gateway, None)
            .await
    }

    async fn update_gateway(&self, ns: &str, gateway: &Gateway) -> MeshResult<()> {
        self.update(Gateway::KIND, ns, gateway.name(), gateway, None)
            .await
    }

    async fn get_authorization_policy(
        &self,
        ns: &str,
        name: &str,
    ) -> MeshResult<AuthorizationPolicy> {
        self.get(AuthorizationPolicy::KIND, ns, name).await
    }

    async fn create_authorization_policy(
        &self,
        ns: &str,
        policy: &AuthorizationPolicy,
    ) -> MeshResult<()> {
        self.create(AuthorizationPolicy::KIND, ns, policy.name(), policy, None)
            .await
    }

    async fn update_authorization_policy(
        &self,
        ns: &str,
        policy: &AuthorizationPolicy,
    ) -> MeshResult<()> {
        self.update(AuthorizationPolicy::KIND, ns, policy.name(), policy, None)
            .await
    }

    async fn get_sidecar(&self, ns: &str, name: &str) -> MeshResult<Sidecar> {
        self.get(Sidecar::KIND, ns, name).await
    }

    async fn create_sidecar(&self, ns: &str, sidecar: &Sidecar) -> MeshResult<()> {
        self.create(Sidecar::KIND, ns, sidecar.name(), sidecar, None)
            .await
    }

    async fn update_sidecar(&self, ns: &str, sidecar: &Sidecar) -> MeshResult<()> {
        self.update(Sidecar::KIND, ns, sidecar.name(), sidecar, None)
            .await
    }
}

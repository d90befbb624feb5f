//! `MeshApi` backed by the Kubernetes API server.
//!
//! Core kinds use the typed `k8s-openapi` APIs. Istio kinds go through
//! `DynamicObject` with an explicit `ApiResource`, converted to and from the
//! typed structs in `resources` via JSON.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, WatchEvent};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use launchpad_core::DriverConfig;

use crate::mesh::{DeploymentStream, MeshApi, MeshError, MeshResult};
use crate::resources::*;

/// Mesh client for a live cluster. Every call runs under `call_timeout`.
#[derive(Clone)]
pub struct KubeMesh {
    client: Client,
    call_timeout: Duration,
}

impl KubeMesh {
    pub fn new(client: Client, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    /// Build a client from the driver configuration: the in-cluster service
    /// account, an explicit kubeconfig, or whatever the environment provides.
    pub async fn connect(config: &DriverConfig) -> MeshResult<Self> {
        let client_config = if config.in_cluster {
            kube::Config::incluster().map_err(|e| MeshError::Client(e.to_string()))?
        } else if let Some(path) = &config.config_file_path {
            let kubeconfig =
                Kubeconfig::read_from(path).map_err(|e| MeshError::Client(e.to_string()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| MeshError::Client(e.to_string()))?
        } else {
            kube::Config::infer()
                .await
                .map_err(|e| MeshError::Client(e.to_string()))?
        };

        debug!(
            cluster_url = %client_config.cluster_url,
            in_cluster = config.in_cluster,
            "kubernetes client configured"
        );
        let client = Client::try_from(client_config).map_err(|e| MeshError::Client(e.to_string()))?;
        Ok(Self::new(
            client,
            Duration::from_secs(config.mesh_call_timeout_secs),
        ))
    }

    async fn call<T>(
        &self,
        kind: &'static str,
        name: &str,
        fut: impl Future<Output = Result<T, kube::Error>>,
    ) -> MeshResult<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(|e| map_kube_error(kind, name, e)),
            Err(_) => Err(MeshError::Timeout(format!("{kind} {name}"))),
        }
    }

    fn namespaced<K>(&self, ns: &str) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), ns)
    }

    async fn get_typed<K>(&self, kind: &'static str, ns: &str, name: &str) -> MeshResult<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api = self.namespaced::<K>(ns);
        self.call(kind, name, api.get(name)).await
    }

    async fn create_typed<K>(&self, kind: &'static str, ns: &str, obj: &K) -> MeshResult<()>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let api = self.namespaced::<K>(ns);
        let name = obj.meta().name.clone().unwrap_or_default();
        self.call(kind, &name, api.create(&PostParams::default(), obj))
            .await?;
        Ok(())
    }

    async fn replace_typed<K>(&self, kind: &'static str, ns: &str, obj: &K) -> MeshResult<()>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let api = self.namespaced::<K>(ns);
        let name = obj.meta().name.clone().unwrap_or_default();
        self.call(kind, &name, api.replace(&name, &PostParams::default(), obj))
            .await?;
        Ok(())
    }

    fn istio_api<T: IstioResource>(&self, ns: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(T::GROUP, T::VERSION, T::KIND);
        let resource = ApiResource::from_gvk_with_plural(&gvk, T::PLURAL);
        Api::namespaced_with(self.client.clone(), ns, &resource)
    }

    async fn get_istio<T: IstioResource>(&self, ns: &str, name: &str) -> MeshResult<T> {
        let api = self.istio_api::<T>(ns);
        let obj = self.call(T::KIND, name, api.get(name)).await?;
        from_dynamic(&obj)
    }

    async fn create_istio<T: IstioResource>(&self, ns: &str, resource: &T) -> MeshResult<()> {
        let api = self.istio_api::<T>(ns);
        let obj = to_dynamic(resource)?;
        self.call(T::KIND, resource.name(), api.create(&PostParams::default(), &obj))
            .await?;
        Ok(())
    }

    async fn replace_istio<T: IstioResource>(&self, ns: &str, resource: &T) -> MeshResult<()> {
        let api = self.istio_api::<T>(ns);
        let obj = to_dynamic(resource)?;
        self.call(
            T::KIND,
            resource.name(),
            api.replace(resource.name(), &PostParams::default(), &obj),
        )
        .await?;
        Ok(())
    }
}

fn map_kube_error(kind: &'static str, name: &str, err: kube::Error) -> MeshError {
    match err {
        kube::Error::Api(response) if response.code == 404 => MeshError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.reason == "AlreadyExists" => {
            MeshError::AlreadyExists {
                kind,
                name: name.to_string(),
            }
        }
        other => MeshError::Api(format!("{kind} {name}: {other}")),
    }
}

fn to_dynamic<T: Serialize>(resource: &T) -> MeshResult<DynamicObject> {
    let value = serde_json::to_value(resource).map_err(|e| MeshError::Serialize(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| MeshError::Serialize(e.to_string()))
}

fn from_dynamic<T: DeserializeOwned>(obj: &DynamicObject) -> MeshResult<T> {
    let value = serde_json::to_value(obj).map_err(|e| MeshError::Serialize(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| MeshError::Serialize(e.to_string()))
}

#[async_trait]
impl MeshApi for KubeMesh {
    async fn create_namespace(&self, namespace: &Namespace) -> MeshResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let name = namespace.metadata.name.clone().unwrap_or_default();
        self.call("Namespace", &name, api.create(&PostParams::default(), namespace))
            .await?;
        Ok(())
    }

    async fn get_service_account(&self, ns: &str, name: &str) -> MeshResult<ServiceAccount> {
        self.get_typed("ServiceAccount", ns, name).await
    }

    async fn create_service_account(&self, ns: &str, account: &ServiceAccount) -> MeshResult<()> {
        self.create_typed("ServiceAccount", ns, account).await
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> MeshResult<Deployment> {
        self.get_typed("Deployment", ns, name).await
    }

    async fn create_deployment(&self, ns: &str, deployment: &Deployment) -> MeshResult<()> {
        self.create_typed("Deployment", ns, deployment).await
    }

    async fn update_deployment(&self, ns: &str, deployment: &Deployment) -> MeshResult<()> {
        self.replace_typed("Deployment", ns, deployment).await
    }

    async fn watch_deployments(
        &self,
        ns: &str,
        label_selector: &str,
        timeout: Duration,
    ) -> MeshResult<DeploymentStream> {
        let api = self.namespaced::<Deployment>(ns);
        let params = WatchParams::default()
            .labels(label_selector)
            .timeout(timeout.as_secs().min(290) as u32);
        let events = self
            .call("Deployment", label_selector, api.watch(&params, "0"))
            .await?;

        let deployments = events.filter_map(|event| async move {
            match event {
                Ok(WatchEvent::Added(d)) | Ok(WatchEvent::Modified(d)) => Some(Ok(d)),
                Ok(WatchEvent::Deleted(_)) | Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(e)) => Some(Err(MeshError::Api(e.message))),
                Err(e) => Some(Err(MeshError::Api(e.to_string()))),
            }
        });
        Ok(deployments.boxed())
    }

    async fn get_kube_service(&self, ns: &str, name: &str) -> MeshResult<KubeService> {
        self.get_typed("Service", ns, name).await
    }

    async fn create_kube_service(&self, ns: &str, service: &KubeService) -> MeshResult<()> {
        self.create_typed("Service", ns, service).await
    }

    async fn update_kube_service(&self, ns: &str, service: &KubeService) -> MeshResult<()> {
        self.replace_typed("Service", ns, service).await
    }

    async fn get_virtual_service(&self, ns: &str, name: &str) -> MeshResult<VirtualService> {
        self.get_istio(ns, name).await
    }

    async fn create_virtual_service(&self, ns: &str, vs: &VirtualService) -> MeshResult<()> {
        self.create_istio(ns, vs).await
    }

    async fn update_virtual_service(&self, ns: &str, vs: &VirtualService) -> MeshResult<()> {
        self.replace_istio(ns, vs).await
    }

    async fn create_destination_rule(&self, ns: &str, rule: &DestinationRule) -> MeshResult<()> {
        self.create_istio(ns, rule).await
    }

    async fn get_gateway(&self, ns: &str, name: &str) -> MeshResult<Gateway> {
        self.get_istio(ns, name).await
    }

    async fn create_gateway(&self, ns: &str, gateway: &Gateway) -> MeshResult<()> {
        self.create_istio(ns, gateway).await
    }

    async fn update_gateway(&self, ns: &str, gateway: &Gateway) -> MeshResult<()> {
        self.replace_istio(ns, gateway).await
    }

    async fn get_authorization_policy(
        &self,
        ns: &str,
        name: &str,
    ) -> MeshResult<AuthorizationPolicy> {
        self.get_istio(ns, name).await
    }

    async fn create_authorization_policy(
        &self,
        ns: &str,
        policy: &AuthorizationPolicy,
    ) -> MeshResult<()> {
        self.create_istio(ns, policy).await
    }

    async fn update_authorization_policy(
        &self,
        ns: &str,
        policy: &AuthorizationPolicy,
    ) -> MeshResult<()> {
        self.replace_istio(ns, policy).await
    }

    async fn get_sidecar(&self, ns: &str, name: &str) -> MeshResult<Sidecar> {
        self.get_istio(ns, name).await
    }

    async fn create_sidecar(&self, ns: &str, sidecar: &Sidecar) -> MeshResult<()> {
        self.create_istio(ns, sidecar).await
    }

    async fn update_sidecar(&self, ns: &str, sidecar: &Sidecar) -> MeshResult<()> {
        self.replace_istio(ns, sidecar).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn istio_objects_convert_through_dynamic() {
        let gateway = Gateway::new(
            ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            GatewaySpec {
                selector: [("istio".to_string(), "ingressgateway".to_string())]
                    .into_iter()
                    .collect(),
                servers: Vec::new(),
            },
        );

        let dynamic = to_dynamic(&gateway).unwrap();
        assert_eq!(dynamic.metadata.name.as_deref(), Some("api"));
        assert_eq!(dynamic.types.as_ref().unwrap().kind, "Gateway");
        assert_eq!(dynamic.data["spec"]["selector"]["istio"], "ingressgateway");

        let back: Gateway = from_dynamic(&dynamic).unwrap();
        assert_eq!(back, gateway);
    }

    #[test]
    fn api_errors_are_classified() {
        let not_found = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "deployments.apps \"api-v1\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(map_kube_error("Deployment", "api-v1", not_found).is_not_found());

        let exists = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "namespaces \"shop\" already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert!(map_kube_error("Namespace", "shop", exists).is_already_exists());

        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(matches!(
            map_kube_error("Deployment", "api-v1", conflict),
            MeshError::Api(_)
        ));
    }
}

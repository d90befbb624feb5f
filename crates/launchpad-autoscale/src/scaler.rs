//! Autoscaler: periodic replica decisions from active request counts.
//!
//! Every tick drains the store's current window and asks the driver to size
//! each service for the requests it saw. Services that stayed quiet report
//! zero and are scaled down to their minimum. A failed adjustment is logged
//! and retried on the next tick with fresh counts.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use launchpad_core::ServiceKey;
use launchpad_driver::{Driver, DriverError, ScaleOutcome};
use launchpad_state::ScaleStore;

pub struct Autoscaler {
    store: ScaleStore,
    driver: Arc<dyn Driver>,
    idle_ttl_secs: u64,
}

impl Autoscaler {
    pub fn new(store: ScaleStore, driver: Arc<dyn Driver>, idle_ttl_secs: u64) -> Self {
        Self {
            store,
            driver,
            idle_ttl_secs,
        }
    }

    /// Run one decision round. Returns the outcome of every successful
    /// adjustment.
    pub async fn tick(&self) -> anyhow::Result<Vec<(ServiceKey, ScaleOutcome)>> {
        let store = self.store.clone();
        let idle_ttl_secs = self.idle_ttl_secs;
        let records =
            tokio::task::spawn_blocking(move || store.drain_active_requests(idle_ttl_secs))
                .await??;

        let adjustments = records.into_iter().map(|record| async move {
            let result = self
                .driver
                .adjust_scale(&record.key, record.active_requests)
                .await;
            (record, result)
        });

        let mut outcomes = Vec::new();
        for (record, result) in join_all(adjustments).await {
            match result {
                Ok(outcome) => outcomes.push((record.key, outcome)),
                Err(DriverError::Mesh(e)) if e.is_not_found() => {
                    debug!(service = %record.key, error = %e, "no deployment to scale");
                }
                Err(e) => {
                    warn!(
                        service = %record.key,
                        active_requests = record.active_requests,
                        error = %e,
                        "scaling action failed"
                    );
                }
            }
        }
        Ok(outcomes)
    }

    /// Run the decision loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use launchpad_core::{Docker, DriverConfig, Port, Protocol, ScaleConfig, Service, Task};
    use launchpad_driver::resources::spec_replicas;
    use launchpad_driver::routing::is_scaled_to_zero;
    use launchpad_driver::{InMemoryMesh, IstioDriver};

    fn service() -> Service {
        Service {
            id: "api".to_string(),
            project_id: "shop".to_string(),
            scale: ScaleConfig {
                replicas: 1,
                min_replicas: 0,
                max_replicas: 5,
                concurrency: 10,
            },
            tasks: vec![Task {
                id: "main".to_string(),
                ports: vec![Port {
                    name: "http".to_string(),
                    protocol: Protocol::Http,
                    port: 8080,
                }],
                docker: Docker {
                    image: "shop/api:1.0".to_string(),
                    cmd: Vec::new(),
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn setup() -> (InMemoryMesh, ScaleStore, Autoscaler) {
        let mesh = InMemoryMesh::new();
        let driver = Arc::new(IstioDriver::new(
            DriverConfig::default(),
            Arc::new(mesh.clone()),
        ));
        driver.apply_service(&service()).await.unwrap();
        let store = ScaleStore::open_in_memory().unwrap();
        let scaler = Autoscaler::new(store.clone(), driver, 300);
        (mesh, store, scaler)
    }

    fn key() -> ServiceKey {
        ServiceKey::new("shop", "api", "v1")
    }

    #[tokio::test]
    async fn busy_window_scales_up() {
        let (mesh, store, scaler) = setup().await;
        store.record_active_requests(&key(), 55).unwrap();

        let outcomes = scaler.tick().await.unwrap();
        assert_eq!(outcomes, vec![(key(), ScaleOutcome::Scaled { from: 1, to: 5 })]);
        assert_eq!(spec_replicas(&mesh.deployment("shop", "api-v1").unwrap()), 5);
    }

    #[tokio::test]
    async fn quiet_window_scales_to_zero() {
        let (mesh, store, scaler) = setup().await;
        store.record_active_requests(&key(), 8).unwrap();
        scaler.tick().await.unwrap();

        let outcomes = scaler.tick().await.unwrap();
        assert_eq!(outcomes, vec![(key(), ScaleOutcome::Scaled { from: 1, to: 0 })]);
        assert!(is_scaled_to_zero(&mesh.virtual_service("shop", "api").unwrap()));

        let outcomes = scaler.tick().await.unwrap();
        assert_eq!(outcomes, vec![(key(), ScaleOutcome::Unchanged)]);
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_services() {
        let (mesh, store, scaler) = setup().await;
        store
            .record_active_requests(&ServiceKey::new("shop", "ghost", "v1"), 10)
            .unwrap();
        store.record_active_requests(&key(), 30).unwrap();

        let outcomes = scaler.tick().await.unwrap();
        assert_eq!(outcomes, vec![(key(), ScaleOutcome::Scaled { from: 1, to: 3 })]);
        assert_eq!(spec_replicas(&mesh.deployment("shop", "api-v1").unwrap()), 3);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (mesh, store, scaler) = setup().await;
        store.record_active_requests(&key(), 20).unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { scaler.run(Duration::from_millis(20), rx).await });

        let mut scaled = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if spec_replicas(&mesh.deployment("shop", "api-v1").unwrap()) == 2 {
                scaled = true;
                break;
            }
        }
        assert!(scaled);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

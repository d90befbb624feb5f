//! Runner assembly: store, driver, autoscaler loops and both HTTP servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use launchpad_api::{AppState, TokenVerifier};
use launchpad_autoscale::{spawn_workers, AccessRecorder, Autoscaler};
use launchpad_core::RunnerConfig;
use launchpad_driver::{KubeMesh, MeshApi};
use launchpad_proxy::ProxyState;
use launchpad_state::ScaleStore;

/// A started runner. Dropping it does not stop the background tasks; call
/// [`Runner::shutdown`].
pub struct Runner {
    api_addr: SocketAddr,
    proxy_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    servers: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Runner {
    /// Start every subsystem against `mesh`, with the store at `store`.
    pub async fn start(
        config: &RunnerConfig,
        store: ScaleStore,
        mesh: Arc<dyn MeshApi>,
    ) -> anyhow::Result<Self> {
        let api_listener = bind(config.port, "front door").await?;
        let proxy_listener = bind(config.proxy_port, "proxy").await?;
        let api_addr = api_listener.local_addr()?;
        let proxy_addr = proxy_listener.local_addr()?;

        // Redirected routes must land on the port the proxy actually holds.
        let mut driver_config = config.driver.clone();
        driver_config.proxy_port = proxy_addr.port();
        let driver = launchpad_driver::new(&driver_config, mesh)?;
        info!(driver = %driver.driver_type(), "driver initialized");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ── Autoscaler ─────────────────────────────────────────────
        let autoscale = &config.autoscale;
        let (recorder, receiver) = AccessRecorder::channel(autoscale.channel_capacity);
        let mut tasks = spawn_workers(
            receiver,
            store.clone(),
            autoscale.workers,
            shutdown_rx.clone(),
        );

        let autoscaler = Autoscaler::new(store.clone(), driver.clone(), autoscale.idle_ttl_secs);
        let interval = Duration::from_secs(autoscale.interval_secs);
        let autoscale_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            autoscaler.run(interval, autoscale_shutdown).await;
        }));

        tasks.push(tokio::spawn(launchpad_autoscale::run_compaction(
            store,
            Duration::from_secs(autoscale.compaction_interval_secs),
            shutdown_rx.clone(),
        )));

        // ── HTTP servers ───────────────────────────────────────────
        let api_router = launchpad_api::build_router(AppState {
            driver: driver.clone(),
            recorder: recorder.clone(),
            verifier: Arc::new(TokenVerifier::new(&config.auth)),
        });
        let proxy_router = launchpad_proxy::router(Arc::new(ProxyState::new(
            driver,
            recorder,
            config.proxy.clone(),
        )));

        info!(%api_addr, %proxy_addr, "runner listening");

        let servers = vec![
            tokio::spawn(serve(api_listener, api_router, shutdown_rx.clone())),
            tokio::spawn(serve(proxy_listener, proxy_router, shutdown_rx)),
        ];

        Ok(Self {
            api_addr,
            proxy_addr,
            shutdown_tx,
            tasks,
            servers,
        })
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);

        let mut result = Ok(());
        for server in self.servers {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "server error");
                    result = Err(e);
                }
                Err(e) => result = Err(e.into()),
            }
        }
        for task in self.tasks {
            let _ = task.await;
        }
        result
    }
}

/// Run the runner against the cluster until Ctrl-C.
pub async fn run(config: RunnerConfig) -> anyhow::Result<()> {
    info!("Launchpad runner starting");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let store_path = config.store_path();
    let store = ScaleStore::open(&store_path)?;
    info!(path = ?store_path, "autoscale store opened");

    let mesh = KubeMesh::connect(&config.driver)
        .await
        .context("connect to kubernetes")?;
    info!(in_cluster = config.driver.in_cluster, "connected to kubernetes");

    let runner = Runner::start(&config, store, Arc::new(mesh)).await?;

    tokio::signal::ctrl_c()
        .await
        .context("install CTRL+C handler")?;
    info!("shutdown signal received");

    runner.shutdown().await?;
    info!("Launchpad runner stopped");
    Ok(())
}

async fn bind(port: u16, name: &str) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {name} on {addr}"))
}

async fn serve(
    listener: TcpListener,
    router: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

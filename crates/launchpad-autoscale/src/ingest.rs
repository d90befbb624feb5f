//! Access event ingestion.
//!
//! The proxy and the metrics endpoint push `AccessEvent`s into a small
//! bounded channel. A fixed pool of workers drains it into the store.
//! When the channel is full the event is dropped; producers never wait.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use launchpad_core::AccessEvent;
use launchpad_state::ScaleStore;

/// Cloneable handle for submitting access events.
#[derive(Debug, Clone)]
pub struct AccessRecorder {
    tx: mpsc::Sender<AccessEvent>,
}

/// Receiving side, shared by the ingestion workers.
#[derive(Debug, Clone)]
pub struct AccessReceiver {
    rx: Arc<Mutex<mpsc::Receiver<AccessEvent>>>,
}

impl AccessRecorder {
    pub fn channel(capacity: usize) -> (AccessRecorder, AccessReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            AccessRecorder { tx },
            AccessReceiver {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Queue an event without waiting. Returns `false` if it was dropped.
    pub fn record(&self, event: AccessEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(
                    project = %event.project,
                    service = %event.service,
                    "access channel full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("access channel closed, dropping event");
                false
            }
        }
    }
}

impl AccessReceiver {
    async fn next(&self) -> Option<AccessEvent> {
        self.rx.lock().await.recv().await
    }
}

/// Spawn `workers` tasks that persist access events until shutdown or
/// until every recorder is dropped.
pub fn spawn_workers(
    receiver: AccessReceiver,
    store: ScaleStore,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    info!(workers, "access ingestion workers started");
    (0..workers.max(1))
        .map(|worker| {
            let receiver = receiver.clone();
            let store = store.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        event = receiver.next() => event,
                        _ = shutdown.changed() => break,
                    };
                    let Some(event) = event else {
                        break;
                    };
                    persist(&store, event, worker).await;
                }
                debug!(worker, "access ingestion worker stopped");
            })
        })
        .collect()
}

async fn persist(store: &ScaleStore, event: AccessEvent, worker: usize) {
    let key = event.key();
    let delta = event.active_requests;
    let store = store.clone();
    let task_key = key.clone();
    let result =
        tokio::task::spawn_blocking(move || store.record_active_requests(&task_key, delta)).await;

    match result {
        Ok(Ok(())) => debug!(worker, service = %key, delta, node = %event.node_id, "recorded active requests"),
        Ok(Err(e)) => warn!(worker, service = %key, error = %e, "could not record active requests"),
        Err(e) => warn!(worker, service = %key, error = %e, "active request writer panicked"),
    }
}

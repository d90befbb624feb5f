//! Periodic store compaction.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use launchpad_state::ScaleStore;

/// Compact until a pass reclaims nothing. Returns the number of passes that
/// made progress.
pub async fn compact_until_done(store: &ScaleStore) -> anyhow::Result<usize> {
    let store = store.clone();
    let passes = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let mut passes = 0;
        while store.compact()? {
            passes += 1;
        }
        Ok(passes)
    })
    .await??;
    Ok(passes)
}

/// Compact the store every `interval` until shutdown.
pub async fn run_compaction(store: ScaleStore, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "store compaction started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match compact_until_done(&store).await {
                    Ok(passes) => debug!(passes, "store compacted"),
                    Err(e) => warn!(error = %e, "store compaction failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("store compaction shutting down");
                break;
            }
        }
    }
}

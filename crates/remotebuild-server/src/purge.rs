//! Background sweep of expired PINs.

use std::sync::Arc;
use std::time::Duration;

use remotebuild_certs::CertificateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often expired PINs are swept.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Delete PINs older than `pin_timeout` minutes every `interval`
/// until `shutdown` changes.
pub fn spawn_pin_purge(
    store: Arc<CertificateStore>,
    pin_timeout: f64,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(pin_timeout, "PIN purge started");
        let mut timer = tokio::time::interval(interval);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let store = Arc::clone(&store);
                    let swept = tokio::task::spawn_blocking(move || {
                        store.purge_expired_pin_based_client_certs_sync(pin_timeout)
                    })
                    .await;
                    match swept {
                        Ok(Ok(purged)) if !purged.is_empty() => {
                            info!(count = purged.len(), ?purged, "Purged expired PINs");
                        }
                        Ok(Ok(_)) => debug!("No expired PINs"),
                        Ok(Err(e)) => warn!(error = %e, "PIN purge failed"),
                        Err(e) => warn!(error = %e, "PIN purge task failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("PIN purge shutting down");
                    return;
                }
            }
        }
    })
}

use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::{snapshot_store::SnapshotStore, storage::StorageError},
    state::SharedState,
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Keep a snapshot store connected, holding the replica in degraded mode while it is not.
pub async fn run<F, Fut>(state: SharedState, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn SnapshotStore>, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match connect().await {
            Ok(store) => {
                state.install_snapshot_store(store.clone()).await;
                info!("snapshot store connected; leaving degraded mode");
                delay = INITIAL_DELAY;

                if !supervise(&state, store.as_ref()).await {
                    warn!("exhausted snapshot store reconnect attempts; reconnecting from scratch");
                    state.clear_snapshot_store().await;
                }

                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(err) => {
                warn!(error = %err, "snapshot store connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Poll the store's health until reconnecting fails for good. Returns `false` then.
async fn supervise(state: &SharedState, store: &dyn SnapshotStore) -> bool {
    loop {
        match store.health_check().await {
            Ok(()) => {
                if state.is_degraded() {
                    info!("snapshot store healthy again; leaving degraded mode");
                    state.update_degraded(false);
                }
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(_) => {
                let mut attempt = 0;
                let mut reconnect_delay = INITIAL_DELAY;
                let mut reconnected = false;

                while attempt < MAX_RECONNECT_ATTEMPTS {
                    match store.try_reconnect().await {
                        Ok(()) => {
                            info!("snapshot store reconnected after health check failure");
                            reconnected = true;
                            break;
                        }
                        Err(reconnect_err) => {
                            if attempt == 0 {
                                warn!(
                                    attempt, error = %reconnect_err,
                                    "snapshot store reconnect failed; entering degraded mode"
                                );
                                state.update_degraded(true);
                            } else {
                                warn!(attempt, error = %reconnect_err, "snapshot store reconnect attempt failed");
                            }
                            attempt += 1;
                            sleep(reconnect_delay).await;
                            reconnect_delay = (reconnect_delay * 2).min(MAX_DELAY);
                        }
                    }
                }

                if !reconnected {
                    return false;
                }
                state.update_degraded(false);
                sleep(HEALTH_POLL_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::fake::FakeNodeClient, config::AppConfig,
        dao::snapshot_store::memory::MemorySnapshotStore, state::AppState,
    };

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_store_connects() {
        let state = AppState::new(AppConfig::default(), Arc::new(FakeNodeClient::default()), None);
        assert!(state.is_degraded());

        let mut attempts = 0;
        let supervisor = tokio::spawn(run(state.clone(), move || {
            attempts += 1;
            let outcome: Result<Arc<dyn SnapshotStore>, StorageError> = if attempts < 3 {
                Err(StorageError::unavailable(
                    "connection refused".into(),
                    std::io::Error::other("refused"),
                ))
            } else {
                Ok(Arc::new(MemorySnapshotStore::new()))
            };
            async move { outcome }
        }));

        let mut degraded = state.degraded_watcher();
        degraded.wait_for(|degraded| !*degraded).await.unwrap();
        assert!(state.snapshot_store().await.is_some());
        supervisor.abort();
    }
}

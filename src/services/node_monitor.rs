use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use crate::state::SharedState;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Ping every audio node at the configured heartbeat interval, forever.
pub async fn run(state: SharedState) {
    let mut ticker = interval(
        state
            .config()
            .nodes
            .heartbeat_interval
            .max(MIN_HEARTBEAT_INTERVAL),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let client = state.node_client();
        state.nodes().heartbeat(client.as_ref()).await;
        debug!(nodes = state.nodes().snapshot().len(), "node heartbeat round finished");
    }
}

//! Gamma Tunes Back binary entrypoint wiring the session manager, node pool, snapshot
//! store and REST/SSE layers.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use gamma_tunes_back::{
    clients::{
        gateway::{HttpVoiceGateway, VoiceGateway},
        node::RestNodeClient,
    },
    config::AppConfig,
    dao::{
        snapshot_store::{SnapshotStore, memory::MemorySnapshotStore},
        storage::StorageError,
    },
    routes,
    services::{event_bridge, node_monitor, sse_events, storage_supervisor, synchronizer},
    state::{AppState, SharedState},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let node_client = RestNodeClient::new().context("building audio node client")?;
    let gateway = match config.gateway.base_url.as_deref() {
        Some(url) => {
            let gateway = HttpVoiceGateway::new(url).context("building voice gateway client")?;
            Some(Arc::new(gateway) as Arc<dyn VoiceGateway>)
        }
        None => {
            warn!("no voice gateway configured; voice join and leave calls are skipped");
            None
        }
    };

    let app_state = AppState::new(config, Arc::new(node_client), gateway);

    spawn_storage_supervisor(app_state.clone());
    tokio::spawn(node_monitor::run(app_state.clone()));
    event_bridge::spawn_reassignment_listener(app_state.clone());
    tokio::spawn(sse_events::announce_degraded_changes(app_state.clone()));
    tokio::spawn(synchronizer::recover_when_ready(app_state.clone()));

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Pick the snapshot backend from the environment and keep it connected in the background.
///
/// `COUCH_BASE_URL` selects CouchDB, `MONGO_URI` selects MongoDB; without either the
/// replica keeps snapshots in memory, which only suits a single replica.
fn spawn_storage_supervisor(state: SharedState) {
    #[cfg(feature = "couch-store")]
    if env::var_os("COUCH_BASE_URL").is_some() {
        use gamma_tunes_back::dao::snapshot_store::couchdb::{CouchConfig, CouchSnapshotStore};

        info!("using CouchDB snapshot store");
        tokio::spawn(storage_supervisor::run(state, || async {
            let config = CouchConfig::from_env()?;
            let store = CouchSnapshotStore::connect(config).await?;
            Ok::<Arc<dyn SnapshotStore>, StorageError>(Arc::new(store))
        }));
        return;
    }

    #[cfg(feature = "mongo-store")]
    if env::var_os("MONGO_URI").is_some() {
        use gamma_tunes_back::dao::snapshot_store::mongodb::{MongoConfig, MongoSnapshotStore};

        info!("using MongoDB snapshot store");
        tokio::spawn(storage_supervisor::run(state, || async {
            let config = MongoConfig::from_env().await?;
            let store = MongoSnapshotStore::connect(config).await?;
            Ok::<Arc<dyn SnapshotStore>, StorageError>(Arc::new(store))
        }));
        return;
    }

    warn!("no shared snapshot store configured; keeping snapshots in memory");
    tokio::spawn(storage_supervisor::run(state, || async {
        Ok::<Arc<dyn SnapshotStore>, StorageError>(Arc::new(MemorySnapshotStore::new()))
    }));
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

use axum::Router;

use crate::state::SharedState;

pub mod commands;
pub mod docs;
pub mod health;
pub mod nodes;
pub mod sse;

/// Compose the API and documentation routes and attach the shared state.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(sse::router())
        .merge(commands::router())
        .merge(nodes::router())
        .merge(docs::router());

    api_router.with_state(state)
}

pub mod action;
pub mod api;
pub mod app;
pub mod command;
pub mod config;
pub mod event;
pub mod monitoring;
pub mod notification;
pub mod shutdown;
pub mod state;
pub mod utils;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use app::Monitor;
pub use state::AppState;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/commands", post(api::handler::handle_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

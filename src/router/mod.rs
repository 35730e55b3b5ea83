//! HTTP router module
//!
//! The control plane rooted at `/server`, plus the console and control
//! WebSocket upgrades.

mod handlers;
mod middleware;
mod websocket;

pub use handlers::ApiError;
pub use middleware::require_auth;
pub use websocket::{console_ws_handler, control_ws_handler};

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Configuration;
use crate::server::Manager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Program registry.
    pub manager: Arc<Manager>,

    /// Global configuration, including `auth.publicKey`.
    pub config: Arc<Configuration>,
}

/// Build the HTTP router with all routes.
pub fn build_router(state: AppState) -> Router {
    let server_routes = Router::new()
        .route("/", put(handlers::servers::create_server))
        .route("/", get(handlers::servers::get_server))
        .route("/", post(handlers::servers::replace_server))
        .route("/", delete(handlers::servers::delete_server))
        .route(
            "/data",
            get(handlers::servers::get_data).post(handlers::servers::post_data),
        )
        .route("/start", post(handlers::servers::start_server))
        .route("/stop", post(handlers::servers::stop_server))
        .route("/kill", post(handlers::servers::kill_server))
        .route("/install", post(handlers::servers::install_server))
        .route(
            "/file/*path",
            get(handlers::files::get_file)
                .put(handlers::files::put_file)
                .delete(handlers::files::delete_file),
        )
        .route(
            "/console",
            post(handlers::servers::post_console).get(websocket::console_ws_handler),
        )
        .route("/logs", get(handlers::servers::get_logs))
        .route("/stats", get(handlers::servers::get_stats))
        .route("/status", get(handlers::servers::get_status))
        .route("/socket", get(websocket::control_ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    Router::new()
        .nest("/server/:id", server_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

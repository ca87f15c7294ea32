//! API router configuration.

use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::handlers::{self, AppState};

/// Create the API router.
pub fn create_router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/local-ips", get(handlers::get_local_ips))
        // Relays
        .route("/tcp/start", post(handlers::start_tcp))
        .route("/tcp/stop", post(handlers::stop_tcp))
        .route("/tcp/running", get(handlers::tcp_running))
        .route("/udp/start", post(handlers::start_udp))
        .route("/udp/stop", post(handlers::stop_udp))
        .route("/udp/running", get(handlers::udp_running))
        .route("/sessions", get(handlers::get_sessions))
        // Statistics
        .route("/stats", get(handlers::get_stats))
        .route("/connections", get(handlers::get_connections))
        .route("/history", get(handlers::get_history))
        // Rules
        .route(
            "/rules",
            get(handlers::list_rules)
                .post(handlers::add_rule)
                .put(handlers::update_rule),
        )
        .route("/rules/delete", post(handlers::delete_rules))
        // Templates
        .route(
            "/templates",
            get(handlers::list_templates)
                .post(handlers::save_template)
                .put(handlers::rename_template),
        )
        .route("/templates/apply", post(handlers::apply_template))
        .route("/templates/delete", post(handlers::delete_template))
        .route("/templates/start", post(handlers::start_template))
        .route("/templates/stop", post(handlers::stop_template))
        .route("/log", get(handlers::get_log))
        .with_state(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Serve static files if directory is provided
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app
}

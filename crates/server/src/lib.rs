// crates/server/src/lib.rs
//! iAvatar server library.
//!
//! Axum HTTP front end that turns an uploaded portrait and voice clip into a
//! talking-head video, running generation as GPU-bounded background jobs.

pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod upload;

pub use config::Config;
pub use error::*;
pub use metrics::{init_metrics, render_metrics};
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use axum::Router;
use iavatar_observability::{make_request_span, propagate_request_id_layer, set_request_id_layer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - Generation, polling, health and metrics routes
/// - A body limit sized for two uploads
/// - CORS (allows any origin)
/// - Request tracing with an `x-request-id` per request
pub fn create_app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.body_limit();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(propagate_request_id_layer())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<Body>| make_request_span(req)),
        )
        .layer(set_request_id_layer())
}


// ============================================================================
// Integration Tests
// ============================================================================

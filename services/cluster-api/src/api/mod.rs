//! HTTP API handlers and routing.

mod clusters;
pub mod error;
mod graph;
mod health;
mod jobs;
pub mod request_context;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method},
    Router,
};
use clustree_id::ClusterId;
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;
use error::ApiError;
use request_context::RequestContext;

pub use clusters::ROSTER_FIELD;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    let cluster_routes = clusters::routes()
        .merge(graph::routes())
        .merge(jobs::routes());

    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .nest("/cluster", cluster_routes)
        .layer(DefaultBodyLimit::max(state.max_upload_bytes()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Envelope for list endpoints.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

pub(crate) fn parse_cluster_id(ctx: &RequestContext, raw: &str) -> Result<ClusterId, ApiError> {
    raw.parse().map_err(|e: clustree_id::IdError| {
        ctx.error(ApiError::bad_request(
            "invalid_cluster_id",
            format!("invalid cluster id: {e}"),
        ))
    })
}

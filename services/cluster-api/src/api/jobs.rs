//! Solver endpoints.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use super::error::ApiError;
use super::request_context::{Authenticated, RequestContext};
use super::{parse_cluster_id, ListResponse};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/scripts", get(list_scripts))
        .route("/teacher/{cluster_id}/run/{script}", post(run))
        .route("/teacher/{cluster_id}/job", get(job_status))
}

/// GET /cluster/scripts
async fn list_scripts(
    ctx: RequestContext,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let scripts = state
        .service()
        .list_scripts()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(scripts)))
}

/// POST /cluster/teacher/{cluster_id}/run/{script}
///
/// Waits for the solver. 200 with stdout on success; failures carry the full
/// captured stderr.
async fn run(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
    Path((cluster_id, script)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_cluster_id(&ctx, &cluster_id)?;
    info!(request_id = %ctx.request_id, cluster_id = %id, script = %script, "Solver run requested");

    let result = state
        .service()
        .run_solver(&actor, id, &script)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(result))
}

/// GET /cluster/teacher/{cluster_id}/job
async fn job_status(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_cluster_id(&ctx, &cluster_id)?;
    let status = state
        .service()
        .job_status(&actor, id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(status))
}

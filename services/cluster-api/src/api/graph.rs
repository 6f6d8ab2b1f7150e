//! Artifact and result reads, open to the owner and authorized students.

use axum::{
    extract::{Path, State},
    http::header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use super::error::ApiError;
use super::parse_cluster_id;
use super::request_context::Authenticated;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{cluster_id}/graph/raw", get(graph_raw))
        .route("/{cluster_id}/graph/file", get(graph_file))
        .route("/{cluster_id}/result", get(result))
}

/// GET /cluster/{cluster_id}/graph/raw
async fn graph_raw(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_cluster_id(&ctx, &cluster_id)?;
    let artifact = state
        .service()
        .graph(&actor, id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(artifact))
}

/// GET /cluster/{cluster_id}/graph/file
///
/// The stored bytes as an attachment, exactly as the solver reads them.
async fn graph_file(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_cluster_id(&ctx, &cluster_id)?;
    let file = state
        .service()
        .graph_file(&actor, id)
        .await
        .map_err(|e| ctx.error(e))?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        attachment_name(&file.file_name)
    );
    Ok((
        [
            (CONTENT_TYPE, "application/json".to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        file.bytes,
    ))
}

/// GET /cluster/{cluster_id}/result
async fn result(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_cluster_id(&ctx, &cluster_id)?;
    let value = state
        .service()
        .result(&actor, id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(value))
}

/// Header-safe file name: ASCII letters, digits, `-`, `_` and `.` only.
fn attachment_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

//! Teacher and student cluster endpoints.

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use clustree_id::ClusterId;
use serde::Serialize;

use super::error::{ApiError, FieldError};
use super::request_context::Authenticated;
use super::{parse_cluster_id, ListResponse};
use crate::registry::ClusterFields;
use crate::state::AppState;

/// Multipart part carrying the roster file. `roster` is accepted as an alias.
pub const ROSTER_FIELD: &str = "file";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/teacher/create", post(create_cluster))
        .route("/teacher/delete/{cluster_id}", delete(delete_cluster))
        .route("/teacher/list", get(list_teacher_clusters))
        .route("/teacher/audit", get(audit))
        .route("/student/list", get(list_student_clusters))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: ClusterId,
    pub deleted: bool,
}

fn multipart_error(e: MultipartError) -> ApiError {
    ApiError::new(e.status(), "invalid_multipart", e.body_text())
}

fn parse_int(field: &str, value: &str) -> Result<i32, ApiError> {
    value.trim().parse().map_err(|_| {
        ApiError::bad_request("invalid_cluster", format!("{field} must be an integer")).with_details(
            vec![FieldError {
                field: field.to_string(),
                message: format!("expected an integer, got {value:?}"),
            }],
        )
    })
}

/// Split the multipart body into cluster fields and the roster bytes.
async fn read_form(multipart: &mut Multipart) -> Result<(ClusterFields, Bytes), ApiError> {
    let mut form = ClusterFields::default();
    let mut roster = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == ROSTER_FIELD || name == "roster" {
            roster = Some(field.bytes().await.map_err(multipart_error)?);
            continue;
        }

        let value = field.text().await.map_err(multipart_error)?;
        match name.as_str() {
            "name" => form.name = value,
            "clusterType" => form.cluster_type = Some(value),
            "groupSize" => form.group_size = Some(parse_int(&name, &value)?),
            "minAffinity" => form.min_affinity = Some(parse_int(&name, &value)?),
            "maxAffinity" => form.max_affinity = Some(parse_int(&name, &value)?),
            _ => {}
        }
    }

    let roster = roster.ok_or_else(|| {
        ApiError::bad_request(
            "missing_roster",
            format!("multipart field '{ROSTER_FIELD}' with the roster is required"),
        )
    })?;

    Ok((form, roster))
}

/// POST /cluster/teacher/create
async fn create_cluster(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let (form, roster) = read_form(&mut multipart)
        .await
        .map_err(|e| ctx.error(e))?;

    let created = state
        .service()
        .create_cluster(&actor, form, &roster)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE /cluster/teacher/delete/{cluster_id}
async fn delete_cluster(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_cluster_id(&ctx, &cluster_id)?;
    state
        .service()
        .delete_cluster(&actor, id)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok(Json(DeleteResponse { id, deleted: true }))
}

/// GET /cluster/teacher/list
async fn list_teacher_clusters(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .service()
        .teacher_clusters(&actor)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(items)))
}

/// GET /cluster/student/list
async fn list_student_clusters(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .service()
        .student_clusters(&actor)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(items)))
}

/// GET /cluster/teacher/audit
async fn audit(
    Authenticated { ctx, actor }: Authenticated,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .service()
        .audit(&actor)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(items)))
}

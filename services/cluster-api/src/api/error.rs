use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use clustree_affinity::{GraphError, StoreError};
use serde::Serialize;
use tracing::error;

use crate::registry::{RegistryError, ValidationError};
use crate::service::ServiceError;
use crate::solver::SolverError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
    /// Captured solver output, for solver failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://clustree.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            details: None,
            stdout: None,
            stderr: None,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.problem.details = Some(details);
        self
    }

    pub fn with_retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.problem.stdout = Some(stdout);
        self.problem.stderr = Some(stderr);
        self
    }

    pub fn code(&self) -> &str {
        &self.problem.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

fn validation_error(e: &ValidationError) -> ApiError {
    let field = match e {
        ValidationError::Name(_) => "name",
        ValidationError::GroupSize(_) => "groupSize",
        ValidationError::AffinityBounds { .. } => "minAffinity",
        ValidationError::ClusterType => "clusterType",
    };
    ApiError::bad_request("invalid_cluster", e.to_string()).with_details(vec![FieldError {
        field: field.to_string(),
        message: e.to_string(),
    }])
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidKey(e) => ApiError::bad_request("invalid_key", e.to_string()),
            StoreError::NotFound(_) => ApiError::not_found("not_found", e.to_string()),
            StoreError::Corrupt { .. } => {
                error!(error = %e, "Corrupt artifact");
                ApiError::internal("corrupt_artifact", e.to_string())
            }
            StoreError::Encode(_) | StoreError::Io { .. } => {
                error!(error = %e, "Artifact storage failure");
                ApiError::internal("storage_error", "Artifact storage failed")
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Conflict { .. } => ApiError::conflict("cluster_exists", e.to_string()),
            RegistryError::Invalid(e) => validation_error(&e),
            RegistryError::Db(e) => {
                error!(error = %e, "Registry failure");
                ApiError::internal("internal_error", "Cluster registry unavailable")
            }
        }
    }
}

impl From<SolverError> for ApiError {
    fn from(e: SolverError) -> Self {
        match e {
            SolverError::AlreadyRunning { .. } => {
                ApiError::conflict("job_already_running", e.to_string()).with_retryable()
            }
            SolverError::ScriptNotFound(_) => ApiError::not_found("script_not_found", e.to_string()),
            SolverError::InputArtifactMissing { .. } => {
                ApiError::not_found("artifact_missing", e.to_string())
            }
            SolverError::InvalidKey(_) => ApiError::bad_request("invalid_script", e.to_string()),
            SolverError::Timeout { .. } => ApiError::gateway_timeout("solver_timeout", e.to_string()),
            SolverError::Failed {
                exit_code,
                stdout,
                stderr,
            } => {
                let detail = if stderr.trim().is_empty() {
                    format!("solver exited with code {exit_code:?}")
                } else {
                    stderr.clone()
                };
                ApiError::internal("solver_failed", detail).with_output(stdout, stderr)
            }
            SolverError::Store(e) => e.into(),
            SolverError::Spawn { .. } | SolverError::Io { .. } | SolverError::Aborted => {
                error!(error = %e, "Solver execution failure");
                ApiError::internal("solver_error", e.to_string())
            }
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Roster(_) => ApiError::bad_request("invalid_roster", e.to_string()),
            ServiceError::Graph(GraphError::EmptyRoster) => {
                ApiError::bad_request("empty_roster", e.to_string())
            }
            ServiceError::Graph(GraphError::MissingConfig(_)) => {
                ApiError::bad_request("invalid_solver_config", e.to_string())
            }
            ServiceError::Validation(e) => validation_error(&e),
            ServiceError::InvalidKey(_) => ApiError::bad_request("invalid_key", e.to_string()),
            ServiceError::Registry(e) => e.into(),
            ServiceError::Store(e) => e.into(),
            ServiceError::Solver(e) => e.into(),
            ServiceError::ClusterNotFound(_) => {
                ApiError::not_found("cluster_not_found", e.to_string())
            }
            ServiceError::ArtifactMissing(_) => {
                ApiError::not_found("artifact_missing", e.to_string())
            }
            ServiceError::ResultMissing(_) => ApiError::not_found("result_missing", e.to_string()),
            ServiceError::Forbidden(_) => ApiError::forbidden("forbidden", e.to_string()),
            ServiceError::OwnerMissing(_) => {
                error!(error = %e, "Cluster owner cannot be resolved");
                ApiError::internal("owner_missing", e.to_string())
            }
        }
    }
}

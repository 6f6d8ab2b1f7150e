//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use clustree_affinity::roster::is_valid_email;
use clustree_id::RequestId;
use tracing::debug;

use crate::api::error::ApiError;
use crate::service::Actor;
use crate::state::AppState;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Email claimed by a `Bearer user:<email>` token, not yet resolved.
    pub actor_email: Option<String>,
}

impl RequestContext {
    /// Attach this request's id to an error.
    pub fn error(&self, e: impl Into<ApiError>) -> ApiError {
        e.into().with_request_id(self.request_id.clone())
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Development bearer convention: `Bearer user:<email>`. Token issuance lives
/// outside this service.
fn email_from_authorization_header(
    headers: &HeaderMap,
    request_id: &str,
) -> Result<Option<String>, ApiError> {
    let Some(auth_value) = header_string(headers, AUTHORIZATION_HEADER) else {
        return Ok(None);
    };

    let auth_value = auth_value.trim();
    let Some(token) = auth_value.strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        )
        .with_request_id(request_id.to_string()));
    };

    let email = token.trim().strip_prefix("user:").map(str::trim);
    match email {
        Some(email) if is_valid_email(email) => Ok(Some(email.to_string())),
        _ => Err(ApiError::unauthorized(
            "invalid_token",
            "token must be in the form 'user:<email>'",
        )
        .with_request_id(request_id.to_string())),
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());

        let actor_email = email_from_authorization_header(&parts.headers, &request_id)?;

        Ok(Self {
            request_id,
            actor_email,
        })
    }
}

/// A request whose bearer identity resolved to an account.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub ctx: RequestContext,
    pub actor: Actor,
}

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let ctx = RequestContext::from_request_parts(parts, state).await?;

        let Some(email) = ctx.actor_email.clone() else {
            return Err(ctx.error(ApiError::unauthorized(
                "unauthenticated",
                "Authorization header required",
            )));
        };

        let user_id = state
            .service()
            .identities()
            .resolve_user_id_by_email(&email)
            .await
            .map_err(|e| ctx.error(e))?;

        let Some(user_id) = user_id else {
            debug!(request_id = %ctx.request_id, "Bearer identity has no account");
            return Err(ctx.error(ApiError::unauthorized(
                "unknown_user",
                "No account for this identity",
            )));
        };

        Ok(Self {
            ctx,
            actor: Actor { user_id, email },
        })
    }
}

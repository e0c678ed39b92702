use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error taxonomy surfaced at the HTTP/WebSocket boundary. Every variant
/// renders as a JSON body `{"error": "..."}` with the mapped status; internal
/// detail stays in the log.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 400
    #[error("{0}")]
    BadRequest(String),

    /// 401; the presented token is never echoed back
    #[error("{0}")]
    AuthFailure(String),

    /// 403
    #[error("{0}")]
    Forbidden(String),

    /// 404
    #[error("{0}")]
    NotFound(String),

    /// 409
    #[error("{0}")]
    Conflict(String),

    /// 429
    #[error("too many requests")]
    Throttled,

    /// 503
    #[error("{0}")]
    Unavailable(String),

    /// 5xx with the upstream status preserved where it is a valid server code
    #[error("upstream error: {message}")]
    Upstream { status: u16, message: String },

    /// 500; the chain is logged, never surfaced
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn forbidden() -> Self {
        ApiError::Forbidden("permission denied".into())
    }

    pub fn unauthorized() -> Self {
        ApiError::AuthFailure("authentication required".into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(e) => {
                tracing::error!(error = ?e, "internal error");
                self.to_string()
            }
            other => {
                if status.is_server_error() {
                    tracing::warn!(%status, error = %other, "request failed");
                }
                other.to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::AuthFailure("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Throttled.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::Conflict("reused".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Upstream {
                status: 502,
                message: "bad".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn invalid_upstream_status_degrades_to_bad_gateway() {
        let e = ApiError::Upstream {
            status: 99,
            message: "weird".into(),
        };
        assert_eq!(e.status(), StatusCode::BAD_GATEWAY);
    }
}

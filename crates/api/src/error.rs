use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tankalarm_core::error::{AuthError, CoreError};

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds the local-network refusal.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `tankalarm_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The caller is not on a local network.
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = None;

        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::NotFound(what) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", format!("{what} not found"))
                }
                CoreError::Capacity { .. } => (
                    StatusCode::INSUFFICIENT_STORAGE,
                    "CAPACITY_EXCEEDED",
                    core.to_string(),
                ),
                CoreError::Auth(auth) => match auth {
                    AuthError::Invalid { .. } => {
                        (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIAL", auth.to_string())
                    }
                    AuthError::Throttled { retry_after_secs } => {
                        retry_after = Some(*retry_after_secs);
                        (StatusCode::TOO_MANY_REQUESTS, "THROTTLED", auth.to_string())
                    }
                    AuthError::Locked { .. } => {
                        (StatusCode::LOCKED, "LOCKED_OUT", auth.to_string())
                    }
                },
                CoreError::ConfigVersion { .. } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "CONFIG_VERSION",
                    core.to_string(),
                ),
                CoreError::CorruptIndex { .. } | CoreError::Persistence(_) => {
                    tracing::error!(error = %core, "Internal core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

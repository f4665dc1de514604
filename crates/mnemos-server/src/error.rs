//! API Error Mapping
//!
//! Maps the core error precedence onto HTTP statuses. User-visible messages
//! stay generic; the detail (Debug form) goes to the server log only.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mnemos_core::CoreError;

/// Wrapper so handlers can `?` core errors straight into responses
pub struct ApiError(pub CoreError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

fn status_for(e: &CoreError) -> StatusCode {
    match e {
        CoreError::AuthRequired => StatusCode::UNAUTHORIZED,
        CoreError::SessionLocked => StatusCode::LOCKED,
        CoreError::BadPassphrase => StatusCode::UNAUTHORIZED,
        CoreError::TamperDetected => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
        CoreError::ConversionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::ModelMismatch { .. } => StatusCode::CONFLICT,
        CoreError::InsufficientShares { .. } => StatusCode::BAD_REQUEST,
        CoreError::QuotaExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("request failed: {:?}", self.0);
        } else {
            tracing::debug!("request rejected: {:?}", self.0);
        }
        // Display is the generic form; internals never leak
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_maps_to_statuses() {
        assert_eq!(status_for(&CoreError::AuthRequired), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&CoreError::SessionLocked), StatusCode::LOCKED);
        assert_eq!(
            status_for(&CoreError::Conflict("dup".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CoreError::QuotaExceeded("big".into())),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&CoreError::internal("secret detail")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_never_reaches_body() {
        let e = CoreError::internal("sqlite page 88 corrupt");
        assert_eq!(e.to_string(), "internal error");
    }
}

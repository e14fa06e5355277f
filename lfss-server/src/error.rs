use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lfss_core::LfssError;
use serde_json::json;

/// Wraps `LfssError` so it can be used as an axum handler error type;
/// the mapping follows the status-code taxonomy named in the external
/// interfaces.
pub struct ApiError(pub LfssError);

impl From<LfssError> for ApiError {
    fn from(e: LfssError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LfssError::InvalidPath(_)
            | LfssError::InvalidInput(_)
            | LfssError::InvalidOptions(_)
            | LfssError::InvalidData(_) => StatusCode::BAD_REQUEST,
            LfssError::PathNotFound(_) | LfssError::FileNotFound(_) | LfssError::UserNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            LfssError::PermissionDenied => StatusCode::FORBIDDEN,
            LfssError::FileExists(_) | LfssError::FileDuplicate(_) => StatusCode::CONFLICT,
            LfssError::FileLocked(_) => StatusCode::LOCKED,
            LfssError::StorageExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            LfssError::TooManyItems => StatusCode::BAD_REQUEST,
            LfssError::DatabaseLocked | LfssError::DatabaseTransaction(_) => StatusCode::SERVICE_UNAVAILABLE,
            LfssError::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            LfssError::UnsupportedContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            LfssError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "unhandled internal error");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

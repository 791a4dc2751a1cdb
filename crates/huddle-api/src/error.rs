use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Failures surfaced synchronously to whoever invoked a pipeline operation.
#[derive(Debug, Error)]
pub enum ApiError {
    // -- Not found --
    #[error("topic not found")]
    TopicNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("notification not found")]
    NotificationNotFound,

    // -- Permission denied --
    #[error("not a member of this project")]
    NotAMember,

    #[error("only the author can do that")]
    NotAuthor,

    // -- Invalid input --
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    InvalidCommand(&'static str),

    #[error("unknown command: /{0}")]
    UnknownCommand(String),

    // -- Internal --
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TopicNotFound | Self::MessageNotFound | Self::NotificationNotFound => {
                StatusCode::NOT_FOUND
            }
            Self::NotAMember | Self::NotAuthor => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) | Self::InvalidCommand(_) | Self::UnknownCommand(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show the caller. Storage details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Storage(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Storage(e) = &self {
            error!("Storage failure: {:#}", e);
        }
        let body = Json(json!({ "error": self.user_message() }));
        (self.status_code(), body).into_response()
    }
}

/// Run blocking storage work off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Storage(e.into())
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(ApiError::TopicNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::NotificationNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::NotAMember.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotAuthor.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::InvalidCommand("topic name required").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::UnknownCommand("frobnicate".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Storage(anyhow::anyhow!("disk full")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn storage_details_are_not_leaked() {
        let err = ApiError::Storage(anyhow::anyhow!("UNIQUE constraint failed: users.email"));
        assert_eq!(err.user_message(), "internal server error");
        assert_eq!(
            ApiError::UnknownCommand("frobnicate".into()).user_message(),
            "unknown command: /frobnicate"
        );
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::QueryError;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("batch of {got} events exceeds the limit of {limit}")]
    BatchTooLarge { got: usize, limit: usize },

    #[error("invalid query parameter `{param}`: {reason}")]
    InvalidParam { param: &'static str, reason: String },

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidBody(_) => "invalid_body",
            Self::BatchTooLarge { .. } => "batch_too_large",
            Self::InvalidParam { .. } => "invalid_param",
            Self::Query(QueryError::InvalidRange { .. }) => "invalid_range",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::InvalidBody(_) | Self::InvalidParam { .. } | Self::Query(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::BatchTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        };

        let message = self.to_string();
        (
            status,
            Json(ErrorBody {
                error: self.kind(),
                message: &message,
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

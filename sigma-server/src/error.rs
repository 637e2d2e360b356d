use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sigma_core::GenerationError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": match self.status {
                    StatusCode::BAD_REQUEST => "invalid_request_error",
                    StatusCode::SERVICE_UNAVAILABLE => "unavailable_error",
                    _ => "server_error",
                },
                "code": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        let status = match &err {
            GenerationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GenerationError::PipelineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GenerationError::OutOfMemory(_)
            | GenerationError::NoImages
            | GenerationError::EncodingFailed(_)
            | GenerationError::PipelineFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

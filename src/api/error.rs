use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::error::VmError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl VmError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            VmError::Validation(_) => StatusCode::BAD_REQUEST,
            VmError::NotFound(_) => StatusCode::NOT_FOUND,
            VmError::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            VmError::Provisioning(_)
            | VmError::Supervisor(_)
            | VmError::Metadata(_)
            | VmError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for VmError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("request failed: {}", self);
        }

        (
            status,
            Json(ErrorBody {
                error: self.kind().to_string(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<JsonRejection> for VmError {
    fn from(rejection: JsonRejection) -> Self {
        VmError::Validation(rejection.body_text())
    }
}

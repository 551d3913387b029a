//! HTTP error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use remotebuild_certs::CertError;
use remotebuild_core::Localizer;
use serde::Serialize;

use crate::build::BuildError;
use crate::builder::BuilderError;

/// An error rendered as `{"status":..,"messageId":..,"message":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub message_id: String,
    pub message: String,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        localizer: &dyn Localizer,
        lang: &str,
        message_id: &str,
        args: &[String],
    ) -> Self {
        Self {
            status,
            message_id: message_id.to_string(),
            message: localizer.message(lang, message_id, args),
        }
    }

    /// Build routes reached without a client certificate.
    pub fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message_id: "ClientCertificateRequired".to_string(),
            message: "A client certificate is required".to_string(),
        }
    }

    pub fn from_build(err: &BuildError, localizer: &dyn Localizer, lang: &str) -> Self {
        let (id, args) = err.message();
        Self::new(build_status(err), localizer, lang, id, &args)
    }

    pub fn from_cert(err: &CertError, localizer: &dyn Localizer, lang: &str) -> Self {
        let (status, id, args) = match err {
            CertError::PinNotFound(pin) => (StatusCode::NOT_FOUND, "InvalidPin", vec![pin.to_string()]),
            CertError::PinExpired(pin) => (StatusCode::GONE, "ExpiredPin", vec![pin.to_string()]),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                vec![other.to_string()],
            ),
        };
        Self::new(status, localizer, lang, id, &args)
    }
}

fn build_status(err: &BuildError) -> StatusCode {
    match err {
        BuildError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BuildError::Unroutable(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
        BuildError::Invalid(_)
        | BuildError::BuildNumberInUse(_)
        | BuildError::NotComplete { .. } => StatusCode::BAD_REQUEST,
        BuildError::NotFound(_)
        | BuildError::Malformed(_)
        | BuildError::Builder(BuilderError::NoArtifact(_)) => StatusCode::NOT_FOUND,
        BuildError::EmulateDisabled => StatusCode::FORBIDDEN,
        BuildError::Unroutable(_)
        | BuildError::Upload { .. }
        | BuildError::Builder(_)
        | BuildError::Transition(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

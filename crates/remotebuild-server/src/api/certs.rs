//! PIN redemption.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use remotebuild_certs::CertError;
use tracing::{info, warn};

use super::{ApiError, AppState};

/// `GET /certs/{pin}`: the sealed client bundle. The PIN is invalidated
/// whether or not the download succeeds.
pub async fn download(
    State(state): State<AppState>,
    Path(pin): Path<u32>,
    headers: HeaderMap,
) -> Response {
    let certs = state.certs.clone();
    let timeout = state.pin_timeout;
    let result = tokio::task::spawn_blocking(move || {
        let result = certs.download_client_certs(pin, timeout);
        if let Err(e) = certs.invalidate_pin(pin) {
            warn!(pin, error = %e, "Failed to invalidate PIN");
        }
        result
    })
    .await
    .unwrap_or_else(|e| Err(CertError::Io(std::io::Error::other(e))));

    match result {
        Ok(bundle) => {
            info!(pin, "Client certificate downloaded");
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"client-{pin}.bundle\""),
                    ),
                ],
                bundle,
            )
                .into_response()
        }
        Err(e) => {
            let lang = headers
                .get(header::ACCEPT_LANGUAGE)
                .and_then(|v| v.to_str().ok())
                .and_then(crate::build::request::primary_language)
                .unwrap_or_else(|| state.lang.clone());
            ApiError::from_cert(&e, state.localizer.as_ref(), &lang).into_response()
        }
    }
}

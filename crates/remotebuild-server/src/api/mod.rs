//! HTTP surface.
//!
//! Build routes are nested under each configured module mount path
//! (`/cordova/build/tasks`, ...). `/certs/{pin}` sits at the root and is the
//! only route reachable without a client certificate when TLS is on.

pub mod builds;
pub mod certs;
pub mod error;

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use remotebuild_certs::CertificateStore;
use remotebuild_core::Localizer;

use crate::build::BuildManager;
use crate::tls::PeerIdentity;

pub use error::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BuildManager>,
    pub certs: Arc<CertificateStore>,
    pub localizer: Arc<dyn Localizer>,
    /// Fallback language for messages.
    pub lang: String,
    /// PIN lifetime in minutes.
    pub pin_timeout: f64,
}

/// Refuse connections that did not present a CA-signed client certificate.
async fn require_client_cert(request: Request, next: Next) -> Response {
    let verified = request
        .extensions()
        .get::<PeerIdentity>()
        .is_some_and(|peer| peer.verified);
    if verified {
        next.run(request).await
    } else {
        ApiError::forbidden().into_response()
    }
}

/// Routes for one mount path.
fn build_routes(require_client_cert_layer: bool) -> Router<AppState> {
    let routes = Router::new()
        .route("/build/tasks", post(builds::submit).get(builds::list))
        .route("/build/tasks/{id}", get(builds::status))
        .route("/build/tasks/{id}/log", get(builds::log))
        .route("/build/metrics", get(builds::metrics))
        .route("/build/{id}/download", get(builds::download))
        .route("/build/{id}/emulate", get(builds::emulate))
        .route("/build/{id}/deploy", get(builds::deploy))
        .route("/build/{id}/run", get(builds::run))
        .route("/build/{id}/debug", get(builds::debug));
    if require_client_cert_layer {
        routes.route_layer(middleware::from_fn(require_client_cert))
    } else {
        routes
    }
}

/// Build the router. With `secure` set, build routes need a client
/// certificate.
pub fn build_router(state: AppState, secure: bool) -> Router {
    let builds = build_routes(secure);
    let mut app = Router::new().route("/certs/{pin}", get(certs::download));
    for mount in state.manager.redirector().mount_paths() {
        app = app.nest(&format!("/{mount}"), builds.clone());
    }
    app.layer(DefaultBodyLimit::disable()).with_state(state)
}

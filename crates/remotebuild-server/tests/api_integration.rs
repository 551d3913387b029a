#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
//! Integration tests for the HTTP surface: client-certificate gating, PIN
//! redemption and the build task endpoints, driven through the router with
//! `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use remotebuild_certs::CertificateStore;
use remotebuild_core::DefaultMessages;
use remotebuild_server::api::{AppState, build_router};
use remotebuild_server::tls::PeerIdentity;
use tower::ServiceExt;

use common::{FakeBuilder, manager, manager_conf, upload, wait_finished};

struct Fixture {
    _dir: tempfile::TempDir,
    state: AppState,
}

fn fixture(pin_timeout: f64, allows_emulate: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut conf = manager_conf(dir.path(), 10);
    conf.allows_emulate = allows_emulate;
    let manager = manager(conf, &FakeBuilder::new(100));
    let certs = Arc::new(CertificateStore::new(dir.path().join("certs"), "localhost"));
    certs.initialize_server_certs().unwrap();
    Fixture {
        _dir: dir,
        state: AppState {
            manager,
            certs,
            localizer: Arc::new(DefaultMessages),
            lang: "en".to_string(),
            pin_timeout,
        },
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn verified(mut request: Request<Body>) -> Request<Body> {
    request
        .extensions_mut()
        .insert(PeerIdentity { verified: true });
    request
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

async fn json(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let (status, _, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn secure_build_routes_need_a_client_certificate() {
    let fx = fixture(10.0, true);
    let app = build_router(fx.state.clone(), true);

    let (status, body) = json(&app, get("/cordova/build/tasks")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["messageId"], "ClientCertificateRequired");

    let unverified = {
        let mut request = get("/cordova/build/tasks");
        request.extensions_mut().insert(PeerIdentity::default());
        request
    };
    assert_eq!(send(&app, unverified).await.0, StatusCode::FORBIDDEN);

    let (status, body) = json(&app, verified(get("/cordova/build/tasks"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], 0);
    assert_eq!(body["metrics"]["submitted"], 0);
}

#[tokio::test]
async fn pin_download_works_once_without_a_client_certificate() {
    let fx = fixture(10.0, true);
    let app = build_router(fx.state.clone(), true);

    let (status, body) = json(&app, get("/certs/123456")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["messageId"], "InvalidPin");

    let pin = fx.state.certs.generate_client_cert().unwrap();
    let (status, headers, bundle) = send(&app, get(&format!("/certs/{pin}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
    assert!(!bundle.is_empty());

    let (status, _, _) = send(&app, get(&format!("/certs/{pin}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_pin_is_gone_and_invalidated() {
    let fx = fixture(0.0, true);
    let app = build_router(fx.state.clone(), true);
    let pin = fx.state.certs.generate_client_cert().unwrap();

    let (status, body) = json(&app, get(&format!("/certs/{pin}"))).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["messageId"], "ExpiredPin");

    let (status, _, _) = send(&app, get(&format!("/certs/{pin}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn submit_status_download_round_trip() {
    let fx = fixture(10.0, true);
    let app = build_router(fx.state.clone(), false);

    let submit = Request::builder()
        .method("POST")
        .uri("/cordova/build/tasks?cfg=debug&command=build")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(upload()))
        .unwrap();
    let (status, headers, body) = send(&app, submit).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let record: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let n = record["buildNumber"].as_u64().unwrap();
    assert_eq!(
        headers[header::LOCATION].to_str().unwrap(),
        format!("/cordova/build/tasks/{n}")
    );
    assert_eq!(record["configuration"], "debug");

    wait_finished(&fx.state.manager, n).await;
    let (status, body) = json(&app, get(&format!("/cordova/build/tasks/{n}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Complete");

    let (status, _, artifact) = send(&app, get(&format!("/cordova/build/{n}/download"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(artifact, b"ipa");

    let (status, body) = json(&app, get(&format!("/cordova/build/{n}/run"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Running");

    let (status, body) = json(&app, get("/cordova/build/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["submitted"], 1);
    assert_eq!(body["succeeded"], 1);
    assert_eq!(body["downloaded"], 1);
}

#[tokio::test]
async fn bad_requests_are_reported_with_message_ids() {
    let fx = fixture(10.0, false);
    let app = build_router(fx.state.clone(), false);

    let submit = Request::builder()
        .method("POST")
        .uri("/cordova/build/tasks?cfg=profile")
        .body(Body::from(upload()))
        .unwrap();
    let (status, body) = json(&app, submit).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["messageId"], "InvalidBuildSubmission400");
    let metrics = fx.state.manager.metrics();
    assert_eq!(metrics.submitted, 1);
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.accepted, 0);

    let (status, body) = json(&app, get("/cordova/build/tasks/31337")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["messageId"], "BuildNotFound");

    let (status, _, _) = send(&app, get("/cordova/build/31337/download")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = json(&app, get("/cordova/build/1/emulate")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["messageId"], "EmulateDisabled");

    let (status, _, log) = send(&app, get("/cordova/build/tasks/31337/log?offset=0")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(log.is_empty());

    // Lookups and refused actions are not submissions.
    let metrics = fx.state.manager.metrics();
    assert_eq!(metrics.submitted, 1);
    assert_eq!(metrics.submitted, metrics.rejected + metrics.failed + metrics.succeeded);
}

//! Build endpoints, mounted under every module's mount path.

use std::collections::HashMap;

use axum::Json;
use axum::body::Body;
use axum::extract::{NestedPath, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use super::{ApiError, AppState};
use crate::build::BuildRequest;
use crate::build::request::primary_language;
use crate::builder::{ActionParams, DeviceAction};

/// Preferred language of the caller, or the server default.
fn language(headers: &HeaderMap, state: &AppState) -> String {
    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .and_then(primary_language)
        .unwrap_or_else(|| state.lang.clone())
}

/// `POST /{mount}/build/tasks`: upload a gzip tarball and start a build.
pub async fn submit(
    State(state): State<AppState>,
    nested: NestedPath,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let lang = language(&headers, &state);
    let accept_language = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok());
    let request = match BuildRequest::from_query(&query, accept_language) {
        Ok(request) => request,
        Err(errors) => {
            state.manager.reject_malformed(&errors);
            return ApiError::new(
                StatusCode::BAD_REQUEST,
                state.localizer.as_ref(),
                &lang,
                "InvalidBuildSubmission400",
                &[errors.join("; ")],
            )
            .into_response();
        }
    };

    let upload = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    match state.manager.submit(request, upload).await {
        Ok(record) => {
            let location = format!(
                "{}/build/tasks/{}",
                nested.as_str().trim_end_matches('/'),
                record.build_number
            );
            (
                StatusCode::ACCEPTED,
                [(header::LOCATION, location)],
                Json(record),
            )
                .into_response()
        }
        Err(e) => ApiError::from_build(&e, state.localizer.as_ref(), &lang).into_response(),
    }
}

/// `GET /{mount}/build/tasks`: every build plus queue state.
pub async fn list(State(state): State<AppState>) -> Response {
    Json(state.manager.get_all_build_info()).into_response()
}

/// `GET /{mount}/build/tasks/{id}`
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    match state.manager.get_build_info(id) {
        Some(record) => Json(record).into_response(),
        None => ApiError::new(
            StatusCode::NOT_FOUND,
            state.localizer.as_ref(),
            &language(&headers, &state),
            "BuildNotFound",
            &[id.to_string()],
        )
        .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    offset: u64,
}

/// `GET /{mount}/build/tasks/{id}/log?offset=N`
pub async fn log(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<LogQuery>,
) -> Response {
    let bytes = state.manager.download_build_log(id, query.offset).await;
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        bytes,
    )
        .into_response()
}

/// `GET /{mount}/build/{id}/download`: the build artifact.
pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    let lang = language(&headers, &state);
    let path = match state.manager.download_build(id).await {
        Ok(path) => path,
        Err(e) => return ApiError::from_build(&e, state.localizer.as_ref(), &lang).into_response(),
    };
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            return ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                state.localizer.as_ref(),
                &lang,
                "InternalServerError",
                &[e.to_string()],
            )
            .into_response();
        }
    };
    let filename = path
        .file_name()
        .map_or_else(|| format!("build-{id}"), |n| n.to_string_lossy().into_owned());
    debug!(build_number = id, %filename, "Streaming artifact");
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

async fn device_action(
    state: AppState,
    id: u64,
    action: DeviceAction,
    params: ActionParams,
    headers: &HeaderMap,
) -> Response {
    match state.manager.device_action(id, action, &params).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => ApiError::from_build(&e, state.localizer.as_ref(), &language(headers, &state))
            .into_response(),
    }
}

/// `GET /{mount}/build/{id}/emulate`
pub async fn emulate(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(params): Query<ActionParams>,
    headers: HeaderMap,
) -> Response {
    device_action(state, id, DeviceAction::Emulate, params, &headers).await
}

/// `GET /{mount}/build/{id}/deploy`
pub async fn deploy(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(params): Query<ActionParams>,
    headers: HeaderMap,
) -> Response {
    device_action(state, id, DeviceAction::Deploy, params, &headers).await
}

/// `GET /{mount}/build/{id}/run`
pub async fn run(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(params): Query<ActionParams>,
    headers: HeaderMap,
) -> Response {
    device_action(state, id, DeviceAction::Run, params, &headers).await
}

/// `GET /{mount}/build/{id}/debug`
pub async fn debug(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(params): Query<ActionParams>,
    headers: HeaderMap,
) -> Response {
    device_action(state, id, DeviceAction::Debug, params, &headers).await
}

/// `GET /{mount}/build/metrics`
pub async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.manager.metrics()).into_response()
}

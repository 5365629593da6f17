//! HTTP surface: the media route, the debug snapshot and the two admin
//! stand-ins for the control plane.
//!
//! Handlers stay thin.  Admission, scheduling and caching all happen in
//! [`DeliveryService`]; this module only turns its answers into responses.

use std::path::PathBuf;
use std::sync::Arc;

// ---

use axum::{
    // ---
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
    Router,
};
use serde::Deserialize;

// ---

use reelsync_delivery::{DeliveryBody, DeliveryService, DeliveryStatus};
use reelsync_domain::{unsatisfiable_content_range, ClientKey, MediaSource, ReelSyncError};

// ---

use super::ControlPlane;

/// Header a player may use instead of the `client` query parameter.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

// ---------------------------------------------------------------------------
// AppState / router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    // ---
    pub service: Arc<DeliveryService>,
    pub control: Arc<ControlPlane>,
}

// ---

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .route("/media", get(media_get).head(media_head))
        .route("/debug/delivery", get(debug_delivery))
        .route("/admin/select", post(admin_select))
        .route("/admin/playback", post(admin_playback))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// [`ReelSyncError`] as an HTTP response.
pub struct ApiError(pub ReelSyncError);

impl From<ReelSyncError> for ApiError {
    fn from(e: ReelSyncError) -> Self {
        Self(e)
    }
}

// ---

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        match self.0 {
            ReelSyncError::RangeNotSatisfiable { len, .. } => {
                let mut headers = HeaderMap::new();
                headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                if let Ok(value) = HeaderValue::from_str(&unsatisfiable_content_range(len)) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response()
            }
            e if e.is_not_found() => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
            ReelSyncError::SchedulerGone => {
                tracing::error!("request refused: delivery scheduler is gone");
                (StatusCode::SERVICE_UNAVAILABLE, "delivery unavailable").into_response()
            }
            e => {
                tracing::warn!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// /media
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct MediaQuery {
    pub client: Option<String>,
}

async fn media_get(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_media(&state, &query, &headers, false).await
}

async fn media_head(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_media(&state, &query, &headers, true).await
}

// ---

async fn serve_media(
    state: &AppState,
    query: &MediaQuery,
    headers: &HeaderMap,
    head_only: bool,
) -> Result<Response, ApiError> {
    // ---
    let client_id = query.client.as_deref().or_else(|| {
        headers
            .get(CLIENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
    });
    let client = ClientKey::from_id(client_id);

    let file = state
        .control
        .current()
        .ok_or_else(|| ReelSyncError::NotFound("no active file".into()))?;

    // A Range header that is not even text cannot be satisfied either.
    let range_header = match headers.get(header::RANGE) {
        Some(v) => Some(v.to_str().map_err(|_| ReelSyncError::RangeNotSatisfiable {
            len: file.len,
            reason: "range header is not ascii",
        })?),
        None => None,
    };

    let delivery = state.service.serve(client, range_header, Some(file), head_only).await?;

    let status = match delivery.status {
        DeliveryStatus::Full => StatusCode::OK,
        DeliveryStatus::Partial => StatusCode::PARTIAL_CONTENT,
    };

    let mut out = HeaderMap::new();
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(delivery.content_length()));
    if let Some(value) = delivery.content_range().and_then(|v| HeaderValue::from_str(&v).ok()) {
        out.insert(header::CONTENT_RANGE, value);
    }

    let body = match delivery.body {
        DeliveryBody::Empty => Body::empty(),
        DeliveryBody::Bytes(bytes) => Body::from(bytes),
        DeliveryBody::Stream(stream) => Body::from_stream(stream),
    };

    Ok((status, out, body).into_response())
}

// ---------------------------------------------------------------------------
// /debug/delivery
// ---------------------------------------------------------------------------

async fn debug_delivery(State(state): State<AppState>) -> Result<Response, ApiError> {
    // ---
    let snapshot = state.service.debug_snapshot().await?;
    Ok(Json(snapshot).into_response())
}

// ---------------------------------------------------------------------------
// /admin
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub path: PathBuf,
}

/// Select a new active file, drop everything queued for the old one and
/// start filling the head cache in the background.
async fn admin_select(
    State(state): State<AppState>,
    Json(req): Json<SelectRequest>,
) -> Result<Response, ApiError> {
    // ---
    let file = state.control.select(&req.path).await?;
    state.service.reset(file.revision).await?;

    let service = Arc::clone(&state.service);
    let warming = file.clone();
    tokio::spawn(async move {
        if let Err(e) = service.warm(&warming).await {
            tracing::warn!(error = %e, revision = warming.revision, "head cache warm-up failed");
        }
    });

    Ok(Json(file).into_response())
}

// ---

#[derive(Debug, Deserialize)]
pub struct PlaybackRequest {
    pub position_secs: f64,
    #[serde(default)]
    pub paused: bool,
}

async fn admin_playback(State(state): State<AppState>, Json(req): Json<PlaybackRequest>) -> Response {
    // ---
    if !req.position_secs.is_finite() || req.position_secs < 0.0 {
        return (StatusCode::BAD_REQUEST, "position_secs must be a non-negative number").into_response();
    }
    state.control.publish_playback(req.position_secs, req.paused);
    StatusCode::NO_CONTENT.into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::io::Write;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt as _;
    use serde_json::{json, Value};
    use tower::ServiceExt; // for Router::oneshot

    use reelsync_delivery::{DeliveryParams, DeliveryService, FileReader, RecordingDiagnostics};

    use super::{router, AppState};
    use crate::ControlPlane;

    const FILE_LEN: usize = 300_000;

    fn pattern() -> Vec<u8> {
        (0..FILE_LEN).map(|i| (i % 251) as u8).collect()
    }

    fn app(params: DeliveryParams) -> (Router, tempfile::NamedTempFile) {
        // ---
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&pattern()).unwrap();
        tmp.flush().unwrap();

        let control = Arc::new(ControlPlane::new());
        let service = Arc::new(DeliveryService::start(
            params,
            Arc::new(FileReader::new()),
            control.clone(),
            Arc::new(RecordingDiagnostics::default()),
        ));
        (router(AppState { service, control }), tmp)
    }

    fn small_params() -> DeliveryParams {
        DeliveryParams {
            max_request_bytes: 65_536,
            chunk_bytes: 16_384,
            ..DeliveryParams::default()
        }
    }

    async fn select(app: &Router, tmp: &tempfile::NamedTempFile) {
        // ---
        let req = Request::builder()
            .method("POST")
            .uri("/admin/select")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "path": tmp.path() }).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    fn media(range: Option<&str>) -> Request<Body> {
        // ---
        let mut req = Request::builder().uri("/media?client=viewer-1");
        if let Some(range) = range {
            req = req.header(header::RANGE, range);
        }
        req.body(Body::empty()).unwrap()
    }

    fn header_str(resp: &axum::response::Response, name: header::HeaderName) -> String {
        resp.headers()
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default()
    }

    // ---

    #[tokio::test]
    async fn no_selection_is_not_found() {
        // ---
        let (app, _tmp) = app(small_params());
        let resp = app.clone().oneshot(media(Some("bytes=0-99"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // Not even a garbled Range header turns that into a 416.
        let req = Request::builder()
            .uri("/media?client=viewer-1")
            .header(header::RANGE, header::HeaderValue::from_bytes(b"bytes=0-\xff").unwrap())
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().get(header::CONTENT_RANGE).is_none());
    }

    // ---

    #[tokio::test]
    async fn garbled_range_header_is_unsatisfiable() {
        // ---
        let (app, tmp) = app(small_params());
        select(&app, &tmp).await;

        let req = Request::builder()
            .uri("/media?client=viewer-1")
            .header(header::RANGE, header::HeaderValue::from_bytes(b"bytes=0-\xff").unwrap())
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header_str(&resp, header::CONTENT_RANGE), "bytes */300000");
    }

    // ---

    #[tokio::test]
    async fn range_request_is_served_as_partial_content() {
        // ---
        let (app, tmp) = app(small_params());
        select(&app, &tmp).await;

        let resp = app.clone().oneshot(media(Some("bytes=1000-50999"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&resp, header::CONTENT_RANGE), "bytes 1000-50999/300000");
        assert_eq!(header_str(&resp, header::CONTENT_LENGTH), "50000");
        assert_eq!(header_str(&resp, header::ACCEPT_RANGES), "bytes");

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], &pattern()[1_000..51_000]);
    }

    // ---

    #[tokio::test]
    async fn open_ended_range_is_truncated() {
        // ---
        let (app, tmp) = app(small_params());
        select(&app, &tmp).await;

        let resp = app.clone().oneshot(media(Some("bytes=100000-"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&resp, header::CONTENT_RANGE), "bytes 100000-165535/300000");

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.len(), 65_536);
        assert_eq!(&bytes[..], &pattern()[100_000..165_536]);
    }

    // ---

    #[tokio::test]
    async fn unsatisfiable_ranges_get_416() {
        // ---
        let (app, tmp) = app(small_params());
        select(&app, &tmp).await;

        for range in ["bytes=400000-500000", "bytes=-500", "bytes=0-1,5-9", "items=0-1"] {
            let resp = app.clone().oneshot(media(Some(range))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{range}");
            assert_eq!(header_str(&resp, header::CONTENT_RANGE), "bytes */300000");
        }
    }

    // ---

    #[tokio::test]
    async fn head_and_full_get() {
        // ---
        let (app, tmp) = app(small_params());
        select(&app, &tmp).await;

        let req = Request::builder()
            .method("HEAD")
            .uri("/media")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, header::CONTENT_LENGTH), "300000");
        assert!(resp.into_body().collect().await.unwrap().to_bytes().is_empty());

        let resp = app.clone().oneshot(media(None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, header::ACCEPT_RANGES), "bytes");
        assert!(resp.headers().get(header::CONTENT_RANGE).is_none());
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], &pattern()[..]);
    }

    // ---

    #[tokio::test]
    async fn debug_snapshot_reports_parameters_and_counters() {
        // ---
        let (app, tmp) = app(small_params());
        select(&app, &tmp).await;

        let resp = app.clone().oneshot(media(Some("bytes=0-9999"))).await.unwrap();
        resp.into_body().collect().await.unwrap();

        let req = Request::builder().uri("/debug/delivery").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["enabled"], json!(true));
        assert_eq!(v["chunk_bytes"], json!(16_384));
        assert_eq!(v["max_request_bytes"], json!(65_536));
        assert_eq!(v["revision"], json!(1));
        assert_eq!(v["counters"]["enqueued"], json!(1));
        assert!(v["per_client"].is_array());
    }

    // ---

    #[tokio::test]
    async fn playback_position_is_validated() {
        // ---
        let (app, _tmp) = app(small_params());

        let post = |body: Value| {
            Request::builder()
                .method("POST")
                .uri("/admin/playback")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let resp = app.clone().oneshot(post(json!({ "position_secs": -3.0 }))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post(json!({ "position_secs": 42.0, "paused": true })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    // ---

    #[tokio::test]
    async fn selecting_a_missing_file_is_not_found() {
        // ---
        let (app, _tmp) = app(small_params());
        let req = Request::builder()
            .method("POST")
            .uri("/admin/select")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "path": "/definitely/not/here.mkv" }).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

//! In-process results feed
//!
//! Serves a CSV body with ETag / If-None-Match support. Tests can swap the
//! body, inject failures and slow responses, and count requests.

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct FeedInner {
    body: Vec<u8>,
    etag: Option<String>,
    last_modified: Option<String>,
    fail_next: u32,
    fail_status: Option<StatusCode>,
    delay: Duration,
    requests: u32,
    not_modified: u32,
}

#[derive(Clone, Default)]
struct FeedState {
    inner: Arc<Mutex<FeedInner>>,
}

pub struct FakeFeed {
    pub url: String,
    state: FeedState,
    server: JoinHandle<()>,
}

impl FakeFeed {
    pub async fn start() -> Self {
        let state = FeedState::default();
        let app = Router::new()
            .route("/results.csv", get(serve_feed))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}/results.csv", addr),
            state,
            server,
        }
    }

    /// Replace the published body and its ETag
    pub fn publish(&self, body: &str, etag: &str) {
        self.publish_bytes(body.as_bytes(), etag);
    }

    /// Publish raw bytes, which need not be valid UTF-8
    pub fn publish_bytes(&self, body: &[u8], etag: &str) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.body = body.to_vec();
        inner.etag = Some(format!("\"{}\"", etag));
    }

    /// Send `Last-Modified` (RFC 2822) with every 200 response
    pub fn set_last_modified(&self, value: &str) {
        self.state.inner.lock().unwrap().last_modified = Some(value.to_string());
    }

    /// Answer the next `count` requests with `status`
    pub fn fail_next(&self, count: u32, status: StatusCode) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.fail_next = count;
        inner.fail_status = Some(status);
    }

    /// Delay every response
    pub fn set_delay(&self, delay: Duration) {
        self.state.inner.lock().unwrap().delay = delay;
    }

    pub fn requests(&self) -> u32 {
        self.state.inner.lock().unwrap().requests
    }

    pub fn not_modified_responses(&self) -> u32 {
        self.state.inner.lock().unwrap().not_modified
    }
}

impl Drop for FakeFeed {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve_feed(State(state): State<FeedState>, headers: HeaderMap) -> Response {
    let delay = state.inner.lock().unwrap().delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut inner = state.inner.lock().unwrap();
    inner.requests += 1;

    if inner.fail_next > 0 {
        inner.fail_next -= 1;
        let status = inner.fail_status.unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return (status, "feed failure").into_response();
    }

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    if let (Some(sent), Some(current)) = (if_none_match, inner.etag.as_deref()) {
        if sent == current {
            inner.not_modified += 1;
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    let mut response = (StatusCode::OK, inner.body.clone()).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/csv; charset=utf-8"),
    );
    if let Some(etag) = &inner.etag {
        response_headers.insert(header::ETAG, HeaderValue::from_str(etag).unwrap());
    }
    if let Some(last_modified) = &inner.last_modified {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(last_modified).unwrap(),
        );
    }
    response
}

//! Admin API Server
//!
//! HTTP API for operators: pause/resume logging, factory erase, and
//! read-only access to the flash history for diagnostics.

use crate::application::AdminService;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Logging toggle request.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct LoggingResponse {
    pub enabled: bool,
    pub previous: bool,
}

/// Buffer size response, as consumed by the diagnostic UI.
#[derive(Debug, Serialize)]
pub struct BufferSizeResponse {
    pub index: u32,
    pub size: u32,
    pub next: Option<u32>,
    pub sealed: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SizeQuery {
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeQuery {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

/// Admin API state.
#[derive(Clone)]
pub struct AdminState {
    pub admin: Arc<AdminService>,
}

impl AdminState {
    pub fn new(admin: Arc<AdminService>) -> Self {
        Self { admin }
    }
}

/// Build the admin routes without middleware.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/logging", get(get_logging_handler).post(set_logging_handler))
        .route("/api/v1/erase", post(erase_handler))
        .route("/api/v1/buffers/size", get(buffer_size_handler))
        .route("/api/v1/buffers/:index", get(buffer_range_handler))
        .route("/api/v1/buffers/:index/events", get(buffer_events_handler))
        .with_state(state)
}

/// Admin API server.
pub struct AdminApi {
    listen_addr: String,
    state: AdminState,
}

impl AdminApi {
    pub fn new(listen_addr: String, admin: Arc<AdminService>) -> Self {
        Self {
            listen_addr,
            state: AdminState::new(admin),
        }
    }

    /// Run the API server until the shutdown future resolves.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(
        &self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let app = router(self.state.clone()).layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("admin API listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

// Handler functions

async fn health_handler(State(state): State<AdminState>) -> Response {
    match read_flash(&state, |admin| admin.status()).await {
        Ok(status) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "logging": status.logging,
            "head_index": status.head_index,
            "segment": status.segment,
            "flash": status.flash,
        }))
        .into_response(),
        Err(response) => response,
    }
}

async fn get_logging_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({ "enabled": state.admin.logging_enabled() }))
}

async fn set_logging_handler(
    State(state): State<AdminState>,
    Json(req): Json<LoggingRequest>,
) -> impl IntoResponse {
    let previous = state.admin.set_logging(req.enabled);
    Json(LoggingResponse {
        enabled: req.enabled,
        previous,
    })
}

async fn erase_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let admin = state.admin.clone();
    match tokio::task::spawn_blocking(move || admin.erase_all()).await {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({ "erased": true }))),
        Ok(false) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "erased": false,
                "error": "some sectors did not erase cleanly"
            })),
        ),
        Err(e) => {
            tracing::error!("erase task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "erased": false,
                    "error": "erase task failed"
                })),
            )
        }
    }
}

async fn buffer_size_handler(
    State(state): State<AdminState>,
    Query(query): Query<SizeQuery>,
) -> Response {
    match read_flash(&state, move |admin| admin.buffer_size(query.index)).await {
        Ok(found) => Json(BufferSizeResponse {
            index: found.index,
            size: found.size,
            next: found.next_index,
            sealed: found.sealed,
        })
        .into_response(),
        Err(response) => response,
    }
}

async fn buffer_range_handler(
    State(state): State<AdminState>,
    Path(index): Path<u32>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let read = move |admin: &AdminService| admin.buffer_range(index, query.start, query.end);
    match read_flash(&state, read).await {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Ok(None) => not_found(index),
        Err(response) => response,
    }
}

async fn buffer_events_handler(
    State(state): State<AdminState>,
    Path(index): Path<u32>,
) -> Response {
    match read_flash(&state, move |admin| admin.buffer_events(index)).await {
        Ok(Some(events)) => Json(events).into_response(),
        Ok(None) => not_found(index),
        Err(response) => response,
    }
}

/// Run a call that takes the flash store lock on the blocking pool.
async fn read_flash<T, F>(state: &AdminState, read: F) -> Result<T, Response>
where
    F: FnOnce(&AdminService) -> T + Send + 'static,
    T: Send + 'static,
{
    let admin = state.admin.clone();
    tokio::task::spawn_blocking(move || read(&admin))
        .await
        .map_err(|e| {
            tracing::error!("flash read task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "flash read failed" })),
            )
                .into_response()
        })
}

fn not_found(index: u32) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "index": index,
            "error": "buffer not found"
        })),
    )
        .into_response()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{DashMapParamStore, ManualTickSource, MemFlash};
    use crate::application::{EventLog, FlashConfig, FlashStore, LogConfig};
    use crate::domain::entities::EventCode;
    use crate::domain::errors::FlashError;
    use crate::domain::ports::FlashDevice;
    use axum::{
        body::Body,
        http::{Request, StatusCode as HttpStatusCode},
    };
    use http_body_util::BodyExt;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    // ===== Mock Implementations =====

    #[derive(Default)]
    struct Gate {
        closed: bool,
        waiting: bool,
    }

    /// MemFlash whose reads wait while the gate is closed, for at most a
    /// few seconds.
    struct GatedFlash {
        inner: MemFlash,
        gate: Arc<(Mutex<Gate>, Condvar)>,
    }

    impl GatedFlash {
        fn set_closed(gate: &(Mutex<Gate>, Condvar), closed: bool) {
            let mut state = gate.0.lock().unwrap();
            state.closed = closed;
            state.waiting = false;
            gate.1.notify_all();
        }

        fn has_waiter(gate: &(Mutex<Gate>, Condvar)) -> bool {
            gate.0.lock().unwrap().waiting
        }
    }

    impl FlashDevice for GatedFlash {
        fn sector_size(&self) -> usize {
            self.inner.sector_size()
        }

        fn sector_count(&self) -> u32 {
            self.inner.sector_count()
        }

        fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
            let (lock, cvar) = &*self.gate;
            let mut state = lock.lock().unwrap();
            state.waiting = true;
            let (state, _) = cvar
                .wait_timeout_while(state, Duration::from_secs(5), |s| s.closed)
                .unwrap();
            drop(state);
            self.inner.read(addr, buf)
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
            self.inner.write(addr, data)
        }

        fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
            self.inner.erase_sector(sector)
        }
    }

    struct TestNode {
        log: Arc<EventLog>,
        store: Arc<FlashStore>,
        ticks: Arc<ManualTickSource>,
        admin: Arc<AdminService>,
    }

    impl TestNode {
        fn new() -> Self {
            Self::on_device(Box::new(MemFlash::new(256, 8)))
        }

        fn on_device(device: Box<dyn FlashDevice>) -> Self {
            let store = Arc::new(
                FlashStore::new(
                    device,
                    FlashConfig {
                        first_sector: 0,
                        num_sectors: 8,
                        ..FlashConfig::default()
                    },
                    Arc::new(Notify::new()),
                )
                .unwrap(),
            );
            let start = store.init();
            let ticks = Arc::new(ManualTickSource::new(100));
            let log = Arc::new(EventLog::new(
                LogConfig {
                    buffer_count: 2,
                    buffer_size: 256,
                    quiescence_ticks: 10,
                },
                ticks.clone(),
                Arc::new(Notify::new()),
                start,
                true,
            ));
            let admin = Arc::new(AdminService::new(
                log.clone(),
                store.clone(),
                Arc::new(DashMapParamStore::new()),
            ));
            Self {
                log,
                store,
                ticks,
                admin,
            }
        }

        /// Log one event and persist it.
        fn record(&self, payload: &[u8]) {
            self.log
                .append_with_retry(EventCode::SHT2X_TEMP_HUM, payload, false);
            self.ticks.advance(11);
            self.store.flush_pending(&self.log);
        }
    }

    fn create_test_app(node: &TestNode) -> Router {
        router(AdminState::new(node.admin.clone()))
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_handler() {
        let node = TestNode::new();
        let response = create_test_app(&node).oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["logging"], true);
        assert_eq!(json["flash"]["write_failures"], 0);
    }

    #[tokio::test]
    async fn test_logging_toggle() {
        let node = TestNode::new();

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/logging")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"enabled":false}"#))
            .unwrap();
        let response = create_test_app(&node).oneshot(request).await.unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["enabled"], false);
        assert_eq!(json["previous"], true);

        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/logging"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["enabled"], false);
    }

    #[tokio::test]
    async fn test_logging_toggle_rejects_bad_body() {
        let node = TestNode::new();
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/logging")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"on":1}"#))
            .unwrap();
        let response = create_test_app(&node).oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_buffer_size_handler() {
        let node = TestNode::new();
        node.record(&[1, 2, 3, 4]);

        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/buffers/size"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["index"], 0);
        assert_eq!(json["sealed"], false);
        assert!(json["next"].is_null());
        assert!(json["size"].as_u64().unwrap() > 8);

        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/buffers/size?index=0"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["index"], 0);
    }

    #[tokio::test]
    async fn test_buffer_range_handler() {
        let node = TestNode::new();
        node.record(&[1, 2, 3, 4]);

        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/buffers/0?start=0&end=8"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let bytes = body_bytes(response).await;
        assert_eq!(bytes, vec![0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);

        // The end is clamped to the content size.
        let size = node.admin.buffer_size(Some(0)).size as usize;
        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/buffers/0?start=4&end=100000"))
            .await
            .unwrap();
        assert_eq!(body_bytes(response).await.len(), size - 4);
    }

    #[tokio::test]
    async fn test_buffer_range_unknown_index() {
        let node = TestNode::new();
        node.record(&[1, 2, 3, 4]);

        // Index 3 resolves to the older index 0, which is not what was asked.
        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/buffers/3"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["index"], 3);
    }

    #[tokio::test]
    async fn test_buffer_events_handler() {
        let node = TestNode::new();
        node.record(&[1, 2, 3, 4]);
        node.record(&[5, 6, 7, 8]);

        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/buffers/0/events"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);
        let json = body_json(response).await;
        let events = json["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["code"], EventCode::SHT2X_TEMP_HUM.value());
        assert_eq!(events[1]["payload"], serde_json::json!([5, 6, 7, 8]));
        assert!(json["error"].is_null());
    }

    #[tokio::test]
    async fn test_erase_handler() {
        let node = TestNode::new();
        node.record(&[1, 2, 3, 4]);

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/erase")
            .body(Body::empty())
            .unwrap();
        let response = create_test_app(&node).oneshot(request).await.unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);
        assert_eq!(body_json(response).await["erased"], true);

        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/buffers/0"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatusCode::NOT_FOUND);
        assert!(node.log.logging_enabled());
    }

    #[tokio::test]
    async fn test_history_reads_leave_runtime_responsive() {
        let gate = Arc::new((Mutex::new(Gate::default()), Condvar::new()));
        let node = TestNode::on_device(Box::new(GatedFlash {
            inner: MemFlash::new(256, 8),
            gate: gate.clone(),
        }));
        node.record(&[1, 2, 3, 4]);
        GatedFlash::set_closed(&gate, true);

        let range = tokio::spawn(
            create_test_app(&node).oneshot(get_request("/api/v1/buffers/0/events")),
        );
        while !GatedFlash::has_waiter(&gate) {
            tokio::task::yield_now().await;
        }

        // The stalled read does not hold up other requests.
        let response = create_test_app(&node)
            .oneshot(get_request("/api/v1/logging"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);
        assert!(!range.is_finished());

        GatedFlash::set_closed(&gate, false);
        let response = range.await.unwrap().unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);
        assert_eq!(body_json(response).await["events"].as_array().unwrap().len(), 1);
    }
}

//! End-to-end tests of the Control API over a real loopback listener.

use std::sync::Arc;

use serde_json::json;
use serde_json::Value;

use screenpilot_daemon::serve_on;
use screenpilot_daemon::spawn_state_actor;
use screenpilot_daemon::test_support::MockBackend;
use screenpilot_daemon::ApiState;
use screenpilot_daemon::CaptureDevice;
use screenpilot_daemon::ControlFacade;
use screenpilot_daemon::DeviceKind;
use screenpilot_daemon::IndexingConfig;
use screenpilot_daemon::IndexingSettings;
use screenpilot_daemon::IngestPipeline;
use screenpilot_daemon::ShutdownTrigger;
use screenpilot_daemon::SnapshotWriter;

struct TestApi {
    base_url: String,
    http: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl TestApi {
    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }
}

fn devices() -> Vec<CaptureDevice> {
    vec![
        CaptureDevice {
            id: "m1".into(),
            name: "MacBook Microphone".into(),
            kind: DeviceKind::Microphone,
        },
        CaptureDevice {
            id: "d1".into(),
            name: "Built-in Display".into(),
            kind: DeviceKind::Display,
        },
    ]
}

async fn start_api(backend: Arc<MockBackend>) -> TestApi {
    let dir = tempfile::tempdir().unwrap();
    let writer = SnapshotWriter::new(dir.path().join("context"));
    let (state, _state_task) = spawn_state_actor(50, writer);
    let indexing = Arc::new(IndexingSettings::new(IndexingConfig::default()));
    let ingest = Arc::new(IngestPipeline::new(
        backend.clone(),
        state.clone(),
        indexing.clone(),
    ));
    let control = ControlFacade::new(
        backend,
        state,
        ingest,
        indexing,
        dir.path().join("config.json"),
    );

    let (shutdown, shutdown_rx) = ShutdownTrigger::new();
    let api_state = Arc::new(ApiState { control, shutdown });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_on(listener, api_state, shutdown_rx));

    TestApi {
        base_url: format!("http://{addr}"),
        http: reqwest::Client::new(),
        _dir: dir,
    }
}

#[tokio::test]
async fn test_status_starts_idle() {
    let api = start_api(Arc::new(MockBackend::new())).await;
    let (status, body) = api.get("/api/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["recording"], false);
    assert_eq!(body["sessionId"], Value::Null);
    assert_eq!(body["duration"], 0);
}

#[tokio::test]
async fn test_start_then_double_start_conflict() {
    let api = start_api(Arc::new(MockBackend::new().with_devices(devices()))).await;

    let (status, body) = api.post("/api/record/start", json!({})).await;
    assert_eq!(status, 200);
    assert!(body["sessionId"].as_str().unwrap().starts_with("session-"));

    let (status, body) = api.post("/api/record/start", json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Already recording");
}

#[tokio::test]
async fn test_stop_then_status_is_clean() {
    let api = start_api(Arc::new(MockBackend::new().with_devices(devices()))).await;

    api.post("/api/record/start", json!({})).await;
    let (status, body) = api.post("/api/record/stop", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (_, body) = api.get("/api/status").await;
    assert_eq!(body["recording"], false);
    assert_eq!(body["sessionId"], Value::Null);
    assert_eq!(body["duration"], 0);
}

#[tokio::test]
async fn test_stop_while_idle_is_conflict() {
    let api = start_api(Arc::new(MockBackend::new())).await;
    let (status, body) = api.post("/api/record/stop", json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["message"], "Not recording");
}

#[tokio::test]
async fn test_explicit_channel_selection_is_passed_through() {
    let backend = Arc::new(MockBackend::new().with_devices(devices()));
    let api = start_api(backend.clone()).await;

    let (status, _) = api
        .post(
            "/api/record/start",
            json!({ "channels": ["Built-in Display"] }),
        )
        .await;
    assert_eq!(status, 200);
    let created = backend.created.lock().unwrap().clone();
    assert_eq!(created[0].1, vec!["Built-in Display".to_string()]);
}

#[tokio::test]
async fn test_context_unknown_channel_is_rejected() {
    let api = start_api(Arc::new(MockBackend::new())).await;
    let (status, body) = api.get("/api/context/webcam").await;
    assert_eq!(status, 400);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_context_all_lists_every_channel() {
    let api = start_api(Arc::new(MockBackend::new())).await;
    let (status, body) = api.get("/api/context/all").await;
    assert_eq!(status, 200);
    let channels = body["channels"].as_object().unwrap();
    assert!(channels.contains_key("screen"));
    assert!(channels.contains_key("mic"));
    assert!(channels.contains_key("system_audio"));
}

#[tokio::test]
async fn test_unknown_endpoint_gets_structured_error() {
    let api = start_api(Arc::new(MockBackend::new())).await;
    let (status, body) = api.get("/api/bogus").await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], "error");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Unknown endpoint"));
}

#[tokio::test]
async fn test_search_requires_known_rtstream() {
    let api = start_api(Arc::new(MockBackend::new())).await;
    let (status, body) = api
        .post(
            "/api/rtstream/search",
            json!({ "rtstream_id": "rt-x", "query": "meeting" }),
        )
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_shutdown_acknowledges_then_tears_down() {
    let api = start_api(Arc::new(MockBackend::new())).await;
    let (status, body) = api.post("/api/shutdown", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    // The listener drains shortly after the acknowledgement.
    let mut gone = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if api.http.get(format!("{}/api/status", api.base_url)).send().await.is_err() {
            gone = true;
            break;
        }
    }
    assert!(gone);
}

//! Control API: the synchronous HTTP surface on loopback.
//!
//! Every response carries the uniform envelope: `{"status": "ok", ...}` on
//! success, `{"status": "error", "code", "message"}` on failure. Unknown
//! routes get the same treatment through the fallback handler.

use std::sync::Arc;

use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tracing::info;

use screenpilot_ipc::error_codes::ErrorCategory;

use crate::config::IndexingConfig;
use crate::context::ChannelKind;
use crate::context::ContextItem;
use crate::control::ControlFacade;
use crate::error::ControlError;
use crate::error::DaemonError;
use crate::server::ShutdownTrigger;
use crate::state::StatusSnapshot;

const DEFAULT_CONTEXT_LIMIT: usize = 50;

pub struct ApiState {
    pub control: ControlFacade,
    pub shutdown: ShutdownTrigger,
}

pub fn router(state: Arc<ApiState>) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/record/start", post(start_handler))
        .route("/api/record/stop", post(stop_handler))
        .route("/api/context/:channel", get(context_handler))
        .route("/api/rtstream/search", post(search_handler))
        .route("/api/rtstream/update-prompt", post(update_prompt_handler))
        .route("/api/overlay/show", post(overlay_show_handler))
        .route("/api/overlay/hide", post(overlay_hide_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .fallback(unknown_endpoint_handler)
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    state: Arc<ApiState>,
    port: u16,
    shutdown: watch::Receiver<bool>,
) -> Result<(), DaemonError> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|err| DaemonError::ApiBind(err.to_string()))?;
    serve_on(listener, state, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DaemonError> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Control API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|err| DaemonError::ApiBind(err.to_string()))
}

fn ok_with(fields: Vec<(&str, Value)>) -> Response {
    let mut body = Map::new();
    body.insert("status".to_string(), json!("ok"));
    for (key, value) in fields {
        body.insert(key.to_string(), value);
    }
    Json(Value::Object(body)).into_response()
}

fn error_response(err: &ControlError) -> Response {
    let status = match err.category() {
        ErrorCategory::Conflict => StatusCode::CONFLICT,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCategory::External => StatusCode::BAD_GATEWAY,
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({
        "status": "error",
        "code": err.code(),
        "message": err.to_string(),
    });
    (status, Json(body)).into_response()
}

fn status_fields(status: &StatusSnapshot) -> Vec<(&'static str, Value)> {
    vec![
        ("recording", json!(status.recording)),
        ("sessionId", json!(status.session_id)),
        ("duration", json!(status.duration_secs)),
        ("phase", json!(status.phase)),
        ("channels", json!(status.channels)),
        ("rtstreams", json!(status.rtstreams)),
        ("bufferCounts", json!(status.buffer_counts)),
        ("visualLatencyMs", json!(status.visual_latency_ms)),
        ("exportInfo", json!(status.export_info)),
        ("failure", json!(status.failure)),
    ]
}

async fn status_handler(State(state): State<Arc<ApiState>>) -> Response {
    let status = state.control.status().await;
    ok_with(status_fields(&status))
}

#[derive(Debug, Deserialize, Default)]
struct StartRequest {
    channels: Option<Vec<String>>,
    indexing_config: Option<IndexingConfig>,
}

async fn start_handler(
    State(state): State<Arc<ApiState>>,
    body: Option<Json<StartRequest>>,
) -> Response {
    let Json(request) = body.unwrap_or_default();
    match state
        .control
        .start(request.channels, request.indexing_config)
        .await
    {
        Ok(session_id) => ok_with(vec![("sessionId", json!(session_id))]),
        Err(err) => error_response(&err),
    }
}

async fn stop_handler(State(state): State<Arc<ApiState>>) -> Response {
    let duration = state.control.status().await.duration_secs;
    match state.control.stop().await {
        Ok(()) => ok_with(vec![("duration", json!(duration))]),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct ContextQuery {
    limit: Option<usize>,
}

fn items_json(items: &[ContextItem]) -> Value {
    json!(items)
}

async fn context_handler(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<String>,
    Query(query): Query<ContextQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_CONTEXT_LIMIT);
    if channel == "all" {
        let mut channels = Map::new();
        for (kind, items) in state.control.all_context(limit).await {
            channels.insert(kind.as_str().to_string(), items_json(&items));
        }
        return ok_with(vec![("channels", Value::Object(channels))]);
    }
    match channel.parse::<ChannelKind>() {
        Ok(kind) => {
            let items = state.control.recent_context(kind, limit).await;
            ok_with(vec![
                ("channel", json!(kind.as_str())),
                ("items", items_json(&items)),
            ])
        }
        Err(_) => error_response(&ControlError::UnknownChannel(channel)),
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    rtstream_id: String,
    query: String,
}

async fn search_handler(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SearchRequest>,
) -> Response {
    match state
        .control
        .search(&request.rtstream_id, &request.query)
        .await
    {
        Ok(results) => ok_with(vec![("results", results)]),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct UpdatePromptRequest {
    rtstream_id: String,
    scene_index_id: String,
    prompt: String,
}

async fn update_prompt_handler(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<UpdatePromptRequest>,
) -> Response {
    match state
        .control
        .update_prompt(&request.rtstream_id, &request.scene_index_id, &request.prompt)
        .await
    {
        Ok(index_type) => ok_with(vec![("index_type", json!(index_type))]),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct OverlayRequest {
    text: Option<String>,
    loading: Option<bool>,
}

async fn overlay_show_handler(
    State(state): State<Arc<ApiState>>,
    body: Option<Json<OverlayRequest>>,
) -> Response {
    let Json(request) = body.unwrap_or_default();
    state
        .control
        .overlay_show(request.text, request.loading.unwrap_or(false));
    ok_with(Vec::new())
}

async fn overlay_hide_handler(State(state): State<Arc<ApiState>>) -> Response {
    state.control.overlay_hide();
    ok_with(Vec::new())
}

/// Acknowledges before teardown; the trigger resolves on the daemon's
/// single shutdown path.
async fn shutdown_handler(State(state): State<Arc<ApiState>>) -> Response {
    info!("Shutdown requested over Control API");
    state.shutdown.trigger();
    ok_with(Vec::new())
}

async fn unknown_endpoint_handler(uri: Uri) -> Response {
    let body = json!({
        "status": "error",
        "code": screenpilot_ipc::error_codes::METHOD_NOT_FOUND,
        "message": format!("Unknown endpoint: {}", uri.path()),
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

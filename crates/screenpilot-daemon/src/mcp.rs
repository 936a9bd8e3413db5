//! Stdio tool server: newline-framed JSON-RPC 2.0 for agent harnesses.
//!
//! Tool dispatch forwards to the Control API over loopback, so the stdio
//! surface stays a thin protocol adapter with no state of its own. Calls
//! run concurrently; the server defers exit until stdin reaches EOF *and*
//! every in-flight call has been answered.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;
use tracing::info;
use tracing::warn;

use screenpilot_ipc::error_codes;
use screenpilot_ipc::ApiClient;
use screenpilot_ipc::RpcRequest;
use screenpilot_ipc::RpcResponse;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// In-flight call tracking. `wait_idle` resolves once every guard has
/// dropped.
struct PendingCalls {
    count: AtomicUsize,
    notify: Notify,
}

impl PendingCalls {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn begin(pending: &Arc<PendingCalls>) -> PendingGuard {
        pending.count.fetch_add(1, Ordering::SeqCst);
        PendingGuard(Arc::clone(pending))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct PendingGuard(Arc<PendingCalls>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }
}

/// Serve the tool protocol on the process's stdio streams.
pub async fn run_stdio(api: ApiClient) {
    serve(tokio::io::stdin(), tokio::io::stdout(), Arc::new(api)).await;
}

pub async fn serve<R, W>(reader: R, writer: W, api: Arc<ApiClient>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = out_rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
            {
                break;
            }
            let _ = writer.flush().await;
        }
    });

    let pending = Arc::new(PendingCalls::new());
    let mut lines = BufReader::new(reader).lines();
    info!("Tool server ready on stdio");

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                warn!(error = %err, "Failed to parse tool request");
                let response =
                    RpcResponse::error(Value::Null, error_codes::PARSE_ERROR, "Parse error");
                send(&out_tx, &response);
                continue;
            }
        };

        if request.is_notification() {
            debug!(method = %request.method, "Ignoring notification");
            continue;
        }
        let id = request.id.clone().unwrap_or(Value::Null);
        let method = request.method.clone();

        match method.as_str() {
            "initialize" => send(&out_tx, &RpcResponse::success(id, initialize_result())),
            "ping" => send(&out_tx, &RpcResponse::success(id, json!({}))),
            "tools/list" => send(
                &out_tx,
                &RpcResponse::success(id, json!({ "tools": tool_catalog() })),
            ),
            "tools/call" => {
                let api = Arc::clone(&api);
                let out_tx = out_tx.clone();
                let guard = PendingCalls::begin(&pending);
                tokio::spawn(async move {
                    let _guard = guard;
                    let response = dispatch_tool_call(&api, id, &request).await;
                    send(&out_tx, &response);
                });
            }
            other => {
                warn!(method = %other, "Unknown tool server method");
                send(
                    &out_tx,
                    &RpcResponse::error(
                        id,
                        error_codes::METHOD_NOT_FOUND,
                        &format!("Method not found: {other}"),
                    ),
                );
            }
        }
    }

    // Stdin is gone; in-flight calls still get their answers.
    pending.wait_idle().await;
    drop(out_tx);
    let _ = writer_task.await;
    info!("Tool server exiting");
}

fn send(out: &mpsc::UnboundedSender<String>, response: &RpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(err) => warn!(error = %err, "Failed to serialize response"),
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": "screenpilot",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

async fn dispatch_tool_call(api: &ApiClient, id: Value, request: &RpcRequest) -> RpcResponse {
    let name = match request.param_str("name") {
        Some(name) => name.to_string(),
        None => {
            return RpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "tools/call requires a tool name",
            )
        }
    };
    let arguments = request
        .param_object("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let outcome = match name.as_str() {
        "get_status" => api.get_status().await,
        "record_start" => api.record_start(arguments).await,
        "record_stop" => api.record_stop().await,
        "get_context" => {
            let channel = arguments
                .get("channel")
                .and_then(|v| v.as_str())
                .unwrap_or("all");
            api.get_context(channel).await
        }
        "show_overlay" => api.post("/api/overlay/show", arguments).await,
        "hide_overlay" => api.post("/api/overlay/hide", json!({})).await,
        "search_rtstream" => api.post("/api/rtstream/search", arguments).await,
        "update_prompt" => api.post("/api/rtstream/update-prompt", arguments).await,
        other => {
            return RpcResponse::error(
                id,
                error_codes::UNKNOWN_TOOL,
                &format!("Unknown tool: {other}"),
            )
        }
    };

    match outcome {
        Ok(value) => RpcResponse::success(id, tool_text_result(&value, false)),
        Err(err) => RpcResponse::success(id, tool_text_result(&json!(err.to_string()), true)),
    }
}

fn tool_text_result(value: &Value, is_error: bool) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn tool_catalog() -> Value {
    json!([
        {
            "name": "get_status",
            "description": "Current capture session and context buffer status",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "record_start",
            "description": "Start a capture session",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "channels": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Capture device names; omit for automatic selection"
                    },
                    "indexing_config": {
                        "type": "object",
                        "description": "Per-channel indexing override for this session"
                    }
                }
            }
        },
        {
            "name": "record_stop",
            "description": "Stop the capture session",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "get_context",
            "description": "Recent context items for one channel or all",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "channel": {
                        "type": "string",
                        "enum": ["screen", "mic", "system_audio", "all"]
                    }
                }
            }
        },
        {
            "name": "show_overlay",
            "description": "Show the overlay notification",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "loading": { "type": "boolean" }
                }
            }
        },
        {
            "name": "hide_overlay",
            "description": "Hide the overlay notification",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "search_rtstream",
            "description": "Semantic search over a live rtstream",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "rtstream_id": { "type": "string" },
                    "query": { "type": "string" }
                },
                "required": ["rtstream_id", "query"]
            }
        },
        {
            "name": "update_prompt",
            "description": "Update the prompt of a running index",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "rtstream_id": { "type": "string" },
                    "scene_index_id": { "type": "string" },
                    "prompt": { "type": "string" }
                },
                "required": ["rtstream_id", "scene_index_id", "prompt"]
            }
        }
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    struct Client {
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
        reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    }

    fn start_server() -> Client {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        // Port 1 is never listening; tool dispatch errors stay per-call.
        let api = ApiClient::with_base_url("http://127.0.0.1:1".to_string()).unwrap();
        tokio::spawn(serve(server_read, server_write, Arc::new(api)));
        let (client_read, client_write) = tokio::io::split(client_side);
        Client {
            writer: client_write,
            reader: BufReader::new(client_read),
        }
    }

    impl Client {
        async fn roundtrip(&mut self, request: &str) -> Value {
            self.writer
                .write_all(format!("{request}\n").as_bytes())
                .await
                .unwrap();
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_initialize_reports_tool_capability() {
        let mut client = start_server();
        let response = client
            .roundtrip(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await;
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], "screenpilot");
    }

    #[tokio::test]
    async fn test_tools_list_has_full_catalog() {
        let mut client = start_server();
        let response = client
            .roundtrip(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await;
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 8);
        assert!(tools.iter().any(|t| t["name"] == "search_rtstream"));
    }

    #[tokio::test]
    async fn test_unknown_method_yields_method_not_found() {
        let mut client = start_server();
        let response = client
            .roundtrip(r#"{"jsonrpc":"2.0","id":3,"method":"bogus"}"#)
            .await;
        assert_eq!(response["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_tool_yields_per_call_error() {
        let mut client = start_server();
        let response = client
            .roundtrip(
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"teleport"}}"#,
            )
            .await;
        assert_eq!(response["error"]["code"], error_codes::UNKNOWN_TOOL);
    }

    #[tokio::test]
    async fn test_notification_gets_no_answer() {
        let mut client = start_server();
        client
            .writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();
        // The next answered request proves the notification was skipped.
        let response = client
            .roundtrip(r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#)
            .await;
        assert_eq!(response["id"], 5);
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_a_tool_error_not_a_crash() {
        let mut client = start_server();
        let response = client
            .roundtrip(
                r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"get_status"}}"#,
            )
            .await;
        assert_eq!(response["result"]["isError"], true);
    }
}

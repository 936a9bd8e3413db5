//! Fast event bridge: a Unix socket relaying agent-harness hook payloads
//! onto the in-process notice bus.
//!
//! Each connection carries exactly one JSON document and gets no reply.
//! The bridge translates and forwards; it never touches the session or
//! the buffers. Malformed input is logged and dropped.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use screenpilot_common::truncate_payload;

use crate::error::DaemonError;
use crate::state::Notice;
use crate::state::StateHandle;

/// Sub-agent names that map to synthetic start/stop notices. Anything
/// else relays as a generic tool-use notice.
const KNOWN_AGENTS: &[&str] = &["recall", "highlight", "meeting-notes"];

const SEARCH_COMMAND_PREFIX: &str = "screenpilot search";
const MAX_RELAY_PAYLOAD: usize = 2048;
const MAX_DOCUMENT_BYTES: u64 = 64 * 1024;

pub struct EventBridge {
    state: StateHandle,
    socket_path: PathBuf,
}

impl EventBridge {
    pub fn new(state: StateHandle, socket_path: PathBuf) -> Self {
        Self { state, socket_path }
    }

    /// Bind the socket and relay until shutdown. A stale socket file from
    /// a previous run is removed before binding.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DaemonError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| DaemonError::BridgeBind(err.to_string()))?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|err| DaemonError::BridgeBind(err.to_string()))?;
        info!(path = %self.socket_path.display(), "Event bridge listening");

        let bridge = Arc::new(self);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let bridge = Arc::clone(&bridge);
                            tokio::spawn(async move {
                                bridge.handle_connection(stream).await;
                            });
                        }
                        Err(err) => warn!(error = %err, "Bridge accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    let _ = std::fs::remove_file(&bridge.socket_path);
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let mut raw = String::new();
        if let Err(err) = stream.take(MAX_DOCUMENT_BYTES).read_to_string(&mut raw).await {
            warn!(error = %err, "Failed to read bridge payload");
            return;
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(document) => {
                if let Some(notice) = translate(&document) {
                    self.state.publish(notice);
                } else {
                    debug!("Dropping unrecognized bridge payload");
                }
            }
            Err(err) => warn!(error = %err, "Dropping malformed bridge payload"),
        }
    }
}

/// Map one hook document to a notice. Task-tool invocations of known
/// agents become start notices, subagent-stop events become stop notices,
/// recognized search commands become structured search notices; other
/// tool uses relay with a truncated payload.
pub fn translate(document: &Value) -> Option<Notice> {
    let event = document.get("hook_event_name")?.as_str()?;
    match event {
        "PreToolUse" => {
            let tool = document.get("tool_name")?.as_str()?;
            let input = document.get("tool_input").cloned().unwrap_or(Value::Null);
            match tool {
                "Task" => {
                    let agent = input.get("subagent_type")?.as_str()?;
                    if KNOWN_AGENTS.contains(&agent) {
                        Some(Notice::AgentTaskStarted {
                            agent: agent.to_string(),
                        })
                    } else {
                        None
                    }
                }
                "Bash" => {
                    let command = input.get("command").and_then(|v| v.as_str())?;
                    if let Some(query) = extract_search_query(command) {
                        Some(Notice::AgentSearch { query })
                    } else {
                        Some(Notice::HookToolUse {
                            tool: tool.to_string(),
                            payload: truncate_payload(command, MAX_RELAY_PAYLOAD),
                        })
                    }
                }
                _ => Some(Notice::HookToolUse {
                    tool: tool.to_string(),
                    payload: truncate_payload(&input.to_string(), MAX_RELAY_PAYLOAD),
                }),
            }
        }
        "SubagentStop" => {
            let agent = document
                .get("subagent_type")
                .or_else(|| document.get("agent"))
                .and_then(|v| v.as_str())?;
            if KNOWN_AGENTS.contains(&agent) {
                Some(Notice::AgentTaskStopped {
                    agent: agent.to_string(),
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Pull the query out of a recognized search invocation, stripping one
/// layer of shell quoting.
fn extract_search_query(command: &str) -> Option<String> {
    let trimmed = command.trim();
    let rest = trimmed.strip_prefix(SEARCH_COMMAND_PREFIX)?.trim();
    if rest.is_empty() {
        return None;
    }
    let unquoted = rest
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
        .unwrap_or(rest);
    Some(unquoted.to_string())
}

/// Deliver one document to a bridge socket, fire-and-forget.
pub async fn send_document(socket_path: &Path, document: &Value) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(document.to_string().as_bytes()).await?;
    stream.shutdown().await
}

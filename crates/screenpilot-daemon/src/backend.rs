//! Backend seam: the cloud capture/indexing service.
//!
//! The backend is opaque to the daemon: a REST surface for commands and a
//! long-lived streaming connection emitting newline-delimited JSON events.
//! `BackendClient` is the trait boundary; `VideodbBackend` is the
//! production implementation. Inbound events are parsed into the closed
//! `BackendEvent` set here, at the boundary; unrecognized kinds come back
//! as `None` and are logged and ignored by the ingestion pipeline.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::context::ChannelKind;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),
    #[error("Backend request timed out")]
    Timeout,
    #[error("Backend rejected request: {0}")]
    Rejected(String),
    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// The stale-session signal: the backend still holds the previous
    /// session and needs a force-stop before a new start can succeed.
    pub fn is_busy(&self) -> bool {
        match self {
            BackendError::Rejected(msg) => msg.to_lowercase().contains("busy"),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_connect() {
            BackendError::Unreachable(err.to_string())
        } else {
            BackendError::Rejected(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Microphone,
    SystemAudio,
    Display,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDevice {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
}

/// Rtstream descriptor as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtstreamInfo {
    pub id: String,
    pub name: String,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    SessionCreated {
        session_id: String,
    },
    SessionStarting {
        session_id: String,
    },
    SessionActive {
        session_id: String,
        channels: Vec<String>,
        rtstreams: Vec<RtstreamInfo>,
    },
    SessionStopping {
        session_id: String,
    },
    SessionStopped {
        session_id: String,
    },
    SessionExported {
        session_id: String,
        video_id: String,
        player_url: String,
    },
    SessionFailed {
        session_id: String,
        code: String,
        message: String,
    },
    Transcript {
        session_id: String,
        channel: ChannelKind,
        text: String,
        is_final: bool,
    },
    VisualIndex {
        session_id: String,
        text: String,
        start: Option<f64>,
    },
    AudioIndex {
        session_id: String,
        channel: ChannelKind,
        text: String,
    },
}

impl BackendEvent {
    pub fn session_id(&self) -> &str {
        match self {
            BackendEvent::SessionCreated { session_id }
            | BackendEvent::SessionStarting { session_id }
            | BackendEvent::SessionActive { session_id, .. }
            | BackendEvent::SessionStopping { session_id }
            | BackendEvent::SessionStopped { session_id }
            | BackendEvent::SessionExported { session_id, .. }
            | BackendEvent::SessionFailed { session_id, .. }
            | BackendEvent::Transcript { session_id, .. }
            | BackendEvent::VisualIndex { session_id, .. }
            | BackendEvent::AudioIndex { session_id, .. } => session_id,
        }
    }

    /// Parse one loose JSON document into a typed event. Returns `None`
    /// for unknown kinds or documents missing required fields.
    pub fn parse(value: &Value) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        let session_id = value.get("session_id")?.as_str()?.to_string();
        match kind {
            "session.created" => Some(BackendEvent::SessionCreated { session_id }),
            "session.starting" => Some(BackendEvent::SessionStarting { session_id }),
            "session.active" => {
                let channels = value
                    .get("channels")
                    .and_then(|c| c.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let rtstreams = value
                    .get("rtstreams")
                    .and_then(|r| serde_json::from_value(r.clone()).ok())
                    .unwrap_or_default();
                Some(BackendEvent::SessionActive {
                    session_id,
                    channels,
                    rtstreams,
                })
            }
            "session.stopping" => Some(BackendEvent::SessionStopping { session_id }),
            "session.stopped" => Some(BackendEvent::SessionStopped { session_id }),
            "session.exported" => Some(BackendEvent::SessionExported {
                session_id,
                video_id: value.get("video_id")?.as_str()?.to_string(),
                player_url: value
                    .get("player_url")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            "session.failed" => Some(BackendEvent::SessionFailed {
                session_id,
                code: value
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("E_UNKNOWN")
                    .to_string(),
                message: value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            "transcript" => Some(BackendEvent::Transcript {
                session_id,
                channel: parse_audio_channel(value.get("channel")?.as_str()?)?,
                text: value.get("text")?.as_str()?.to_string(),
                is_final: coerce_final(value.get("is_final")),
            }),
            "index.visual" => Some(BackendEvent::VisualIndex {
                session_id,
                text: value.get("text")?.as_str()?.to_string(),
                start: value.get("start").and_then(|v| v.as_f64()),
            }),
            "index.audio" => Some(BackendEvent::AudioIndex {
                session_id,
                channel: parse_audio_channel(value.get("channel")?.as_str()?)?,
                text: value.get("text")?.as_str()?.to_string(),
            }),
            _ => None,
        }
    }
}

fn parse_audio_channel(name: &str) -> Option<ChannelKind> {
    match name {
        "mic" => Some(ChannelKind::Mic),
        "system_audio" => Some(ChannelKind::SystemAudio),
        _ => None,
    }
}

/// An event is final if the flag is the boolean or string value `true`.
/// Some backend deployments serialize the flag as a string.
pub fn coerce_final(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

/// Normalize an event start timestamp to epoch milliseconds. The backend
/// emits seconds or milliseconds depending on deployment; values at or
/// above 1e12 are already milliseconds.
pub fn normalize_epoch_ms(start: f64) -> u64 {
    if start >= 1.0e12 {
        start as u64
    } else {
        (start * 1000.0) as u64
    }
}

pub type BackendEventStream = Pin<Box<dyn Stream<Item = Result<Value, BackendError>> + Send>>;

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<CaptureDevice>, BackendError>;
    async fn create_session(&self, channels: &[String]) -> Result<String, BackendError>;
    async fn start_capture(&self, session_id: &str) -> Result<(), BackendError>;
    async fn stop_capture(&self, session_id: &str) -> Result<(), BackendError>;
    async fn force_stop(&self, session_id: &str) -> Result<(), BackendError>;
    async fn index_rtstream(
        &self,
        rtstream_id: &str,
        index_type: &str,
        prompt: &str,
        model: &str,
        batch_secs: u64,
    ) -> Result<String, BackendError>;
    async fn search_rtstream(&self, rtstream_id: &str, query: &str)
        -> Result<Value, BackendError>;
    async fn update_prompt(
        &self,
        rtstream_id: &str,
        scene_index_id: &str,
        prompt: &str,
    ) -> Result<String, BackendError>;
    /// Open the long-lived event stream. The stream ends when the backend
    /// drops the connection; there is no read timeout on it.
    async fn connect_events(&self) -> Result<BackendEventStream, BackendError>;
}

pub struct VideodbBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl VideodbBackend {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, BackendError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("x-access-token", &self.api_key)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn get_json(&self, path: &str) -> Result<Value, BackendError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("x-access-token", &self.api_key)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn check(response: reqwest::Response) -> Result<Value, BackendError> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_else(|| status.as_str())
                .to_string();
            return Err(BackendError::Rejected(message));
        }
        Ok(body)
    }

    fn require_str(body: &Value, key: &str) -> Result<String, BackendError> {
        body.get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Malformed(format!("missing field '{key}'")))
    }
}

#[async_trait]
impl BackendClient for VideodbBackend {
    async fn list_devices(&self) -> Result<Vec<CaptureDevice>, BackendError> {
        let body = self.get_json("/capture/devices").await?;
        let devices = body
            .get("devices")
            .cloned()
            .ok_or_else(|| BackendError::Malformed("missing field 'devices'".into()))?;
        serde_json::from_value(devices).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn create_session(&self, channels: &[String]) -> Result<String, BackendError> {
        let body = self
            .post_json(
                "/capture/sessions",
                serde_json::json!({ "channels": channels }),
            )
            .await?;
        Self::require_str(&body, "session_id")
    }

    async fn start_capture(&self, session_id: &str) -> Result<(), BackendError> {
        self.post_json(
            &format!("/capture/sessions/{session_id}/start"),
            Value::Null,
        )
        .await
        .map(|_| ())
    }

    async fn stop_capture(&self, session_id: &str) -> Result<(), BackendError> {
        self.post_json(&format!("/capture/sessions/{session_id}/stop"), Value::Null)
            .await
            .map(|_| ())
    }

    async fn force_stop(&self, session_id: &str) -> Result<(), BackendError> {
        self.post_json(
            &format!("/capture/sessions/{session_id}/stop"),
            serde_json::json!({ "force": true }),
        )
        .await
        .map(|_| ())
    }

    async fn index_rtstream(
        &self,
        rtstream_id: &str,
        index_type: &str,
        prompt: &str,
        model: &str,
        batch_secs: u64,
    ) -> Result<String, BackendError> {
        let body = self
            .post_json(
                &format!("/rtstream/{rtstream_id}/index"),
                serde_json::json!({
                    "index_type": index_type,
                    "prompt": prompt,
                    "model": model,
                    "batch_secs": batch_secs,
                }),
            )
            .await?;
        Self::require_str(&body, "scene_index_id")
    }

    async fn search_rtstream(
        &self,
        rtstream_id: &str,
        query: &str,
    ) -> Result<Value, BackendError> {
        self.post_json(
            &format!("/rtstream/{rtstream_id}/search"),
            serde_json::json!({ "query": query, "search_type": "semantic" }),
        )
        .await
    }

    async fn update_prompt(
        &self,
        rtstream_id: &str,
        scene_index_id: &str,
        prompt: &str,
    ) -> Result<String, BackendError> {
        let body = self
            .post_json(
                &format!("/rtstream/{rtstream_id}/index/{scene_index_id}/prompt"),
                serde_json::json!({ "prompt": prompt }),
            )
            .await?;
        Self::require_str(&body, "index_type")
    }

    async fn connect_events(&self) -> Result<BackendEventStream, BackendError> {
        // No overall timeout here: the stream lives until the backend
        // idle-drops it, typically after ~10 minutes without traffic.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        let response = client
            .get(format!("{}/capture/events", self.base_url))
            .header("x-access-token", &self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Rejected(format!(
                "event stream refused: {}",
                response.status()
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BackendError::from));
        let stream = ndjson_documents(stream);
        Ok(Box::pin(stream))
    }
}

/// Reframe a byte stream into newline-delimited JSON documents. Blank
/// lines are skipped; an unparsable line surfaces as a `Malformed` item
/// without ending the stream.
fn ndjson_documents<S>(byte_stream: S) -> impl Stream<Item = Result<Value, BackendError>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, BackendError>> + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(byte_stream), Vec::new(), false),
        |(mut inner, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let item = serde_json::from_str::<Value>(line)
                        .map_err(|e| BackendError::Malformed(e.to_string()));
                    return Some((item, (inner, buf, done)));
                }
                if done {
                    return None;
                }
                match inner.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(err)) => return Some((Err(err), (inner, buf, done))),
                    None => done = true,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_session_active_event() {
        let raw = json!({
            "type": "session.active",
            "session_id": "s-1",
            "channels": ["MacBook Pro Microphone", "Display 1"],
            "rtstreams": [
                {"id": "r1", "name": "Display 1", "media_type": "video"},
                {"id": "r2", "name": "MacBook Pro Microphone", "media_type": "audio"}
            ]
        });
        let event = BackendEvent::parse(&raw).unwrap();
        match event {
            BackendEvent::SessionActive {
                session_id,
                channels,
                rtstreams,
            } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(channels.len(), 2);
                assert_eq!(rtstreams[1].media_type, "audio");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_kind_is_none() {
        let raw = json!({"type": "session.rebalanced", "session_id": "s-1"});
        assert!(BackendEvent::parse(&raw).is_none());
    }

    #[test]
    fn test_parse_missing_session_id_is_none() {
        let raw = json!({"type": "session.stopped"});
        assert!(BackendEvent::parse(&raw).is_none());
    }

    #[test]
    fn test_transcript_finality_string_true() {
        let raw = json!({
            "type": "transcript",
            "session_id": "s-1",
            "channel": "mic",
            "text": "hello",
            "is_final": "true"
        });
        match BackendEvent::parse(&raw).unwrap() {
            BackendEvent::Transcript { is_final, .. } => assert!(is_final),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_coerce_final_variants() {
        assert!(coerce_final(Some(&json!(true))));
        assert!(coerce_final(Some(&json!("true"))));
        assert!(!coerce_final(Some(&json!(false))));
        assert!(!coerce_final(Some(&json!("false"))));
        assert!(!coerce_final(Some(&json!("True"))));
        assert!(!coerce_final(Some(&json!(1))));
        assert!(!coerce_final(None));
    }

    #[test]
    fn test_normalize_epoch_seconds_and_millis_agree() {
        assert_eq!(
            normalize_epoch_ms(1_700_000_000.0),
            normalize_epoch_ms(1_700_000_000_000.0)
        );
        assert_eq!(normalize_epoch_ms(1_700_000_000.0), 1_700_000_000_000);
    }

    #[test]
    fn test_busy_detection() {
        assert!(BackendError::Rejected("session Busy: teardown pending".into()).is_busy());
        assert!(!BackendError::Rejected("quota exceeded".into()).is_busy());
        assert!(!BackendError::Timeout.is_busy());
    }

    #[tokio::test]
    async fn test_ndjson_reframing_across_chunks() {
        let chunks: Vec<Result<bytes::Bytes, BackendError>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"a\"")),
            Ok(bytes::Bytes::from_static(b":1}\n\n{\"b\":2}\n")),
        ];
        let stream = ndjson_documents(futures_util::stream::iter(chunks));
        let docs: Vec<_> = stream.collect().await;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].as_ref().unwrap()["a"], 1);
        assert_eq!(docs[1].as_ref().unwrap()["b"], 2);
    }

    #[tokio::test]
    async fn test_ndjson_malformed_line_does_not_end_stream() {
        let chunks: Vec<Result<bytes::Bytes, BackendError>> =
            vec![Ok(bytes::Bytes::from_static(b"not json\n{\"ok\":true}\n"))];
        let stream = ndjson_documents(futures_util::stream::iter(chunks));
        let docs: Vec<_> = stream.collect().await;
        assert_eq!(docs.len(), 2);
        assert!(docs[0].is_err());
        assert_eq!(docs[1].as_ref().unwrap()["ok"], true);
    }
}

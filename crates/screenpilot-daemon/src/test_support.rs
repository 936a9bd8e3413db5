//! In-memory backend double used by unit and integration tests.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::backend::BackendClient;
use crate::backend::BackendError;
use crate::backend::BackendEventStream;
use crate::backend::CaptureDevice;

/// Records every call and lets a test script busy rejections and feed the
/// event stream by hand.
#[derive(Default)]
pub struct MockBackend {
    devices: Vec<CaptureDevice>,
    session_counter: AtomicUsize,
    busy_starts: AtomicUsize,
    pub created: Mutex<Vec<(String, Vec<String>)>>,
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub force_stopped: Mutex<Vec<String>>,
    pub indexed: Mutex<Vec<IndexRequest>>,
    pub prompt_updates: Mutex<Vec<(String, String, String)>>,
    pub searches: Mutex<Vec<(String, String)>>,
    event_feed: Mutex<Option<mpsc::UnboundedReceiver<Result<Value, BackendError>>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRequest {
    pub rtstream_id: String,
    pub index_type: String,
    pub prompt: String,
    pub model: String,
    pub batch_secs: u64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(mut self, devices: Vec<CaptureDevice>) -> Self {
        self.devices = devices;
        self
    }

    /// Reject the next `count` start attempts with a busy error.
    pub fn busy_for_starts(self, count: usize) -> Self {
        self.busy_starts.store(count, Ordering::SeqCst);
        self
    }

    /// Hand back a sender that feeds the stream returned by
    /// `connect_events`. Dropping the sender ends the stream.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<Result<Value, BackendError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_feed.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn list_devices(&self) -> Result<Vec<CaptureDevice>, BackendError> {
        Ok(self.devices.clone())
    }

    async fn create_session(&self, channels: &[String]) -> Result<String, BackendError> {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("session-{n}");
        self.created
            .lock()
            .unwrap()
            .push((session_id.clone(), channels.to_vec()));
        Ok(session_id)
    }

    async fn start_capture(&self, session_id: &str) -> Result<(), BackendError> {
        self.started.lock().unwrap().push(session_id.to_string());
        let remaining = self.busy_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.busy_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Rejected(
                "previous session is busy tearing down".to_string(),
            ));
        }
        Ok(())
    }

    async fn stop_capture(&self, session_id: &str) -> Result<(), BackendError> {
        self.stopped.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn force_stop(&self, session_id: &str) -> Result<(), BackendError> {
        self.force_stopped
            .lock()
            .unwrap()
            .push(session_id.to_string());
        Ok(())
    }

    async fn index_rtstream(
        &self,
        rtstream_id: &str,
        index_type: &str,
        prompt: &str,
        model: &str,
        batch_secs: u64,
    ) -> Result<String, BackendError> {
        self.indexed.lock().unwrap().push(IndexRequest {
            rtstream_id: rtstream_id.to_string(),
            index_type: index_type.to_string(),
            prompt: prompt.to_string(),
            model: model.to_string(),
            batch_secs,
        });
        Ok(format!("idx-{rtstream_id}"))
    }

    async fn search_rtstream(
        &self,
        rtstream_id: &str,
        query: &str,
    ) -> Result<Value, BackendError> {
        self.searches
            .lock()
            .unwrap()
            .push((rtstream_id.to_string(), query.to_string()));
        Ok(json!({ "results": [] }))
    }

    async fn update_prompt(
        &self,
        rtstream_id: &str,
        scene_index_id: &str,
        prompt: &str,
    ) -> Result<String, BackendError> {
        self.prompt_updates.lock().unwrap().push((
            rtstream_id.to_string(),
            scene_index_id.to_string(),
            prompt.to_string(),
        ));
        // Audio rtstream ids carry an "audio" marker in tests.
        if rtstream_id.contains("audio") {
            Ok("spoken_word".to_string())
        } else {
            Ok("scene".to_string())
        }
    }

    async fn connect_events(&self) -> Result<BackendEventStream, BackendError> {
        let rx = self
            .event_feed
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

//! Event ingestion: one live backend stream, classified into state-actor
//! commands, plus the per-rtstream indexing arm loop.
//!
//! Connection discipline is deliberate: the stream is opened lazily on the
//! first session start and recreated only on the next explicit start after
//! a disconnect. Backend deployments idle-drop long-quiet connections, and
//! the only consumer that needs a fresh stream is a start request.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use futures_util::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use screenpilot_common::mutex_lock_or_recover;

use crate::backend::normalize_epoch_ms;
use crate::backend::BackendClient;
use crate::backend::BackendError;
use crate::backend::BackendEvent;
use crate::backend::RtstreamInfo;
use crate::config::IndexingConfig;
use crate::context::ChannelKind;
use crate::context::ContextItem;
use crate::session::Rtstream;
use crate::state::StateHandle;

const SCENE_INDEX_TYPE: &str = "scene";
const SPOKEN_WORD_INDEX_TYPE: &str = "spoken_word";

/// Stored indexing defaults plus the override supplied with the most
/// recent start request. Shared between the control facade (which sets
/// the override and persists tuned prompts) and the arm loop.
pub struct IndexingSettings {
    stored: Mutex<IndexingConfig>,
    runtime_override: Mutex<Option<IndexingConfig>>,
}

impl IndexingSettings {
    pub fn new(stored: IndexingConfig) -> Self {
        Self {
            stored: Mutex::new(stored),
            runtime_override: Mutex::new(None),
        }
    }

    pub fn set_override(&self, over: Option<IndexingConfig>) {
        *mutex_lock_or_recover(&self.runtime_override) = over;
    }

    pub fn effective(&self, channel: ChannelKind) -> crate::config::ChannelIndexing {
        let over = mutex_lock_or_recover(&self.runtime_override).clone();
        mutex_lock_or_recover(&self.stored).effective(channel, over.as_ref())
    }

    pub fn with_stored<T>(&self, f: impl FnOnce(&mut IndexingConfig) -> T) -> T {
        f(&mut mutex_lock_or_recover(&self.stored))
    }
}

/// Maps a backend rtstream descriptor to its local channel. Visual versus
/// audio comes from the declared media type; the audio sub-kind from a
/// name substring, matching how the backend labels capture devices.
pub fn classify_rtstream(info: &RtstreamInfo) -> ChannelKind {
    if info.media_type == "video" {
        ChannelKind::Screen
    } else if info.name.to_lowercase().contains("mic") {
        ChannelKind::Mic
    } else {
        ChannelKind::SystemAudio
    }
}

pub struct IngestPipeline {
    backend: Arc<dyn BackendClient>,
    state: StateHandle,
    indexing: Arc<IndexingSettings>,
    connected: AtomicBool,
    connect_guard: AsyncMutex<()>,
}

impl IngestPipeline {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        state: StateHandle,
        indexing: Arc<IndexingSettings>,
    ) -> Self {
        Self {
            backend,
            state,
            indexing,
            connected: AtomicBool::new(false),
            connect_guard: AsyncMutex::new(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the backend event stream if no reader is live. Called from the
    /// start path; a disconnect observed later stays disconnected until
    /// the next call here.
    pub async fn ensure_connected(self: Arc<Self>) -> Result<(), BackendError> {
        let _guard = self.connect_guard.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let stream = self.backend.connect_events().await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("Backend event stream connected");

        let pipeline = Arc::clone(&self);
        tokio::spawn(async move {
            pipeline.read_loop(stream).await;
        });
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut stream: crate::backend::BackendEventStream) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(document) => match BackendEvent::parse(&document) {
                    Some(event) => self.apply(event).await,
                    None => debug!(
                        kind = document.get("type").and_then(|v| v.as_str()).unwrap_or("?"),
                        "Ignoring unknown backend event"
                    ),
                },
                Err(err) => warn!(error = %err, "Dropping malformed event document"),
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Backend event stream ended; will reconnect on next start");
    }

    async fn apply(&self, event: BackendEvent) {
        let tracked = self.state.tracked_id().await;
        if tracked.as_deref() != Some(event.session_id()) {
            warn!(
                event_session = event.session_id(),
                tracked = tracked.as_deref().unwrap_or("none"),
                "Discarding event for untracked session"
            );
            return;
        }

        match event {
            BackendEvent::SessionCreated { session_id }
            | BackendEvent::SessionStarting { session_id } => {
                self.state.begin_starting(&session_id).await;
            }
            BackendEvent::SessionActive {
                channels,
                rtstreams,
                ..
            } => {
                let records = rtstreams
                    .iter()
                    .map(|info| Rtstream {
                        id: info.id.clone(),
                        name: info.name.clone(),
                        scene_index_id: None,
                        index_type: None,
                    })
                    .collect();
                self.state.activate(channels, records).await;
                self.arm_indexing(&rtstreams).await;
            }
            BackendEvent::SessionStopping { .. } => {
                self.state.begin_stopping().await;
            }
            BackendEvent::SessionStopped { .. } => {
                self.state.complete_stop().await;
            }
            BackendEvent::SessionExported {
                video_id,
                player_url,
                ..
            } => {
                self.state
                    .attach_export(crate::session::ExportInfo {
                        video_id,
                        player_url,
                    })
                    .await;
            }
            BackendEvent::SessionFailed { code, message, .. } => {
                self.state.fail(&code, &message).await;
            }
            BackendEvent::Transcript {
                channel,
                text,
                is_final,
                ..
            } => {
                self.state
                    .append_context(channel, ContextItem::now(text), is_final)
                    .await;
            }
            BackendEvent::VisualIndex { text, start, .. } => {
                if let Some(start) = start {
                    self.state
                        .set_visual_latency(visual_latency_ms(start, now_epoch_ms()))
                        .await;
                }
                self.state
                    .append_context(ChannelKind::Screen, ContextItem::now(text), true)
                    .await;
            }
            BackendEvent::AudioIndex { channel, text, .. } => {
                self.state
                    .append_context(channel, ContextItem::now(text), true)
                    .await;
            }
        }
    }

    /// Request an index for every rtstream of the now-active session. One
    /// failure is logged and the loop continues; a disabled channel is
    /// skipped the same way.
    async fn arm_indexing(&self, rtstreams: &[RtstreamInfo]) {
        for info in rtstreams {
            let channel = classify_rtstream(info);
            let policy = self.indexing.effective(channel);
            if policy.disabled {
                info!(
                    rtstream = %info.id,
                    channel = channel.as_str(),
                    "Indexing disabled for channel, skipping"
                );
                continue;
            }
            let index_type = match channel {
                ChannelKind::Screen => SCENE_INDEX_TYPE,
                ChannelKind::Mic | ChannelKind::SystemAudio => SPOKEN_WORD_INDEX_TYPE,
            };
            match self
                .backend
                .index_rtstream(
                    &info.id,
                    index_type,
                    &policy.prompt,
                    &policy.model,
                    policy.batch_secs,
                )
                .await
            {
                Ok(scene_index_id) => {
                    info!(rtstream = %info.id, index = %scene_index_id, "Index armed");
                    self.state
                        .upsert_rtstream(Rtstream {
                            id: info.id.clone(),
                            name: info.name.clone(),
                            scene_index_id: Some(scene_index_id),
                            index_type: Some(index_type.to_string()),
                        })
                        .await;
                }
                Err(err) => {
                    warn!(rtstream = %info.id, error = %err, "Failed to arm index");
                }
            }
        }
    }
}

fn now_epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Latency between an annotation's capture time and now, clamped at zero
/// for clock skew.
pub fn visual_latency_ms(event_start: f64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(normalize_epoch_ms(event_start))
}

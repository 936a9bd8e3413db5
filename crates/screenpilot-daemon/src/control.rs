//! Control facade: the operations behind every IPC surface. HTTP handlers,
//! the stdio tool server and the CLI all funnel through here.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::backend::BackendClient;
use crate::backend::BackendError;
use crate::backend::DeviceKind;
use crate::config::IndexingConfig;
use crate::context::ChannelKind;
use crate::context::ContextItem;
use crate::error::ControlError;
use crate::ingest::IndexingSettings;
use crate::ingest::IngestPipeline;
use crate::state::Notice;
use crate::state::StateHandle;
use crate::state::StatusSnapshot;

fn map_backend(err: BackendError) -> ControlError {
    if err.is_busy() {
        return ControlError::Busy(err.to_string());
    }
    match err {
        BackendError::Timeout => ControlError::Timeout("backend request".to_string()),
        other => ControlError::Backend(other.to_string()),
    }
}

#[derive(Clone)]
pub struct ControlFacade {
    backend: Arc<dyn BackendClient>,
    state: StateHandle,
    ingest: Arc<IngestPipeline>,
    indexing: Arc<IndexingSettings>,
    config_path: PathBuf,
}

impl ControlFacade {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        state: StateHandle,
        ingest: Arc<IngestPipeline>,
        indexing: Arc<IndexingSettings>,
        config_path: PathBuf,
    ) -> Self {
        Self {
            backend,
            state,
            ingest,
            indexing,
            config_path,
        }
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.state.status().await
    }

    /// Start a capture session. Rejects with a conflict while a session is
    /// active or starting; retries exactly once through a force-stop when
    /// the backend reports the previous session is still tearing down.
    pub async fn start(
        &self,
        channels: Option<Vec<String>>,
        indexing_override: Option<IndexingConfig>,
    ) -> Result<String, ControlError> {
        let status = self.state.status().await;
        if status.recording || status.phase == crate::session::SessionPhase::Starting {
            return Err(ControlError::AlreadyRecording);
        }

        self.indexing.set_override(indexing_override);

        let channels = match channels {
            Some(list) if !list.is_empty() => list,
            _ => self.auto_select_channels().await?,
        };

        Arc::clone(&self.ingest)
            .ensure_connected()
            .await
            .map_err(map_backend)?;

        let stale = self.state.tracked_id().await;
        let started = match self.try_start(&channels).await {
            Ok(session_id) => Ok(session_id),
            Err(err) if err.is_busy() => {
                warn!(error = %err, "Backend busy, force-stopping stale session and retrying");
                if let Some(stale_id) = stale {
                    if let Err(stop_err) = self.backend.force_stop(&stale_id).await {
                        warn!(error = %stop_err, "Force-stop of stale session failed");
                    }
                }
                self.try_start(&channels).await
            }
            Err(err) => Err(err),
        };
        match started {
            Ok(session_id) => Ok(session_id),
            Err(err) => {
                self.abandon_failed_start().await;
                Err(map_backend(err))
            }
        }
    }

    async fn try_start(&self, channels: &[String]) -> Result<String, BackendError> {
        let session_id = self.backend.create_session(channels).await?;
        self.state.begin_starting(&session_id).await;
        self.backend.start_capture(&session_id).await?;
        info!(session = %session_id, "Capture session starting");
        Ok(session_id)
    }

    /// A start that failed past session creation leaves the record in
    /// `Starting` with no capture running and no backend events coming to
    /// settle it. Tear the orphan down so the next start is not rejected
    /// as a conflict.
    async fn abandon_failed_start(&self) {
        let status = self.state.status().await;
        if status.phase != crate::session::SessionPhase::Starting {
            return;
        }
        if let Some(id) = self.state.tracked_id().await {
            if let Err(err) = self.backend.force_stop(&id).await {
                warn!(error = %err, "Teardown of failed start did not reach the backend");
            }
        }
        self.state.begin_stopping().await;
        self.state.complete_stop().await;
    }

    /// Default channel selection: first microphone, first system-audio
    /// source, first display the backend reports.
    async fn auto_select_channels(&self) -> Result<Vec<String>, ControlError> {
        let devices = self.backend.list_devices().await.map_err(map_backend)?;
        let mut selected = Vec::new();
        for kind in [DeviceKind::Microphone, DeviceKind::SystemAudio, DeviceKind::Display] {
            if let Some(device) = devices.iter().find(|d| d.kind == kind) {
                selected.push(device.name.clone());
            }
        }
        if selected.is_empty() {
            return Err(ControlError::Backend(
                "No capture devices available".to_string(),
            ));
        }
        Ok(selected)
    }

    /// Stop the session and clear the buffers. Completes the local state
    /// immediately; late backend events for the old id are discarded by
    /// the ingestion pipeline.
    pub async fn stop(&self) -> Result<(), ControlError> {
        let status = self.state.status().await;
        let session_id = match status.session_id {
            Some(id) if status.recording => id,
            _ => {
                if status.phase == crate::session::SessionPhase::Starting {
                    // A start is in flight; tear it down too.
                    if let Some(id) = self.state.tracked_id().await {
                        let _ = self.backend.stop_capture(&id).await;
                        self.state.begin_stopping().await;
                        self.state.complete_stop().await;
                        self.state.reset_buffers().await;
                        return Ok(());
                    }
                }
                return Err(ControlError::NotRecording);
            }
        };

        self.state.begin_stopping().await;
        if let Err(err) = self.backend.stop_capture(&session_id).await {
            warn!(error = %err, "Backend stop failed, completing local stop anyway");
        }
        self.state.complete_stop().await;
        self.state.reset_buffers().await;
        info!(session = %session_id, "Capture session stopped");
        Ok(())
    }

    pub async fn recent_context(
        &self,
        channel: ChannelKind,
        limit: usize,
    ) -> Vec<ContextItem> {
        self.state.recent_context(channel, limit).await
    }

    pub async fn all_context(&self, limit: usize) -> Vec<(ChannelKind, Vec<ContextItem>)> {
        let mut all = Vec::with_capacity(ChannelKind::ALL.len());
        for channel in ChannelKind::ALL {
            all.push((channel, self.state.recent_context(channel, limit).await));
        }
        all
    }

    /// Semantic search against one of the live session's rtstreams.
    pub async fn search(&self, rtstream_id: &str, query: &str) -> Result<Value, ControlError> {
        let status = self.state.status().await;
        if !status.rtstreams.iter().any(|r| r.id == rtstream_id) {
            return Err(ControlError::RtstreamNotFound(rtstream_id.to_string()));
        }
        self.backend
            .search_rtstream(rtstream_id, query)
            .await
            .map_err(map_backend)
    }

    /// Re-prompt a running index and persist the tuned prompt under the
    /// rtstream's channel so the next session starts with it.
    pub async fn update_prompt(
        &self,
        rtstream_id: &str,
        scene_index_id: &str,
        prompt: &str,
    ) -> Result<String, ControlError> {
        let status = self.state.status().await;
        let rtstream = status
            .rtstreams
            .iter()
            .find(|r| {
                r.id == rtstream_id && r.scene_index_id.as_deref() == Some(scene_index_id)
            })
            .cloned()
            .ok_or_else(|| ControlError::RtstreamNotFound(rtstream_id.to_string()))?;

        let index_type = self
            .backend
            .update_prompt(rtstream_id, scene_index_id, prompt)
            .await
            .map_err(map_backend)?;

        let channel = channel_for_rtstream(&index_type, &rtstream.name);
        self.indexing.with_stored(|stored| {
            stored.set_prompt(channel, prompt);
            if let Err(err) = stored.persist(&self.config_path) {
                warn!(error = %err, "Failed to persist indexing config");
            }
        });
        Ok(index_type)
    }

    pub fn overlay_show(&self, text: Option<String>, loading: bool) {
        self.state.publish(Notice::OverlayShow { text, loading });
    }

    pub fn overlay_hide(&self) {
        self.state.publish(Notice::OverlayHide);
    }
}

fn channel_for_rtstream(index_type: &str, name: &str) -> ChannelKind {
    if index_type == "scene" {
        ChannelKind::Screen
    } else if name.to_lowercase().contains("mic") {
        ChannelKind::Mic
    } else {
        ChannelKind::SystemAudio
    }
}

//! State actor: single owner of the Session record and context buffers.
//!
//! Every mutation flows through one task via a command channel, which makes
//! the serialization guarantee structural: the ingestion pipeline and the
//! three IPC surfaces all hold a `StateHandle` and never share references
//! to the state itself. State-changed and hook notifications fan out on a
//! broadcast bus carrying the closed `Notice` enum.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::context::ChannelKind;
use crate::context::ContextBuffers;
use crate::context::ContextItem;
use crate::session::ExportInfo;
use crate::session::Rtstream;
use crate::session::Session;
use crate::session::SessionPhase;
use crate::snapshot::SnapshotWriter;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Notification fan-out for UI consumers and the event bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    StateChanged { status: StatusSnapshot },
    SessionFailed { code: String, message: String },
    OverlayShow { text: Option<String>, loading: bool },
    OverlayHide,
    AgentTaskStarted { agent: String },
    AgentTaskStopped { agent: String },
    AgentSearch { query: String },
    HookToolUse { tool: String, payload: String },
}

/// Read-only view of the session + buffers served to every surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub phase: SessionPhase,
    pub recording: bool,
    pub session_id: Option<String>,
    pub duration_secs: u64,
    pub channels: Vec<String>,
    pub rtstreams: Vec<Rtstream>,
    pub buffer_counts: BTreeMap<String, usize>,
    pub visual_latency_ms: Option<u64>,
    pub export_info: Option<ExportInfo>,
    pub failure: Option<crate::session::SessionFailure>,
}

enum StateCommand {
    Status(oneshot::Sender<StatusSnapshot>),
    TrackedId(oneshot::Sender<Option<String>>),
    BeginStarting(String, oneshot::Sender<bool>),
    Activate(Vec<String>, Vec<Rtstream>, oneshot::Sender<bool>),
    BeginStopping(oneshot::Sender<bool>),
    CompleteStop(oneshot::Sender<bool>),
    AttachExport(ExportInfo, oneshot::Sender<bool>),
    Fail(String, String, oneshot::Sender<bool>),
    UpsertRtstream(Rtstream),
    SetVisualLatency(u64),
    AppendContext(ChannelKind, ContextItem, bool),
    RecentContext(ChannelKind, usize, oneshot::Sender<Vec<ContextItem>>),
    BufferCounts(oneshot::Sender<Vec<(ChannelKind, usize)>>),
    ResetBuffers,
}

#[derive(Clone)]
pub struct StateHandle {
    commands: mpsc::Sender<StateCommand>,
    notices: broadcast::Sender<Notice>,
}

impl StateHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Publish a notice that does not originate from a state mutation
    /// (overlay requests, hook relays). Lagging subscribers just miss it.
    pub fn publish(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    async fn ask<T: Default>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> StateCommand,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_err() {
            return T::default();
        }
        rx.await.unwrap_or_default()
    }

    async fn tell(&self, command: StateCommand) {
        let _ = self.commands.send(command).await;
    }

    pub async fn status(&self) -> StatusSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(StateCommand::Status(tx)).await.is_err() {
            return empty_snapshot();
        }
        rx.await.unwrap_or_else(|_| empty_snapshot())
    }

    pub async fn tracked_id(&self) -> Option<String> {
        self.ask(StateCommand::TrackedId).await
    }

    pub async fn begin_starting(&self, session_id: &str) -> bool {
        let id = session_id.to_string();
        self.ask(|tx| StateCommand::BeginStarting(id, tx)).await
    }

    pub async fn activate(&self, channels: Vec<String>, rtstreams: Vec<Rtstream>) -> bool {
        self.ask(|tx| StateCommand::Activate(channels, rtstreams, tx))
            .await
    }

    pub async fn begin_stopping(&self) -> bool {
        self.ask(StateCommand::BeginStopping).await
    }

    pub async fn complete_stop(&self) -> bool {
        self.ask(StateCommand::CompleteStop).await
    }

    pub async fn attach_export(&self, info: ExportInfo) -> bool {
        self.ask(|tx| StateCommand::AttachExport(info, tx)).await
    }

    pub async fn fail(&self, code: &str, message: &str) -> bool {
        let (code, message) = (code.to_string(), message.to_string());
        self.ask(|tx| StateCommand::Fail(code, message, tx)).await
    }

    pub async fn upsert_rtstream(&self, rtstream: Rtstream) {
        self.tell(StateCommand::UpsertRtstream(rtstream)).await;
    }

    pub async fn set_visual_latency(&self, latency_ms: u64) {
        self.tell(StateCommand::SetVisualLatency(latency_ms)).await;
    }

    pub async fn append_context(&self, channel: ChannelKind, item: ContextItem, is_final: bool) {
        self.tell(StateCommand::AppendContext(channel, item, is_final))
            .await;
    }

    pub async fn recent_context(&self, channel: ChannelKind, limit: usize) -> Vec<ContextItem> {
        self.ask(|tx| StateCommand::RecentContext(channel, limit, tx))
            .await
    }

    pub async fn buffer_counts(&self) -> Vec<(ChannelKind, usize)> {
        self.ask(StateCommand::BufferCounts).await
    }

    pub async fn reset_buffers(&self) {
        self.tell(StateCommand::ResetBuffers).await;
    }
}

fn empty_snapshot() -> StatusSnapshot {
    StatusSnapshot {
        phase: SessionPhase::Idle,
        recording: false,
        session_id: None,
        duration_secs: 0,
        channels: Vec::new(),
        rtstreams: Vec::new(),
        buffer_counts: BTreeMap::new(),
        visual_latency_ms: None,
        export_info: None,
        failure: None,
    }
}

struct StateActor {
    session: Session,
    buffers: ContextBuffers,
    snapshot: SnapshotWriter,
    notices: broadcast::Sender<Notice>,
}

impl StateActor {
    fn snapshot_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.session.phase(),
            recording: self.session.is_active(),
            session_id: self.session.session_id().map(str::to_string),
            duration_secs: self.session.duration_secs(),
            channels: self.session.channels.clone(),
            rtstreams: self.session.rtstreams.clone(),
            buffer_counts: self
                .buffers
                .counts()
                .into_iter()
                .map(|(channel, count)| (channel.as_str().to_string(), count))
                .collect(),
            visual_latency_ms: self.session.visual_latency_ms,
            export_info: self.session.export_info.clone(),
            failure: self.session.failure.clone(),
        }
    }

    fn publish_state_changed(&self) {
        let _ = self.notices.send(Notice::StateChanged {
            status: self.snapshot_status(),
        });
    }

    fn write_snapshot(&self) {
        self.snapshot.write(
            &self.buffers,
            self.session.is_active(),
            self.session.session_id(),
        );
    }

    fn after_transition(&self, changed: bool) {
        if changed {
            self.publish_state_changed();
            self.write_snapshot();
        } else {
            debug!("Duplicate lifecycle transition ignored");
        }
    }

    fn handle(&mut self, command: StateCommand) {
        match command {
            StateCommand::Status(reply) => {
                let _ = reply.send(self.snapshot_status());
            }
            StateCommand::TrackedId(reply) => {
                let _ = reply.send(self.session.tracked_id().map(str::to_string));
            }
            StateCommand::BeginStarting(session_id, reply) => {
                let changed = self.session.begin_starting(&session_id);
                self.after_transition(changed);
                let _ = reply.send(changed);
            }
            StateCommand::Activate(channels, rtstreams, reply) => {
                let changed = self.session.activate(channels, rtstreams);
                self.after_transition(changed);
                let _ = reply.send(changed);
            }
            StateCommand::BeginStopping(reply) => {
                let changed = self.session.begin_stopping();
                self.after_transition(changed);
                let _ = reply.send(changed);
            }
            StateCommand::CompleteStop(reply) => {
                let changed = self.session.complete_stop();
                self.after_transition(changed);
                let _ = reply.send(changed);
            }
            StateCommand::AttachExport(info, reply) => {
                let changed = self.session.attach_export(info);
                self.after_transition(changed);
                let _ = reply.send(changed);
            }
            StateCommand::Fail(code, message, reply) => {
                let changed = self.session.fail(&code, &message);
                if changed {
                    let _ = self.notices.send(Notice::SessionFailed {
                        code: code.clone(),
                        message: message.clone(),
                    });
                }
                self.after_transition(changed);
                let _ = reply.send(changed);
            }
            StateCommand::UpsertRtstream(rtstream) => {
                self.session.upsert_rtstream(rtstream);
                self.publish_state_changed();
            }
            StateCommand::SetVisualLatency(latency_ms) => {
                self.session.set_visual_latency(latency_ms);
            }
            StateCommand::AppendContext(channel, item, is_final) => {
                self.buffers.append(channel, item, is_final);
                self.write_snapshot();
            }
            StateCommand::RecentContext(channel, limit, reply) => {
                let _ = reply.send(self.buffers.recent(channel, limit));
            }
            StateCommand::BufferCounts(reply) => {
                let _ = reply.send(self.buffers.counts());
            }
            StateCommand::ResetBuffers => {
                self.buffers.reset();
                self.snapshot.clear();
            }
        }
    }
}

/// Construct the actor and hand back its handle. The actor task ends when
/// the last handle is dropped.
pub fn spawn_state_actor(
    buffer_capacity: usize,
    snapshot: SnapshotWriter,
) -> (StateHandle, tokio::task::JoinHandle<()>) {
    let (commands_tx, mut commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (notices_tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);

    // Never serve a previous run's snapshot.
    snapshot.clear();

    let mut actor = StateActor {
        session: Session::new(),
        buffers: ContextBuffers::new(buffer_capacity),
        snapshot,
        notices: notices_tx.clone(),
    };

    let join = tokio::spawn(async move {
        while let Some(command) = commands_rx.recv().await {
            actor.handle(command);
        }
    });

    (
        StateHandle {
            commands: commands_tx,
            notices: notices_tx,
        },
        join,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_for_test() -> (StateHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("context"));
        let (handle, _join) = spawn_state_actor(5, writer);
        (handle, dir)
    }

    fn rts(id: &str) -> Rtstream {
        Rtstream {
            id: id.to_string(),
            name: id.to_string(),
            scene_index_id: None,
            index_type: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_through_handle() {
        let (handle, _dir) = handle_for_test();

        assert!(handle.begin_starting("s-1").await);
        assert!(handle.activate(vec!["Display 1".into()], vec![rts("r1")]).await);

        let status = handle.status().await;
        assert!(status.recording);
        assert_eq!(status.session_id.as_deref(), Some("s-1"));
        assert_eq!(status.rtstreams.len(), 1);

        assert!(handle.begin_stopping().await);
        assert!(handle.complete_stop().await);
        let status = handle.status().await;
        assert!(!status.recording);
        assert!(status.session_id.is_none());
        assert_eq!(status.duration_secs, 0);
    }

    #[tokio::test]
    async fn test_transitions_publish_state_changed() {
        let (handle, _dir) = handle_for_test();
        let mut notices = handle.subscribe();

        handle.begin_starting("s-1").await;
        match notices.recv().await.unwrap() {
            Notice::StateChanged { status } => {
                assert_eq!(status.phase, SessionPhase::Starting)
            }
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_transition_publishes_nothing() {
        let (handle, _dir) = handle_for_test();
        handle.begin_starting("s-1").await;

        let mut notices = handle.subscribe();
        assert!(!handle.begin_starting("s-1").await);
        assert!(matches!(
            notices.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_failure_publishes_failure_notice() {
        let (handle, _dir) = handle_for_test();
        handle.begin_starting("s-1").await;
        handle.activate(vec![], vec![]).await;

        let mut notices = handle.subscribe();
        handle.fail("E_CAPTURE", "encoder crashed").await;
        match notices.recv().await.unwrap() {
            Notice::SessionFailed { code, .. } => assert_eq!(code, "E_CAPTURE"),
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_context_append_and_counts() {
        let (handle, _dir) = handle_for_test();
        handle
            .append_context(ChannelKind::Screen, ContextItem::now("a window"), true)
            .await;
        handle
            .append_context(ChannelKind::Mic, ContextItem::now("part"), false)
            .await;

        let counts = handle.buffer_counts().await;
        assert!(counts.contains(&(ChannelKind::Screen, 1)));
        assert!(counts.contains(&(ChannelKind::Mic, 0)));

        let recent = handle.recent_context(ChannelKind::Mic, 10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].text, "part");
    }

    #[tokio::test]
    async fn test_snapshot_written_on_append(){
        let (handle, dir) = handle_for_test();
        handle
            .append_context(ChannelKind::Screen, ContextItem::now("a window"), true)
            .await;
        // Drain through a status round-trip so the append is processed.
        let _ = handle.status().await;
        assert!(dir.path().join("context").join("status.json").exists());
    }
}

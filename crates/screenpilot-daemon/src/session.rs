//! Capture-session state machine.
//!
//! A single `Session` record is the authoritative view of capture status.
//! It is owned exclusively by the state actor; every other component reads
//! and mutates it through `StateHandle`. Transition methods return `true`
//! when they changed the record, so duplicate lifecycle events from the
//! backend collapse into no-ops.

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

/// Lifecycle phase. `Failed` is terminal for a session generation; a new
/// explicit start is required afterwards. Export is an attribute of
/// `Stopped`, not a phase of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rtstream {
    pub id: String,
    pub name: String,
    pub scene_index_id: Option<String>,
    pub index_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportInfo {
    pub video_id: String,
    pub player_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFailure {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    phase: SessionPhase,
    /// Backend session id under observation, from creation until the
    /// session reaches a terminal phase. Used to discard stale events.
    tracked_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    pub channels: Vec<String>,
    pub rtstreams: Vec<Rtstream>,
    pub export_info: Option<ExportInfo>,
    pub failure: Option<SessionFailure>,
    pub visual_latency_ms: Option<u64>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            tracked_id: None,
            start_time: None,
            channels: Vec::new(),
            rtstreams: Vec::new(),
            export_info: None,
            failure: None,
            visual_latency_ms: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    pub fn is_starting(&self) -> bool {
        self.phase == SessionPhase::Starting
    }

    pub fn is_stopping(&self) -> bool {
        self.phase == SessionPhase::Stopping
    }

    /// Public session id: non-null iff the session is active or a stop is
    /// in flight.
    pub fn session_id(&self) -> Option<&str> {
        match self.phase {
            SessionPhase::Active | SessionPhase::Stopping => self.tracked_id.as_deref(),
            _ => None,
        }
    }

    /// Id used to match inbound backend events, live from creation until
    /// the session generation ends.
    pub fn tracked_id(&self) -> Option<&str> {
        self.tracked_id.as_deref()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Seconds since activation while active, else 0. Duration is computed
    /// on read, never stored.
    pub fn duration_secs(&self) -> u64 {
        if self.phase != SessionPhase::Active {
            return 0;
        }
        self.start_time
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Backend reported session creation. Allowed from any settled phase;
    /// clears leftovers from the previous generation.
    pub fn begin_starting(&mut self, session_id: &str) -> bool {
        if self.phase == SessionPhase::Starting && self.tracked_id.as_deref() == Some(session_id) {
            return false;
        }
        self.phase = SessionPhase::Starting;
        self.tracked_id = Some(session_id.to_string());
        self.start_time = None;
        self.channels.clear();
        self.rtstreams.clear();
        self.export_info = None;
        self.failure = None;
        self.visual_latency_ms = None;
        true
    }

    /// Backend reported the session live. Re-entrant from `Active`: the
    /// rtstream list is refreshed without resetting `start_time`, so a
    /// reconnect does not reset the duration clock.
    pub fn activate(&mut self, channels: Vec<String>, rtstreams: Vec<Rtstream>) -> bool {
        match self.phase {
            SessionPhase::Starting | SessionPhase::Active => {}
            _ => return false,
        }
        self.phase = SessionPhase::Active;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        self.channels = channels;
        for rts in rtstreams {
            self.upsert_rtstream(rts);
        }
        true
    }

    /// Entries are upserted by id, never duplicated.
    pub fn upsert_rtstream(&mut self, rtstream: Rtstream) {
        if let Some(existing) = self.rtstreams.iter_mut().find(|r| r.id == rtstream.id) {
            *existing = rtstream;
        } else {
            self.rtstreams.push(rtstream);
        }
    }

    pub fn begin_stopping(&mut self) -> bool {
        match self.phase {
            SessionPhase::Active | SessionPhase::Starting => {
                self.phase = SessionPhase::Stopping;
                true
            }
            _ => false,
        }
    }

    /// Backend confirmed all streams finalized. The tracked id survives
    /// into `Stopped` so a late export event can still attach; it is
    /// replaced on the next start.
    pub fn complete_stop(&mut self) -> bool {
        if self.phase != SessionPhase::Stopping && self.phase != SessionPhase::Active {
            return false;
        }
        self.phase = SessionPhase::Stopped;
        self.start_time = None;
        self.channels.clear();
        self.failure = None;
        self.visual_latency_ms = None;
        true
    }

    /// Attach export info to a stopped session. Does not change phase.
    pub fn attach_export(&mut self, info: ExportInfo) -> bool {
        if self.phase != SessionPhase::Stopped {
            return false;
        }
        self.export_info = Some(info);
        true
    }

    /// Fatal backend failure. Terminal for this generation.
    pub fn fail(&mut self, code: &str, message: &str) -> bool {
        if self.phase == SessionPhase::Failed {
            return false;
        }
        self.phase = SessionPhase::Failed;
        self.start_time = None;
        self.channels.clear();
        self.visual_latency_ms = None;
        self.failure = Some(SessionFailure {
            code: code.to_string(),
            message: message.to_string(),
        });
        true
    }

    pub fn set_visual_latency(&mut self, latency_ms: u64) {
        self.visual_latency_ms = Some(latency_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rts(id: &str) -> Rtstream {
        Rtstream {
            id: id.to_string(),
            name: format!("stream-{id}"),
            scene_index_id: None,
            index_type: None,
        }
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = Session::new();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.session_id().is_none());
        assert_eq!(session.duration_secs(), 0);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut session = Session::new();
        assert!(session.begin_starting("s-1"));
        assert_eq!(session.phase(), SessionPhase::Starting);
        assert!(session.session_id().is_none());
        assert_eq!(session.tracked_id(), Some("s-1"));

        assert!(session.activate(vec!["Display 1".into()], vec![rts("r1")]));
        assert_eq!(session.phase(), SessionPhase::Active);
        assert_eq!(session.session_id(), Some("s-1"));
        assert!(session.start_time().is_some());

        assert!(session.begin_stopping());
        assert_eq!(session.session_id(), Some("s-1"));

        assert!(session.complete_stop());
        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert!(session.session_id().is_none());
        // Still tracked, so a late export event can attach.
        assert_eq!(session.tracked_id(), Some("s-1"));
        assert!(session.channels.is_empty());
        assert_eq!(session.duration_secs(), 0);
    }

    #[test]
    fn test_active_iff_session_id_present() {
        let mut session = Session::new();
        assert_eq!(session.is_active(), session.session_id().is_some());

        session.begin_starting("s-1");
        assert_eq!(session.is_active(), session.session_id().is_some());

        session.activate(vec![], vec![]);
        assert_eq!(session.is_active(), session.session_id().is_some());

        session.begin_stopping();
        session.complete_stop();
        assert_eq!(session.is_active(), session.session_id().is_some());
    }

    #[test]
    fn test_reentrant_activate_preserves_start_time() {
        let mut session = Session::new();
        session.begin_starting("s-1");
        session.activate(vec!["Mic".into()], vec![rts("r1")]);
        let first_start = session.start_time().unwrap();

        assert!(session.activate(vec!["Mic".into()], vec![rts("r1"), rts("r2")]));
        assert_eq!(session.start_time(), Some(first_start));
        assert_eq!(session.rtstreams.len(), 2);
    }

    #[test]
    fn test_rtstream_upsert_never_duplicates() {
        let mut session = Session::new();
        session.begin_starting("s-1");
        session.activate(vec![], vec![rts("r1")]);

        let mut updated = rts("r1");
        updated.scene_index_id = Some("idx-9".into());
        session.upsert_rtstream(updated);

        assert_eq!(session.rtstreams.len(), 1);
        assert_eq!(session.rtstreams[0].scene_index_id.as_deref(), Some("idx-9"));
    }

    #[test]
    fn test_activate_from_idle_is_rejected() {
        let mut session = Session::new();
        assert!(!session.activate(vec![], vec![]));
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_duplicate_starting_is_noop() {
        let mut session = Session::new();
        assert!(session.begin_starting("s-1"));
        assert!(!session.begin_starting("s-1"));
    }

    #[test]
    fn test_stop_from_idle_is_noop() {
        let mut session = Session::new();
        assert!(!session.begin_stopping());
        assert!(!session.complete_stop());
    }

    #[test]
    fn test_export_attaches_only_when_stopped() {
        let mut session = Session::new();
        let info = ExportInfo {
            video_id: "v-1".into(),
            player_url: "https://player.example/v-1".into(),
        };
        assert!(!session.attach_export(info.clone()));

        session.begin_starting("s-1");
        session.activate(vec![], vec![]);
        session.begin_stopping();
        session.complete_stop();
        assert!(session.attach_export(info.clone()));
        assert_eq!(session.export_info, Some(info));
        assert_eq!(session.phase(), SessionPhase::Stopped);
    }

    #[test]
    fn test_failure_is_terminal_and_clears_in_flight_fields() {
        let mut session = Session::new();
        session.begin_starting("s-1");
        session.activate(vec!["Mic".into()], vec![rts("r1")]);
        session.set_visual_latency(120);

        assert!(session.fail("E_CAPTURE", "encoder crashed"));
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert!(session.session_id().is_none());
        assert!(session.start_time().is_none());
        assert!(session.channels.is_empty());
        assert!(session.visual_latency_ms.is_none());
        assert_eq!(session.failure.as_ref().unwrap().code, "E_CAPTURE");

        assert!(!session.fail("E_CAPTURE", "encoder crashed"));
    }

    #[test]
    fn test_new_start_after_stop_resets_duration_clock() {
        let mut session = Session::new();
        session.begin_starting("s-1");
        session.activate(vec![], vec![]);
        session.begin_stopping();
        session.complete_stop();

        session.begin_starting("s-2");
        assert!(session.start_time().is_none());
        assert_eq!(session.duration_secs(), 0);
    }
}

//! On-disk snapshot of buffer + status state.
//!
//! The snapshot is a disposable cache for out-of-process readers: one
//! `timestamp<TAB>text` file per channel plus a `status.json` summary,
//! rewritten whole on every buffer mutation and deleted on clean startup
//! and on session stop. Write failures are logged and swallowed; in-memory
//! buffer correctness never depends on snapshot I/O.

use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::context::ChannelKind;
use crate::context::ContextBuffers;

#[derive(Debug, Serialize)]
struct SnapshotStatus<'a> {
    recording: bool,
    session_id: Option<&'a str>,
    buffer_counts: Vec<ChannelCount>,
    updated_at: String,
}

#[derive(Debug, Serialize)]
struct ChannelCount {
    channel: ChannelKind,
    count: usize,
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrite every channel file and the status summary. Best-effort.
    pub fn write(&self, buffers: &ContextBuffers, recording: bool, session_id: Option<&str>) {
        if let Err(err) = self.try_write(buffers, recording, session_id) {
            warn!(dir = %self.dir.display(), error = %err, "Snapshot write failed");
        }
    }

    fn try_write(
        &self,
        buffers: &ContextBuffers,
        recording: bool,
        session_id: Option<&str>,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        for (channel, items) in buffers.snapshot_all() {
            let mut body = String::new();
            for item in &items {
                body.push_str(&item.timestamp);
                body.push('\t');
                // Keep one line per item; embedded newlines would break
                // the framing for external readers.
                body.push_str(&item.text.replace('\n', " "));
                body.push('\n');
            }
            write_atomic(&self.dir.join(format!("{channel}.txt")), body.as_bytes())?;
        }

        let status = SnapshotStatus {
            recording,
            session_id,
            buffer_counts: buffers
                .counts()
                .into_iter()
                .map(|(channel, count)| ChannelCount { channel, count })
                .collect(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        write_atomic(
            &self.dir.join("status.json"),
            &serde_json::to_vec_pretty(&status).unwrap_or_default(),
        )
    }

    /// Delete all snapshot artifacts. Used on startup and on stop so no
    /// reader ever sees a previous run's data.
    pub fn clear(&self) {
        for channel in ChannelKind::ALL {
            let _ = std::fs::remove_file(self.dir.join(format!("{channel}.txt")));
        }
        let _ = std::fs::remove_file(self.dir.join("status.json"));
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

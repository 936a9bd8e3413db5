use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::context::ChannelKind;
use crate::context::DEFAULT_BUFFER_CAPACITY;

const DEFAULT_BACKEND_URL: &str = "https://api.videodb.io";
const DEFAULT_REST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 3;

const DEFAULT_SCREEN_PROMPT: &str =
    "Describe what is happening on screen: the application, visible text, and user activity.";
const DEFAULT_AUDIO_PROMPT: &str = "Summarize what was said, keeping speaker intent and key facts.";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BATCH_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub api_port: u16,
    pub state_dir: PathBuf,
    pub buffer_capacity: usize,
    pub backend_url: String,
    pub api_key: String,
    pub rest_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self {
            api_port: screenpilot_ipc::api_port(),
            state_dir: screenpilot_ipc::state_dir(),
            buffer_capacity: env::var("SCREENPILOT_BUFFER_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BUFFER_CAPACITY),
            backend_url: env::var("SCREENPILOT_BACKEND_URL")
                .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string()),
            api_key: env::var("VIDEO_DB_API_KEY").unwrap_or_default(),
            rest_timeout: Duration::from_secs(
                env::var("SCREENPILOT_REST_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_REST_TIMEOUT_SECS),
            ),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = port;
        self
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir.join("context")
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }
}

/// Per-channel indexing policy: the prompt/model/batching handed to the
/// backend when a rtstream's index is armed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIndexing {
    pub prompt: String,
    pub model: String,
    pub batch_secs: u64,
    #[serde(default)]
    pub disabled: bool,
}

/// Stored indexing defaults plus merge logic for runtime overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default)]
    channels: HashMap<String, ChannelIndexing>,
}

impl IndexingConfig {
    /// Load the stored config; a missing or unreadable file yields the
    /// built-in defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "Ignoring malformed indexing config");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn builtin_default(channel: ChannelKind) -> ChannelIndexing {
        ChannelIndexing {
            prompt: match channel {
                ChannelKind::Screen => DEFAULT_SCREEN_PROMPT.to_string(),
                ChannelKind::Mic | ChannelKind::SystemAudio => DEFAULT_AUDIO_PROMPT.to_string(),
            },
            model: DEFAULT_MODEL.to_string(),
            batch_secs: DEFAULT_BATCH_SECS,
            disabled: false,
        }
    }

    /// Effective policy for a channel: runtime override first, then the
    /// stored entry, then the built-in default.
    pub fn effective(
        &self,
        channel: ChannelKind,
        runtime_override: Option<&IndexingConfig>,
    ) -> ChannelIndexing {
        if let Some(over) = runtime_override {
            if let Some(entry) = over.channels.get(channel.as_str()) {
                return entry.clone();
            }
        }
        self.channels
            .get(channel.as_str())
            .cloned()
            .unwrap_or_else(|| Self::builtin_default(channel))
    }

    pub fn set_prompt(&mut self, channel: ChannelKind, prompt: &str) {
        let entry = self
            .channels
            .entry(channel.as_str().to_string())
            .or_insert_with(|| Self::builtin_default(channel));
        entry.prompt = prompt.to_string();
    }

    /// Best-effort persistence; callers log and move on if this fails.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self).unwrap_or_default())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_falls_back_to_builtin_defaults() {
        let config = IndexingConfig::default();
        let screen = config.effective(ChannelKind::Screen, None);
        assert_eq!(screen.prompt, DEFAULT_SCREEN_PROMPT);
        assert!(!screen.disabled);

        let mic = config.effective(ChannelKind::Mic, None);
        assert_eq!(mic.prompt, DEFAULT_AUDIO_PROMPT);
    }

    #[test]
    fn test_runtime_override_wins_over_stored() {
        let mut stored = IndexingConfig::default();
        stored.set_prompt(ChannelKind::Screen, "stored prompt");

        let mut over = IndexingConfig::default();
        over.set_prompt(ChannelKind::Screen, "runtime prompt");

        let effective = stored.effective(ChannelKind::Screen, Some(&over));
        assert_eq!(effective.prompt, "runtime prompt");
    }

    #[test]
    fn test_set_prompt_does_not_touch_other_channels() {
        let mut config = IndexingConfig::default();
        config.set_prompt(ChannelKind::Mic, "tuned mic prompt");

        assert_eq!(
            config.effective(ChannelKind::Mic, None).prompt,
            "tuned mic prompt"
        );
        assert_eq!(
            config.effective(ChannelKind::SystemAudio, None).prompt,
            DEFAULT_AUDIO_PROMPT
        );
        assert_eq!(
            config.effective(ChannelKind::Screen, None).prompt,
            DEFAULT_SCREEN_PROMPT
        );
    }

    #[test]
    fn test_persist_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = IndexingConfig::default();
        config.set_prompt(ChannelKind::SystemAudio, "meeting summaries");
        config.persist(&path).unwrap();

        let reloaded = IndexingConfig::load(&path);
        assert_eq!(
            reloaded.effective(ChannelKind::SystemAudio, None).prompt,
            "meeting summaries"
        );
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexingConfig::load(&dir.path().join("nope.json"));
        assert_eq!(config, IndexingConfig::default());
    }

    #[test]
    fn test_load_malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(IndexingConfig::load(&path), IndexingConfig::default());
    }
}

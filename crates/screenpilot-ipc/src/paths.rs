use std::path::PathBuf;

const DEFAULT_API_PORT: u16 = 7817;

/// Directory holding the daemon's runtime artifacts: the bridge socket,
/// the stored indexing config, and the context snapshot directory.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SCREENPILOT_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".screenpilot")
}

pub fn bridge_socket_path() -> PathBuf {
    state_dir().join("bridge.sock")
}

pub fn api_port() -> u16 {
    std::env::var("SCREENPILOT_API_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_API_PORT)
}

pub fn api_base_url() -> String {
    format!("http://127.0.0.1:{}", api_port())
}

#![deny(clippy::all)]

mod backend;
mod bridge;
mod config;
mod context;
mod control;
mod error;
mod http_api;
mod ingest;
mod mcp;
mod server;
mod session;
mod snapshot;
mod state;

pub mod test_support;

pub use backend::BackendClient;
pub use backend::BackendError;
pub use backend::BackendEvent;
pub use backend::CaptureDevice;
pub use backend::DeviceKind;
pub use backend::RtstreamInfo;
pub use backend::VideodbBackend;
pub use config::ChannelIndexing;
pub use config::DaemonConfig;
pub use config::IndexingConfig;
pub use context::ChannelKind;
pub use context::ContextBuffers;
pub use context::ContextItem;
pub use control::ControlFacade;
pub use bridge::send_document;
pub use bridge::EventBridge;
pub use error::ControlError;
pub use error::DaemonError;
pub use http_api::serve_on;
pub use http_api::ApiState;
pub use ingest::IndexingSettings;
pub use ingest::IngestPipeline;
pub use server::run_daemon;
pub use server::ShutdownTrigger;
pub use session::ExportInfo;
pub use session::Rtstream;
pub use session::Session;
pub use session::SessionFailure;
pub use session::SessionPhase;
pub use snapshot::SnapshotWriter;
pub use state::spawn_state_actor;
pub use state::Notice;
pub use state::StateHandle;
pub use state::StatusSnapshot;

pub type Result<T> = std::result::Result<T, ControlError>;

#![deny(clippy::all)]

mod client;
pub mod error_codes;
mod paths;
mod types;

pub use client::ApiClient;
pub use client::ClientError;
pub use paths::api_base_url;
pub use paths::api_port;
pub use paths::bridge_socket_path;
pub use paths::state_dir;
pub use types::RpcRequest;
pub use types::RpcResponse;

pub type Result<T> = std::result::Result<T, ClientError>;

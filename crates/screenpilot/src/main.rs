//! screenpilot CLI: run the daemon, or talk to a running one.

mod telemetry;

use clap::Parser;
use clap::Subcommand;
use serde_json::Value;

use screenpilot_daemon::DaemonConfig;
use screenpilot_ipc::ApiClient;
use screenpilot_ipc::ClientError;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_TRANSPORT: i32 = 74;

#[derive(Parser)]
#[command(
    name = "screenpilot",
    version,
    about = "Local capture-session control plane"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Run {
        /// Also serve the stdio tool protocol on stdin/stdout
        #[arg(long)]
        mcp: bool,
        /// Control API port
        #[arg(long, env = "SCREENPILOT_API_PORT")]
        port: Option<u16>,
    },
    /// Show the capture session status
    Status,
    /// Start a capture session
    Start {
        /// Capture device names; omit for automatic selection
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,
    },
    /// Stop the capture session
    Stop,
    /// Print recent context for a channel (screen, mic, system_audio, all)
    Context {
        channel: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { mcp, port } => run_daemon_command(mcp, port).await,
        Command::Status => status_command().await,
        Command::Start { channels } => start_command(channels).await,
        Command::Stop => stop_command().await,
        Command::Context { channel, limit } => context_command(&channel, limit).await,
    };
    std::process::exit(code);
}

async fn run_daemon_command(mcp: bool, port: Option<u16>) -> i32 {
    let _telemetry = telemetry::init_tracing("info");
    let mut config = DaemonConfig::from_env();
    if let Some(port) = port {
        config = config.with_api_port(port);
    }
    match screenpilot_daemon::run_daemon(config, mcp).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("Error: {err}");
            EXIT_ERROR
        }
    }
}

fn client() -> Result<ApiClient, i32> {
    ApiClient::new().map_err(|err| {
        eprintln!("Error: {err}");
        EXIT_TRANSPORT
    })
}

fn exit_code_for(err: &ClientError) -> i32 {
    match err {
        ClientError::NotReachable(_) | ClientError::Timeout => EXIT_TRANSPORT,
        ClientError::Api { .. } | ClientError::InvalidResponse => EXIT_ERROR,
    }
}

async fn status_command() -> i32 {
    let api = match client() {
        Ok(api) => api,
        Err(code) => return code,
    };
    match api.get_status().await {
        Ok(status) => {
            if status["recording"].as_bool().unwrap_or(false) {
                println!(
                    "Recording: yes (session {}, {}s)",
                    status["sessionId"].as_str().unwrap_or("?"),
                    status["duration"].as_u64().unwrap_or(0)
                );
            } else {
                println!("Recording: no");
            }
            if let Some(counts) = status["bufferCounts"].as_object() {
                for (channel, count) in counts {
                    println!("  {channel}: {count} items");
                }
            }
            EXIT_OK
        }
        Err(err) => {
            eprintln!("Error: {err}");
            exit_code_for(&err)
        }
    }
}

async fn start_command(channels: Vec<String>) -> i32 {
    let api = match client() {
        Ok(api) => api,
        Err(code) => return code,
    };
    let body = if channels.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::json!({ "channels": channels })
    };
    match api.record_start(body).await {
        Ok(response) => {
            println!(
                "Started session {}",
                response["sessionId"].as_str().unwrap_or("?")
            );
            EXIT_OK
        }
        Err(err) => {
            eprintln!("Error: {err}");
            exit_code_for(&err)
        }
    }
}

async fn stop_command() -> i32 {
    let api = match client() {
        Ok(api) => api,
        Err(code) => return code,
    };
    match api.record_stop().await {
        Ok(response) => {
            println!(
                "Stopped (duration {}s)",
                response["duration"].as_u64().unwrap_or(0)
            );
            EXIT_OK
        }
        Err(err) => {
            eprintln!("Error: {err}");
            exit_code_for(&err)
        }
    }
}

async fn context_command(channel: &str, limit: usize) -> i32 {
    let api = match client() {
        Ok(api) => api,
        Err(code) => return code,
    };
    match api
        .get(&format!("/api/context/{channel}?limit={limit}"))
        .await
    {
        Ok(response) => {
            if let Some(channels) = response["channels"].as_object() {
                for (name, items) in channels {
                    println!("[{name}]");
                    print_items(items);
                }
            } else {
                print_items(&response["items"]);
            }
            EXIT_OK
        }
        Err(err) => {
            eprintln!("Error: {err}");
            exit_code_for(&err)
        }
    }
}

fn print_items(items: &Value) {
    for item in items.as_array().map(Vec::as_slice).unwrap_or_default() {
        println!(
            "{}\t{}",
            item["timestamp"].as_str().unwrap_or(""),
            item["text"].as_str().unwrap_or("")
        );
    }
}

//! weave-relay: WebSocket relay for collaborative documents.
//!
//! Clients connect to `ws://<bind>/<documentId>`, join a room and exchange
//! JSON sync frames. With `--storage` every room's op log is kept in
//! RocksDB and reloaded on restart.

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use weave_collab::server::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "weave-relay")]
#[command(about = "Relay server for real-time collaborative text editing")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for room logs (in-memory when omitted)
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Maximum connections per document
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Frames buffered per connection before it must resync
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: args.bind,
            max_peers_per_room: args.max_peers,
            broadcast_capacity: args.broadcast_capacity,
            storage_path: args.storage,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting weave-relay on {} ({})",
        config.bind_addr,
        match &config.storage_path {
            Some(path) => format!("storage at {}", path.display()),
            None => "in-memory".to_string(),
        }
    );

    let server = match SyncServer::open(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to open storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    ExitCode::SUCCESS
}

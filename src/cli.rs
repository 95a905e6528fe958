//! Command line interface for the `wsengine` echo server.

use std::net::SocketAddr;

use clap::Parser;

/// Command line arguments for the `wsengine` binary.
#[derive(Debug, Parser)]
#[command(
    name = "wsengine",
    version,
    about = "WebSocket echo server built on wsengine"
)]
pub struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:9001")]
    pub bind: SocketAddr,

    /// Largest inbound frame payload accepted, in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_payload: usize,

    /// Seconds a client may take to complete the opening handshake.
    #[arg(long)]
    pub handshake_timeout: Option<u64>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

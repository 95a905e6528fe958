//! WebSocket echo server built on `wsengine`.
//!
//! Every text or binary message is sent back to the client that sent it.
//! Ctrl+C stops the server after closing all connections.

mod cli;

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use log::{info, warn};
use wsengine::{ConnectionId, Event, ServerBuilder, ServerHandle};

fn echo(server: &ServerHandle, id: ConnectionId, event: Event) {
    match event {
        Event::NewConnection => info!("client connected: id={id}"),
        Event::Message(message) => {
            if let Err(e) = server.send(id, message) {
                warn!("echo failed: id={id}, error={e}");
            }
        }
        Event::Disconnect => info!("client disconnected: id={id}"),
    }
}

#[cfg(feature = "metrics")]
fn install_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!("serving metrics: addr={addr}");
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    warn!("metrics feature disabled; ignoring --metrics-addr {addr}");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    if let Some(addr) = cli.metrics_addr {
        install_metrics(addr)?;
    }

    let mut server = ServerBuilder::new(echo)
        .max_payload_len(cli.max_payload)
        .handshake_timeout(cli.handshake_timeout.map(Duration::from_secs))
        .bind(cli.bind)?;
    info!("echo server ready: local_addr={}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    tokio::task::spawn_blocking(move || server.stop()).await?;
    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use udpfw_dispatch::bus::{Bus, MemoryBus};
use udpfw_dispatch::server::Server;

/// udpfw dispatch daemon
#[derive(Parser, Debug)]
#[command(name = "udpfw-dispatch")]
#[command(about = "Broker relaying multicast frames between udpfw nodelets", long_about = None)]
struct Args {
    /// TCP bind address
    #[arg(short, long, default_value = "0.0.0.0:5530", env = "UDPFW_BIND")]
    bind: String,

    /// Exchange name blobs are published under
    #[arg(
        long,
        default_value = "udpfw-dispatch-exchange",
        env = "UDPFW_BUS_CHANNEL"
    )]
    bus_channel: String,

    /// Hostname reported to clients in the handshake reply
    /// (defaults to $HOSTNAME)
    #[arg(long, env = "UDPFW_HOSTNAME")]
    hostname: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let hostname = args
        .hostname
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "<unknown>".to_string());

    info!("initialize bus...");
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new(args.bus_channel));
    bus.start().await?;

    info!("initialize TCP server...");
    let bind_addr: SocketAddr = args.bind.parse()?;
    let server = match Server::bind(bind_addr, hostname, Arc::clone(&bus)).await {
        Ok(server) => server,
        Err(e) => {
            let _ = bus.shutdown().await;
            return Err(e);
        }
    };

    info!(address = %server.local_addr(), "now listening");

    let armed = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, notifying clients and draining queues...");
            armed.shutdown().await;
        }
    });

    let result = server.run().await;
    // Covers the listener-failure path; a signal-triggered shutdown
    // already ran and this returns immediately.
    server.shutdown().await;
    info!("bye!");
    result
}

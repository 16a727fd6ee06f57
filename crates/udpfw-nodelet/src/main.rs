use std::net::Ipv4Addr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use udpfw_nodelet::agent::{spawn_emitter, spawn_injector};
use udpfw_nodelet::client::DispatchClient;
use udpfw_nodelet::loopguard::LoopGuard;
use udpfw_nodelet::packetio::{PacketSink, PacketSource, UdpMulticastIo};

/// udpfw nodelet agent
#[derive(Parser, Debug)]
#[command(name = "udpfw-nodelet")]
#[command(about = "Relays local multicast traffic through a udpfw dispatch broker", long_about = None)]
struct Args {
    /// Address of the dispatch service for the local cluster
    #[arg(
        short,
        long,
        default_value = "udpfw-dispatch.svc.cluster.local:5530",
        env = "UDPFW_DISPATCH_ADDRESS"
    )]
    dispatch_address: String,

    /// Namespace to exchange packets in (empty joins the global pool)
    #[arg(short, long, default_value = "", env = "UDPFW_NAMESPACE")]
    namespace: String,

    /// Multicast group to capture and re-inject on
    #[arg(long, default_value = "239.192.0.77", env = "UDPFW_GROUP")]
    group: Ipv4Addr,

    /// UDP port of the multicast group
    #[arg(long, default_value = "7077", env = "UDPFW_PORT")]
    port: u16,

    /// Local interface address used to join the group
    #[arg(long, default_value = "0.0.0.0", env = "UDPFW_INTERFACE")]
    interface: Ipv4Addr,

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

    info!(group = %args.group, port = args.port, "initialize packet handler...");
    let io = Arc::new(UdpMulticastIo::bind(args.group, args.port, args.interface).await?);

    let guard = Arc::new(LoopGuard::new());
    guard.start();

    info!(address = %args.dispatch_address, "initialize dispatch connector...");
    let (client, packets) = DispatchClient::new(args.dispatch_address, args.namespace);

    let emitter = spawn_emitter(
        Arc::clone(&io) as Arc<dyn PacketSource>,
        client.clone(),
        Arc::clone(&guard),
    );
    let injector = spawn_injector(
        packets,
        Arc::clone(&io) as Arc<dyn PacketSink>,
        Arc::clone(&guard),
    );

    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    let armed = client.clone();
    let armed_guard = Arc::clone(&guard);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, draining dispatch session...");
            armed.shutdown().await;
            armed_guard.stop();
        }
    });

    // Either pump finishing means the agent cannot do useful work
    // anymore.
    tokio::select! {
        _ = emitter => {}
        _ = injector => {}
    }

    info!("bye!");
    Ok(())
}

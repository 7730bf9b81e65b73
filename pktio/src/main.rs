//! pktio daemon: host packet path between the switch NPU and TAP devices.

use anyhow::Context;
use clap::Parser;
use pktio::config::Config;
use pktio::filter::PacketFilter;
use pktio::npu::{LoopbackNpu, NpuDriver};
use pktio::packet_io::{PacketDebug, PacketIo};
use pktio::port::{PortRegistry, PortResolver, TapWatcher};
use pktio::reactor::flood::FloodReconstructor;
use pktio::reactor::nflog::NflogSocket;
use pktio::reactor::{FloodSource, Reactor};
use pktio::tap::{LinuxTap, TapDriver};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pktio", about = "Switch host packet I/O daemon")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// sFlow collector address
    #[arg(long)]
    sample_destination: Option<SocketAddrV4>,

    /// NFLOG group carrying flooded ARP/NS copies
    #[arg(long)]
    nflog_group: Option<u16>,

    /// Queues per TAP device
    #[arg(long)]
    tap_queues: Option<usize>,

    /// Packet dumps: off, in, out or both
    #[arg(long)]
    packet_debug: Option<PacketDebug>,

    /// Log counters every N seconds
    #[arg(long)]
    stats_interval: Option<u64>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dest) = args.sample_destination {
        config.sample_destination = dest;
    }
    if let Some(group) = args.nflog_group {
        config.nflog_group = Some(group);
    }
    if let Some(queues) = args.tap_queues {
        config.tap_queues = queues;
    }
    if let Some(mode) = args.packet_debug {
        config.packet_debug = mode;
    }
    config.validate()?;
    Ok(config)
}

fn log_stats(io: &PacketIo) {
    match serde_json::to_string(&io.counters()) {
        Ok(counters) => info!(
            counters = %counters,
            ports = io.ports().dump().len(),
            rules = io.filter().describe_all().len(),
            "Packet counters"
        ),
        Err(e) => warn!(error = %e, "Failed to serialize counters"),
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args).context("Failed to load configuration")?;
    info!(
        sample_destination = %config.sample_destination,
        tap_queues = config.tap_queues,
        nflog_group = ?config.nflog_group,
        "pktio starting..."
    );

    let (reactor, reactor_handle) =
        Reactor::new(config.reactor()).context("Failed to create reactor")?;

    let driver: Arc<dyn TapDriver> = Arc::new(LinuxTap::new(config.tap_txqlen));
    let watcher: Arc<dyn TapWatcher> = Arc::new(reactor_handle.clone());
    let ports = Arc::new(
        PortRegistry::new(driver, watcher, config.tap_queues, config.link_up_retries)
            .context("Failed to create port registry")?,
    );
    let filter = Arc::new(
        PacketFilter::new(Arc::clone(&ports) as Arc<dyn PortResolver>)
            .context("Failed to create packet filter")?,
    );
    let npu: Arc<dyn NpuDriver> = Arc::new(LoopbackNpu::new());
    let io = Arc::new(
        PacketIo::new(filter, Arc::clone(&ports), npu, config.sample_destination)
            .context("Failed to open sample socket")?,
    );
    io.set_packet_debug(config.packet_debug);

    let flood = match config.nflog_group {
        Some(group) => {
            let socket = NflogSocket::open(group).context("Failed to open NFLOG socket")?;
            let interfaces = config.interface_table();
            info!(interfaces = interfaces.len(), "Interface context loaded");
            Some(FloodSource {
                socket,
                reconstructor: FloodReconstructor::new(Arc::new(interfaces)),
            })
        }
        None => None,
    };

    let reactor_io = Arc::clone(&io);
    let reactor_thread = thread::Builder::new()
        .name("pktio-reactor".into())
        .spawn(move || reactor.run(&reactor_io, flood))
        .context("Failed to spawn reactor thread")?;

    for p in &config.ports {
        match ports.create_port(p.npu, p.port, &p.name) {
            Ok(ifindex) => info!(
                npu = p.npu,
                port = p.port,
                name = %p.name,
                ifindex,
                "Port created"
            ),
            Err(e) => {
                error!(
                    npu = p.npu,
                    port = p.port,
                    name = %p.name,
                    error = %e,
                    "Failed to create port"
                );
                continue;
            }
        }
        if p.link_up
            && let Err(e) = ports.set_link(p.npu, p.port, true)
        {
            error!(npu = p.npu, port = p.port, error = %e, "Failed to bring link up");
        }
    }

    for spec in &config.rules {
        match io.filter().create(spec) {
            Ok(rule_id) => info!(rule_id, direction = ?spec.direction, "Rule installed"),
            Err(e) => error!(error = %e, "Failed to install rule"),
        }
    }

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut stats = args
        .stats_interval
        .map(|secs| tokio::time::interval(Duration::from_secs(secs.max(1))));

    loop {
        tokio::select! {
            _ = sigint.recv() => { info!("Received SIGINT"); break; }
            _ = sigterm.recv() => { info!("Received SIGTERM"); break; }
            _ = async {
                match stats.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log_stats(&io),
        }
    }

    info!("Shutting down...");
    // Unbinding queues the unwatch commands ahead of the shutdown. The TAP
    // devices are persistent and stay for the next start.
    ports.shutdown();
    reactor_handle.shutdown();
    match reactor_thread.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Reactor failed"),
        Err(_) => error!("Reactor thread panicked"),
    }
    log_stats(&io);

    info!("pktio stopped");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        error!(error = %format_args!("{e:#}"), "pktio failed");
        std::process::exit(1);
    }
}

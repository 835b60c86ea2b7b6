use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::interval;

use hipvpls::backbone::RawIpSocket;
use hipvpls::config::Config;
use hipvpls::error::ConfigError;
use hipvpls::identity::Identity;
use hipvpls::metrics::Metrics;
use hipvpls::router::{Router, RouterOutput};
use hipvpls::{ah, hip, http, ipv4, tap};

#[derive(Parser, Debug)]
#[command(
    name = "hipvpls",
    version,
    about = "HIP-secured VPLS router",
    long_about = "Bridges a local Ethernet segment with peer routers over an IPv4 backbone.\n\
        Layer-2 frames travel inside authenticated IPsec AH tunnels whose keys are\n\
        negotiated by the HIP base exchange (I1/R1/I2/R2)."
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short = 'C', default_value = "hipvpls.toml")]
    config: PathBuf,

    /// Path to the host identity keypair (overrides the config)
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Generate a new host identity and exit
    #[arg(long)]
    init: bool,

    /// TAP device name (overrides the config)
    #[arg(long)]
    tap: Option<String>,

    /// Metrics HTTP port (overrides the config)
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if err.is::<ConfigError>() {
        2
    } else if err.downcast_ref::<io::Error>().is_some() {
        3
    } else {
        4
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    env_logger::init();

    if let Err(err) = run(args).await {
        error!("{:#}", err);
        std::process::exit(exit_code(&err));
    }
}

fn identity_path(args: &Args, config: &Config) -> PathBuf {
    args.identity
        .clone()
        .or_else(|| config.security.identity_path.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("hipvpls.key"))
}

async fn run(args: Args) -> Result<()> {
    if args.init {
        let path = args
            .identity
            .clone()
            .unwrap_or_else(|| PathBuf::from("hipvpls.key"));
        let identity = Identity::generate();
        identity.save(&path)?;
        println!("host identity tag: {}", identity.hit());
        println!("public key:        {}", identity.public_key_hex());
        return Ok(());
    }

    let config = Config::load(&args.config)?;
    let tap_name = args.tap.clone().unwrap_or_else(|| config.daemon.tap_name.clone());
    let metrics_port = args.metrics_port.unwrap_or(config.daemon.metrics_port);
    let local_addr = config
        .daemon
        .local_addr
        .expect("validated by Config::load");

    let identity = Identity::load_or_generate(&identity_path(&args, &config))?;
    info!(
        "starting hip-vpls router, hit {} at {}",
        identity.hit(),
        local_addr
    );

    let peer_table = config.build_peer_table()?;
    if peer_table.is_empty() {
        warn!("no peers configured; nothing will be bridged");
    }

    let metrics = Metrics::new();
    let mut router = Router::new(identity, &config, peer_table, metrics.clone());

    // Bridge side: async TAP device split into reader and writer halves.
    let device = tap::create(&tap_name, config.daemon.tap_mtu)?;
    let (mut tap_reader, mut tap_writer) = tokio::io::split(device);

    // Backbone side: one raw receive socket per protocol, shared send path.
    let hip_socket = RawIpSocket::open(hip::HIP_PROTOCOL)
        .context("failed to open raw socket for HIP control traffic")?;
    let ah_socket =
        RawIpSocket::open(ah::AH_PROTOCOL).context("failed to open raw socket for AH traffic")?;

    let quiesce = Arc::new(AtomicBool::new(false));

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(1024);
    let (datagram_tx, mut datagram_rx) = mpsc::channel::<(Ipv4Addr, u8, Vec<u8>)>(1024);
    let (bridge_tx, mut bridge_rx) = mpsc::channel::<Vec<u8>>(1024);
    let (backbone_tx, backbone_rx) = std::sync::mpsc::channel::<(Ipv4Addr, Vec<u8>)>();

    let hip_reader = spawn_backbone_reader(hip_socket, datagram_tx.clone(), quiesce.clone(), "hip");
    let ah_reader = spawn_backbone_reader(ah_socket, datagram_tx, quiesce.clone(), "ah");
    let backbone_writer = spawn_backbone_writer(backbone_rx);

    // TAP reader task: frames from the local segment into the worker.
    tokio::spawn(async move {
        let mut buf = vec![0u8; tap::TAP_READ_BUFFER];
        loop {
            match tap_reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(len) => {
                    if frame_tx.send(buf[..len].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("tap read error: {}", e);
                    break;
                }
            }
        }
    });

    // TAP writer task: authenticated frames back onto the local segment.
    tokio::spawn(async move {
        while let Some(frame) = bridge_rx.recv().await {
            if let Err(e) = tap_writer.write_all(&frame).await {
                error!("tap write error: {}", e);
                break;
            }
        }
    });

    // Counter endpoint.
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve(metrics_clone, metrics_port).await {
            error!("counter endpoint failed: {}", e);
        }
    });

    // Protocol worker: single owner of all mutable core state.
    let mut ticker = interval(config.timing.tick());
    let mut outputs: Vec<RouterOutput> = Vec::new();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutting down...");
                break;
            }
            _ = ticker.tick() => {
                router.tick(Instant::now(), &mut outputs);
            }
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => router.handle_bridge_frame(frame, &mut outputs),
                    None => break,
                }
            }
            datagram = datagram_rx.recv() => {
                match datagram {
                    Some((src, protocol, payload)) => {
                        router.handle_backbone(src, protocol, &payload, &mut outputs)
                    }
                    None => break,
                }
            }
        }

        dispatch(&mut outputs, &bridge_tx, &backbone_tx).await;
    }

    router.shutdown(&mut outputs);
    dispatch(&mut outputs, &bridge_tx, &backbone_tx).await;

    quiesce.store(true, Ordering::Relaxed);
    drop(backbone_tx);
    let _ = hip_reader.join();
    let _ = ah_reader.join();
    let _ = backbone_writer.join();

    info!("clean shutdown");
    Ok(())
}

async fn dispatch(
    outputs: &mut Vec<RouterOutput>,
    bridge_tx: &mpsc::Sender<Vec<u8>>,
    backbone_tx: &std::sync::mpsc::Sender<(Ipv4Addr, Vec<u8>)>,
) {
    for output in outputs.drain(..) {
        match output {
            RouterOutput::BridgeFrame(frame) => {
                if bridge_tx.send(frame).await.is_err() {
                    warn!("bridge writer gone, frame dropped");
                }
            }
            RouterOutput::Backbone { dst, datagram } => {
                if backbone_tx.send((dst, datagram)).is_err() {
                    warn!("backbone writer gone, datagram dropped");
                }
            }
        }
    }
}

/// Blocking reader thread for one raw socket. The receive timeout bounds
/// how long shutdown can wait.
fn spawn_backbone_reader(
    socket: RawIpSocket,
    tx: mpsc::Sender<(Ipv4Addr, u8, Vec<u8>)>,
    quiesce: Arc<AtomicBool>,
    label: &'static str,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = vec![0u8; 65536];
        while !quiesce.load(Ordering::Relaxed) {
            match socket.recv(&mut buf) {
                Ok(len) => match ipv4::parse(&buf[..len]) {
                    Ok(datagram) => {
                        let item = (datagram.src, datagram.protocol, datagram.payload.to_vec());
                        if tx.blocking_send(item).is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!("{} reader: unparseable datagram: {}", label, err),
                },
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => {
                    error!("{} reader: receive error: {}", label, e);
                    break;
                }
            }
        }
    })
}

/// Blocking writer thread draining the outbound backbone queue. Exits when
/// the worker drops its sender.
fn spawn_backbone_writer(
    rx: std::sync::mpsc::Receiver<(Ipv4Addr, Vec<u8>)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        // Sending with IP_HDRINCL works from any raw socket; one dedicated
        // socket keeps transmit out of the readers' way.
        let socket = match RawIpSocket::open(ah::AH_PROTOCOL) {
            Ok(socket) => socket,
            Err(e) => {
                error!("failed to open backbone send socket: {}", e);
                return;
            }
        };
        while let Ok((dst, datagram)) = rx.recv() {
            if let Err(e) = socket.send(&datagram, dst) {
                warn!("backbone send to {} failed: {}", dst, e);
            }
        }
    })
}

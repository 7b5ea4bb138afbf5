//! punchline CLI
//!
//! NAT discovery and peer-to-peer TCP connection setup.

mod config;

use clap::{Parser, Subcommand};
use punchline_crypto::PrivateKey;
use punchline_traversal::clock::SntpSource;
use punchline_traversal::nat::NatClassifier;
use punchline_traversal::predict::MappingProbe;
use punchline_traversal::{
    IdleReaper, NatInfo, Orchestrator, PeerAddress, PeerInterface, ReaperConfig, Signaling, SyncClock,
    TcpPuncher, node_id_for,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::Config;

/// punchline - reach peers behind NATs
#[derive(Parser)]
#[command(name = "punchline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the NAT in front of this host
    Nat,

    /// Show the WAN IP agreed on by the STUN servers
    WanIp,

    /// Generate a new node keypair
    Keygen {
        /// Output file for the private key (defaults to the configured path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print this node's address for sharing with peers
    Address,

    /// Connect to a peer and exchange one message
    Connect {
        /// Peer address text
        #[arg(required = true)]
        peer: String,

        /// Message to send
        #[arg(short, long, default_value = "hello")]
        message: String,
    },

    /// Accept connections and echo what arrives
    Listen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    config.validate()?;

    match cli.command {
        Commands::Nat => show_nat(&config).await?,
        Commands::WanIp => show_wan_ip(&config).await?,
        Commands::Keygen { output } => generate_keypair(output, &config)?,
        Commands::Address => show_address(&config).await?,
        Commands::Connect { peer, message } => connect(&peer, &message, &config).await?,
        Commands::Listen => listen(&config).await?,
    }

    Ok(())
}

/// Local IP the OS routes towards `target` through.
async fn outbound_ip(target: SocketAddr) -> anyhow::Result<IpAddr> {
    let unspecified = match target {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    };
    let socket = tokio::net::UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}

/// Classifier bound to the configured (or outbound) interface.
async fn classifier(config: &Config) -> anyhow::Result<NatClassifier> {
    let stun = config.stun_config()?;
    let mut ip = config.bind_ip()?;
    if ip.is_unspecified() {
        if let Some(server) = stun.servers.first() {
            ip = outbound_ip(*server).await?;
        } else {
            ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        }
    }
    Ok(NatClassifier::new(stun, ip))
}

/// Classify the NAT
async fn show_nat(config: &Config) -> anyhow::Result<()> {
    let classifier = classifier(config).await?;
    let timeout = Duration::from_secs(config.stun.timeout_secs * 4);
    let info = classifier.get_nat_info(timeout).await?;

    println!("NAT type: {:?}", info.nat_type);
    println!("Delta: {:?} ({})", info.delta.kind, info.delta.value);
    println!("Port range: {}-{}", info.range.0, info.range.1);
    println!("Predictable: {}", info.can_predict());
    Ok(())
}

/// Show the WAN IP
async fn show_wan_ip(config: &Config) -> anyhow::Result<()> {
    let classifier = classifier(config).await?;
    println!("{}", classifier.get_wan_ip().await?);
    Ok(())
}

/// Generate a new node keypair
fn generate_keypair(output: Option<PathBuf>, config: &Config) -> anyhow::Result<()> {
    println!("Generating new X25519 node keypair...");

    let key = PrivateKey::generate(&mut rand_core::OsRng);
    let public = key.public_key();
    println!("Public key: {}", public.to_hex());
    println!("Node id: {}", node_id_for(&public));

    let path = output.unwrap_or_else(|| config.node.private_key_file.clone());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, key.to_hex())?;
    println!("Private key saved to: {}", path.display());
    println!("\nKeep this file secure! It contains your private key.");
    Ok(())
}

fn load_key(config: &Config) -> anyhow::Result<PrivateKey> {
    let path = &config.node.private_key_file;
    let text = std::fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("cannot read key {}: {} (run `punchline keygen`)", path.display(), e)
    })?;
    Ok(PrivateKey::from_hex(text.trim())?)
}

/// Our address with the NAT detected on the bound interface.
async fn local_address(config: &Config, key: &PrivateKey) -> anyhow::Result<PeerAddress> {
    let classifier = classifier(config).await?;
    let nic = classifier.bind_ip();
    let (wan, nat) = if classifier.config().servers.is_empty() {
        (nic, NatInfo::open())
    } else {
        let wan = classifier.get_wan_ip().await?;
        let timeout = Duration::from_secs(config.stun.timeout_secs * 4);
        let nat = match classifier.get_nat_info(timeout).await {
            Ok(nat) => nat,
            Err(e) => {
                tracing::warn!("NAT detection failed, assuming the worst: {}", e);
                NatInfo::default()
            }
        };
        (wan, nat)
    };
    let interface = PeerInterface {
        wan_ip: wan,
        nic_ip: nic,
        port: config.node.listen_port,
        nat,
    };
    Ok(PeerAddress::new(&key.public_key(), vec![interface]))
}

/// Print our address
async fn show_address(config: &Config) -> anyhow::Result<()> {
    let key = load_key(config)?;
    let address = local_address(config, &key).await?;
    println!("Node id: {}", address.node_id);
    for (i, iface) in address.interfaces.iter().enumerate() {
        println!(
            "  [{}] wan {} nic {} port {} nat {:?}/{:?}",
            i, iface.wan_ip, iface.nic_ip, iface.port, iface.nat.nat_type, iface.nat.delta.kind
        );
    }
    println!("\n{}", address.to_text()?);
    Ok(())
}

/// Wire up signaling, puncher, reaper and orchestrator for this node.
async fn start_node(config: &Config) -> anyhow::Result<(Orchestrator, PeerAddress)> {
    let key = load_key(config)?;
    let address = local_address(config, &key).await?;
    let clock = match config.ntp_server()? {
        Some(server) => SyncClock::calibrate(Arc::new(SntpSource::new(server)), 8).await,
        None => SyncClock::default(),
    };

    // No relay channels are configured here, so only Direct can complete;
    // signaled strategies fail over immediately.
    let signaling = Arc::new(Signaling::new(
        config.signaling_config(),
        key,
        address.clone(),
        clock,
        Vec::new(),
    ));

    let probe = classifier(config).await?;
    let prober: Option<Arc<dyn MappingProbe>> = if probe.config().servers.is_empty() {
        None
    } else {
        Some(Arc::new(probe))
    };
    let puncher = Arc::new(TcpPuncher::new(config.punch_config(), clock, prober));

    let reaper = Arc::new(IdleReaper::new(ReaperConfig::default(), puncher.pool().clone()));
    reaper.start();

    let orchestrator = Orchestrator::builder(config.orchestrator_config()?, signaling, puncher)
        .reaper(reaper)
        .start()
        .await;
    Ok((orchestrator, address))
}

/// Connect to a peer
async fn connect(peer: &str, message: &str, config: &Config) -> anyhow::Result<()> {
    let peer = PeerAddress::from_text(peer.trim())?;
    let (orchestrator, _) = start_node(config).await?;
    tracing::info!("Connecting to {}", peer.node_id);

    let pipe = orchestrator.connect_default(&peer).await?;
    println!(
        "Connected: {} -> {}",
        pipe.local_addr()?,
        pipe.peer_addr().map_or_else(|| "?".to_string(), |a| a.to_string())
    );

    pipe.send(message.as_bytes(), None).await?;
    match pipe.recv(Duration::from_secs(5)).await? {
        Some((reply, _)) => println!("Reply: {}", String::from_utf8_lossy(&reply)),
        None => println!("No reply within 5s"),
    }
    pipe.close().await?;
    orchestrator.shutdown();
    Ok(())
}

/// Accept and echo
async fn listen(config: &Config) -> anyhow::Result<()> {
    let (orchestrator, address) = start_node(config).await?;
    let bind = SocketAddr::new(config.bind_ip()?, config.node.listen_port);
    let bound = orchestrator.listen(bind).await?;

    println!("Listening on {}", bound);
    println!("Address:\n{}", address.to_text()?);
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            incoming = orchestrator.accept() => {
                let Some(incoming) = incoming else { break };
                println!("Pipe {} from {:?}", incoming.pipe_id, incoming.pipe.peer_addr());
                tokio::spawn(async move {
                    let pipe = incoming.pipe;
                    while let Ok(Some((data, _))) = pipe.recv(Duration::from_secs(60)).await {
                        println!("[{}] {}", incoming.pipe_id, String::from_utf8_lossy(&data));
                        if pipe.send(&data, None).await.is_err() {
                            break;
                        }
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\nShutting down...");
    orchestrator.shutdown();
    Ok(())
}

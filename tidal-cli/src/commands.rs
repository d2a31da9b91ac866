//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use tidal_core::config::ServiceConfig;
use tidal_core::engine::{
    EngineDependencies, LibraryProbe, NativeDownloadEngine, PeerId, SaveDirectory,
    SimulatedBackend,
};
use tidal_core::filter::PeerFilterConfig;
use tidal_core::network::ReqwestClientFactory;
use tidal_core::service::{
    RetryPolicy, StateTransition, TcpServiceStarter, acquire_with_backoff,
};
use tidal_core::{
    ClientFingerprint, DownloadEngine, EngineConfig, EngineType, PeerInfo, ServiceConnection,
    Setting, SharedFilterChain, TidalConfig, Verdict,
};
use tokio::sync::broadcast::error::RecvError;

#[derive(Subcommand)]
pub enum Commands {
    /// Show the peer-id prefix and user agent for a client version
    Fingerprint {
        /// Client version, e.g. 4.10.2
        #[arg(short, long)]
        version: Option<String>,
    },
    /// Check whether a native engine library can be loaded
    Probe {
        /// Library base name, e.g. torrent-rasterbar
        #[arg(short, long)]
        library: String,
        /// Directories to search (defaults to the configured library dirs)
        #[arg(short, long = "search-dir")]
        search_dir: Vec<PathBuf>,
    },
    /// Evaluate one peer against a filter configuration
    CheckPeer {
        /// JSON peer filter configuration (defaults to the configured filters)
        #[arg(short, long)]
        filters: Option<PathBuf>,
        /// Remote address of the peer
        #[arg(long)]
        ip: String,
        /// Self-reported client name
        #[arg(short, long, default_value = "")]
        client: String,
        /// Raw peer id as sent in the handshake
        #[arg(short, long, default_value = "")]
        peer_id: String,
    },
    /// Connect to the background download service
    Service {
        /// Address the service listens on
        #[arg(short, long)]
        addr: Option<SocketAddr>,
        /// Executable to spawn if the service is not running
        #[arg(short, long)]
        program: Option<PathBuf>,
    },
}

/// Handle CLI command execution
///
/// # Errors
///
/// - Configuration, library or service errors from the chosen command
pub async fn handle_command(command: Commands, config: TidalConfig) -> Result<()> {
    match command {
        Commands::Fingerprint { version } => show_fingerprint(&config, version),
        Commands::Probe {
            library,
            search_dir,
        } => probe_library(&config, library, search_dir).await,
        Commands::CheckPeer {
            filters,
            ip,
            client,
            peer_id,
        } => check_peer(&config, filters, ip, client, peer_id),
        Commands::Service { addr, program } => connect_service(&config, addr, program).await,
    }
}

fn show_fingerprint(config: &TidalConfig, version: Option<String>) -> Result<()> {
    let version = version.unwrap_or_else(|| config.client.version.clone());
    let fingerprint = ClientFingerprint::derive(
        &config.client.fingerprint_tag,
        &config.client.product,
        &version,
    )?;

    println!("Fingerprint: {fingerprint}");
    println!("User agent:  {}", fingerprint.user_agent());
    println!("Peer id:     {}", PeerId::generate(&fingerprint));
    Ok(())
}

async fn probe_library(
    config: &TidalConfig,
    library: String,
    search_dir: Vec<PathBuf>,
) -> Result<()> {
    let search_dirs = if search_dir.is_empty() {
        config.storage.library_dirs.clone()
    } else {
        search_dir
    };
    let probe = LibraryProbe::new(library, search_dirs);
    println!("Looking for {}", probe.file_name());

    let deps = EngineDependencies {
        proxy: Setting::new(config.proxy.clone()),
        http_factory: Arc::new(ReqwestClientFactory::default()),
        save_dir: SaveDirectory::new(&config.storage.save_dir),
        fingerprint: ClientFingerprint::from_config(&config.client)?,
        peer_filter: SharedFilterChain::new(config.peer_filter.build_chain(&[])),
    };
    let backend = Arc::new(SimulatedBackend::with_library(Arc::new(probe.clone())));
    let engine = NativeDownloadEngine::new(
        backend,
        Setting::new(EngineConfig::new(EngineType::Simulated)),
        deps,
    );

    if engine.test_connection() {
        println!("Supported: {}", engine.library_name());
    } else {
        let reason = match probe.locate() {
            Ok(path) => format!("{} could not be loaded", path.display()),
            Err(e) => e.to_string(),
        };
        println!("Unsupported: {reason}");
    }
    Ok(())
}

fn check_peer(
    config: &TidalConfig,
    filters: Option<PathBuf>,
    ip: String,
    client: String,
    peer_id: String,
) -> Result<()> {
    let filter_config = match filters {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<PeerFilterConfig>(&text)
                .with_context(|| format!("Invalid filter configuration in {}", path.display()))?
        }
        None => config.peer_filter.clone(),
    };

    let chain = filter_config.build_chain(&[]);
    let peer = PeerInfo::new(peer_id.into_bytes(), client, ip, 0);

    match chain.evaluate(&peer) {
        Verdict::Allow => println!("Allowed ({} filters)", chain.len()),
        Verdict::Block { filter } => {
            let description = chain
                .filters()
                .get(filter)
                .map(|f| f.describe())
                .unwrap_or_default();
            println!("Blocked by filter #{filter}: {description}");
        }
    }
    Ok(())
}

async fn connect_service(
    config: &TidalConfig,
    addr: Option<SocketAddr>,
    program: Option<PathBuf>,
) -> Result<()> {
    let mut service: ServiceConfig = config.service.clone();
    if let Some(addr) = addr {
        service.address = addr.to_string();
    }
    if program.is_some() {
        service.program = program;
    }
    let policy: RetryPolicy = service.retry.clone();

    let connection = ServiceConnection::new("tidal-service", TcpServiceStarter::new(service));
    let mut transitions = connection.transitions();

    let acquire = acquire_with_backoff(&connection, &policy);
    tokio::pin!(acquire);
    let result = loop {
        tokio::select! {
            result = &mut acquire => break result,
            event = transitions.recv() => match event {
                Ok(transition) => print_transition(transition),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} state transitions", skipped);
                }
                Err(RecvError::Closed) => {}
            },
        }
    };
    while let Ok(transition) = transitions.try_recv() {
        print_transition(transition);
    }

    let endpoint = result.context("Service is unavailable")?;
    println!(
        "Connected to {endpoint} ({})",
        connection.status().describe()
    );
    Ok(())
}

fn print_transition(transition: StateTransition) {
    println!(
        "[attempt {}] {} -> {}",
        transition.attempt, transition.from, transition.to
    );
}

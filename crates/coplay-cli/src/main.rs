//! Coplay CLI
//!
//! Relayed UDP tunnelling for peer-to-peer game sessions

mod config;

use clap::{Parser, Subcommand};
use coplay_core::{
    CoplayConfig, JoinCommand, JoinFilter, JoinTarget, LocalSession, Role, RoleCoordinator,
    StaticSession,
};
use coplay_transport::{MemoryRelay, PeerIdentity};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use config::Config;

/// Coplay - play LAN games over a relay, no port forwarding
#[derive(Parser)]
#[command(name = "coplay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Tunnel a local game server to an in-process client over a loopback relay
    Loopback {
        /// Address of the running game server
        #[arg(short, long, default_value = "127.0.0.1:27015")]
        server: SocketAddr,

        /// Join filter for the host (off, controlled, friends-only, everyone)
        #[arg(short, long, default_value = "controlled")]
        filter: JoinFilter,

        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Parse a join command and show where it points
    Parse {
        /// The command, e.g. `coplay_connect 76561198000000001 XYZ`
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Show the effective configuration
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration as TOML
    Show,
}

const LOOPBACK_HOST: PeerIdentity = PeerIdentity::new(1);
const LOOPBACK_GUEST: PeerIdentity = PeerIdentity::new(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        return init_config(&config_path, *force);
    }

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Init { .. } => {}
            ConfigAction::Show => print!("{}", toml::to_string_pretty(&config)?),
        },
        Commands::Loopback {
            server,
            filter,
            duration,
        } => {
            run_loopback(&config.coplay, server, filter, duration.map(Duration::from_secs)).await?;
        }
        Commands::Parse { command } => {
            parse_command(&command.join(" "))?;
        }
        Commands::Status => {
            show_status(&config, &config_path);
        }
    }

    Ok(())
}

/// Write a default configuration file
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

/// Host `server` and join it from a second coordinator on the same relay
async fn run_loopback(
    config: &CoplayConfig,
    server: SocketAddr,
    filter: JoinFilter,
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    tracing::info!(%server, %filter, "starting loopback session");

    let relay = MemoryRelay::new();
    let nobody = Arc::new(|_: PeerIdentity| false);

    let host_session = Arc::new(StaticSession::hosting(server));
    host_session.set_names("loopback", "");
    let mut host = RoleCoordinator::new(
        config.clone(),
        Arc::new(relay.endpoint(LOOPBACK_HOST)),
        host_session,
        nobody.clone(),
    )?;

    let client_session = Arc::new(StaticSession::idle());
    let mut client = RoleCoordinator::new(
        config.clone(),
        Arc::new(relay.endpoint(LOOPBACK_GUEST)),
        client_session.clone(),
        nobody,
    )?;

    host.tick();
    client.tick();
    host.set_join_filter(filter);
    host.start_hosting()?;

    let command = host.join_command()?;
    println!("Host: {LOOPBACK_HOST} serving {server}");
    println!("Join command: {command}");
    client.run_join_command(&command.to_string())?;

    let deadline = duration.map(|d| Instant::now() + d);
    let mut ticker = tokio::time::interval(config.tick_interval().max(Duration::from_millis(5)));
    let mut reporter = tokio::time::interval(Duration::from_secs(5));
    let mut announced = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
            _ = ticker.tick() => {
                host.tick();
                client.tick();

                let endpoint = (client.role() == Role::Client)
                    .then(|| client_session.server_addr())
                    .flatten();
                if endpoint.is_some() && endpoint != announced {
                    if let Some(addr) = endpoint {
                        println!("Point your game client at {addr}");
                    }
                    announced = endpoint;
                }
                if client.role() == Role::Inactive {
                    let ended = match client.last_error() {
                        Some(e) if e.is_admission() => {
                            println!("Host refused the connection: {e}");
                            true
                        }
                        Some(e) if e.is_transient() => {
                            println!("Connect failed, retry later: {e}");
                            true
                        }
                        Some(e) => {
                            println!("Connect failed: {e}");
                            true
                        }
                        None if announced.is_some() => {
                            println!("Connection to host closed");
                            true
                        }
                        None => false,
                    };
                    if ended {
                        break;
                    }
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
            _ = reporter.tick() => {
                let status = host.status();
                tracing::info!(
                    role = %status.role,
                    connections = status.connections,
                    pending = status.pending,
                    filter = %status.join_filter,
                    "host status"
                );
            }
        }
    }

    client.shutdown();
    host.shutdown();
    Ok(())
}

/// Parse a join command and describe it
fn parse_command(input: &str) -> anyhow::Result<()> {
    let command = match input.strip_prefix('+') {
        Some(_) => JoinCommand::from_presence(input)?,
        None => JoinCommand::parse(input)?,
    };

    match &command.target {
        JoinTarget::Peer(peer) => println!("Relayed host: {peer}"),
        JoinTarget::Lobby(lobby) => println!("Lobby: {lobby}"),
        JoinTarget::Address(addr) => println!("Direct server: {addr}"),
    }
    if command.password.is_some() {
        println!("Passcode: supplied");
    }
    println!("Canonical form: {command}");
    Ok(())
}

/// Show the effective configuration
fn show_status(config: &Config, path: &Path) {
    let coplay = &config.coplay;
    println!("Coplay Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", path.display());
    println!();

    println!("Tunnels:");
    println!(
        "  Port range: {}-{} on {}",
        coplay.port_range.start, coplay.port_range.end, coplay.bind_addr
    );
    println!(
        "  Tick rate: {} Hz ({} packets/tick)",
        coplay.effective_tick_hz(),
        coplay.max_packets_per_tick
    );
    println!("  Idle timeout: {:?}", coplay.idle_timeout());
    println!("  Handshake timeout: {:?}", coplay.handshake_timeout());
    println!();

    println!("Game:");
    println!("  Client port: {}", coplay.client_port);
    println!("  Default server port: {}", coplay.default_server_port);
    println!();

    println!("Hosting:");
    println!("  Join filter: {}", coplay.join_filter);
    println!("  Admission: {:?}", coplay.admission);
    println!("  Auto open: {}", coplay.auto_open);
}

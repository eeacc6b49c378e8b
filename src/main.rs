//! gateway-proxy: HTTP reverse proxy gateway
//!
//! Spreads inbound requests over a backend pool that can change at runtime,
//! fed by a static list, a coordination-service registry, or health checks.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

use gateway_proxy::{
    backends::{build_balancer, BalanceKind, BalancerOptions},
    config::{read_config, AppConfig},
    membership::{bind, build_source},
    registry::{build_client, RegistryBackend, RegistryClient},
    run_server,
};

#[derive(Parser)]
#[command(name = "gateway-proxy")]
#[command(version = "0.1.0")]
#[command(about = "HTTP reverse proxy gateway with pluggable load balancing")]
#[command(long_about = "
gateway-proxy forwards HTTP requests to a pool of backends and provides:
  - Round robin, weighted round robin, consistent hash and random balancing
  - Backend membership from a static list, a registry watch, or health checks
  - Self-registration as an ephemeral member of a registry service group

Example usage:
  gateway-proxy run --config config.yaml
  gateway-proxy run --strategy consistent_hash --port 2002
  gateway-proxy members
")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Set logging level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Run {
        /// Override listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Override balancing strategy (e.g., "weight_round_robin")
        #[arg(long)]
        strategy: Option<BalanceKind>,
    },

    /// Validate configuration file
    CheckConfig,

    /// List the available balancing strategies
    ListStrategies,

    /// Register an address in the service group and hold it until Ctrl-C
    Register {
        /// Address to register (host:port)
        #[arg(short, long)]
        address: String,
    },

    /// Print the current members of the service group
    Members,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level_filter = if let Some(level) = cli.log_level {
        level.to_string()
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
            .to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&level_filter))
        .init();

    match cli.command {
        Commands::Run { port, strategy } => {
            run_proxy(cli.config, port, strategy).await?;
        }
        Commands::CheckConfig => {
            check_config(cli.config)?;
        }
        Commands::ListStrategies => {
            list_strategies();
        }
        Commands::Register { address } => {
            register(cli.config, address).await?;
        }
        Commands::Members => {
            members(cli.config).await?;
        }
    }

    Ok(())
}

/// Run the proxy server
async fn run_proxy(
    config_path: PathBuf,
    port_override: Option<u16>,
    strategy_override: Option<BalanceKind>,
) -> Result<(), Box<dyn std::error::Error>> {
    // CLI overrides are applied before validation
    let config = load_config_or_exit(&config_path, |config| {
        if let Some(port) = port_override {
            config.server.port = port;
        }
        if let Some(strategy) = strategy_override {
            config.balancer.strategy = strategy;
        }
    });

    tracing::info!("Loaded configuration from {:?}", config_path);

    let registry = if config.uses_registry() {
        Some(start_registry(&config).await?)
    } else {
        None
    };

    let balancer = build_balancer(config.balancer.strategy, BalancerOptions::from(&config.balancer));
    let source = build_source(&config, registry)?;
    bind(&balancer, source.clone());

    tokio::spawn(async move {
        if let Err(e) = source.watch_conf().await {
            tracing::error!(source = source.name(), error = %e, "Membership source stopped");
        }
    });

    run_server(config, balancer).await
}

/// Connect to the registry and register this gateway if configured.
///
/// A registry that is down at startup is not fatal: the membership watch keeps
/// retrying in the background.
async fn start_registry(config: &AppConfig) -> Result<RegistryClient, Box<dyn std::error::Error>> {
    let client = build_client(&config.registry)?;
    if let Err(e) = client.get_connect().await {
        tracing::warn!(hosts = ?client.hosts(), error = %e, "Registry unavailable at startup");
        return Ok(client);
    }

    if let Some(address) = &config.registry.register_self {
        let group = config.registry.group_path();
        match client.register_server_path(&group, address).await {
            Ok(()) => tracing::info!(group = %group, address = %address, "Registered in service group"),
            Err(e) => tracing::warn!(group = %group, address = %address, error = %e, "Self-registration failed"),
        }
    }

    Ok(client)
}

/// List all balancing strategies
fn list_strategies() {
    println!("Available load balancing strategies:\n");

    for kind in BalanceKind::ALL {
        let entry_format = if kind.requires_weight() {
            "address,weight"
        } else {
            "address"
        };
        println!("  {:20} [{}] - {}", kind.as_str(), entry_format, kind.description());
    }

    println!("\nSelect one in config.yaml:");
    println!("\nbalancer:");
    println!("  strategy: round_robin");
}

/// Validate configuration file
fn check_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match AppConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid\n");
            println!("Server:");
            println!("  Listen: {}:{}", config.server.host, config.server.port);
            println!("\nProxy:");
            println!("  Timeout: {}s", config.proxy.timeout_seconds);
            if let Some(ref prefix) = config.proxy.strip_prefix {
                println!("  Strip prefix: {}", prefix);
            }
            if let Some(ref fallback) = config.proxy.fallback_backend {
                println!("  Fallback backend: {}", fallback);
            }
            if let Some(ref header) = config.proxy.hash_header {
                println!("  Hash header: {}", header);
            }
            println!("\nBalancer:");
            println!("  Strategy: {}", config.balancer.strategy);
            println!("  Replicas: {}", config.balancer.replicas);
            println!("  Degrade on error: {}", config.balancer.degrade_on_error);
            println!("\nMembership:");
            println!("  Source: {:?}", config.membership.source);
            for server in &config.membership.servers {
                println!("  - {}", server);
            }
            if config.uses_registry() {
                println!("\nRegistry:");
                println!("  Backend: {:?}", config.registry.backend);
                println!("  Hosts: {}", config.registry.hosts.join(","));
                println!("  Group: {}", config.registry.group_path());
                if let Some(ref address) = config.registry.register_self {
                    println!("  Register self: {}", address);
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Open a registry session for the one-shot commands, or exit
async fn connect_or_exit(config: &AppConfig) -> RegistryClient {
    if config.registry.backend == RegistryBackend::Memory {
        eprintln!("Note: the memory registry backend only lives inside this process");
    }

    let client = match build_client(&config.registry) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("✗ Failed to create registry client: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = client.get_connect().await {
        eprintln!("✗ Failed to connect to registry {}: {}", config.registry.hosts.join(","), e);
        std::process::exit(1);
    }
    client
}

/// Register an ephemeral member and keep the session open
async fn register(config_path: PathBuf, address: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config_or_exit(&config_path, |_| {});
    let client = connect_or_exit(&config).await;
    let group = config.registry.group_path();

    client.register_server_path(&group, &address).await?;
    println!("✓ Registered {} under {}", address, group);
    println!("  Holding the session, press Ctrl-C to deregister");

    tokio::signal::ctrl_c().await?;
    client.close().await;
    println!("Session closed, {} removed", address);
    Ok(())
}

/// Print the service group members once
async fn members(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config_or_exit(&config_path, |_| {});
    let client = connect_or_exit(&config).await;
    let group = config.registry.group_path();

    let result = client.get_server_list_by_path(&group).await;
    client.close().await;

    let members = result?;
    println!("Members of {} ({}):", group, members.len());
    for member in members {
        println!("  - {}", member);
    }
    Ok(())
}

/// Load configuration, apply overrides, then validate, or exit with error
fn load_config_or_exit(config_path: &PathBuf, overrides: impl FnOnce(&mut AppConfig)) -> AppConfig {
    let mut config = match read_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            eprintln!("\nMake sure you have a config.yaml file.");
            eprintln!("You can copy config.yaml.default and modify it:");
            eprintln!("  cp config.yaml.default config.yaml");
            std::process::exit(1);
        }
    };

    overrides(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("✗ Configuration error: {}", e);
        std::process::exit(1);
    }
    config
}

//! ipmartnet reverse tunnel
//!
//! Runs one side of the tunnel:
//! - `listener` ("outside"): accepts the dialer and forwards its streams
//! - `dialer` ("iran"): dials out and exposes local listeners through the tunnel

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use ipmartnet::{
    config::{Config, DialerConfig, ExposeConfig, ForwardingConfig, ListenerConfig},
    crypto::SharedKey,
    reverse::{TunnelClient, TunnelServer},
    transport::TransportKind,
};
use tracing::info;

/// Where the listener forwards streams when nothing else is configured
const DEFAULT_DESTINATION: &str = "127.0.0.1:22";

/// Side of the tunnel to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    /// Public host that accepts the tunnel
    #[value(alias = "outside")]
    Listener,
    /// Restricted host that dials out
    #[value(alias = "iran")]
    Dialer,
}

/// ipmartnet - reverse tunnel over one outbound encrypted connection
#[derive(Parser, Debug)]
#[command(name = "ipmartnet")]
#[command(about = "Reverse tunnel multiplexing local services over one outbound encrypted connection")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Role to run (listener/outside or dialer/iran)
    #[arg(short, long, value_enum)]
    role: Option<RoleArg>,

    /// Transport to use (overrides config)
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Listen address for the listener role (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Listener address for the dialer role (overrides config)
    #[arg(long)]
    connect: Option<String>,

    /// Pre-shared key, base64 or passphrase (overrides config)
    #[arg(short, long)]
    key: Option<String>,

    /// Default destination for unnamed streams
    #[arg(short, long)]
    forward: Option<String>,

    /// Named destination, may repeat
    #[arg(long = "service", value_name = "NAME=ADDR")]
    services: Vec<String>,

    /// Local listener exposed through the tunnel, may repeat
    #[arg(long, value_name = "BIND[=SERVICE]")]
    expose: Vec<ExposeConfig>,

    /// Reconnect delay in seconds for the dialer role
    #[arg(long, value_name = "SECS")]
    retry: Option<u64>,

    /// Generate a new pre-shared key and exit
    #[arg(long)]
    generate_key: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Generate key if requested
    if args.generate_key {
        return generate_key();
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    if config.logging.format.eq_ignore_ascii_case("compact") {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(&level)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(&level).init();
    }

    let role = match args.role {
        Some(role) => role,
        None => match (&config.listener, &config.dialer) {
            (Some(_), None) => RoleArg::Listener,
            (None, Some(_)) => RoleArg::Dialer,
            _ => return Err(anyhow!("Specify --role listener|dialer")),
        },
    };

    info!("ipmartnet v{}", ipmartnet::VERSION);

    match role {
        RoleArg::Listener => {
            let listener = listener_config(config.listener.take().unwrap_or_default(), &args)?;
            let server = TunnelServer::bind(&listener)
                .await
                .context("Failed to start listener")?;

            tokio::select! {
                result = server.run() => result.context("Listener stopped")?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
            }
        }
        RoleArg::Dialer => {
            let dialer = dialer_config(config.dialer.take().unwrap_or_default(), &args)?;
            let client = TunnelClient::new(&dialer)
                .await
                .context("Failed to start dialer")?;

            tokio::select! {
                result = client.run() => result.context("Dialer stopped")?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
            }
        }
    }

    Ok(())
}

/// Apply command line overrides to the listener section
fn listener_config(mut config: ListenerConfig, args: &Args) -> Result<ListenerConfig> {
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(key) = &args.key {
        config.key = key.clone();
    }
    apply_forwarding(&mut config.forwarding, args)?;

    if config.forwarding.destination.is_none() && config.forwarding.services.is_empty() {
        config.forwarding.destination = Some(DEFAULT_DESTINATION.to_string());
    }
    Ok(config)
}

/// Apply command line overrides to the dialer section
fn dialer_config(mut config: DialerConfig, args: &Args) -> Result<DialerConfig> {
    if let Some(connect) = &args.connect {
        config.connect = connect.clone();
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(key) = &args.key {
        config.key = key.clone();
    }
    if let Some(retry) = args.retry {
        config.retry_delay_secs = Some(retry);
    }
    apply_forwarding(&mut config.forwarding, args)?;
    Ok(config)
}

fn apply_forwarding(forwarding: &mut ForwardingConfig, args: &Args) -> Result<()> {
    if let Some(forward) = &args.forward {
        forwarding.destination = Some(forward.clone());
    }
    for entry in &args.services {
        let (name, addr) = entry
            .split_once('=')
            .filter(|(name, addr)| !name.is_empty() && !addr.is_empty())
            .ok_or_else(|| anyhow!("Invalid --service {:?}, expected NAME=ADDR", entry))?;
        forwarding.services.insert(name.to_string(), addr.to_string());
    }
    forwarding.expose.extend(args.expose.iter().cloned());
    Ok(())
}

/// Generate and print a new pre-shared key
fn generate_key() -> Result<()> {
    let key = SharedKey::generate()?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                ipmartnet Pre-Shared Key                      ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║ {}  ║", key.to_base64());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Add to both sides' config.toml:");
    println!("  key = \"{}\"", key.to_base64());

    Ok(())
}

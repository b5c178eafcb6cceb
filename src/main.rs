use std::{net::SocketAddr, path::PathBuf, process::exit, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use labhal::{
    ConnectConfig, Connection, InterfaceType, SessionRegistry,
    config::RelaySettings,
    error::Result,
    relay::Relay,
    scan::{LocalScanner, Scanner, format_listing},
};
use log::{error, info};
use strum::IntoEnumIterator;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "labhal", version, about = "Lab instrument transport and relay")]
struct Args {
    /// Default log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve locally attached instruments to remote callers
    Relay {
        /// TOML settings file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Listen address, overrides the settings
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
    /// List attached instruments
    Scan {
        /// Seconds to wait for VXI-11 replies
        #[arg(long, default_value_t = 1.0)]
        timeout: f64,
    },
    /// Send one command and print the response
    Query {
        /// VISA-style resource, or HOST:PORT for a raw socket
        target: String,
        command: String,
        /// serial, socket, usbtmc or vxi11, as seen from the relay with --relay
        #[arg(short, long)]
        interface: Option<String>,
        #[arg(long, default_value_t = 9600)]
        baud: u32,
        /// Go through the relay at this address instead of opening locally
        #[arg(long)]
        relay: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let res = match args.command {
        Command::Relay { config, bind } => run_relay(config, bind).await,
        Command::Scan { timeout } => run_scan(timeout).await,
        Command::Query {
            target,
            command,
            interface,
            baud,
            relay,
        } => run_query(&target, &command, interface, baud, relay).await,
    };

    if let Err(e) = res {
        error!("{e}");
        exit(1);
    }
}

async fn run_relay(config: Option<PathBuf>, bind: Option<SocketAddr>) -> Result<()> {
    let mut settings = RelaySettings::load(config.as_deref())?;
    if let Some(bind) = bind {
        settings.bind = bind;
    }

    let relay = Arc::new(Relay::new(Arc::new(SessionRegistry::new())));
    relay.preload(&settings.sessions).await;
    info!(
        "labhal {} relay with {} preloaded sessions",
        labhal::version(),
        relay.registry().len().await
    );

    let listener = TcpListener::bind(settings.bind).await?;
    relay
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Could not wait for Ctrl-C: {e}");
            }
        })
        .await
}

async fn run_scan(timeout: f64) -> Result<()> {
    let scanner = LocalScanner {
        vxi11_timeout: Duration::from_secs_f64(timeout.max(0.0)),
    };
    let found = scanner.scan().await?;
    println!("{}", format_listing(&found));
    Ok(())
}

fn target_config(target: &str, interface: Option<String>, baud: u32) -> Result<ConnectConfig> {
    let mut config = match target.rsplit_once(':') {
        Some((host, port)) if !target.contains("::") && !target.starts_with("/dev/") => {
            let Ok(port) = port.parse() else {
                println!("Invalid port in '{target}'");
                exit(1);
            };
            ConnectConfig::socket(host, port)
        }
        _ => ConnectConfig::from_resource(target),
    };
    config.serial.baud_rate = baud;

    if let Some(interface) = interface {
        let Ok(itype) = interface.parse::<InterfaceType>() else {
            let supported: Vec<_> = InterfaceType::iter().map(|i| i.to_string()).collect();
            println!("Interface '{interface}' not supported, use one of: {}", supported.join(", "));
            exit(1);
        };
        config.interface_type = Some(itype);
    }

    Ok(config)
}

async fn run_query(
    target: &str,
    command: &str,
    interface: Option<String>,
    baud: u32,
    relay: Option<String>,
) -> Result<()> {
    let mut config = target_config(target, interface, baud)?;
    if let Some(addr) = relay {
        config = config.via_relay(addr, Some("labhal-query".into()));
    }

    let mut conn = Connection::from_config(&config)?;
    conn.open().await?;
    let res = conn.query(command.as_bytes()).await;
    conn.close().await?;
    let response = res?;

    println!("{}", String::from_utf8_lossy(&response));
    Ok(())
}

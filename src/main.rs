use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use rsocks5::{
    config::{Config, LogLevel},
    method_handlers::TunnelConnect,
    tunnel::{agent, proxy},
    EventLoop,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Reverse SOCKS5 proxy
#[derive(Parser, Debug)]
#[command(name = "rsocks5")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Tunnel host (overrides config)
    #[arg(long, global = true)]
    tunnel_host: Option<String>,

    /// Tunnel port (overrides config)
    #[arg(long, global = true)]
    tunnel_port: Option<u16>,

    /// Public SOCKS5 port (overrides config)
    #[arg(long, global = true)]
    proxy_port: Option<u16>,

    /// Log level (overrides config, RUST_LOG overrides both)
    #[arg(short = 'v', long, global = true, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Mode {
    /// Wait for the agent on the tunnel port, then serve SOCKS5 clients
    Proxy,
    /// Dial the proxy's tunnel port and open connections on its behalf
    Backdoor,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("rsocks5: {err}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args.mode, &config) {
        Ok(()) => {
            info!("stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, source = ?err.source(), "fatal");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<Config, rsocks5::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = &args.tunnel_host {
        config.tunnel_host = host.clone();
    }
    if let Some(port) = args.tunnel_port {
        config.tunnel_port = port;
    }
    if let Some(port) = args.proxy_port {
        config.proxy_port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    Ok(config)
}

fn run(mode: Mode, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let tunnel_addr = config.tunnel_addr()?;
    let event_loop = EventLoop::new()?;

    match mode {
        Mode::Proxy => {
            info!(%tunnel_addr, proxy_addr = %config.proxy_addr(), "proxy mode");
            proxy::serve(&event_loop, tunnel_addr, config.proxy_addr())?;
        }
        Mode::Backdoor => {
            info!(%tunnel_addr, "backdoor mode");
            agent::connect(&event_loop, tunnel_addr, config.proxy_port, TunnelConnect)?;
        }
    }

    event_loop.run()?;
    Ok(())
}

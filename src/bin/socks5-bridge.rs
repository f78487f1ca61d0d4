use anyhow::{Result, bail};
use clap::Parser;
use socks5_bridge::{BridgeConfig, BridgeServer, ProxyCredentials, ProxyEndpoint};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A local SOCKS5 bridge to an authenticating upstream proxy", long_about = None)]
struct Args {
    /// Local port to accept anonymous SOCKS5 clients on
    #[arg(long, default_value_t = 1080)]
    port: u16,

    /// Local address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Upstream SOCKS5 proxy host
    #[arg(long)]
    proxy_host: String,

    /// Upstream SOCKS5 proxy port
    #[arg(long, default_value_t = 1080)]
    proxy_port: u16,

    /// Username for the upstream proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for the upstream proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Maximum number of concurrent sessions
    #[arg(long, default_value_t = 100)]
    max_sessions: usize,

    /// Seconds a client may stay silent during the handshake
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    idle_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Check for auth and grab it if present
    let credentials = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Upstream authentication enabled");
            Some(ProxyCredentials::new(u, p))
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    let endpoint = ProxyEndpoint::new(args.proxy_host, args.proxy_port).with_auth(credentials);
    let config = BridgeConfig::new(args.port, endpoint)
        .with_bind_host(args.bind)
        .with_max_sessions(args.max_sessions)
        .with_idle_timeout(Duration::from_secs(args.idle_timeout));

    let server = BridgeServer::authenticating(config);
    server.start().await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
        }
        _ = server.closed() => {}
    }

    server.stop().await?;
    Ok(())
}

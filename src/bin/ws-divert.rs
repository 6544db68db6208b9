use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ws_divert::{Config, Interceptor};

/// Transparent interception proxy for WebSocket-bearing HTTP(S) services.
///
/// Hijacks DNS resolution for the hostnames in the hosts file, terminates
/// TLS with the certificates in the certs directory, and reverse-proxies
/// HTTP and WebSocket traffic to the real servers.
#[derive(Parser, Debug)]
#[command(name = "ws-divert")]
#[command(version, about)]
struct Args {
    /// Plain HTTP listener address.
    #[arg(long, default_value = "0.0.0.0:80")]
    http: SocketAddr,

    /// TLS listener address.
    #[arg(long, default_value = "0.0.0.0:443")]
    https: SocketAddr,

    /// DNS proxy listener address.
    #[arg(long, default_value = "0.0.0.0:53")]
    dns_listen: SocketAddr,

    /// Upstream resolver for queries that are not intercepted.
    #[arg(long)]
    dns_upstream: SocketAddr,

    /// IPv4 address hijacked queries resolve to. Defaults to the local
    /// address used to reach the upstream resolver.
    #[arg(long)]
    hijack_target: Option<Ipv4Addr>,

    /// Hosts file listing intercepted hostnames, one per line, literal
    /// or wildcard (`*.example.com`).
    #[arg(long, default_value = "hosts")]
    hosts: PathBuf,

    /// Directory of `<name>.fullchain` / `<name>.privkey` PEM pairs.
    #[arg(long, default_value = "certs")]
    certs: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = Config {
        http_addr: args.http,
        https_addr: args.https,
        dns_listen: args.dns_listen,
        dns_upstream: args.dns_upstream,
        hijack_target: args.hijack_target,
        hosts_path: args.hosts,
        certs_dir: args.certs,
    };
    Interceptor::new(config).run().await
}

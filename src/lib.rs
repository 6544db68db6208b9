//! Transparent interception proxy for WebSocket-bearing HTTP(S) services.
//!
//! Clients are steered here by DNS: a UDP responder answers queries for a
//! configured set of hostnames with this machine's address and forwards
//! everything else to a real resolver. Diverted connections land on a
//! TLS-terminating reverse proxy that replays plain requests against the
//! genuine upstream and runs a duplex frame relay for WebSocket sessions,
//! so neither side notices the interception.
//!
//! # Architecture
//!
//! - [`hosts::HostSet`]: which hostnames to intercept, as exact names or
//!   `*.` wildcard suffixes.
//! - [`dns::DnsProxy`]: the hijacking DNS responder, correlating
//!   forwarded queries and upstream answers through a timeout-evicted
//!   [`dns::QueryLedger`].
//! - [`proxy::ProxyServer`]: paired HTTP and HTTPS listeners; requests
//!   pass through with hop-by-hop headers stripped, WebSocket upgrades
//!   become bidirectional relays to the real endpoint.

pub mod dns;
pub mod hosts;
pub mod proxy;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use dns::DnsProxy;
use hosts::HostSet;
use proxy::{IdentitySet, ProxyServer};

/// Startup parameters for the interception stack.
#[derive(Debug, Clone)]
pub struct Config {
    /// Plain HTTP listener address.
    pub http_addr: SocketAddr,
    /// TLS listener address.
    pub https_addr: SocketAddr,
    /// DNS proxy listener address.
    pub dns_listen: SocketAddr,
    /// Real resolver for non-intercepted queries.
    pub dns_upstream: SocketAddr,
    /// Address hijacked queries resolve to. Autodetected from the route
    /// toward the upstream resolver when unset.
    pub hijack_target: Option<Ipv4Addr>,
    /// Hosts file naming the intercepted hostnames.
    pub hosts_path: PathBuf,
    /// Directory of `<name>.fullchain` / `<name>.privkey` pairs.
    pub certs_dir: PathBuf,
}

/// The assembled interception stack: DNS proxy plus reverse proxy.
pub struct Interceptor {
    config: Config,
}

impl Interceptor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Loads configuration from disk, binds every listener, and serves
    /// until one of the components fails.
    pub async fn run(self) -> Result<()> {
        let hosts = Arc::new(HostSet::load(&self.config.hosts_path).with_context(|| {
            format!("failed to load hosts file {}", self.config.hosts_path.display())
        })?);
        info!("loaded {} interception rules", hosts.len());

        let identities = Arc::new(IdentitySet::load_dir(&self.config.certs_dir).with_context(
            || {
                format!(
                    "failed to load certificates from {}",
                    self.config.certs_dir.display()
                )
            },
        )?);

        let hijack_target = match self.config.hijack_target {
            Some(target) => target,
            None => outbound_ipv4(self.config.dns_upstream)
                .context("failed to autodetect the hijack target address")?,
        };
        info!("hijacked queries resolve to {}", hijack_target);

        let dns = DnsProxy::bind(
            self.config.dns_listen,
            self.config.dns_upstream,
            hijack_target,
            Arc::clone(&hosts),
        )
        .await
        .context("failed to bind DNS proxy")?;
        info!(
            "DNS proxy listening on {}, forwarding to {}",
            dns.local_addr().context("DNS proxy local address")?,
            self.config.dns_upstream
        );

        let server = ProxyServer::bind(
            self.config.http_addr,
            self.config.https_addr,
            identities,
        )
        .await
        .context("failed to bind proxy listeners")?;
        info!(
            "reverse proxy listening on {} (http) and {} (https)",
            server.http_addr().context("HTTP listener address")?,
            server.https_addr().context("HTTPS listener address")?
        );

        tokio::try_join!(
            async { dns.run().await.context("DNS proxy terminated") },
            async { server.run().await.context("reverse proxy terminated") },
        )?;
        Ok(())
    }
}

/// Local IPv4 address this host uses to reach the upstream resolver.
/// Hijacked clients are pointed at this address, so it must be the one
/// they can route back to.
fn outbound_ipv4(upstream: SocketAddr) -> Result<Ipv4Addr> {
    let socket =
        std::net::UdpSocket::bind("0.0.0.0:0").context("failed to bind detection socket")?;
    socket
        .connect(upstream)
        .context("failed to route toward upstream resolver")?;
    match socket.local_addr().context("detection socket address")? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(addr) => anyhow::bail!("expected an IPv4 outbound address, got {}", addr),
    }
}

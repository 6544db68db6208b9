//! UDP DNS proxy that hijacks intercepted names and forwards the rest.
//!
//! Two sockets: the client-facing listener and an ephemeral upstream-facing
//! socket. Queries for intercepted hostnames are answered locally with the
//! hijack target address; everything else is forwarded byte for byte and
//! the upstream answer relayed back to whichever client sent the matching
//! transaction id.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::dns::ledger::{DnsQuery, QueryLedger};
use crate::dns::wire;
use crate::hosts::HostSet;

const DNS_BUF_SIZE: usize = 4096;

pub struct DnsProxy {
    listen: UdpSocket,
    upstream_sock: UdpSocket,
    upstream_addr: SocketAddr,
    hijack_target: Ipv4Addr,
    hosts: Arc<HostSet>,
    ledger: Arc<QueryLedger>,
}

impl DnsProxy {
    /// Binds the client-facing listener on `listen_addr` and an ephemeral
    /// socket for talking to the upstream resolver.
    pub async fn bind(
        listen_addr: SocketAddr,
        upstream_addr: SocketAddr,
        hijack_target: Ipv4Addr,
        hosts: Arc<HostSet>,
    ) -> io::Result<Self> {
        let listen = UdpSocket::bind(listen_addr).await?;
        let upstream_sock = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            listen,
            upstream_sock,
            upstream_addr,
            hijack_target,
            hosts,
            ledger: Arc::new(QueryLedger::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listen.local_addr()
    }

    /// Runs the proxy until a socket read fails. The timeout eviction
    /// task lives only as long as the receive loops.
    pub async fn run(&self) -> io::Result<()> {
        let eviction = tokio::spawn(Arc::clone(&self.ledger).run_eviction());
        let result = tokio::try_join!(self.run_client(), self.run_upstream()).map(|_| ());
        eviction.abort();
        result
    }

    /// Receives client queries and either answers them locally or
    /// forwards them upstream under their original transaction id.
    async fn run_client(&self) -> io::Result<()> {
        let mut buf = [0u8; DNS_BUF_SIZE];
        loop {
            let (len, client) = self.listen.recv_from(&mut buf).await?;
            let packet = &buf[..len];

            let Some(txid) = wire::transaction_id(packet) else {
                debug!("dropping runt datagram from {}", client);
                continue;
            };
            let host = wire::question_name(packet).unwrap_or_default();

            if self.hosts.is_intercepted(&host) {
                match wire::hijack_answer(packet, self.hijack_target) {
                    Some(answer) => {
                        info!("hijacking {} -> {}", host, self.hijack_target);
                        if let Err(e) = self.listen.send_to(&answer, client).await {
                            warn!("failed to send hijacked answer to {}: {}", client, e);
                        }
                    }
                    None => warn!("malformed query for intercepted host {}", host),
                }
            } else {
                debug!("forwarding query for {:?} (txid {})", host, txid);
                self.ledger.insert(DnsQuery {
                    txid,
                    client,
                    host,
                });
                self.upstream_sock.send_to(packet, self.upstream_addr).await?;
            }
        }
    }

    /// Receives upstream answers and relays each one, untouched, to the
    /// client whose forwarded query carried the same transaction id.
    async fn run_upstream(&self) -> io::Result<()> {
        let mut buf = [0u8; DNS_BUF_SIZE];
        loop {
            let (len, _) = self.upstream_sock.recv_from(&mut buf).await?;
            let packet = &buf[..len];

            let Some(txid) = wire::transaction_id(packet) else {
                debug!("dropping runt upstream datagram");
                continue;
            };
            match self.ledger.remove(txid) {
                Some(query) => {
                    debug!("relaying answer for {:?} to {}", query.host, query.client);
                    if let Err(e) = self.listen.send_to(packet, query.client).await {
                        warn!("failed to relay answer to {}: {}", query.client, e);
                    }
                }
                None => debug!("dropping unmatched upstream answer (txid {})", txid),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::testutil::build_query;
    use std::time::Duration;

    async fn spawn_proxy(
        upstream_addr: SocketAddr,
        hosts: &str,
    ) -> SocketAddr {
        let hosts = Arc::new(HostSet::parse(hosts));
        let proxy = DnsProxy::bind(
            "127.0.0.1:0".parse().unwrap(),
            upstream_addr,
            Ipv4Addr::new(10, 1, 150, 1),
            hosts,
        )
        .await
        .unwrap();
        let addr = proxy.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = proxy.run().await;
        });
        addr
    }

    /// A query for an intercepted name is answered locally with the
    /// hijack target, without touching the upstream socket.
    #[tokio::test]
    async fn hijacks_intercepted_query() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = spawn_proxy(upstream.local_addr().unwrap(), "*.example.com\n").await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(0xbeef, &["app", "example", "com"]);
        client.send_to(&query, proxy).await.unwrap();

        let mut buf = [0u8; DNS_BUF_SIZE];
        let (len, from) = client.recv_from(&mut buf).await.unwrap();
        let answer = &buf[..len];

        assert_eq!(from, proxy);
        assert_eq!(&answer[..2], &query[..2]);
        assert_eq!(answer[2], 0x81);
        assert_eq!(answer[3], 0x80);
        assert_eq!(answer[7], 1);
        assert_eq!(&answer[len - 4..], &[10, 1, 150, 1]);

        // The upstream resolver never saw the query.
        let unused = tokio::time::timeout(
            Duration::from_millis(100),
            upstream.recv_from(&mut buf),
        )
        .await;
        assert!(unused.is_err());
    }

    /// Non-intercepted queries travel upstream byte for byte, and the
    /// answer comes back verbatim to the original client.
    #[tokio::test]
    async fn forwards_and_relays_other_queries() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = spawn_proxy(upstream.local_addr().unwrap(), "*.example.com\n").await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(0x0042, &["other", "test"]);
        client.send_to(&query, proxy).await.unwrap();

        let mut buf = [0u8; DNS_BUF_SIZE];
        let (len, relay_addr) = upstream.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &query[..]);

        // Answer with the same transaction id, arbitrary payload.
        let mut answer = query.clone();
        answer[2] = 0x81;
        answer[3] = 0x80;
        upstream.send_to(&answer, relay_addr).await.unwrap();

        let (len, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, proxy);
        assert_eq!(&buf[..len], &answer[..]);
    }

    /// An upstream datagram with no ledger entry is dropped: the client
    /// never hears about it.
    #[tokio::test]
    async fn drops_unmatched_upstream_answer() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = spawn_proxy(upstream.local_addr().unwrap(), "*.example.com\n").await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(0x0042, &["other", "test"]);
        client.send_to(&query, proxy).await.unwrap();

        let mut buf = [0u8; DNS_BUF_SIZE];
        let (_, relay_addr) = upstream.recv_from(&mut buf).await.unwrap();

        // Wrong transaction id.
        let stray = build_query(0x0043, &["other", "test"]);
        upstream.send_to(&stray, relay_addr).await.unwrap();

        let got = tokio::time::timeout(
            Duration::from_millis(100),
            client.recv_from(&mut buf),
        )
        .await;
        assert!(got.is_err());
    }

    /// Malformed queries are unclassifiable and forwarded untouched.
    #[tokio::test]
    async fn forwards_multi_question_query_untouched() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = spawn_proxy(upstream.local_addr().unwrap(), "app.example.com\n").await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut query = build_query(0x7777, &["app", "example", "com"]);
        query[5] = 2;
        client.send_to(&query, proxy).await.unwrap();

        let mut buf = [0u8; DNS_BUF_SIZE];
        let (len, _) = upstream.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &query[..]);
    }
}

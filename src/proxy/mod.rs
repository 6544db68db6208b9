//! TLS-terminating reverse proxy for intercepted hosts.
//!
//! Plain requests are passed through to the real upstream with hop-by-hop
//! headers stripped; WebSocket upgrades get a bidirectional frame relay.

mod relay;
mod server;
mod tls;

pub use relay::RelayError;
pub use server::{ProxyServer, UpstreamError};
pub use tls::{IdentitySet, TlsError};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};

/// Response body type shared by the passthrough and upgrade paths.
pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Erased duplex byte stream, TLS-wrapped or plain.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub(crate) fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .unwrap()
}

/// Splits a Host header value into hostname and port, supplying the
/// scheme default when no port is present. Bracketed IPv6 literals keep
/// their brackets out of the hostname.
pub(crate) fn host_port(host: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((addr, port)) = rest.split_once(']') {
            let port = port
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (addr.to_string(), port);
        }
    }
    match host.rsplit_once(':') {
        Some((name, port)) => {
            // An unparsable port falls back to the default; the junk
            // after the colon never becomes part of the hostname.
            let port = port.parse().unwrap_or(default_port);
            (name.to_string(), port)
        }
        None => (host.to_string(), default_port),
    }
}

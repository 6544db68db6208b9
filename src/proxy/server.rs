//! HTTP(S) reverse proxy server for intercepted hosts.
//!
//! Every request names its real destination in the Host header, so the
//! proxy simply dials that host, replays the request, and streams the
//! response back with hop-by-hop headers stripped. WebSocket upgrades are
//! handed to the duplex relay instead.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_LENGTH, HOST, UPGRADE};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder as ClientBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::tls::IdentitySet;
use super::{host_port, relay, text_response, tls, Io, ProxyBody};

/// Hop-by-hop response headers never copied to the client. Content-Length
/// is stripped here and re-derived from what the upstream declared.
const HOP_HEADERS: [&str; 10] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] io::Error),
    #[error(transparent)]
    Tls(#[from] tls::TlsError),
    #[error("upstream handshake failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("upstream request failed: {0}")]
    RoundTrip(#[source] hyper::Error),
}

/// Paired plain and TLS listeners sharing one request handler.
pub struct ProxyServer {
    http: TcpListener,
    https: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
}

impl ProxyServer {
    pub async fn bind(
        http_addr: SocketAddr,
        https_addr: SocketAddr,
        identities: Arc<IdentitySet>,
    ) -> io::Result<Self> {
        let http = TcpListener::bind(http_addr).await?;
        let https = TcpListener::bind(https_addr).await?;
        let acceptor = tokio_rustls::TlsAcceptor::from(tls::server_config(identities));
        Ok(Self {
            http,
            https,
            acceptor,
        })
    }

    pub fn http_addr(&self) -> io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn https_addr(&self) -> io::Result<SocketAddr> {
        self.https.local_addr()
    }

    /// Accepts connections on both listeners until one of them fails.
    pub async fn run(self) -> io::Result<()> {
        tokio::try_join!(
            Self::run_plain(self.http),
            Self::run_tls(self.https, self.acceptor)
        )?;
        Ok(())
    }

    async fn run_plain(listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tokio::spawn(async move {
                if let Err(e) = serve_stream(stream, peer, false).await {
                    debug!("connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }

    async fn run_tls(listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("TLS handshake with {} failed: {}", peer, e);
                        return;
                    }
                };
                if let Err(e) = serve_stream(tls_stream, peer, true).await {
                    debug!("connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }
}

/// Serves one accepted connection, keeping upgrade support enabled so
/// WebSocket sessions can take over the stream.
pub(crate) async fn serve_stream<S>(
    stream: S,
    peer: SocketAddr,
    is_tls: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handle_request(req, peer, is_tls));
    ServerBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
}

async fn handle_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let Some(host) = request_host(&req) else {
        warn!("request from {} without a Host header", peer);
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "missing Host header",
        ));
    };
    debug!(
        "{} {} {} from {} (host {})",
        if is_tls { "https" } else { "http" },
        req.method(),
        req.uri(),
        peer,
        host
    );

    if is_websocket_upgrade(&req) {
        return match relay::serve_websocket(req, &host, is_tls) {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("websocket upgrade for {} failed: {}", host, e);
                Ok(text_response(StatusCode::BAD_REQUEST, e.to_string()))
            }
        };
    }

    match passthrough(req, &host, is_tls).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!("round trip to {} failed: {}", host, e);
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
            ))
        }
    }
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(value) = req.headers().get(HOST) {
        if let Ok(host) = value.to_str() {
            return Some(host.to_string());
        }
    }
    req.uri().authority().map(|authority| authority.to_string())
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Replays a request against the real upstream and returns its response
/// with the status preserved, hop-by-hop headers stripped, and the body
/// streamed through without buffering.
async fn passthrough(
    req: Request<Incoming>,
    host: &str,
    is_tls: bool,
) -> Result<Response<ProxyBody>, UpstreamError> {
    let (hostname, port) = host_port(host, if is_tls { 443 } else { 80 });
    let tcp = TcpStream::connect((hostname.as_str(), port))
        .await
        .map_err(UpstreamError::Connect)?;
    let io: Box<dyn Io> = if is_tls {
        Box::new(tls::connect_upstream(tcp, &hostname).await?)
    } else {
        Box::new(tcp)
    };

    let (mut sender, conn) = ClientBuilder::new()
        .handshake(TokioIo::new(io))
        .await
        .map_err(UpstreamError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("upstream connection ended with error: {}", e);
        }
    });

    let upstream = sender
        .send_request(req)
        .await
        .map_err(UpstreamError::RoundTrip)?;

    // Length the upstream declared, captured before the header is
    // stripped with the rest of the hop-by-hop set.
    let content_length = upstream
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|len| *len > 0);

    let (mut parts, body) = upstream.into_parts();
    for name in HOP_HEADERS {
        parts.headers.remove(name);
    }
    // Re-declare the length when it is known; otherwise the response goes
    // out chunked. Never both.
    if let Some(len) = content_length {
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }

    Ok(Response::from_parts(parts, body.boxed()))
}

//! Duplex WebSocket relay between an upgraded inbound connection and the
//! real upstream endpoint.
//!
//! Each session runs two independent pump tasks, one per direction. The
//! first direction to fail tears down the whole session so neither side
//! is left talking to a dead peer.

use std::io;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::{
    HeaderValue, CONNECTION, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use super::{empty_body, host_port, tls, Io, ProxyBody};

/// Budget for mirroring a ping or pong to the opposite side.
const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("invalid upstream websocket url: {0}")]
    InvalidUrl(#[source] WsError),
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] io::Error),
    #[error(transparent)]
    Tls(#[from] tls::TlsError),
    #[error("websocket handshake with upstream failed: {0}")]
    Handshake(#[source] WsError),
}

/// Accepts a WebSocket upgrade and wires the upgraded connection to the
/// same path on the real upstream.
///
/// The 101 response is returned immediately; the upstream dial and the
/// relay itself run in a spawned task once the inbound upgrade completes.
/// The client's subprotocol offer is forwarded to the upstream in full;
/// the 101 answers with the first offered protocol.
pub fn serve_websocket(
    req: Request<Incoming>,
    host: &str,
    is_tls: bool,
) -> Result<Response<ProxyBody>, RelayError> {
    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .cloned()
        .ok_or(RelayError::MissingKey)?;
    let protocol = req.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let (ws_scheme, origin_scheme) = if is_tls {
        ("wss", "https")
    } else {
        ("ws", "http")
    };
    let url = format!("{}://{}{}", ws_scheme, host, target);
    let mut far_request = url.into_client_request().map_err(RelayError::InvalidUrl)?;
    if let Ok(origin) = HeaderValue::from_str(&format!("{}://{}", origin_scheme, host)) {
        far_request.headers_mut().insert(ORIGIN, origin);
    }
    // The upstream gets the full offer list and picks for itself.
    if let Some(protocol) = protocol.clone() {
        far_request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    let selected = protocol.as_ref().and_then(first_protocol);

    let accept = derive_accept_key(key.as_bytes());
    // Sessions are logged under the client's handshake key.
    let session = key.to_str().unwrap_or("opaque").to_string();
    let session_host = host.to_string();
    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("inbound websocket upgrade failed: {}", e);
                return;
            }
        };
        let near =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        let far = match dial_upstream(far_request, &session_host, is_tls).await {
            Ok(far) => far,
            Err(e) => {
                warn!(
                    "websocket dial to {} failed (key {}): {}",
                    session_host, session, e
                );
                return;
            }
        };
        debug!("websocket session {} to {} established", session, session_host);
        run_duplex(near, far).await;
        debug!("websocket session {} to {} finished", session, session_host);
    });

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = selected {
        response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    Ok(response.body(empty_body()).unwrap())
}

/// First token of a comma-separated subprotocol offer. A 101 response may
/// name at most one subprotocol, so a multi-protocol offer is answered
/// with the client's first choice.
fn first_protocol(offer: &HeaderValue) -> Option<HeaderValue> {
    let first = offer.to_str().ok()?.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    HeaderValue::from_str(first).ok()
}

/// Dials the real upstream and completes a client-side WebSocket
/// handshake, over TLS when the inbound side was TLS.
async fn dial_upstream(
    request: Request<()>,
    host: &str,
    is_tls: bool,
) -> Result<WebSocketStream<Box<dyn Io>>, RelayError> {
    let (hostname, port) = host_port(host, if is_tls { 443 } else { 80 });
    let tcp = TcpStream::connect((hostname.as_str(), port))
        .await
        .map_err(RelayError::Connect)?;
    let io: Box<dyn Io> = if is_tls {
        Box::new(tls::connect_upstream(tcp, &hostname).await?)
    } else {
        Box::new(tcp)
    };
    let (far, _response) = tokio_tungstenite::client_async(request, io)
        .await
        .map_err(RelayError::Handshake)?;
    Ok(far)
}

/// Runs both pump directions until the first one ends, then aborts the
/// survivor so both underlying connections drop together.
async fn run_duplex<N, F>(near: WebSocketStream<N>, far: WebSocketStream<F>)
where
    N: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (near_sink, near_stream) = near.split();
    let (far_sink, far_stream) = far.split();

    let mut inbound = tokio::spawn(pump(near_stream, far_sink, "client"));
    let mut outbound = tokio::spawn(pump(far_stream, near_sink, "upstream"));

    tokio::select! {
        _ = &mut inbound => outbound.abort(),
        _ = &mut outbound => inbound.abort(),
    }
}

/// Copies frames from one side to the other until the source ends or a
/// data write fails.
///
/// Ping and pong frames are mirrored under a short write deadline;
/// failure to mirror one because the destination already sent its close
/// is ignored, and a timeout is logged without ending the direction.
async fn pump<S, D>(mut source: S, mut dest: D, side: &'static str)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
    D: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    while let Some(next) = source.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                debug!("{} read failed: {}", side, e);
                break;
            }
        };
        match message {
            // The websocket layer also queues its own pong for every ping
            // read here, so the far side can see an unsolicited pong next
            // to the mirrored one. RFC 6455 permits unsolicited pongs.
            Message::Ping(_) | Message::Pong(_) => {
                match tokio::time::timeout(CONTROL_WRITE_TIMEOUT, dest.send(message)).await {
                    Ok(Ok(())) => {}
                    // The destination already sent its close; nowhere to
                    // deliver the control frame.
                    Ok(Err(WsError::ConnectionClosed)) | Ok(Err(WsError::AlreadyClosed)) => {}
                    Ok(Err(e)) => {
                        debug!("{} control write failed: {}", side, e);
                        break;
                    }
                    Err(_) => debug!("{} control write timed out", side),
                }
            }
            Message::Close(frame) => {
                let _ = dest.send(Message::Close(frame)).await;
                debug!("{} sent close, direction finished", side);
                break;
            }
            message => {
                if let Err(e) = dest.send(message).await {
                    debug!("{} write failed: {}", side, e);
                    break;
                }
            }
        }
    }
}

//! WebSocket bidirectional relay with message-level interception.
//!
//! Both legs are real WebSocket endpoints: the origin side is dialed over an
//! already-established stream, the client side is upgraded in place. Data
//! frames pass through the Request (client to origin) or Response (origin to
//! client) handler chain; control frames are forwarded untouched. The
//! underlying library reassembles fragmented messages, so handlers always see
//! whole payloads.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{
    Request as ClientRequest, Response as ClientResponse,
};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, client_async};

use crate::ctx::ProxyCtx;
use crate::errors::{ProxyError, Result};
use crate::handler::Phase;
use crate::http1::{HttpBodyMode, RequestHead, ResponseHead};
use crate::proxy::ProxyCore;

/// Handshake headers the dialer must own; everything else is forwarded.
const WS_HANDSHAKE_HEADERS: [&str; 7] = [
    "sec-websocket-extensions",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-accept",
    "upgrade",
    "connection",
];

/// The two endpoints of a bridged connection, as seen by handlers.
///
/// Sends are queued onto the per-direction writer task, so they are safe to
/// call from any handler (including Connected handlers running before the
/// relay loops start) and interleave cleanly with relayed frames.
pub struct WsSession {
    client_tx: UnboundedSender<Message>,
    origin_tx: UnboundedSender<Message>,
}

impl WsSession {
    pub fn send_text_to_origin(&self, text: impl Into<String>) -> Result<()> {
        self.origin_tx
            .send(Message::text(text.into()))
            .map_err(|_| ProxyError::WsSessionClosed)
    }

    pub fn send_binary_to_origin(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.origin_tx
            .send(Message::binary(data.into()))
            .map_err(|_| ProxyError::WsSessionClosed)
    }

    pub fn send_text_to_client(&self, text: impl Into<String>) -> Result<()> {
        self.client_tx
            .send(Message::text(text.into()))
            .map_err(|_| ProxyError::WsSessionClosed)
    }

    pub fn send_binary_to_client(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.client_tx
            .send(Message::binary(data.into()))
            .map_err(|_| ProxyError::WsSessionClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayDirection {
    ClientToOrigin,
    OriginToClient,
}

impl RelayDirection {
    fn phase(self) -> Phase {
        match self {
            Self::ClientToOrigin => Phase::Request,
            Self::OriginToClient => Phase::Response,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::ClientToOrigin => "client -> origin",
            Self::OriginToClient => "origin -> client",
        }
    }
}

pub(crate) async fn relay<C, O>(
    core: Arc<ProxyCore>,
    mut client_io: C,
    origin_io: O,
    head: RequestHead,
    secure: bool,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    O: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let host = match head.host() {
        Some(host) => host.to_string(),
        None => {
            return Err(ProxyError::WebSocketUpgrade(
                "upgrade request has no Host header".to_string(),
            ))
        }
    };
    let request = build_origin_request(&head, secure)?;
    let target = request.uri().to_string();

    let (origin_ws, origin_response) = match client_async(request, origin_io).await {
        Ok(pair) => pair,
        Err(WsError::Http(response)) => {
            core.logger.error(&format!(
                "origin rejected websocket upgrade for {target}: {}",
                response.status()
            ));
            write_handshake_rejection(&mut client_io, &response).await?;
            return Ok(());
        }
        Err(error) => {
            core.logger
                .error(&format!("websocket connect to {target} failed: {error}"));
            crate::http1::write_simple_response(
                &mut client_io,
                "502 Bad Gateway",
                "unable to reach websocket origin",
            )
            .await
            .map_err(|error| ProxyError::BodyWrite(error.to_string()))?;
            return Ok(());
        }
    };

    let negotiated_protocol = origin_response.headers().get("sec-websocket-protocol").cloned();
    let client_ws = match accept_hdr_async(client_io, move |_request: &Request, mut response: Response| {
        if let Some(protocol) = negotiated_protocol {
            response
                .headers_mut()
                .insert("sec-websocket-protocol", protocol);
        }
        Ok(response)
    })
    .await
    {
        Ok(ws) => ws,
        Err(error) => {
            return Err(ProxyError::WebSocketUpgrade(format!(
                "client upgrade for {host} failed: {error}"
            )))
        }
    };

    let (client_sink, client_stream) = client_ws.split();
    let (origin_sink, origin_stream) = origin_ws.split();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (origin_tx, origin_rx) = mpsc::unbounded_channel();
    let client_writer = tokio::spawn(drain_frames(client_rx, client_sink));
    let origin_writer = tokio::spawn(drain_frames(origin_rx, origin_sink));

    let session = Arc::new(WsSession {
        client_tx: client_tx.clone(),
        origin_tx: origin_tx.clone(),
    });
    let mut ctx = ProxyCtx::new(head.clone());
    ctx.response = Some(response_head_from_handshake(&origin_response));
    ctx.ws_session = Some(Arc::clone(&session));
    let ctx = Arc::new(Mutex::new(ctx));

    // Connected handlers run to completion before either direction reads.
    dispatch_locked(&core, Phase::Connected, &host, &[], &ctx);

    let mut client_task = tokio::spawn(relay_direction(
        Arc::clone(&core),
        RelayDirection::ClientToOrigin,
        client_stream,
        origin_tx,
        Arc::clone(&ctx),
        host.clone(),
    ));
    let mut origin_task = tokio::spawn(relay_direction(
        Arc::clone(&core),
        RelayDirection::OriginToClient,
        origin_stream,
        client_tx,
        Arc::clone(&ctx),
        host.clone(),
    ));

    tokio::select! {
        joined = &mut client_task => {
            log_relay_exit(&core, "client connection closed", joined);
            origin_task.abort();
        }
        joined = &mut origin_task => {
            log_relay_exit(&core, "origin connection closed", joined);
            client_task.abort();
        }
    }

    {
        let mut guard = ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.ws_session = None;
    }
    drop(session);

    // Writer tasks close their sinks once every sender is gone.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = client_writer.await;
        let _ = origin_writer.await;
    })
    .await;

    Ok(())
}

fn build_origin_request(head: &RequestHead, secure: bool) -> Result<ClientRequest> {
    let host = head
        .host()
        .ok_or_else(|| ProxyError::WebSocketUpgrade("upgrade request has no Host header".to_string()))?;
    let scheme = if secure { "wss" } else { "ws" };
    let url = format!("{scheme}://{host}{}", head.path_and_query());
    let mut request = url
        .into_client_request()
        .map_err(|error| ProxyError::WebSocketUpgrade(error.to_string()))?;

    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("host") || is_ws_handshake_header(name) {
            continue;
        }
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|error| ProxyError::WebSocketUpgrade(error.to_string()))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|error| ProxyError::WebSocketUpgrade(error.to_string()))?;
        request.headers_mut().append(header_name, header_value);
    }

    // Subprotocol negotiation must survive the double handshake.
    if let Some(protocols) = head.header("sec-websocket-protocol") {
        let header_value = HeaderValue::from_str(protocols)
            .map_err(|error| ProxyError::WebSocketUpgrade(error.to_string()))?;
        request
            .headers_mut()
            .insert("sec-websocket-protocol", header_value);
    }

    Ok(request)
}

fn is_ws_handshake_header(name: &str) -> bool {
    WS_HANDSHAKE_HEADERS
        .iter()
        .any(|header| name.eq_ignore_ascii_case(header))
}

async fn write_handshake_rejection<S: AsyncWrite + Unpin>(
    stream: &mut S,
    response: &ClientResponse,
) -> Result<()> {
    let body = response
        .body()
        .as_ref()
        .map(|bytes| bytes.as_slice())
        .unwrap_or(&[]);

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        let _ = write!(
            head,
            "{name}: {}\r\n",
            String::from_utf8_lossy(value.as_bytes())
        );
    }
    if !response.headers().contains_key("content-length") {
        let _ = write!(head, "Content-Length: {}\r\n", body.len());
    }
    head.push_str("\r\n");

    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))?;
    stream
        .write_all(body)
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))?;
    Ok(())
}

fn response_head_from_handshake(response: &ClientResponse) -> ResponseHead {
    ResponseHead {
        status: response.status().as_u16(),
        reason: response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string(),
        headers: response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body_mode: HttpBodyMode::None,
    }
}

async fn relay_direction<S>(
    core: Arc<ProxyCore>,
    direction: RelayDirection,
    mut source: S,
    sink: UnboundedSender<Message>,
    ctx: Arc<Mutex<ProxyCtx>>,
    host: String,
) where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send + 'static,
{
    while let Some(next) = source.next().await {
        let message = match next {
            Ok(message) => message,
            Err(error) => {
                core.logger
                    .debug(&format!("{} read ended: {error}", direction.label()));
                break;
            }
        };

        let forwarded = match message {
            Message::Text(text) => {
                if core.config.verbose {
                    core.logger.debug(&format!(
                        "{}: {}",
                        direction.label(),
                        hex_string(text.as_bytes())
                    ));
                }
                let mutated =
                    dispatch_locked(&core, direction.phase(), &host, text.as_bytes(), &ctx);
                match String::from_utf8(mutated) {
                    Ok(out) => Message::text(out),
                    Err(invalid) => {
                        core.logger.warn(
                            "handler produced non-UTF-8 bytes for a text frame; forwarding lossily",
                        );
                        Message::text(String::from_utf8_lossy(invalid.as_bytes()).into_owned())
                    }
                }
            }
            Message::Binary(payload) => {
                if core.config.verbose {
                    core.logger.debug(&format!(
                        "{}: {}",
                        direction.label(),
                        hex_string(payload.as_ref())
                    ));
                }
                let mutated =
                    dispatch_locked(&core, direction.phase(), &host, payload.as_ref(), &ctx);
                Message::binary(mutated)
            }
            Message::Close(frame) => {
                let _ = sink.send(Message::Close(frame));
                break;
            }
            control => control,
        };

        if sink.send(forwarded).is_err() {
            break;
        }
    }
}

async fn drain_frames<S>(mut rx: UnboundedReceiver<Message>, mut sink: S)
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

fn dispatch_locked(
    core: &ProxyCore,
    phase: Phase,
    host: &str,
    payload: &[u8],
    ctx: &Mutex<ProxyCtx>,
) -> Vec<u8> {
    let mut guard = ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    core.registry.dispatch(phase, host, payload, &mut guard)
}

fn log_relay_exit(
    core: &ProxyCore,
    message: &str,
    joined: std::result::Result<(), JoinError>,
) {
    match joined {
        Err(error) if error.is_panic() => {
            core.logger
                .error(&format!("websocket relay task panicked: {error}"));
        }
        _ => core.logger.info(message),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut rendered = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(rendered, "{byte:02x}");
    }
    rendered
}

//! One intercepted request per tunnel.
//!
//! Reads a single HTTP request off the terminated client TLS stream and
//! either hands the connection to the WebSocket relay or forwards the
//! exchange over the already-established origin TLS stream. Both streams are
//! closed when the exchange finishes; clients open a fresh CONNECT per
//! request.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::ctx::ProxyCtx;
use crate::errors::{ProxyError, Result};
use crate::handler::Phase;
use crate::http1::{
    encode_request_head, encode_response_head, forwarded_headers, is_websocket_upgrade,
    parse_request_head, parse_response_head, read_body, read_head, BodyReadError, BufferedConn,
    ConnectTarget, PrefixedIo,
};
use crate::proxy::ProxyCore;
use crate::websocket;

pub(crate) async fn run<C, O>(
    core: Arc<ProxyCore>,
    client_tls: C,
    origin_tls: O,
    target: ConnectTarget,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    O: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut client = BufferedConn::new(client_tls);
    let head_raw = match read_head(&mut client, core.config.max_head_bytes).await? {
        Some(raw) => raw,
        None => return Ok(()),
    };
    let head = parse_request_head(&head_raw)?;
    let host = head
        .host()
        .map(str::to_string)
        .unwrap_or_else(|| target.authority.clone());

    if is_websocket_upgrade(&head) {
        if core.config.verbose {
            core.logger
                .debug(&format!("handling websocket (wss) connection for {host}"));
        }
        let mut replay = head.raw.clone();
        replay.extend_from_slice(&client.read_buf);
        let client_io = PrefixedIo::new(replay, client.stream);
        return websocket::relay(core, client_io, origin_tls, head, true).await;
    }

    let body = match read_body(&mut client, head.body_mode, core.config.max_body_bytes).await {
        Ok(body) => body,
        Err(BodyReadError::TooLarge) => {
            return Err(ProxyError::BodyTooLarge {
                limit: core.config.max_body_bytes,
            })
        }
        Err(BodyReadError::Io(error)) => {
            return Err(ProxyError::BodyRead(format!(
                "request body from {host}: {error}"
            )))
        }
    };

    let mut ctx = ProxyCtx::new(head.clone());
    let body = core.registry.dispatch(Phase::Request, &host, &body, &mut ctx);

    let mut origin = BufferedConn::new(origin_tls);
    let outbound_head = encode_request_head(
        &head.method,
        &head.path_and_query(),
        &forwarded_headers(&head.headers, body.len()),
    );
    write_all(&mut origin.stream, &outbound_head).await?;
    write_all(&mut origin.stream, &body).await?;
    origin
        .stream
        .flush()
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))?;

    let response_raw = read_head(&mut origin, core.config.max_head_bytes)
        .await?
        .ok_or_else(|| {
            ProxyError::BodyRead(format!("origin {host} closed before response head"))
        })?;
    let response = parse_response_head(&response_raw, &head.method)?;
    let response_body =
        match read_body(&mut origin, response.body_mode, core.config.max_body_bytes).await {
            Ok(body) => body,
            Err(BodyReadError::TooLarge) => {
                return Err(ProxyError::BodyTooLarge {
                    limit: core.config.max_body_bytes,
                })
            }
            Err(BodyReadError::Io(error)) => {
                return Err(ProxyError::BodyRead(format!(
                    "response body from {host}: {error}"
                )))
            }
        };

    ctx.response = Some(response.clone());
    let response_body = core
        .registry
        .dispatch(Phase::Response, &host, &response_body, &mut ctx);

    let outbound = encode_response_head(
        response.status,
        &response.reason,
        &forwarded_headers(&response.headers, response_body.len()),
    );
    write_all(&mut client.stream, &outbound).await?;
    write_all(&mut client.stream, &response_body).await?;
    client
        .stream
        .flush()
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))?;
    client.stream.shutdown().await.ok();
    Ok(())
}

async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))
}

//! Plaintext proxied requests (everything that is not CONNECT).
//!
//! One request/response exchange per connection: the full body is buffered,
//! run through the Request chain, replayed to the origin, and the origin's
//! response comes back through the Response chain. Plain `ws://` upgrades are
//! handed to the relay instead.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::ctx::ProxyCtx;
use crate::errors::{ProxyError, Result};
use crate::handler::Phase;
use crate::http1::{
    encode_request_head, encode_response_head, forwarded_headers, is_websocket_upgrade,
    parse_response_head, read_body, read_head, split_authority, write_simple_response,
    BodyReadError, BufferedConn, PrefixedIo, RequestHead,
};
use crate::proxy::ProxyCore;
use crate::websocket;

pub(crate) async fn handle_http(
    core: Arc<ProxyCore>,
    mut conn: BufferedConn<TcpStream>,
    head: RequestHead,
) -> Result<()> {
    let Some(authority) = head.target_authority() else {
        write_simple_response(&mut conn.stream, "400 Bad Request", "request target has no host")
            .await
            .ok();
        return Ok(());
    };
    let host = head
        .host()
        .map(str::to_string)
        .unwrap_or_else(|| authority.clone());

    if is_websocket_upgrade(&head) {
        if core.config.verbose {
            core.logger
                .debug(&format!("handling websocket upgrade for {authority}"));
        }
        let origin = match dial_origin(&core, &authority, 80).await {
            Ok(stream) => stream,
            Err(error) => {
                core.logger.error(&format!("{error}"));
                write_simple_response(&mut conn.stream, "502 Bad Gateway", "origin unreachable")
                    .await
                    .ok();
                return Ok(());
            }
        };
        let mut replay = head.raw.clone();
        replay.extend_from_slice(&conn.read_buf);
        let client_io = PrefixedIo::new(replay, conn.stream);
        return websocket::relay(core, client_io, origin, head, false).await;
    }

    if core.config.verbose {
        core.logger
            .debug(&format!("handling HTTP request for {}", head.target));
    }

    let body = match read_body(&mut conn, head.body_mode, core.config.max_body_bytes).await {
        Ok(body) => body,
        Err(BodyReadError::TooLarge) => {
            write_simple_response(
                &mut conn.stream,
                "413 Payload Too Large",
                "request body exceeds proxy limit",
            )
            .await
            .ok();
            return Err(ProxyError::BodyTooLarge {
                limit: core.config.max_body_bytes,
            });
        }
        Err(BodyReadError::Io(error)) => {
            write_simple_response(
                &mut conn.stream,
                "500 Internal Server Error",
                "failed to read request body",
            )
            .await
            .ok();
            return Err(ProxyError::BodyRead(error.to_string()));
        }
    };

    let mut ctx = ProxyCtx::new(head.clone());
    let body = core.registry.dispatch(Phase::Request, &host, &body, &mut ctx);

    let mut origin = match dial_origin(&core, &authority, 80).await {
        Ok(stream) => BufferedConn::new(stream),
        Err(error) => {
            core.logger.error(&format!("{error}"));
            write_simple_response(&mut conn.stream, "502 Bad Gateway", "origin unreachable")
                .await
                .ok();
            return Ok(());
        }
    };

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
        .ok_or_else(|| ProxyError::BodyRead("origin closed before response head".to_string()))?;
    let response = parse_response_head(&response_raw, &head.method)?;
    let response_body = match read_body(&mut origin, response.body_mode, core.config.max_body_bytes)
        .await
    {
        Ok(body) => body,
        Err(BodyReadError::TooLarge) => {
            write_simple_response(
                &mut conn.stream,
                "500 Internal Server Error",
                "origin response exceeds proxy limit",
            )
            .await
            .ok();
            return Err(ProxyError::BodyTooLarge {
                limit: core.config.max_body_bytes,
            });
        }
        Err(BodyReadError::Io(error)) => {
            write_simple_response(
                &mut conn.stream,
                "500 Internal Server Error",
                "failed to read origin response",
            )
            .await
            .ok();
            return Err(ProxyError::BodyRead(error.to_string()));
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
    write_all(&mut conn.stream, &outbound).await?;
    write_all(&mut conn.stream, &response_body).await?;
    conn.stream
        .flush()
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))?;
    Ok(())
}

async fn dial_origin(
    core: &ProxyCore,
    authority: &str,
    default_port: u16,
) -> Result<TcpStream> {
    let (hostname, port) = split_authority(authority, default_port)
        .map_err(|error| ProxyError::UpstreamUnreachable(format!("{authority}: {error}")))?;
    tokio::time::timeout(
        core.config.origin_connect_timeout,
        TcpStream::connect((hostname.as_str(), port)),
    )
    .await
    .map_err(|_| ProxyError::UpstreamUnreachable(format!("{authority}: connect timed out")))?
    .map_err(|error| ProxyError::UpstreamUnreachable(format!("{authority}: {error}")))
}

async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))
}

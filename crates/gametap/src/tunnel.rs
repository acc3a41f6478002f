//! CONNECT tunnel handling: terminate the client's TLS with a minted leaf,
//! dial the origin over TLS, then hand both streams to the bridge.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::bridge;
use crate::errors::{ProxyError, Result};
use crate::http1::{parse_connect_target, write_simple_response, BufferedConn, PrefixedIo, RequestHead};
use crate::proxy::ProxyCore;

pub(crate) async fn handle_connect(
    core: Arc<ProxyCore>,
    conn: BufferedConn<TcpStream>,
    head: RequestHead,
) -> Result<()> {
    let BufferedConn {
        mut stream,
        read_buf,
    } = conn;

    let target = match parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(error) => {
            write_simple_response(&mut stream, "400 Bad Request", "invalid CONNECT target")
                .await
                .ok();
            return Err(error.into());
        }
    };
    if core.config.verbose {
        core.logger
            .debug(&format!("handling CONNECT request for {}", target.authority));
    }

    // The client must see the 200 before any TLS bytes.
    stream
        .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
        .await
        .map_err(|error| ProxyError::BodyWrite(error.to_string()))?;

    let issued = core.leaf_store.server_config_for_host(&target.authority)?;
    let acceptor = TlsAcceptor::from(issued.server_config);
    let client_io = PrefixedIo::new(read_buf, stream);
    let client_tls = acceptor.accept(client_io).await.map_err(|error| {
        ProxyError::ClientHandshake(format!("{}: {error}", target.authority))
    })?;

    let origin_tcp = tokio::time::timeout(
        core.config.origin_connect_timeout,
        TcpStream::connect((target.hostname.as_str(), target.port)),
    )
    .await
    .map_err(|_| {
        ProxyError::UpstreamUnreachable(format!("{}: connect timed out", target.authority))
    })?
    .map_err(|error| {
        ProxyError::UpstreamUnreachable(format!("{}: {error}", target.authority))
    })?;

    let server_name = ServerName::try_from(target.hostname.clone()).map_err(|_| {
        ProxyError::OriginHandshake(format!("{}: invalid server name", target.authority))
    })?;
    let connector = TlsConnector::from(Arc::clone(&core.origin_tls));
    let origin_tls = connector
        .connect(server_name, origin_tcp)
        .await
        .map_err(|error| {
            ProxyError::OriginHandshake(format!("{}: {error}", target.authority))
        })?;

    bridge::run(core, client_tls, origin_tls, target).await
}

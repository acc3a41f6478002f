//! CONNECT tunnel and HTTPS bridge scenarios: dual TLS termination, body
//! rewriting on the intercepted leg, and leaf cache behavior.

use std::net::SocketAddr;
use std::sync::Arc;

use gametap::{
    CaOptions, CertificateAuthority, LeafCertificateStore, Proxy, ProxyConfig, ProxyHandle,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::pem::parse_x509_pem;

fn test_proxy(dir: &TempDir) -> Proxy {
    let config = ProxyConfig {
        port: 0,
        bind_addr: [127, 0, 0, 1].into(),
        verbose: false,
        ca: CaOptions {
            dir: dir.path().join("ca"),
            ..CaOptions::default()
        },
        ..ProxyConfig::default()
    };
    Proxy::with_config(config).expect("build proxy")
}

/// TLS origin with its own private root; answers one request with `body` and
/// hands back what it read.
async fn spawn_tls_origin(
    dir: &TempDir,
    body: &'static str,
) -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let ca = CertificateAuthority::load_or_create(&CaOptions {
        dir: dir.path().join("origin-ca"),
        ..CaOptions::default()
    })
    .expect("origin ca");
    let store = LeafCertificateStore::new(ca);
    let issued = store
        .server_config_for_host("127.0.0.1")
        .expect("origin leaf");
    let acceptor = TlsAcceptor::from(issued.server_config);

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut stream = acceptor.accept(tcp).await.expect("origin tls accept");

        let mut received = Vec::new();
        let mut buf = [0_u8; 4096];
        while !request_complete(&received) {
            let read = stream.read(&mut buf).await.expect("origin read");
            if read == 0 {
                break;
            }
            received.extend_from_slice(&buf[..read]);
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(response.as_bytes())
            .await
            .expect("origin write");
        stream.shutdown().await.ok();
        received
    });
    (addr, handle)
}

fn request_complete(received: &[u8]) -> bool {
    let Some(head_end) = received
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
    else {
        return false;
    };
    let head = String::from_utf8_lossy(&received[..head_end]);
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    received.len() >= head_end + 4 + content_length
}

/// CONNECT through the proxy, then a TLS handshake that trusts its root.
async fn open_tunnel(handle: &ProxyHandle, ca_pem: &str, target: SocketAddr) -> TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(handle.local_addr())
        .await
        .expect("connect proxy");
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .expect("send CONNECT");

    let mut status = Vec::new();
    let mut byte = [0_u8; 1];
    while !status.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read CONNECT status");
        assert!(read > 0, "proxy closed during CONNECT");
        status.push(byte[0]);
    }
    let status = String::from_utf8_lossy(&status);
    assert!(status.starts_with("HTTP/1.1 200"), "{status}");

    let mut roots = RootCertStore::empty();
    let (_, pem) = parse_x509_pem(ca_pem.as_bytes()).expect("proxy ca pem");
    roots
        .add(CertificateDer::from(pem.contents))
        .expect("trust proxy ca");
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");
    connector
        .connect(server_name, stream)
        .await
        .expect("tls handshake with proxy")
}

async fn read_http_response<S: AsyncReadExt + Unpin>(stream: &mut S) -> String {
    let mut response = Vec::new();
    let mut buf = [0_u8; 4096];
    loop {
        let read = match stream.read(&mut buf).await {
            Ok(read) => read,
            Err(_) => break,
        };
        if read == 0 {
            break;
        }
        response.extend_from_slice(&buf[..read]);
        if request_complete(&response) {
            break;
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn rewrites_https_request_body_toward_origin() {
    let dir = TempDir::new().expect("temp dir");
    let mut proxy = test_proxy(&dir);
    proxy.on_request("127.0.0.1").handle(|body, _ctx| {
        String::from_utf8_lossy(body).replace("foo", "bar").into_bytes()
    });
    let ca_pem = proxy.ca_cert_pem();
    let handle = proxy.start().await.expect("start proxy");
    let (origin_addr, origin) = spawn_tls_origin(&dir, "origin says hi").await;

    let mut tls = open_tunnel(&handle, &ca_pem, origin_addr).await;
    let payload = r#"{"x":"foo"}"#;
    tls.write_all(
        format!(
            "POST /p HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: {}\r\n\r\n{payload}",
            origin_addr.port(),
            payload.len()
        )
        .as_bytes(),
    )
    .await
    .expect("send request");

    let response = read_http_response(&mut tls).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("origin says hi"), "{response}");

    let seen = origin.await.expect("origin task");
    let seen = String::from_utf8_lossy(&seen);
    assert!(seen.starts_with("POST /p HTTP/1.1\r\n"), "{seen}");
    assert!(seen.ends_with(r#"{"x":"bar"}"#), "{seen}");

    handle.stop().await.expect("stop proxy");
}

#[tokio::test]
async fn response_handler_rewrites_https_response() {
    let dir = TempDir::new().expect("temp dir");
    let mut proxy = test_proxy(&dir);
    proxy.on_response("127.0.0.1").handle(|body, _ctx| {
        String::from_utf8_lossy(body)
            .replace("says hi", "was rewritten")
            .into_bytes()
    });
    let ca_pem = proxy.ca_cert_pem();
    let handle = proxy.start().await.expect("start proxy");
    let (origin_addr, _origin) = spawn_tls_origin(&dir, "origin says hi").await;

    let mut tls = open_tunnel(&handle, &ca_pem, origin_addr).await;
    tls.write_all(
        format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", origin_addr.port()).as_bytes(),
    )
    .await
    .expect("send request");

    let response = read_http_response(&mut tls).await;
    assert!(response.ends_with("origin was rewritten"), "{response}");

    handle.stop().await.expect("stop proxy");
}

#[tokio::test]
async fn successive_tunnels_to_one_host_mint_a_single_leaf() {
    let dir = TempDir::new().expect("temp dir");
    let proxy = test_proxy(&dir);
    let ca_pem = proxy.ca_cert_pem();
    let handle = proxy.start().await.expect("start proxy");

    for _ in 0..2 {
        let origin_dir = TempDir::new().expect("origin dir");
        let (origin_addr, _origin) = spawn_tls_origin(&origin_dir, "hi").await;
        let mut tls = open_tunnel(&handle, &ca_pem, origin_addr).await;
        tls.write_all(
            format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", origin_addr.port())
                .as_bytes(),
        )
        .await
        .expect("send request");
        let response = read_http_response(&mut tls).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    }

    let metrics = handle.leaf_metrics();
    assert_eq!(metrics.leaves_issued, 1, "{metrics:?}");
    assert_eq!(metrics.cache_hits, 1, "{metrics:?}");

    handle.stop().await.expect("stop proxy");
}

#[tokio::test]
async fn tunnel_drops_when_origin_is_down() {
    let dir = TempDir::new().expect("temp dir");
    let proxy = test_proxy(&dir);
    let ca_pem = proxy.ca_cert_pem();
    let handle = proxy.start().await.expect("start proxy");

    let parked = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let dead_addr = parked.local_addr().expect("addr");
    drop(parked);

    let mut stream = TcpStream::connect(handle.local_addr())
        .await
        .expect("connect proxy");
    stream
        .write_all(format!("CONNECT {dead_addr} HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n").as_bytes())
        .await
        .expect("send CONNECT");

    // The 200 arrives first; the TLS handshake then dies because the proxy
    // cannot reach the origin.
    let mut roots = RootCertStore::empty();
    let (_, pem) = parse_x509_pem(ca_pem.as_bytes()).expect("proxy ca pem");
    roots
        .add(CertificateDer::from(pem.contents))
        .expect("trust proxy ca");
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");

    let mut status = Vec::new();
    let mut byte = [0_u8; 1];
    while !status.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read CONNECT status");
        assert!(read > 0, "proxy closed during CONNECT");
        status.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&status).starts_with("HTTP/1.1 200"));

    let result = connector.connect(server_name, stream).await;
    match result {
        Ok(mut tls) => {
            // Handshake may complete before the tunnel collapses; the next
            // read must then fail or hit EOF.
            let mut buf = [0_u8; 64];
            let read = tls.read(&mut buf).await.unwrap_or(0);
            assert_eq!(read, 0, "expected a dropped tunnel");
        }
        Err(_) => {}
    }

    handle.stop().await.expect("stop proxy");
}

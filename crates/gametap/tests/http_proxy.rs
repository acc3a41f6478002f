//! End-to-end scenarios over the plaintext proxy path.

use std::net::SocketAddr;

use gametap::{CaOptions, Proxy, ProxyConfig};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

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

/// One-shot origin: records the request it saw, answers 200 with `body`.
async fn spawn_http_origin(body: &'static str) -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
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
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: marker\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(response.as_bytes())
            .await
            .expect("origin write");
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

async fn send_via_proxy(proxy_addr: SocketAddr, request: &str) -> String {
    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    client
        .write_all(request.as_bytes())
        .await
        .expect("send request");
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read response");
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn relays_plain_http_unchanged_without_handlers() {
    let dir = TempDir::new().expect("temp dir");
    let handle = test_proxy(&dir).start().await.expect("start proxy");
    let (origin_addr, origin) = spawn_http_origin("plain body").await;

    let response = send_via_proxy(
        handle.local_addr(),
        &format!(
            "GET http://{origin_addr}/foo?q=1 HTTP/1.1\r\nHost: {origin_addr}\r\nAccept: */*\r\n\r\n"
        ),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("X-Origin: marker"));
    assert!(response.ends_with("plain body"));

    let seen = origin.await.expect("origin task");
    let seen = String::from_utf8_lossy(&seen);
    assert!(seen.starts_with("GET /foo?q=1 HTTP/1.1\r\n"), "{seen}");
    assert!(seen.contains("Accept: */*"));
    assert!(seen.contains(&format!("Host: {origin_addr}")));

    handle.stop().await.expect("stop proxy");
}

#[tokio::test]
async fn request_handler_rewrite_reaches_the_origin() {
    let dir = TempDir::new().expect("temp dir");
    let mut proxy = test_proxy(&dir);
    proxy.on_request("127.0.0.1").handle(|body, _ctx| {
        String::from_utf8_lossy(body).replace("foo", "bar").into_bytes()
    });
    let handle = proxy.start().await.expect("start proxy");
    let (origin_addr, origin) = spawn_http_origin("ok").await;

    let payload = r#"{"x":"foo"}"#;
    let response = send_via_proxy(
        handle.local_addr(),
        &format!(
            "POST http://{origin_addr}/p HTTP/1.1\r\nHost: {origin_addr}\r\nContent-Length: {}\r\n\r\n{payload}",
            payload.len()
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

    let seen = origin.await.expect("origin task");
    let seen = String::from_utf8_lossy(&seen);
    assert!(seen.ends_with(r#"{"x":"bar"}"#), "{seen}");
    assert!(seen.contains("Content-Length: 11"));

    handle.stop().await.expect("stop proxy");
}

#[tokio::test]
async fn wildcard_response_handler_rewrites_every_host() {
    let dir = TempDir::new().expect("temp dir");
    let mut proxy = test_proxy(&dir);
    proxy.on_response("*").handle(|body, _ctx| {
        String::from_utf8_lossy(body)
            .replace("plain", "patched")
            .into_bytes()
    });
    let handle = proxy.start().await.expect("start proxy");
    let (origin_addr, _origin) = spawn_http_origin("plain body").await;

    let response = send_via_proxy(
        handle.local_addr(),
        &format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"),
    )
    .await;

    assert!(response.ends_with("patched body"), "{response}");
    assert!(response.contains("Content-Length: 12"));

    handle.stop().await.expect("stop proxy");
}

#[tokio::test]
async fn unreachable_origin_yields_502() {
    let dir = TempDir::new().expect("temp dir");
    let handle = test_proxy(&dir).start().await.expect("start proxy");

    // Grab a port nothing is listening on.
    let parked = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let dead_addr = parked.local_addr().expect("addr");
    drop(parked);

    let response = send_via_proxy(
        handle.local_addr(),
        &format!("GET http://{dead_addr}/ HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n"),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");

    handle.stop().await.expect("stop proxy");
}

#[tokio::test]
async fn oversized_request_body_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let config = ProxyConfig {
        port: 0,
        bind_addr: [127, 0, 0, 1].into(),
        verbose: false,
        max_body_bytes: 64,
        ca: CaOptions {
            dir: dir.path().join("ca"),
            ..CaOptions::default()
        },
        ..ProxyConfig::default()
    };
    let handle = Proxy::with_config(config)
        .expect("build proxy")
        .start()
        .await
        .expect("start proxy");

    let response = send_via_proxy(
        handle.local_addr(),
        "POST http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\nContent-Length: 4096\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 413"), "{response}");

    handle.stop().await.expect("stop proxy");
}

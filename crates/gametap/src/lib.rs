//! gametap: an intercepting proxy for HTTP, HTTPS and WebSocket traffic.
//!
//! Point a client's system proxy at the listener, trust the generated root
//! certificate, and register per-host handlers that rewrite request bodies,
//! response bodies and WebSocket frames in flight:
//!
//! ```no_run
//! # async fn demo() -> gametap::Result<()> {
//! let mut proxy = gametap::Proxy::new()?;
//! proxy.set_port(12311);
//! proxy.on_request("api.game.example").handle(|body, _ctx| {
//!     body.to_vec() // inspect or rewrite here
//! });
//! proxy.run().await
//! # }
//! ```

mod bridge;
mod config;
mod ctx;
mod errors;
mod forward;
mod handler;
mod http1;
mod logger;
mod proxy;
mod tunnel;
mod websocket;

pub use config::ProxyConfig;
pub use ctx::ProxyCtx;
pub use errors::{ProxyError, Result};
pub use handler::{Phase, ALL_HOSTS};
pub use http1::{RequestHead, ResponseHead};
pub use logger::{Logger, TracingLogger};
pub use proxy::{Dispatcher, Proxy, ProxyHandle};
pub use websocket::WsSession;

pub use gametap_tls::{
    CaOptions, CertificateAuthority, LeafCertificateStore, LeafMetricsSnapshot, TlsError,
};

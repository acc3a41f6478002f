//! The proxy server: accept loop, CONNECT/plain dispatch, registration
//! surface, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gametap_tls::{
    build_origin_client_config, CertificateAuthority, LeafCertificateStore, LeafMetricsSnapshot,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::rustls::ClientConfig;

use crate::config::ProxyConfig;
use crate::ctx::ProxyCtx;
use crate::errors::{ProxyError, Result};
use crate::forward;
use crate::handler::{Handler, HandlerRegistry, Phase};
use crate::http1::{parse_request_head, read_head, write_simple_response, BufferedConn};
use crate::logger::{Logger, TracingLogger};
use crate::tunnel;

/// Shared state for connection tasks. Built once at start; read-only after.
pub(crate) struct ProxyCore {
    pub(crate) config: ProxyConfig,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) leaf_store: Arc<LeafCertificateStore>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) origin_tls: Arc<ClientConfig>,
}

pub struct Proxy {
    config: ProxyConfig,
    logger: Arc<dyn Logger>,
    leaf_store: Arc<LeafCertificateStore>,
    registry: HandlerRegistry,
}

impl Proxy {
    /// Creates a proxy with default configuration, loading or minting the CA
    /// under `./ca`.
    pub fn new() -> Result<Self> {
        Self::with_config(ProxyConfig::default())
    }

    pub fn with_config(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let ca = CertificateAuthority::load_or_create(&config.ca)?;
        Ok(Self {
            logger: Arc::new(TracingLogger),
            leaf_store: Arc::new(LeafCertificateStore::new(ca)),
            registry: HandlerRegistry::default(),
            config,
        })
    }

    pub fn set_port(&mut self, port: u16) {
        self.config.port = port;
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.config.verbose = verbose;
    }

    pub fn set_logger<L: Logger + 'static>(&mut self, logger: L) {
        self.logger = Arc::new(logger);
    }

    /// Replaces the signing root; the leaf cache starts over.
    pub fn set_ca(&mut self, ca: CertificateAuthority) {
        self.leaf_store = Arc::new(LeafCertificateStore::new(ca));
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProxyConfig {
        &mut self.config
    }

    /// The root certificate in PEM form, for client trust stores.
    pub fn ca_cert_pem(&self) -> String {
        self.leaf_store.ca().cert_pem().to_string()
    }

    pub fn leaf_metrics(&self) -> LeafMetricsSnapshot {
        self.leaf_store.metrics_snapshot()
    }

    pub fn on_request(&mut self, pattern: &str) -> Dispatcher<'_> {
        self.dispatcher(Phase::Request, pattern)
    }

    pub fn on_response(&mut self, pattern: &str) -> Dispatcher<'_> {
        self.dispatcher(Phase::Response, pattern)
    }

    pub fn on_connected(&mut self, pattern: &str) -> Dispatcher<'_> {
        self.dispatcher(Phase::Connected, pattern)
    }

    fn dispatcher(&mut self, phase: Phase, pattern: &str) -> Dispatcher<'_> {
        Dispatcher {
            proxy: self,
            phase,
            pattern: pattern.to_string(),
        }
    }

    /// Runs the accept loop until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        let core = self.into_core();
        let listener = bind(&core).await?;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        serve(core, listener, shutdown_rx).await
    }

    /// Binds the listener and serves in a background task.
    pub async fn start(self) -> Result<ProxyHandle> {
        let core = self.into_core();
        let grace = core.config.shutdown_grace;
        let leaf_store = Arc::clone(&core.leaf_store);
        let listener = bind(&core).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(serve(core, listener, shutdown_rx));
        Ok(ProxyHandle {
            shutdown,
            join,
            local_addr,
            grace,
            leaf_store,
        })
    }

    fn into_core(self) -> Arc<ProxyCore> {
        Arc::new(ProxyCore {
            origin_tls: build_origin_client_config(self.config.verify_origin_tls),
            logger: self.logger,
            leaf_store: self.leaf_store,
            registry: self.registry,
            config: self.config,
        })
    }
}

/// Registration handle returned by `on_request`/`on_response`/`on_connected`.
pub struct Dispatcher<'p> {
    proxy: &'p mut Proxy,
    phase: Phase,
    pattern: String,
}

impl Dispatcher<'_> {
    /// Installs the handler under this pattern.
    pub fn handle<F>(self, handler: F)
    where
        F: Fn(&[u8], &mut ProxyCtx) -> Vec<u8> + Send + Sync + 'static,
    {
        let Dispatcher {
            proxy,
            phase,
            pattern,
        } = self;
        let handler: Handler = Arc::new(handler);
        let logger = Arc::clone(&proxy.logger);
        proxy
            .registry
            .install(phase, &pattern, handler, logger.as_ref());
    }
}

pub struct ProxyHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<Result<()>>,
    local_addr: SocketAddr,
    grace: Duration,
    leaf_store: Arc<LeafCertificateStore>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn leaf_metrics(&self) -> LeafMetricsSnapshot {
        self.leaf_store.metrics_snapshot()
    }

    /// Graceful shutdown: stops accepting, drains in-flight connections for
    /// the grace period, then aborts whatever is left (long-lived WebSocket
    /// relays included).
    pub async fn stop(self) -> Result<()> {
        let ProxyHandle {
            shutdown,
            mut join,
            grace,
            ..
        } = self;
        let _ = shutdown.send(true);
        match tokio::time::timeout(grace + Duration::from_secs(1), &mut join).await {
            Ok(joined) => joined?,
            Err(_) => {
                join.abort();
                Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for proxy shutdown",
                )))
            }
        }
    }

    /// Waits for the serve loop to end on its own.
    pub async fn wait(self) -> Result<()> {
        self.join.await?
    }
}

async fn bind(core: &ProxyCore) -> Result<TcpListener> {
    let addr = SocketAddr::from((core.config.bind_addr, core.config.port));
    let listener = TcpListener::bind(addr).await?;
    core.logger
        .info(&format!("starting proxy server on {}", listener.local_addr()?));
    Ok(listener)
}

async fn serve(
    core: Arc<ProxyCore>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut tasks: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        core.logger.error(&format!("accept failed: {error}"));
                        continue;
                    }
                };
                let task_core = Arc::clone(&core);
                tasks.spawn(async move {
                    if let Err(error) = handle_client(Arc::clone(&task_core), stream, peer).await {
                        task_core
                            .logger
                            .error(&format!("connection from {peer} failed: {error}"));
                    }
                });
            }
        }
        // Reap finished tasks so the set does not grow with connection count.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(error) = joined {
                if error.is_panic() {
                    core.logger
                        .error(&format!("connection task panicked: {error}"));
                }
            }
        }
    }

    core.logger.info("stopping proxy server");
    let drained = tokio::time::timeout(core.config.shutdown_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        core.logger
            .warn("shutdown grace period elapsed; aborting remaining connections");
        tasks.shutdown().await;
    }
    core.logger.info("proxy server stopped");
    Ok(())
}

async fn handle_client(
    core: Arc<ProxyCore>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut conn = BufferedConn::new(stream);
    let head_raw = match read_head(&mut conn, core.config.max_head_bytes).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(()),
        Err(error) => {
            if error.kind() == std::io::ErrorKind::InvalidData {
                write_simple_response(
                    &mut conn.stream,
                    "431 Request Header Fields Too Large",
                    "request head exceeded limit",
                )
                .await
                .ok();
            }
            return Err(error.into());
        }
    };
    let head = match parse_request_head(&head_raw) {
        Ok(head) => head,
        Err(error) => {
            write_simple_response(&mut conn.stream, "400 Bad Request", "invalid HTTP request")
                .await
                .ok();
            return Err(error.into());
        }
    };
    if core.config.verbose {
        core.logger.debug(&format!(
            "received request from {peer}: {} {}",
            head.method, head.target
        ));
    }

    if head.method.eq_ignore_ascii_case("CONNECT") {
        tunnel::handle_connect(core, conn, head).await
    } else {
        forward::handle_http(core, conn, head).await
    }
}

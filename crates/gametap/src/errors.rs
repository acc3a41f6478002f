use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Tls(#[from] gametap_tls::TlsError),
    #[error("origin unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("client TLS handshake failed: {0}")]
    ClientHandshake(String),
    #[error("origin TLS handshake failed: {0}")]
    OriginHandshake(String),
    #[error("body read failed: {0}")]
    BodyRead(String),
    #[error("body write failed: {0}")]
    BodyWrite(String),
    #[error("body exceeded the configured limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("websocket upgrade failed: {0}")]
    WebSocketUpgrade(String),
    #[error("websocket session is closed")]
    WsSessionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

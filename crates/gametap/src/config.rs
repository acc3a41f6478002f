use std::net::IpAddr;
use std::time::Duration;

use gametap_tls::CaOptions;

use crate::errors::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Listening port for the proxy itself.
    pub port: u16,
    pub bind_addr: IpAddr,
    /// Per-request and per-frame debug logging.
    pub verbose: bool,
    pub ca: CaOptions,
    /// Timeout for dialing origins, on every outbound path.
    pub origin_connect_timeout: Duration,
    /// Origin certificate verification. Off by default: the hosts this proxy
    /// targets routinely present pinned or private-CA certificates.
    pub verify_origin_tls: bool,
    /// Upper bound for any fully-buffered request or response body.
    pub max_body_bytes: usize,
    /// Upper bound for an HTTP head (request line + headers).
    pub max_head_bytes: usize,
    /// How long `stop()` waits for in-flight connections before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 12311,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            verbose: true,
            ca: CaOptions::default(),
            origin_connect_timeout: Duration::from_secs(10),
            verify_origin_tls: false,
            max_body_bytes: 64 * 1024 * 1024,
            max_head_bytes: 64 * 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.origin_connect_timeout.is_zero() {
            return Err(ProxyError::InvalidConfig(
                "origin_connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_head_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_head_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

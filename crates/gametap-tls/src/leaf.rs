use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
    SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::ca::{generate_key_pair, CertificateAuthority};
use crate::TlsError;

const LEAF_VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone)]
pub struct IssuedServerConfig {
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
    pub leaf_cert_der: CertificateDer<'static>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeafMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
}

/// Per-host leaf issuance with an in-memory cache.
///
/// Lookups take the read lock; generation happens outside any lock and the
/// write lock is held only around the map insert. When two connections race
/// on a cold host the first inserted leaf wins and both are valid.
pub struct LeafCertificateStore {
    ca: CertificateAuthority,
    cache: RwLock<HashMap<String, CachedLeaf>>,
    serial: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl LeafCertificateStore {
    pub fn new(ca: CertificateAuthority) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(1);
        Self {
            ca,
            cache: RwLock::new(HashMap::new()),
            serial: AtomicU64::new(seed),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        }
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn server_config_for_host(&self, host: &str) -> Result<IssuedServerConfig, TlsError> {
        let host = normalize_host(host);

        {
            let cache = self.cache.read().map_err(|_| TlsError::LockPoisoned)?;
            if let Some(cached) = cache.get(&host) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(IssuedServerConfig {
                    server_config: Arc::clone(&cached.server_config),
                    cache_status: LeafCacheStatus::Hit,
                    leaf_cert_der: cached.leaf_cert_der.clone(),
                });
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let (server_config, leaf_cert_der) = self.issue(&host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);

        let mut cache = self.cache.write().map_err(|_| TlsError::LockPoisoned)?;
        let entry = cache.entry(host).or_insert(CachedLeaf {
            server_config,
            leaf_cert_der,
        });
        Ok(IssuedServerConfig {
            server_config: Arc::clone(&entry.server_config),
            cache_status: LeafCacheStatus::Miss,
            leaf_cert_der: entry.leaf_cert_der.clone(),
        })
    }

    /// SNI-driven variant for callers holding a client hello rather than a
    /// CONNECT target.
    pub fn server_config_for_sni(
        &self,
        server_name: Option<&str>,
    ) -> Result<IssuedServerConfig, TlsError> {
        match server_name {
            Some(name) if !name.is_empty() => self.server_config_for_host(name),
            _ => Err(TlsError::MissingSni),
        }
    }

    pub fn metrics_snapshot(&self) -> LeafMetricsSnapshot {
        LeafMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }

    fn issue(&self, host: &str) -> Result<(Arc<ServerConfig>, CertificateDer<'static>), TlsError> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let params = build_leaf_params(host, serial)?;
        let key = generate_key_pair()?;
        let cert = params
            .signed_by(&key, self.ca.issuer())
            .map_err(TlsError::Sign)?;
        let leaf_cert_der = cert.der().clone();

        let chain = vec![leaf_cert_der.clone(), self.ca.cert_der().clone()];
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok((Arc::new(server_config), leaf_cert_der))
    }
}

fn build_leaf_params(host: &str, serial: u64) -> Result<CertificateParams, TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(TlsError::Sign)?;
    params.is_ca = IsCa::NoCa;
    params.serial_number = Some(SerialNumber::from(serial));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        // Clients reach game hosts both directly and through ws./wss.
        // aliases, so every leaf covers all of them.
        for name in [
            host.to_string(),
            format!("*.{host}"),
            format!("ws.{host}"),
            format!("wss.{host}"),
        ] {
            params
                .subject_alt_names
                .push(SanType::DnsName(name.try_into().map_err(TlsError::Sign)?));
        }
    }

    Ok(params)
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest)
    } else if let Some((name, port)) = host.rsplit_once(':') {
        if !name.is_empty() && !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            host
        }
    } else {
        host
    };

    match bare.parse::<IpAddr>() {
        Ok(_) => bare.to_string(),
        Err(_) => bare.to_ascii_lowercase(),
    }
}

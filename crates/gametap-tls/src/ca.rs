use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use x509_parser::parse_x509_certificate;
use x509_parser::pem::parse_x509_pem;

use crate::TlsError;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_VALIDITY_DAYS: i64 = 10 * 365;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaOptions {
    pub dir: PathBuf,
    pub common_name: String,
    pub organization: String,
}

impl Default for CaOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./ca"),
            common_name: "MITM Proxy CA".to_string(),
            organization: "MITM Proxy".to_string(),
        }
    }
}

/// The long-lived signing root. Loaded once at startup, read-only afterwards.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertificateAuthority {
    /// Loads `ca.crt` + `ca.key` from `options.dir`, or generates and
    /// persists a fresh self-signed root when both files are absent.
    pub fn load_or_create(options: &CaOptions) -> Result<Self, TlsError> {
        fs::create_dir_all(&options.dir)?;
        #[cfg(unix)]
        set_mode(&options.dir, 0o755)?;

        let cert_path = options.dir.join(CA_CERT_FILE);
        let key_path = options.dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            return Self::load(cert_path, key_path);
        }
        Self::create(options, cert_path, key_path)
    }

    fn load(cert_path: PathBuf, key_path: PathBuf) -> Result<Self, TlsError> {
        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;

        let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).map_err(|error| {
            TlsError::CaParse(format!("{}: {error}", cert_path.display()))
        })?;
        if pem.label != "CERTIFICATE" {
            return Err(TlsError::CaParse(format!(
                "{}: expected a CERTIFICATE block, found {}",
                cert_path.display(),
                pem.label
            )));
        }
        let key = KeyPair::from_pem(&key_pem).map_err(|error| {
            TlsError::CaParse(format!("{}: {error}", key_path.display()))
        })?;

        let (_, parsed) = parse_x509_certificate(&pem.contents).map_err(|error| {
            TlsError::CaParse(format!("{}: {error}", cert_path.display()))
        })?;
        if spki_of_key(&key)? != parsed.public_key().raw {
            return Err(TlsError::CaParse(
                "CA certificate and private key do not match".to_string(),
            ));
        }

        let cert_der = CertificateDer::from(pem.contents.clone());
        let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
            TlsError::CaParse(format!("{}: {error}", cert_path.display()))
        })?;

        Ok(Self {
            issuer,
            cert_pem,
            cert_der,
            cert_path,
            key_path,
        })
    }

    fn create(
        options: &CaOptions,
        cert_path: PathBuf,
        key_path: PathBuf,
    ) -> Result<Self, TlsError> {
        let key = generate_key_pair()?;
        let params = build_ca_params(options);
        let cert = params.self_signed(&key).map_err(TlsError::Sign)?;

        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();
        let cert_der = cert.der().clone();

        fs::write(&cert_path, cert_pem.as_bytes())?;
        fs::write(&key_path, key_pem.as_bytes())?;
        #[cfg(unix)]
        {
            set_mode(&cert_path, 0o644)?;
            set_mode(&key_path, 0o600)?;
        }

        Ok(Self {
            issuer: Issuer::new(params, key),
            cert_pem,
            cert_der,
            cert_path,
            key_path,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

fn build_ca_params(options: &CaOptions) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.serial_number = Some(SerialNumber::from(1_u64));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, options.common_name.clone());
    distinguished_name.push(DnType::OrganizationName, options.organization.clone());
    params.distinguished_name = distinguished_name;
    params
}

/// Public key of `key` in SubjectPublicKeyInfo form, extracted from a
/// throwaway self-signed certificate so it can be compared against the SPKI
/// of a loaded CA certificate.
fn spki_of_key(key: &KeyPair) -> Result<Vec<u8>, TlsError> {
    let probe = CertificateParams::default()
        .self_signed(key)
        .map_err(|error| TlsError::CaParse(format!("CA private key is unusable: {error}")))?;
    let (_, parsed) = parse_x509_certificate(probe.der().as_ref())
        .map_err(|error| TlsError::CaParse(format!("probe certificate: {error}")))?;
    Ok(parsed.public_key().raw.to_vec())
}

/// RSA-2048 where the backend supports generating it, otherwise ECDSA P-256.
pub(crate) fn generate_key_pair() -> Result<KeyPair, TlsError> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256))
        .or_else(|_| KeyPair::generate())
        .map_err(TlsError::KeyGen)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

//! Certificate Authority management for the intercepting proxy.
//!
//! Generates and persists the root CA certificate on first run and signs
//! per-host leaf certificates on the fly.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;

pub use crate::error::CaError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "interlock-ca.crt";
const CA_KEY_FILENAME: &str = "interlock-ca.key";

const CA_COMMON_NAME: &str = "Interlock Root CA";
const CA_ORGANIZATION: &str = "Interlock";

/// Number of leaf certificates kept per authority.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Issues leaf certificates for intercepted server names.
pub trait CertificateAuthority: Send + Sync {
    /// Returns a certificate chain and key for `server_name`.
    fn issue(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CaError>;
}

/// Manages the root CA certificate on disk.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the default Interlock data directory.
    pub fn with_default_dir() -> Result<Self, CaError> {
        Ok(Self::new(default_ca_dir()?))
    }

    /// Returns the CA directory.
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA certificate exists, generating it if necessary.
    ///
    /// Returns an authority ready to sign leaf certificates.
    pub fn ensure_ca(&self) -> Result<LocalAuthority, CaError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;
        let cert = ca_params()
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the CA certificate and key into a signing authority.
    pub fn load_authority(&self) -> Result<LocalAuthority, CaError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(LocalAuthority::new(
            issuer,
            parse_cert_der(&cert_pem)?,
            DEFAULT_CACHE_CAPACITY,
        ))
    }

    /// Reads the CA certificate as DER bytes (for installation instructions).
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        Ok(parse_cert_der(&cert_pem)?.to_vec())
    }
}

/// Default CA directory under the platform data dir.
pub fn default_ca_dir() -> Result<PathBuf, CaError> {
    let project_dirs = directories::ProjectDirs::from("com", "interlock", "Interlock")
        .ok_or_else(|| CaError::Generation("Failed to get project dirs".into()))?;
    Ok(project_dirs.data_dir().join("ca"))
}

fn parse_cert_der(pem: &str) -> Result<CertificateDer<'static>, CaError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .ok_or_else(|| CaError::Parse("No certificate found in PEM".into()))?
        .map_err(|e| CaError::Parse(e.to_string()))
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, CA_COMMON_NAME);
    name.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = name;
    params
}

fn leaf_params(host: &str) -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, host);
    params.distinguished_name = name;

    // IP literals need an IP SAN; clients reject them as DNS names.
    match host.parse::<IpAddr>() {
        Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
        Err(_) => params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?)),
    }
    Ok(params)
}

#[derive(Default)]
struct LeafCache {
    entries: HashMap<String, Arc<CertifiedKey>>,
    order: VecDeque<String>,
}

/// Root CA loaded in memory, signing leaves for [`CertificateAuthority::issue`].
pub struct LocalAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    cache: RwLock<LeafCache>,
    capacity: usize,
}

impl std::fmt::Debug for LocalAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAuthority")
            .field("cached", &self.cached())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl LocalAuthority {
    /// Creates an authority from a loaded issuer and its certificate.
    pub fn new(
        issuer: Issuer<'static, KeyPair>,
        ca_cert_der: CertificateDer<'static>,
        capacity: usize,
    ) -> Self {
        Self {
            issuer,
            ca_cert_der,
            cache: RwLock::new(LeafCache::default()),
            capacity: capacity.max(1),
        }
    }

    /// DER of the root certificate.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Number of cached leaf certificates.
    pub fn cached(&self) -> usize {
        self.cache.read().entries.len()
    }

    fn sign_leaf(&self, host: &str) -> Result<CertifiedKey, CaError> {
        let signing = |reason: String| CaError::Signing {
            host: host.to_string(),
            reason,
        };

        let params = leaf_params(host).map_err(|e| signing(e.to_string()))?;
        let key_pair = KeyPair::generate().map_err(|e| signing(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| signing(e.to_string()))?;

        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = any_supported_type(&private_key).map_err(|e| signing(e.to_string()))?;

        Ok(CertifiedKey::new(
            vec![cert.der().clone(), self.ca_cert_der.clone()],
            signing_key,
        ))
    }
}

impl CertificateAuthority for LocalAuthority {
    fn issue(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CaError> {
        let host = server_name.to_ascii_lowercase();
        if let Some(key) = self.cache.read().entries.get(&host) {
            return Ok(key.clone());
        }

        tracing::debug!(host = %host, "Signing leaf certificate");
        let key = Arc::new(self.sign_leaf(&host)?);

        let mut cache = self.cache.write();
        if let Some(existing) = cache.entries.get(&host) {
            return Ok(existing.clone());
        }
        while cache.entries.len() >= self.capacity {
            match cache.order.pop_front() {
                Some(oldest) => {
                    cache.entries.remove(&oldest);
                }
                None => break,
            }
        }
        cache.order.push_back(host.clone());
        cache.entries.insert(host, key.clone());
        Ok(key)
    }
}

//! The local certificate authority and per-host leaf issuance.
//!
//! The CA root is generated once under `certs/` with create-new semantics:
//! an existing key is never silently overwritten, that would invalidate
//! every trust store the user installed it into. Leaf certificates are
//! ECDSA P-256, SAN = SNI host, short-lived, cached in a bounded LRU.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::errors::GatewayError;

/// Leaf certs older than this are re-issued; well under their notAfter.
const LEAF_TTL: Duration = Duration::from_secs(60 * 60);
const LEAF_CACHE_CAP: usize = 256;

pub struct LeafCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    issued: Instant,
}

impl Clone for LeafCert {
    fn clone(&self) -> Self {
        LeafCert {
            cert_der: self.cert_der.clone(),
            key_der: self.key_der.clone_key(),
            issued: self.issued,
        }
    }
}

struct CacheEntry {
    leaf: LeafCert,
    last_used: Instant,
}

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl CertificateAuthority {
    /// Load the CA from disk, generating it on first run.
    pub fn load_or_create(config: &Config) -> Result<Arc<Self>, GatewayError> {
        let cert_path = config.ca_cert_path();
        let key_path = config.ca_key_path();
        let (cert_pem, key_pem) = load_or_create_ca_pem(&cert_path, &key_path)?;

        let ca_key = KeyPair::from_pem(&key_pem)
            .map_err(|e| GatewayError::Config(format!("parse CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| GatewayError::Config(format!("parse CA cert: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| GatewayError::Config(format!("rebuild CA issuer: {e}")))?;

        Ok(Arc::new(CertificateAuthority {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem,
            cache: Mutex::new(HashMap::new()),
        }))
    }

    /// An in-memory CA for tests.
    pub fn ephemeral() -> Result<Arc<Self>, GatewayError> {
        let (cert_pem, key_pem) = generate_ca_pem()?;
        let ca_key = KeyPair::from_pem(&key_pem)
            .map_err(|e| GatewayError::Config(format!("parse CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| GatewayError::Config(format!("parse CA cert: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| GatewayError::Config(format!("rebuild CA issuer: {e}")))?;
        Ok(Arc::new(CertificateAuthority {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem,
            cache: Mutex::new(HashMap::new()),
        }))
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The leaf for an SNI host, from cache or freshly issued. The cache
    /// lock is released during generation; concurrent misses on the same
    /// host may both generate, last write wins.
    pub fn leaf_for(&self, host: &str) -> Result<LeafCert, GatewayError> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get_mut(host) {
                if entry.leaf.issued.elapsed() < LEAF_TTL {
                    entry.last_used = Instant::now();
                    return Ok(entry.leaf.clone());
                }
                cache.remove(host);
            }
        }

        let leaf = self.issue(host)?;

        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= LEAF_CACHE_CAP {
            evict_lru(&mut cache);
        }
        cache.insert(
            host.to_string(),
            CacheEntry {
                leaf: leaf.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(leaf)
    }

    fn issue(&self, host: &str) -> Result<LeafCert, GatewayError> {
        let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
            let mut params = CertificateParams::new(Vec::new())
                .map_err(|e| GatewayError::Internal(format!("cert params: {e}")))?;
            params.subject_alt_names.push(SanType::IpAddress(ip));
            params
        } else {
            CertificateParams::new(vec![host.to_string()])
                .map_err(|e| GatewayError::Internal(format!("cert params: {e}")))?
        };
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| GatewayError::Internal(format!("leaf keypair: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| GatewayError::Internal(format!("sign leaf: {e}")))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| GatewayError::Internal(format!("leaf key der: {e}")))?;

        tracing::debug!(%host, "issued leaf certificate");
        Ok(LeafCert {
            cert_der,
            key_der,
            issued: Instant::now(),
        })
    }

    /// rustls server config presenting the leaf for `host`, HTTP/1 only so
    /// the intercepted stream can be served by the same pipeline code.
    pub fn server_config(&self, host: &str) -> Result<Arc<rustls::ServerConfig>, GatewayError> {
        let leaf = self.leaf_for(host)?;
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.cert_der.clone()], leaf.key_der.clone_key())
            .map_err(|e| GatewayError::Internal(format!("tls config: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

fn evict_lru(cache: &mut HashMap<String, CacheEntry>) {
    if let Some(oldest) = cache
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(host, _)| host.clone())
    {
        cache.remove(&oldest);
    }
}

fn load_or_create_ca_pem(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(String, String), GatewayError> {
    if cert_path.exists() || key_path.exists() {
        if !cert_path.exists() || !key_path.exists() {
            return Err(GatewayError::Config(
                "both ca_cert and ca_key must exist, refusing a half-initialized CA".into(),
            ));
        }
        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| GatewayError::Config(format!("read {}: {e}", cert_path.display())))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| GatewayError::Config(format!("read {}: {e}", key_path.display())))?;
        return Ok((cert_pem, key_pem));
    }

    if let Some(parent) = cert_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| GatewayError::Config(format!("create {}: {e}", parent.display())))?;
    }

    let (cert_pem, key_pem) = generate_ca_pem()?;
    // The key is a high-value secret: 0600 and create-new so an existing
    // file is never clobbered.
    write_create_new(key_path, key_pem.as_bytes(), 0o600)?;
    if let Err(e) = write_create_new(cert_path, cert_pem.as_bytes(), 0o644) {
        let _ = fs::remove_file(key_path);
        return Err(e);
    }
    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "generated CodeGate CA; install the certificate into your trust store"
    );
    Ok((cert_pem, key_pem))
}

fn generate_ca_pem() -> Result<(String, String), GatewayError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "CodeGate CA");
    dn.push(DnType::OrganizationName, "CodeGate");
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| GatewayError::Config(format!("generate CA keypair: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| GatewayError::Config(format!("self-sign CA: {e}")))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn write_create_new(path: &Path, contents: &[u8], mode: u32) -> Result<(), GatewayError> {
    let mut file = open_create_new(path, mode)
        .map_err(|e| GatewayError::Config(format!("create {}: {e}", path.display())))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| GatewayError::Config(format!("write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(unix)]
fn open_create_new(path: &Path, mode: u32) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn open_create_new(path: &Path, _mode: u32) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_is_cached_per_host() {
        let ca = CertificateAuthority::ephemeral().unwrap();
        let a = ca.leaf_for("api.githubcopilot.com").unwrap();
        let b = ca.leaf_for("api.githubcopilot.com").unwrap();
        assert_eq!(a.cert_der, b.cert_der);

        let other = ca.leaf_for("api.openai.com").unwrap();
        assert_ne!(a.cert_der, other.cert_der);
    }

    #[test]
    fn ip_hosts_get_ip_san() {
        let ca = CertificateAuthority::ephemeral().unwrap();
        // Parses and issues without error; SAN type selection is internal.
        assert!(ca.leaf_for("127.0.0.1").is_ok());
    }

    #[test]
    fn ca_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            certs_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let first = CertificateAuthority::load_or_create(&config).unwrap();
        let pem_first = first.ca_cert_pem().to_string();

        let second = CertificateAuthority::load_or_create(&config).unwrap();
        assert_eq!(pem_first, second.ca_cert_pem());
    }

    #[test]
    fn half_initialized_ca_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            certs_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        std::fs::write(config.ca_cert_path(), "not-a-cert").unwrap();
        assert!(CertificateAuthority::load_or_create(&config).is_err());
    }

    #[test]
    fn server_config_builds() {
        let ca = CertificateAuthority::ephemeral().unwrap();
        let config = ca.server_config("example.com").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}

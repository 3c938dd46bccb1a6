//! Self-signed certificate for the loopback chat listener.
//!
//! The game client is told to accept bad certificates, so the only job of
//! this certificate is to complete the TLS handshake. It is generated once
//! and persisted as PEM next to the settings file so the client sees a
//! stable identity across runs.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

const COMMON_NAME: &str = "League Deceiver CA";

/// Ten years; nobody wants to debug an expired loopback certificate.
const VALIDITY_DAYS: i64 = 3650;

pub struct CertPair {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Load the persisted certificate pair, generating a fresh one when either
/// file is missing or unreadable.
pub fn load_or_generate(dir: &Path) -> anyhow::Result<CertPair> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        match load_pem_pair(&cert_path, &key_path) {
            Ok(pair) => {
                info!(path = %cert_path.display(), "loaded chat listener certificate");
                return Ok(pair);
            }
            Err(e) => {
                warn!(error = %e, "persisted certificate unusable, regenerating");
            }
        }
    }

    info!("generating self-signed chat listener certificate");
    generate_pem_pair(&cert_path, &key_path)?;
    load_pem_pair(&cert_path, &key_path)
}

fn load_pem_pair(cert_path: &Path, key_path: &Path) -> anyhow::Result<CertPair> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("reading {}", cert_path.display()))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("reading {}", key_path.display()))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .context("parsing certificate PEM")?;
    if certs.is_empty() {
        bail!("no certificate found in {}", cert_path.display());
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("parsing key PEM")?
        .with_context(|| format!("no private key found in {}", key_path.display()))?;

    Ok(CertPair { certs, key })
}

fn generate_pem_pair(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    // The Riot client expects an RSA certificate; rcgen cannot generate RSA
    // keys itself, so the key pair comes from the rsa crate as PKCS#8.
    let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
        .context("generating RSA-2048 key")?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("encoding key as PKCS#8")?;
    let key_pair = KeyPair::from_pem(&key_pem).context("importing key into rcgen")?;

    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("building certificate params")?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, COMMON_NAME);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .context("self-signing certificate")?;

    if let Some(parent) = cert_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(cert_path, cert.pem())
        .with_context(|| format!("writing {}", cert_path.display()))?;
    std::fs::write(key_path, key_pem.as_bytes())
        .with_context(|| format!("writing {}", key_path.display()))?;

    info!(path = %cert_path.display(), "certificate written");
    Ok(())
}

/// Build the TLS acceptor for the chat listener. The pair is shared by every
/// accepted session.
pub fn tls_acceptor(pair: &CertPair) -> anyhow::Result<TlsAcceptor> {
    crate::proxy::init_crypto_provider();
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(pair.certs.clone(), pair.key.clone_key())
        .context("building TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let pair = load_or_generate(dir.path()).unwrap();
        assert!(!pair.certs.is_empty());
        assert!(dir.path().join(CERT_FILE).exists());
        assert!(dir.path().join(KEY_FILE).exists());

        // A second load must reuse the persisted pair, not regenerate.
        let first_pem = std::fs::read(dir.path().join(CERT_FILE)).unwrap();
        let again = load_or_generate(dir.path()).unwrap();
        let second_pem = std::fs::read(dir.path().join(CERT_FILE)).unwrap();
        assert_eq!(first_pem, second_pem);
        assert_eq!(pair.certs, again.certs);
    }

    #[test]
    fn test_corrupt_pem_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CERT_FILE), "garbage").unwrap();
        std::fs::write(dir.path().join(KEY_FILE), "garbage").unwrap();
        let pair = load_or_generate(dir.path()).unwrap();
        assert!(!pair.certs.is_empty());
    }

    #[test]
    fn test_acceptor_builds_from_generated_pair() {
        let dir = tempfile::tempdir().unwrap();
        let pair = load_or_generate(dir.path()).unwrap();
        assert!(tls_acceptor(&pair).is_ok());
    }

    #[test]
    fn test_key_is_rsa_pkcs8() {
        let dir = tempfile::tempdir().unwrap();
        load_or_generate(dir.path()).unwrap();
        let key_pem = std::fs::read_to_string(dir.path().join(KEY_FILE)).unwrap();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
    }
}

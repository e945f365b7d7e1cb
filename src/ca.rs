// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Per-SNI leaf certificate minting under a user-supplied root CA.

use anyhow::{anyhow, Context, Result};
use rcgen::{Certificate, CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::{Certificate as RustlsCertificate, PrivateKey};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::{debug, error, info};

const LEAF_VALIDITY_DAYS: i64 = 100;
const LEAF_ORGANIZATION: &str = "Json Pi";
const LEAF_COUNTRY: &str = "AU";

/// Holds the root CA and mints leaf certificates for intercepted server names.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    /// The CA certificate object used for signing leaves.
    ca_cert: Certificate,
    /// Minted certificates per server name. Unbounded for the process
    /// lifetime; hosts are few in dev use.
    cache: RwLock<HashMap<String, Arc<rustls::sign::CertifiedKey>>>,
}

impl CertificateAuthority {
    /// Load the root CA from PEM files (private key + certificate).
    pub async fn from_pem_files(key_path: &Path, cert_path: &Path) -> Result<Arc<Self>> {
        let key_pem = fs::read_to_string(key_path)
            .await
            .with_context(|| format!("failed to read CA key {}", key_path.display()))?;
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .with_context(|| format!("failed to read CA certificate {}", cert_path.display()))?;
        let ca = Self::from_pem(&key_pem, &cert_pem)?;
        info!(cert = %cert_path.display(), "root CA loaded");
        Ok(ca)
    }

    /// Load the root CA from PEM strings.
    pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Arc<Self>> {
        let key_pair = KeyPair::from_pem(key_pem).context("failed to parse CA key pair from PEM")?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .context("failed to parse CA certificate from PEM")?;
        let ca_cert =
            Certificate::from_params(params).context("failed to reconstruct CA certificate")?;

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem.to_string(),
            ca_cert,
            cache: RwLock::new(HashMap::new()),
        }))
    }

    /// The CA certificate in PEM form, for installing into client trust stores.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Return a certified key for the given server name, minting and caching
    /// one on first use. The leaf carries the name as both CommonName and
    /// SubjectAltName and is signed by the root CA.
    pub fn cert_for(&self, server_name: &str) -> Result<Arc<rustls::sign::CertifiedKey>> {
        {
            let cache = self.cache.read().unwrap();
            if let Some(ck) = cache.get(server_name) {
                return Ok(ck.clone());
            }
        }

        let certified = self.mint(server_name)?;
        debug!(%server_name, "minted leaf certificate");

        let mut cache = self.cache.write().unwrap();
        let entry = cache
            .entry(server_name.to_string())
            .or_insert(certified);
        Ok(entry.clone())
    }

    fn mint(&self, server_name: &str) -> Result<Arc<rustls::sign::CertifiedKey>> {
        let mut params = CertificateParams::new(vec![server_name.to_string()]);
        params
            .distinguished_name
            .push(DnType::CommonName, server_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, LEAF_ORGANIZATION);
        params
            .distinguished_name
            .push(DnType::CountryName, LEAF_COUNTRY);
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        // Timestamp serial: unique enough within a run.
        let millis = chrono::Utc::now().timestamp_millis() as u64;
        params.serial_number = Some(rcgen::SerialNumber::from(millis));
        params.alg = &PKCS_ECDSA_P256_SHA256;

        let cert = Certificate::from_params(params)
            .with_context(|| format!("failed to build leaf certificate for {server_name}"))?;
        let cert_pem = cert
            .serialize_pem_with_signer(&self.ca_cert)
            .context("failed to sign leaf certificate")?;
        let key_pem = cert.serialize_private_key_pem();

        let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .context("failed to parse minted certificate")?;
        let leaf_cert = certs
            .into_iter()
            .next()
            .map(RustlsCertificate)
            .ok_or_else(|| anyhow!("minted certificate PEM held no certificate"))?;

        let keys = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .context("failed to parse minted key")?;
        let leaf_key = keys
            .into_iter()
            .next()
            .map(PrivateKey)
            .ok_or_else(|| anyhow!("minted key PEM held no private key"))?;

        let signing_key = rustls::sign::any_supported_type(&leaf_key)
            .map_err(|_| anyhow!("unsupported leaf key type"))?;

        Ok(Arc::new(rustls::sign::CertifiedKey::new(
            vec![leaf_cert],
            signing_key,
        )))
    }
}

/// SNI-keyed certificate resolver for the internal TLS listener.
pub struct SniCertResolver {
    ca: Arc<CertificateAuthority>,
}

impl rustls::server::ResolvesServerCert for SniCertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let name = client_hello.server_name().unwrap_or("localhost");
        match self.ca.cert_for(name) {
            Ok(ck) => Some(ck),
            Err(e) => {
                error!(server_name = %name, error = %e, "certificate minting failed");
                None
            }
        }
    }
}

/// Server-side TLS config for the internal listener: SNI-minted certificates,
/// HTTP/1.1 only (h2 negotiation is rejected by omission).
pub fn server_config(ca: Arc<CertificateAuthority>) -> rustls::ServerConfig {
    let mut config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver { ca }));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

#[cfg(test)]
pub(crate) fn test_ca_pem() -> (String, String) {
    use rcgen::{BasicConstraints, DistinguishedName, IsCa};

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "devproxy test CA");
    params.alg = &PKCS_ECDSA_P256_SHA256;
    let cert = Certificate::from_params(params).expect("generate test CA");
    let cert_pem = cert.serialize_pem().expect("serialize test CA");
    let key_pem = cert.serialize_private_key_pem();
    (key_pem, cert_pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn from_pem_rejects_garbage() {
        assert!(CertificateAuthority::from_pem("not a key", "not a cert").is_err());
    }

    #[tokio::test]
    async fn from_pem_files_loads_ca() {
        let (key_pem, cert_pem) = test_ca_pem();
        let dir = std::env::temp_dir();
        let id = Uuid::new_v4();
        let key_path = dir.join(format!("devproxy_ca_{id}.key"));
        let cert_path = dir.join(format!("devproxy_ca_{id}.crt"));
        tokio::fs::write(&key_path, &key_pem).await.unwrap();
        tokio::fs::write(&cert_path, &cert_pem).await.unwrap();

        let ca = CertificateAuthority::from_pem_files(&key_path, &cert_path)
            .await
            .expect("load CA");
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));

        let _ = tokio::fs::remove_file(&key_path).await;
        let _ = tokio::fs::remove_file(&cert_path).await;
    }

    #[test]
    fn cert_for_mints_leaf() {
        let (key_pem, cert_pem) = test_ca_pem();
        let ca = CertificateAuthority::from_pem(&key_pem, &cert_pem).unwrap();

        let ck = ca.cert_for("example.com").expect("mint leaf");
        assert!(!ck.cert.is_empty());
    }

    #[test]
    fn cert_for_memoizes_per_name() {
        let (key_pem, cert_pem) = test_ca_pem();
        let ca = CertificateAuthority::from_pem(&key_pem, &cert_pem).unwrap();

        let first = ca.cert_for("example.com").unwrap();
        let second = ca.cert_for("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = ca.cert_for("other.example").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn server_config_offers_http1_only() {
        let (key_pem, cert_pem) = test_ca_pem();
        let ca = CertificateAuthority::from_pem(&key_pem, &cert_pem).unwrap();
        let config = server_config(ca);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}

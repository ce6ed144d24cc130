//! TLS-ALPN-01 challenge responses (RFC 8737)
//!
//! While a hostname is under validation, handshakes offering the `acme-tls/1`
//! protocol for it are answered with a throw-away self-signed certificate
//! carrying the SHA-256 digest of the key authorization in the
//! `id-pe-acmeIdentifier` extension. All other handshakes fall through.

use super::acme::AcmeError;
use dashmap::DashMap;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Validation certificates by hostname. Cloning shares the map.
#[derive(Debug, Clone, Default)]
pub struct AlpnChallengeResponder {
    certificates: Arc<DashMap<String, Arc<CertifiedKey>>>,
}

impl AlpnChallengeResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the validation certificate for `hostname` and start answering
    /// `acme-tls/1` handshakes for it. The certificate is built once here and
    /// reused for every validation handshake.
    pub fn register(&self, hostname: &str, key_authorization: &str) -> Result<(), AcmeError> {
        let certified = validation_certificate(hostname, key_authorization)?;
        tracing::debug!(hostname = %hostname, "Registering ACME TLS-ALPN-01 challenge");
        self.certificates
            .insert(hostname.to_ascii_lowercase(), Arc::new(certified));
        Ok(())
    }

    pub fn remove(&self, hostname: &str) {
        if self
            .certificates
            .remove(&hostname.to_ascii_lowercase())
            .is_some()
        {
            tracing::debug!(hostname = %hostname, "Removed ACME TLS-ALPN-01 challenge");
        }
    }

    /// Certificate for an `acme-tls/1` handshake, if `hostname` is under validation.
    pub fn resolve(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.certificates
            .get(&hostname.to_ascii_lowercase())
            .map(|entry| entry.value().clone())
    }

    pub fn pending_count(&self) -> usize {
        self.certificates.len()
    }
}

fn validation_certificate(
    hostname: &str,
    key_authorization: &str,
) -> Result<CertifiedKey, AcmeError> {
    let digest = Sha256::digest(key_authorization.as_bytes());

    let key_pair = KeyPair::generate().map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
    let mut params = CertificateParams::new(vec![hostname.to_string()])
        .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    params
        .custom_extensions
        .push(CustomExtension::new_acme_identifier(&digest));
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;

    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key =
        super::load_signing_key(key).map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
    Ok(CertifiedKey::new(vec![cert.der().clone()], signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";

    #[test]
    fn test_register_resolve_remove() {
        let responder = AlpnChallengeResponder::new();
        assert!(responder.resolve("example.com").is_none());

        responder.register("Example.com", "token.thumbprint").unwrap();
        assert!(responder.resolve("example.com").is_some());
        assert_eq!(responder.pending_count(), 1);

        responder.remove("example.com");
        assert!(responder.resolve("example.com").is_none());
        assert_eq!(responder.pending_count(), 0);
    }

    #[test]
    fn test_validation_certificate_carries_key_authorization_digest() {
        let responder = AlpnChallengeResponder::new();
        responder.register("example.com", "token.thumbprint").unwrap();
        let certified = responder.resolve("example.com").unwrap();

        let (_, cert) = X509Certificate::from_der(certified.cert[0].as_ref()).unwrap();
        let extension = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == ACME_IDENTIFIER_OID)
            .expect("acmeIdentifier extension");
        assert!(extension.critical);

        // OCTET STRING (0x04, len 32) wrapping the digest.
        let expected = Sha256::digest(b"token.thumbprint");
        assert_eq!(&extension.value[..2], &[0x04, 0x20]);
        assert_eq!(&extension.value[2..], expected.as_slice());

        let names: Vec<String> = cert
            .subject_alternative_name()
            .unwrap()
            .unwrap()
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["example.com".to_string()]);
    }

    #[test]
    fn test_responder_is_shared_between_clones() {
        let writer = AlpnChallengeResponder::new();
        let reader = writer.clone();
        writer.register("a.example.com", "t.k").unwrap();
        assert!(reader.resolve("a.example.com").is_some());
    }
}

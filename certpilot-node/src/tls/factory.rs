//! Certificate factory - turns a ready order into a `ManagedCertificate`

use super::acme::{AcmeError, CertificateAuthority, OrderStatus};
use super::retry::{self, Backoff, retry_transient};
use certpilot_core::{Clock, HostnameSet, ManagedCertificate};
use rcgen::{CertificateParams, DistinguishedName, KeyPair, SignatureAlgorithm};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Key type of issued certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

impl KeyAlgorithm {
    fn signature_algorithm(&self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }

    pub fn generate(&self) -> Result<KeyPair, AcmeError> {
        KeyPair::generate_for(self.signature_algorithm())
            .map_err(|e| AcmeError::KeyGeneration(e.to_string()))
    }
}

/// A fresh key pair and the CSR signed with it.
pub struct CertificateRequest {
    pub private_key_pem: String,
    pub csr_der: Vec<u8>,
}

pub struct CertificateFactory {
    key_algorithm: KeyAlgorithm,
    clock: Arc<dyn Clock>,
    order_timeout: Duration,
}

impl CertificateFactory {
    pub fn new(
        key_algorithm: KeyAlgorithm,
        clock: Arc<dyn Clock>,
        order_timeout: Duration,
    ) -> Self {
        Self {
            key_algorithm,
            clock,
            order_timeout,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn request(&self, hostnames: &HostnameSet) -> Result<CertificateRequest, AcmeError> {
        let key = self.key_algorithm.generate()?;
        let mut params =
            CertificateParams::new(hostnames.to_vec()).map_err(|e| AcmeError::Csr(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(&key)
            .map_err(|e| AcmeError::Csr(e.to_string()))?;

        Ok(CertificateRequest {
            private_key_pem: key.serialize_pem(),
            csr_der: csr.der().to_vec(),
        })
    }

    /// Finalize a `ready` order, wait for it to become `valid` and download
    /// the chain.
    ///
    /// Nothing is returned unless the whole sequence completed; a cancelled
    /// run yields `AcmeError::Cancelled` and no certificate.
    pub async fn issue<A: CertificateAuthority>(
        &self,
        authority: &A,
        order: &mut A::OrderHandle,
        hostnames: &HostnameSet,
        cancel: &CancellationToken,
    ) -> Result<ManagedCertificate, AcmeError> {
        let request = self.request(hostnames)?;

        retry_transient!(
            cancel,
            "finalize",
            authority.finalize(order, &request.csr_der)
        )?;
        tracing::debug!(hostnames = %hostnames, "Order finalized, waiting for certificate");

        let deadline = Instant::now() + self.order_timeout;
        let mut backoff = Backoff::polling();
        let mut last = OrderStatus::Processing;
        loop {
            match retry::cancellable(cancel, authority.refresh(order)).await {
                Ok(state) => {
                    last = state.status;
                    match state.status {
                        OrderStatus::Valid => break,
                        OrderStatus::Invalid => {
                            return Err(AcmeError::OrderInvalid { stage: "finalizing" });
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Transient error polling order");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(AcmeError::OrderTimeout {
                    expected: OrderStatus::Valid,
                    last,
                });
            }
            retry::sleep(cancel, backoff.next_delay()).await?;
        }

        let chain_pem = loop {
            match retry_transient!(cancel, "certificate", authority.certificate(order))? {
                Some(chain) => break chain,
                None if Instant::now() >= deadline => return Err(AcmeError::CertificateUnavailable),
                None => retry::sleep(cancel, backoff.next_delay()).await?,
            }
        };

        let certificate = ManagedCertificate::from_pem(
            hostnames.clone(),
            &chain_pem,
            &request.private_key_pem,
            self.clock.now(),
        )?;
        Ok(certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certpilot_core::SystemClock;
    use x509_parser::prelude::*;

    fn factory(key_algorithm: KeyAlgorithm) -> CertificateFactory {
        CertificateFactory::new(key_algorithm, Arc::new(SystemClock), Duration::from_secs(5))
    }

    #[test]
    fn test_csr_covers_every_hostname() {
        let hostnames = HostnameSet::new(["example.com", "www.example.com"]).unwrap();
        let request = factory(KeyAlgorithm::EcdsaP256).request(&hostnames).unwrap();
        assert!(request.private_key_pem.contains("PRIVATE KEY"));

        let (_, csr) = X509CertificationRequest::from_der(&request.csr_der).unwrap();
        let mut names = Vec::new();
        for ext in csr.requested_extensions().into_iter().flatten() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        names.push(dns.to_string());
                    }
                }
            }
        }
        names.sort();
        assert_eq!(names, vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_every_key_algorithm_generates() {
        let hostnames = HostnameSet::new(["example.com"]).unwrap();
        for algorithm in [
            KeyAlgorithm::EcdsaP256,
            KeyAlgorithm::EcdsaP384,
            KeyAlgorithm::Ed25519,
        ] {
            assert!(factory(algorithm).request(&hostnames).is_ok(), "{algorithm:?}");
        }
    }

    #[test]
    fn test_key_algorithm_config_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            key_algorithm: KeyAlgorithm,
        }
        let parsed: Wrapper = toml::from_str(r#"key_algorithm = "ecdsa-p384""#).unwrap();
        assert_eq!(parsed.key_algorithm, KeyAlgorithm::EcdsaP384);
        assert_eq!(KeyAlgorithm::default(), KeyAlgorithm::EcdsaP256);
    }
}

//! SNI-based certificate selection for TLS
//!
//! The selector maps hostnames to the most recently added certificate that
//! covers them. `AcmeCertResolver` plugs it into rustls, routing `acme-tls/1`
//! handshakes to the TLS-ALPN-01 responder first.

use super::alpn::{ACME_TLS_ALPN_NAME, AlpnChallengeResponder};
use certpilot_core::{Clock, HostnameSet, ManagedCertificate};
use dashmap::DashMap;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("Certificate for {0} has already expired")]
    Expired(String),

    #[error("Failed to load private key: {0}")]
    Key(String),
}

#[derive(Debug)]
struct SelectedCertificate {
    certificate: ManagedCertificate,
    certified_key: Arc<CertifiedKey>,
}

/// Hostname -> certificate, last write wins.
///
/// Certificates are also indexed by the exact set they were issued for, so
/// overlapping sets never shadow each other's renewal decisions.
#[derive(Debug)]
pub struct CertificateSelector {
    entries: DashMap<String, Arc<SelectedCertificate>>,
    by_set: DashMap<HostnameSet, Arc<SelectedCertificate>>,
    clock: Arc<dyn Clock>,
}

impl CertificateSelector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            by_set: DashMap::new(),
            clock,
        }
    }

    /// Make `certificate` the answer for every hostname it was issued for.
    ///
    /// Expired certificates are refused so they can never be served.
    pub fn add(&self, certificate: &ManagedCertificate) -> Result<(), SelectorError> {
        if certificate.is_expired_at(self.clock.now()) {
            return Err(SelectorError::Expired(certificate.hostnames().to_string()));
        }

        let selected = Arc::new(SelectedCertificate {
            certificate: certificate.clone(),
            certified_key: Arc::new(certified_key(certificate)?),
        });
        for hostname in certificate.hostnames().iter() {
            self.entries.insert(hostname.to_string(), selected.clone());
        }
        self.by_set.insert(certificate.hostnames().clone(), selected);

        tracing::debug!(
            hostnames = %certificate.hostnames(),
            not_after = ?certificate.not_after(),
            "Certificate added to selector"
        );
        Ok(())
    }

    /// Key for a TLS handshake on `hostname`, falling back to a wildcard.
    pub fn select(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.lookup(hostname)
            .map(|selected| selected.certified_key.clone())
    }

    pub fn certificate_for(&self, hostname: &str) -> Option<ManagedCertificate> {
        self.lookup(hostname)
            .map(|selected| selected.certificate.clone())
    }

    /// The held certificate covering every name of `hostnames`, if any.
    ///
    /// A certificate issued for exactly this set wins; otherwise whatever
    /// serves the primary name counts when it covers the whole set.
    pub fn certificate_for_set(&self, hostnames: &HostnameSet) -> Option<ManagedCertificate> {
        let now = self.clock.now();
        let exact = self.by_set.get(hostnames).map(|e| e.value().clone());
        if let Some(selected) = exact
            && !selected.certificate.is_expired_at(now)
        {
            return Some(selected.certificate.clone());
        }

        let certificate = self.certificate_for(hostnames.primary())?;
        hostnames
            .iter()
            .all(|hostname| certificate.covers(hostname))
            .then_some(certificate)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, hostname: &str) -> Option<Arc<SelectedCertificate>> {
        let host = hostname.trim_end_matches('.').to_ascii_lowercase();
        let now = self.clock.now();

        // Try exact match first
        let exact = self.entries.get(&host).map(|e| e.value().clone());
        if let Some(selected) = exact
            && !selected.certificate.is_expired_at(now)
        {
            return Some(selected);
        }

        // Try wildcard match
        let (_, parent) = host.split_once('.')?;
        let wildcard = format!("*.{}", parent);
        let selected = self.entries.get(&wildcard).map(|e| e.value().clone())?;
        (!selected.certificate.is_expired_at(now)).then_some(selected)
    }
}

fn certified_key(certificate: &ManagedCertificate) -> Result<CertifiedKey, SelectorError> {
    let chain: Vec<CertificateDer<'static>> = certificate
        .chain()
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();

    let key = rustls_pemfile::private_key(&mut certificate.private_key_pem().as_bytes())
        .map_err(|e| SelectorError::Key(e.to_string()))?
        .ok_or_else(|| SelectorError::Key("no private key in PEM".to_string()))?;
    let signing_key = super::load_signing_key(key).map_err(|e| SelectorError::Key(e.to_string()))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// rustls certificate callback: TLS-ALPN-01 validation first, then the selector.
#[derive(Debug)]
pub struct AcmeCertResolver {
    alpn: AlpnChallengeResponder,
    selector: Arc<CertificateSelector>,
}

impl AcmeCertResolver {
    pub fn new(alpn: AlpnChallengeResponder, selector: Arc<CertificateSelector>) -> Self {
        Self { alpn, selector }
    }

    pub fn resolve_for(&self, server_name: &str, acme_tls: bool) -> Option<Arc<CertifiedKey>> {
        if acme_tls {
            let validation = self.alpn.resolve(server_name);
            if validation.is_none() {
                tracing::warn!(
                    hostname = %server_name,
                    "No TLS-ALPN-01 challenge pending for hostname"
                );
            }
            return validation;
        }

        let selected = self.selector.select(server_name);
        if selected.is_none() {
            tracing::warn!(
                hostname = %server_name,
                "No certificate found for hostname, TLS handshake will fail"
            );
        }
        selected
    }
}

impl ResolvesServerCert for AcmeCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let acme_tls = client_hello
            .alpn()
            .is_some_and(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_NAME));
        let Some(server_name) = client_hello.server_name() else {
            tracing::warn!("No SNI hostname in TLS handshake");
            return None;
        };
        self.resolve_for(server_name, acme_tls)
    }
}

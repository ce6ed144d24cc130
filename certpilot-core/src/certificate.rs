//! Managed certificates and the hostname sets they cover

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use x509_parser::prelude::*;

/// Errors raised while building hostname sets or parsing certificates
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Hostname set must not be empty")]
    NoHostnames,

    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("Certificate chain is empty")]
    EmptyChain,

    #[error("No private key found in PEM data")]
    MissingKey,

    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    #[error("Certificate validity window is inverted (notAfter <= notBefore)")]
    InvalidValidity,

    #[error("Certificate does not cover hostname: {0}")]
    HostnameNotCovered(String),
}

/// A normalized, non-empty set of DNS names issued together on one certificate.
///
/// Names are lowercased and stripped of a trailing dot, so `Example.COM.` and
/// `example.com` are the same member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct HostnameSet(BTreeSet<String>);

impl HostnameSet {
    pub fn new<I, S>(names: I) -> Result<Self, CertificateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for name in names {
            let normalized = normalize_hostname(name.as_ref())?;
            set.insert(normalized);
        }
        if set.is_empty() {
            return Err(CertificateError::NoHostnames);
        }
        Ok(Self(set))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.0.contains(&hostname.trim_end_matches('.').to_ascii_lowercase())
    }

    /// First name in sort order; used to label logs and storage entries.
    pub fn primary(&self) -> &str {
        // Construction guarantees at least one member.
        self.0.iter().next().map(String::as_str).unwrap_or_default()
    }

    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(|name| name.starts_with("*."))
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    /// Stable, filesystem-safe key identifying this exact set of names.
    ///
    /// Example: `example.com-3f1a09c2`
    pub fn storage_key(&self) -> String {
        let stem: String = self
            .primary()
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '.' | '-' => c,
                _ => '_',
            })
            .collect();

        let mut hasher = Sha256::new();
        for name in &self.0 {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        format!("{}-{}", stem, hex::encode(&digest[..4]))
    }
}

impl fmt::Display for HostnameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().collect();
        f.write_str(&names.join(","))
    }
}

impl TryFrom<Vec<String>> for HostnameSet {
    type Error = CertificateError;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(names)
    }
}

impl From<HostnameSet> for Vec<String> {
    fn from(set: HostnameSet) -> Self {
        set.0.into_iter().collect()
    }
}

fn normalize_hostname(raw: &str) -> Result<String, CertificateError> {
    let name = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() || name.len() > 253 {
        return Err(CertificateError::InvalidHostname(raw.to_string()));
    }

    let labels = name.strip_prefix("*.").unwrap_or(&name);
    for label in labels.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(CertificateError::InvalidHostname(raw.to_string()));
        }
    }

    Ok(name)
}

/// An issued certificate chain together with its private key.
///
/// Immutable once built: a renewal produces a new instance for the same
/// hostnames rather than mutating this one.
#[derive(Clone)]
pub struct ManagedCertificate {
    hostnames: HostnameSet,
    private_key_pem: String,
    chain_pem: String,
    chain: Vec<Vec<u8>>,
    not_before: SystemTime,
    not_after: SystemTime,
    issued_at: SystemTime,
}

impl ManagedCertificate {
    /// Build from a PEM chain (leaf first) and a PEM private key.
    ///
    /// Validates that the chain is non-empty, the leaf validity window is not
    /// inverted and the leaf covers every requested hostname.
    pub fn from_pem(
        hostnames: HostnameSet,
        chain_pem: &str,
        private_key_pem: &str,
        issued_at: SystemTime,
    ) -> Result<Self, CertificateError> {
        let mut chain = Vec::new();
        for pem in Pem::iter_from_buffer(chain_pem.as_bytes()) {
            let pem = pem.map_err(|e| CertificateError::Parse(e.to_string()))?;
            if pem.label == "CERTIFICATE" {
                chain.push(pem.contents);
            }
        }
        if chain.is_empty() {
            return Err(CertificateError::EmptyChain);
        }

        let has_key = Pem::iter_from_buffer(private_key_pem.as_bytes())
            .flatten()
            .any(|pem| pem.label.ends_with("PRIVATE KEY"));
        if !has_key {
            return Err(CertificateError::MissingKey);
        }

        let (not_before, not_after, names) = {
            let (_, leaf) = X509Certificate::from_der(&chain[0])
                .map_err(|e| CertificateError::Parse(e.to_string()))?;
            let validity = leaf.validity();
            (
                system_time_from_unix(validity.not_before.timestamp()),
                system_time_from_unix(validity.not_after.timestamp()),
                leaf_dns_names(&leaf)?,
            )
        };

        if not_after <= not_before {
            return Err(CertificateError::InvalidValidity);
        }

        for hostname in hostnames.iter() {
            if !names.iter().any(|san| hostname_matches(san, hostname)) {
                return Err(CertificateError::HostnameNotCovered(hostname.to_string()));
            }
        }

        Ok(Self {
            hostnames,
            private_key_pem: private_key_pem.to_string(),
            chain_pem: chain_pem.to_string(),
            chain,
            not_before,
            not_after,
            issued_at,
        })
    }

    pub fn hostnames(&self) -> &HostnameSet {
        &self.hostnames
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    /// DER-encoded certificates, leaf first.
    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn lifetime(&self) -> Duration {
        self.not_after
            .duration_since(self.not_before)
            .unwrap_or_default()
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.not_after
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        self.not_after.duration_since(now).unwrap_or_default()
    }

    /// Whether this certificate was issued for `hostname`, directly or via a
    /// wildcard member.
    pub fn covers(&self, hostname: &str) -> bool {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        self.hostnames
            .iter()
            .any(|name| hostname_matches(name, &hostname))
    }
}

impl fmt::Debug for ManagedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCertificate")
            .field("hostnames", &self.hostnames)
            .field("chain_len", &self.chain.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

fn leaf_dns_names(leaf: &X509Certificate<'_>) -> Result<Vec<String>, CertificateError> {
    let mut names = Vec::new();
    let san = leaf
        .subject_alternative_name()
        .map_err(|e| CertificateError::Parse(e.to_string()))?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }

    if names.is_empty()
        && let Some(cn) = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
    {
        names.push(cn.to_ascii_lowercase());
    }

    Ok(names)
}

/// Match `hostname` against a certificate name, honoring a single leading
/// wildcard label.
fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    if pattern == hostname {
        return true;
    }
    match (pattern.strip_prefix("*."), hostname.split_once('.')) {
        (Some(suffix), Some((label, rest))) => !label.is_empty() && rest == suffix,
        _ => false,
    }
}

fn system_time_from_unix(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

//! Shared certificate store
//!
//! Masters publish every issued certificate here; every node loads from it at
//! startup and followers keep polling it. The authoritative record per
//! hostname set is `<root>/<storage key>/certificate.json`, replaced by an
//! atomic rename so a reader never observes a half-written bundle.
//! `fullchain.pem` and `privkey.pem` are written alongside for other tools.

use super::selector::CertificateSelector;
use async_trait::async_trait;
use certpilot_core::{CertificateError, HostnameSet, ManagedCertificate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const BUNDLE_FILE: &str = "certificate.json";
const CHAIN_FILE: &str = "fullchain.pem";
const KEY_FILE: &str = "privkey.pem";

/// Errors that can occur while reading or writing the certificate store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid certificate bundle: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid certificate in store: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Certificate source timed out after {0:?}")]
    Timeout(Duration),

    #[error("Certificate load cancelled")]
    Cancelled,
}

/// Where certificates come from at startup (and, for followers, afterwards).
#[async_trait]
pub trait CertificateSource: Send + Sync {
    fn name(&self) -> &str;

    async fn certificates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ManagedCertificate>, StoreError>;
}

/// Where a master publishes finished certificates for its followers.
#[async_trait]
pub trait CertificateSink: Send + Sync {
    async fn publish(&self, certificate: &ManagedCertificate) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CertificateBundle {
    hostnames: HostnameSet,
    chain_pem: String,
    private_key_pem: String,
    issued_at: u64,
    published_at: u64,
    published_by: String,
}

/// File-system store, typically on a volume shared by the node pool.
#[derive(Debug, Clone)]
pub struct DirectoryCertificateStore {
    root: PathBuf,
    node_name: String,
}

impl DirectoryCertificateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let node_name = hostname::get()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            root: root.into(),
            node_name,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_dir(&self, hostnames: &HostnameSet) -> PathBuf {
        self.root.join(hostnames.storage_key())
    }

    /// The stored certificate for exactly this hostname set.
    pub async fn load(
        &self,
        hostnames: &HostnameSet,
    ) -> Result<Option<ManagedCertificate>, StoreError> {
        let path = self.set_dir(hostnames).join(BUNDLE_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(parse_bundle(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CertificateSource for DirectoryCertificateStore {
    fn name(&self) -> &str {
        "directory"
    }

    async fn certificates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ManagedCertificate>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut certificates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let path = entry.path().join(BUNDLE_FILE);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match parse_bundle(&bytes) {
                Ok(certificate) => certificates.push(certificate),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable certificate bundle"
                    );
                }
            }
        }
        Ok(certificates)
    }
}

#[async_trait]
impl CertificateSink for DirectoryCertificateStore {
    async fn publish(&self, certificate: &ManagedCertificate) -> Result<(), StoreError> {
        let dir = self.set_dir(certificate.hostnames());
        tokio::fs::create_dir_all(&dir).await?;

        let bundle = CertificateBundle {
            hostnames: certificate.hostnames().clone(),
            chain_pem: certificate.chain_pem().to_string(),
            private_key_pem: certificate.private_key_pem().to_string(),
            issued_at: unix_secs(certificate.issued_at()),
            published_at: unix_secs(SystemTime::now()),
            published_by: self.node_name.clone(),
        };

        write_atomic(&dir.join(CHAIN_FILE), certificate.chain_pem().as_bytes(), 0o644).await?;
        write_atomic(&dir.join(KEY_FILE), certificate.private_key_pem().as_bytes(), 0o600).await?;
        // The bundle goes last: readers only trust it, and it must never point
        // at a chain/key pair that is not on disk yet.
        write_atomic(&dir.join(BUNDLE_FILE), &serde_json::to_vec_pretty(&bundle)?, 0o600).await?;

        tracing::info!(
            hostnames = %certificate.hostnames(),
            dir = %dir.display(),
            "Published certificate to shared store"
        );
        Ok(())
    }
}

fn parse_bundle(bytes: &[u8]) -> Result<ManagedCertificate, StoreError> {
    let bundle: CertificateBundle = serde_json::from_slice(bytes)?;
    let certificate = ManagedCertificate::from_pem(
        bundle.hostnames,
        &bundle.chain_pem,
        &bundle.private_key_pem,
        UNIX_EPOCH + Duration::from_secs(bundle.issued_at),
    )?;
    Ok(certificate)
}

async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Hand `certificate` to the selector unless it already holds one for the
/// same hostnames that lasts at least as long.
fn offer(selector: &CertificateSelector, certificate: &ManagedCertificate) -> bool {
    if let Some(held) = selector.certificate_for_set(certificate.hostnames())
        && held.not_after() >= certificate.not_after()
    {
        return false;
    }
    match selector.add(certificate) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                hostnames = %certificate.hostnames(),
                error = %e,
                "Certificate not loaded"
            );
            false
        }
    }
}

/// Startup load of pre-existing certificates into the selector.
pub struct StartupCertificateLoader {
    sources: Vec<Arc<dyn CertificateSource>>,
    selector: Arc<CertificateSelector>,
    timeout: Duration,
}

impl StartupCertificateLoader {
    pub fn new(
        sources: Vec<Arc<dyn CertificateSource>>,
        selector: Arc<CertificateSelector>,
        timeout: Duration,
    ) -> Self {
        Self {
            sources,
            selector,
            timeout,
        }
    }

    /// Load every source within one shared deadline. A slow or failing source
    /// is logged and skipped; whatever loaded before it stays loaded.
    pub async fn load(&self, cancel: &CancellationToken) -> usize {
        let deadline = Instant::now() + self.timeout;
        let mut loaded = 0;

        for source in &self.sources {
            let child = cancel.child_token();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(StoreError::Cancelled),
                result = tokio::time::timeout_at(deadline, source.certificates(&child)) => {
                    result.unwrap_or(Err(StoreError::Timeout(self.timeout)))
                }
            };
            child.cancel();

            match result {
                Ok(certificates) => {
                    for certificate in &certificates {
                        if offer(&self.selector, certificate) {
                            loaded += 1;
                        }
                    }
                    tracing::info!(
                        source = source.name(),
                        found = certificates.len(),
                        "Loaded certificates from source"
                    );
                }
                Err(StoreError::Cancelled) => break,
                Err(e) => {
                    tracing::error!(
                        source = source.name(),
                        error = %e,
                        "Failed to load certificates, continuing without them"
                    );
                }
            }
        }
        loaded
    }
}

/// Follower poller: re-reads the shared source and picks up renewals.
pub struct CertificateRefresher {
    source: Arc<dyn CertificateSource>,
    selector: Arc<CertificateSelector>,
    interval: Duration,
}

impl CertificateRefresher {
    pub fn new(
        source: Arc<dyn CertificateSource>,
        selector: Arc<CertificateSelector>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            selector,
            interval,
        }
    }

    /// Returns how many certificates replaced (or filled) a selector entry.
    pub async fn refresh_once(&self, cancel: &CancellationToken) -> Result<usize, StoreError> {
        let certificates = self.source.certificates(cancel).await?;
        let mut updated = 0;
        for certificate in &certificates {
            if offer(&self.selector, certificate) {
                tracing::info!(
                    hostnames = %certificate.hostnames(),
                    "Picked up certificate from shared store"
                );
                updated += 1;
            }
        }
        Ok(updated)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Starting shared store refresher"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.refresh_once(&cancel).await {
                tracing::warn!(
                    source = self.source.name(),
                    error = %e,
                    "Shared store refresh failed"
                );
            }
        }
        tracing::info!("Shared store refresher stopped");
    }
}

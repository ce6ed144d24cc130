//! ACME protocol driver
//!
//! `CertificateAuthority` is the seam between the lifecycle engine and the
//! authority. Production uses `InstantAcmeAuthority` (instant-acme, RFC 8555
//! with JWS signing and nonce handling); tests substitute a scripted authority.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use certpilot_core::{CertificateError, HostnameSet};
use instant_acme::{
    Account, AccountBuilder, AccountCredentials, ChallengeType, ExternalAccountKey, HttpClient,
    Identifier, NewAccount, NewOrder,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::OnceCell;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const PROBLEM_PREFIX: &str = "urn:ietf:params:acme:error:";

/// Where a failure sits in the lifecycle's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeouts, 5xx, connection resets. Retried with backoff.
    TransientNetwork,
    /// Invalid identifier, policy violation, rate limit.
    AuthorityRejected,
    /// A challenge resolved to invalid.
    ValidationFailed,
    /// Key generation, CSR construction, local I/O.
    LocalResource,
    Configuration,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::AuthorityRejected => "authority_rejected",
            FailureKind::ValidationFailed => "validation_failed",
            FailureKind::LocalResource => "local_resource",
            FailureKind::Configuration => "configuration",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Terms of service must be accepted before registering an ACME account")]
    TermsNotAccepted,

    #[error("Invalid external account binding key: {0}")]
    InvalidExternalAccountKey(String),

    #[error("Authority unavailable: {0}")]
    Transient(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authority rejected request ({problem}): {detail}")]
    Rejected { problem: String, detail: String },

    #[error("No {kind} challenge offered for {hostname}")]
    ChallengeUnavailable { hostname: String, kind: ChallengeKind },

    #[error("Authorization for {hostname} not present in order")]
    UnknownAuthorization { hostname: String },

    #[error("Validation failed for {hostname}")]
    ValidationFailed { hostname: String },

    #[error("Timed out waiting for authorization of {hostname}")]
    AuthorizationTimeout { hostname: String },

    #[error("Order became invalid while {stage}")]
    OrderInvalid { stage: &'static str },

    #[error("Timed out waiting for order to become {expected} (last status: {last})")]
    OrderTimeout {
        expected: OrderStatus,
        last: OrderStatus,
    },

    #[error("Order is valid but no certificate is available")]
    CertificateUnavailable,

    #[error("Issued certificate rejected: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    #[error("CSR construction error: {0}")]
    Csr(String),

    #[error("Account credentials error: {0}")]
    Credentials(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl AcmeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AcmeError::TermsNotAccepted | AcmeError::InvalidExternalAccountKey(_) => {
                FailureKind::Configuration
            }
            AcmeError::Transient(_) | AcmeError::OrderTimeout { .. } => {
                FailureKind::TransientNetwork
            }
            AcmeError::RateLimited(_)
            | AcmeError::Rejected { .. }
            | AcmeError::ChallengeUnavailable { .. }
            | AcmeError::UnknownAuthorization { .. }
            | AcmeError::OrderInvalid { .. }
            | AcmeError::CertificateUnavailable
            | AcmeError::Certificate(_) => FailureKind::AuthorityRejected,
            AcmeError::ValidationFailed { .. } | AcmeError::AuthorizationTimeout { .. } => {
                FailureKind::ValidationFailed
            }
            AcmeError::KeyGeneration(_)
            | AcmeError::Csr(_)
            | AcmeError::Credentials(_)
            | AcmeError::Io(_) => FailureKind::LocalResource,
            AcmeError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether a single authority call may be retried in place.
    ///
    /// Rate limits (HTTP 429) get the same bounded in-call retry as network
    /// failures; if they persist the attempt is aborted as authority-rejected.
    pub fn is_transient(&self) -> bool {
        matches!(self, AcmeError::Transient(_) | AcmeError::RateLimited(_))
    }

    fn from_problem(status: Option<u16>, problem_type: Option<&str>, detail: Option<&str>) -> Self {
        let problem = problem_type
            .map(|t| t.strip_prefix(PROBLEM_PREFIX).unwrap_or(t))
            .unwrap_or("unknown")
            .to_string();
        let detail = detail.unwrap_or("no detail").to_string();

        if status == Some(429) || problem == "rateLimited" {
            return AcmeError::RateLimited(detail);
        }
        if status.is_some_and(|s| s >= 500) || problem == "serverInternal" || problem == "badNonce"
        {
            return AcmeError::Transient(format!("{problem}: {detail}"));
        }
        AcmeError::Rejected { problem, detail }
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(err: instant_acme::Error) -> Self {
        match err {
            instant_acme::Error::Api(problem) => AcmeError::from_problem(
                problem.status,
                problem.r#type.as_deref(),
                problem.detail.as_deref(),
            ),
            other => AcmeError::Transient(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeKind {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeKind::Http01 => f.write_str("http-01"),
            ChallengeKind::TlsAlpn01 => f.write_str("tls-alpn-01"),
        }
    }
}

impl From<ChallengeKind> for ChallengeType {
    fn from(kind: ChallengeKind) -> Self {
        match kind {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::TlsAlpn01 => ChallengeType::TlsAlpn01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    /// Invalid, revoked, expired or deactivated; all end the order.
    Invalid,
}

impl AuthorizationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuthorizationStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub token: String,
    pub status: ChallengeStatus,
    pub url: String,
    /// `token || '.' || base64url(account key thumbprint)`
    pub key_authorization: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub hostname: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    pub fn challenge(&self, kind: ChallengeKind) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == kind)
    }
}

/// Authority-side view of an order after a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub status: OrderStatus,
    pub finalize_url: String,
    pub certificate_url: Option<String>,
}

/// Persisted metadata of a registered account. The key itself lives in the
/// credentials file next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeAccount {
    pub directory_url: String,
    pub account_url: String,
    pub created_timestamp: u64,
}

/// Stateless protocol driver.
///
/// `OrderHandle` is owned by exactly one lifecycle run and dropped when it ends.
#[async_trait]
pub trait CertificateAuthority: Send + Sync + 'static {
    type OrderHandle: Send;

    /// Load or register the account. Idempotent.
    async fn ensure_account(&self) -> Result<AcmeAccount, AcmeError>;

    async fn new_order(&self, hostnames: &HostnameSet) -> Result<Self::OrderHandle, AcmeError>;

    /// Fetch the current state of every authorization of the order.
    async fn authorizations(
        &self,
        order: &mut Self::OrderHandle,
    ) -> Result<Vec<Authorization>, AcmeError>;

    async fn set_challenge_ready(
        &self,
        order: &mut Self::OrderHandle,
        hostname: &str,
        kind: ChallengeKind,
    ) -> Result<(), AcmeError>;

    async fn refresh(&self, order: &mut Self::OrderHandle) -> Result<Order, AcmeError>;

    async fn finalize(&self, order: &mut Self::OrderHandle, csr_der: &[u8])
    -> Result<(), AcmeError>;

    /// Download the PEM chain; `None` while the authority is still processing.
    async fn certificate(&self, order: &mut Self::OrderHandle)
    -> Result<Option<String>, AcmeError>;
}

#[derive(Debug, Clone)]
pub struct ExternalAccountBinding {
    pub key_id: String,
    /// base64url-encoded HMAC key as handed out by the authority.
    pub hmac_key: String,
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    /// Contact email for ACME account
    pub email: Option<String>,
    pub accept_terms_of_service: bool,
    /// Directory to store ACME account credentials
    pub account_dir: PathBuf,
    pub external_account: Option<ExternalAccountBinding>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            email: None,
            accept_terms_of_service: false,
            account_dir: PathBuf::from("/var/lib/certpilot/acme"),
            external_account: None,
        }
    }
}

impl AcmeConfig {
    pub fn is_staging(&self) -> bool {
        self.directory_url == LETS_ENCRYPT_STAGING
    }

    /// Credentials are kept per authority so switching directories never
    /// reuses a key registered elsewhere.
    fn credentials_path(&self) -> PathBuf {
        self.account_dir
            .join(format!("credentials-{}.json", directory_slug(&self.directory_url)))
    }

    fn account_path(&self) -> PathBuf {
        self.account_dir
            .join(format!("account-{}.json", directory_slug(&self.directory_url)))
    }
}

fn directory_slug(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

type HttpClientFactory = Arc<dyn Fn() -> Box<dyn HttpClient> + Send + Sync>;

/// Production driver backed by instant-acme.
pub struct InstantAcmeAuthority {
    config: AcmeConfig,
    http: Option<HttpClientFactory>,
    account: OnceCell<(Account, AcmeAccount)>,
}

impl InstantAcmeAuthority {
    pub fn new(config: AcmeConfig) -> Self {
        Self {
            config,
            http: None,
            account: OnceCell::new(),
        }
    }

    /// Talk to the authority through clients built by `http` instead of the
    /// default HTTPS client with the platform trust store.
    pub fn with_http_client<F>(mut self, http: F) -> Self
    where
        F: Fn() -> Box<dyn HttpClient> + Send + Sync + 'static,
    {
        self.http = Some(Arc::new(http));
        self
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    fn account_builder(&self) -> Result<AccountBuilder, AcmeError> {
        match &self.http {
            Some(http) => Ok(Account::builder_with_http(http())),
            None => Ok(Account::builder()?),
        }
    }

    /// Registration happens at most once per process; concurrent callers
    /// wait on the same initialization.
    async fn registered(&self) -> Result<&(Account, AcmeAccount), AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create())
            .await
    }

    /// Restore the stored account, registering a new one only when none is
    /// stored.
    ///
    /// Failing to reach the authority is returned as is, leaving the stored
    /// credentials untouched for the next attempt. Credentials that cannot be
    /// parsed are moved aside to `<file>.corrupt` before registering.
    async fn load_or_create(&self) -> Result<(Account, AcmeAccount), AcmeError> {
        tokio::fs::create_dir_all(&self.config.account_dir).await?;
        let credentials_path = self.config.credentials_path();

        match tokio::fs::read(&credentials_path).await {
            Ok(contents) => match serde_json::from_slice::<AccountCredentials>(&contents) {
                Ok(credentials) => {
                    let loaded = self.restore_account(credentials).await?;
                    tracing::info!(account = %loaded.1.account_url, "Loaded existing ACME account");
                    return Ok(loaded);
                }
                Err(e) => {
                    let quarantine = corrupt_path(&credentials_path);
                    tracing::warn!(
                        error = %e,
                        moved_to = %quarantine.display(),
                        "Stored ACME credentials are unreadable, registering a new account"
                    );
                    tokio::fs::rename(&credentials_path, &quarantine).await?;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let (account, credentials) = self.create_account().await?;
        let metadata = AcmeAccount {
            directory_url: self.config.directory_url.clone(),
            account_url: account.id().to_string(),
            created_timestamp: unix_now(),
        };

        // Another process may have registered in the meantime; its account wins.
        match write_new_file(&credentials_path, &serde_json::to_vec_pretty(&credentials)?) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::info!("ACME account registered concurrently, using the stored one");
                return self.load_account(&credentials_path).await;
            }
            Err(e) => return Err(e.into()),
        }
        std::fs::write(
            self.config.account_path(),
            serde_json::to_vec_pretty(&metadata)?,
        )?;

        tracing::info!(
            staging = self.config.is_staging(),
            id = %metadata.account_url,
            "Created new ACME account"
        );
        Ok((account, metadata))
    }

    async fn load_account(&self, path: &Path) -> Result<(Account, AcmeAccount), AcmeError> {
        let contents = tokio::fs::read(path).await?;
        let credentials: AccountCredentials = serde_json::from_slice(&contents)?;
        self.restore_account(credentials).await
    }

    async fn restore_account(
        &self,
        credentials: AccountCredentials,
    ) -> Result<(Account, AcmeAccount), AcmeError> {
        let account = self
            .account_builder()?
            .from_credentials(credentials)
            .await?;

        let metadata = AcmeAccount {
            directory_url: self.config.directory_url.clone(),
            account_url: account.id().to_string(),
            created_timestamp: read_created_timestamp(&self.config.account_path()),
        };
        Ok((account, metadata))
    }

    async fn create_account(&self) -> Result<(Account, AccountCredentials), AcmeError> {
        if !self.config.accept_terms_of_service {
            return Err(AcmeError::TermsNotAccepted);
        }

        let contact = self.config.email.as_ref().map(|e| format!("mailto:{}", e));
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let eab = match &self.config.external_account {
            Some(binding) => {
                let key = URL_SAFE_NO_PAD
                    .decode(binding.hmac_key.trim_end_matches('='))
                    .map_err(|e| AcmeError::InvalidExternalAccountKey(e.to_string()))?;
                Some(ExternalAccountKey::new(binding.key_id.clone(), &key))
            }
            None => None,
        };

        let (account, credentials) = self
            .account_builder()?
            .create(
                &new_account,
                self.config.directory_url.clone(),
                eab.as_ref(),
            )
            .await?;
        Ok((account, credentials))
    }
}

#[async_trait]
impl CertificateAuthority for InstantAcmeAuthority {
    type OrderHandle = instant_acme::Order;

    async fn ensure_account(&self) -> Result<AcmeAccount, AcmeError> {
        let (_, metadata) = self.registered().await?;
        Ok(metadata.clone())
    }

    async fn new_order(&self, hostnames: &HostnameSet) -> Result<instant_acme::Order, AcmeError> {
        let (account, _) = self.registered().await?;
        let identifiers: Vec<Identifier> = hostnames
            .iter()
            .map(|h| Identifier::Dns(h.to_string()))
            .collect();
        let order = account.new_order(&NewOrder::new(&identifiers)).await?;
        Ok(order)
    }

    async fn authorizations(
        &self,
        order: &mut instant_acme::Order,
    ) -> Result<Vec<Authorization>, AcmeError> {
        let (account, _) = self.registered().await?;
        let thumbprint = account.key_thumbprint();

        let mut result = Vec::new();
        let mut authorizations = order.authorizations();
        while let Some(authz) = authorizations.next().await {
            let mut authz = authz?;
            // The order keeps the first fetched state; polling needs the current one.
            authz.refresh().await?;
            let hostname = authz.identifier().to_string();
            let status = match authz.status {
                instant_acme::AuthorizationStatus::Pending => AuthorizationStatus::Pending,
                instant_acme::AuthorizationStatus::Valid => AuthorizationStatus::Valid,
                _ => AuthorizationStatus::Invalid,
            };

            let challenges = authz
                .challenges
                .iter()
                .filter_map(|challenge| {
                    let kind = match challenge.r#type {
                        ChallengeType::Http01 => ChallengeKind::Http01,
                        ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
                        _ => return None,
                    };
                    let status = match challenge.status {
                        instant_acme::ChallengeStatus::Pending => ChallengeStatus::Pending,
                        instant_acme::ChallengeStatus::Processing => ChallengeStatus::Processing,
                        instant_acme::ChallengeStatus::Valid => ChallengeStatus::Valid,
                        _ => ChallengeStatus::Invalid,
                    };
                    Some(Challenge {
                        kind,
                        token: challenge.token.clone(),
                        status,
                        url: challenge.url.clone(),
                        key_authorization: key_authorization(&challenge.token, thumbprint),
                    })
                })
                .collect();

            result.push(Authorization {
                hostname,
                status,
                challenges,
            });
        }
        Ok(result)
    }

    async fn set_challenge_ready(
        &self,
        order: &mut instant_acme::Order,
        hostname: &str,
        kind: ChallengeKind,
    ) -> Result<(), AcmeError> {
        let mut authorizations = order.authorizations();
        while let Some(authz) = authorizations.next().await {
            let mut authz = authz?;
            if authz.identifier().to_string() != hostname {
                continue;
            }
            let mut challenge =
                authz
                    .challenge(kind.into())
                    .ok_or_else(|| AcmeError::ChallengeUnavailable {
                        hostname: hostname.to_string(),
                        kind,
                    })?;
            challenge.set_ready().await?;
            return Ok(());
        }
        Err(AcmeError::UnknownAuthorization {
            hostname: hostname.to_string(),
        })
    }

    async fn refresh(&self, order: &mut instant_acme::Order) -> Result<Order, AcmeError> {
        let state = order.refresh().await?;
        let status = match state.status {
            instant_acme::OrderStatus::Pending => OrderStatus::Pending,
            instant_acme::OrderStatus::Ready => OrderStatus::Ready,
            instant_acme::OrderStatus::Processing => OrderStatus::Processing,
            instant_acme::OrderStatus::Valid => OrderStatus::Valid,
            _ => OrderStatus::Invalid,
        };
        Ok(Order {
            status,
            finalize_url: state.finalize.clone(),
            certificate_url: state.certificate.clone(),
        })
    }

    async fn finalize(
        &self,
        order: &mut instant_acme::Order,
        csr_der: &[u8],
    ) -> Result<(), AcmeError> {
        order.finalize_csr(csr_der).await?;
        Ok(())
    }

    async fn certificate(
        &self,
        order: &mut instant_acme::Order,
    ) -> Result<Option<String>, AcmeError> {
        Ok(order.certificate().await?)
    }
}

/// RFC 8555 section 8.1
fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}

fn write_new_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

fn read_created_timestamp(path: &Path) -> u64 {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<AcmeAccount>(&bytes).ok())
        .map(|account| account.created_timestamp)
        .unwrap_or(0)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acme_config_defaults() {
        let config = AcmeConfig::default();
        assert_eq!(config.directory_url, LETS_ENCRYPT_PRODUCTION);
        assert!(!config.accept_terms_of_service);
        assert!(config.email.is_none());
        assert!(!config.is_staging());
    }

    #[test]
    fn test_credentials_are_keyed_by_directory_host() {
        let config = AcmeConfig {
            directory_url: LETS_ENCRYPT_STAGING.to_string(),
            account_dir: PathBuf::from("/data/acme"),
            ..Default::default()
        };
        assert!(config.is_staging());
        assert_eq!(
            config.credentials_path(),
            PathBuf::from("/data/acme/credentials-acme-staging-v02.api.letsencrypt.org.json")
        );
        assert_eq!(directory_slug("https://localhost:14000/dir"), "localhost_14000");
    }

    #[test]
    fn test_problem_classification() {
        let limited = AcmeError::from_problem(
            Some(429),
            Some("urn:ietf:params:acme:error:rateLimited"),
            Some("too many certificates"),
        );
        assert!(matches!(limited, AcmeError::RateLimited(_)));
        assert!(limited.is_transient());
        assert_eq!(limited.kind(), FailureKind::AuthorityRejected);

        let unavailable = AcmeError::from_problem(Some(503), None, Some("maintenance"));
        assert!(unavailable.is_transient());
        assert_eq!(unavailable.kind(), FailureKind::TransientNetwork);

        let bad_nonce =
            AcmeError::from_problem(Some(400), Some("urn:ietf:params:acme:error:badNonce"), None);
        assert!(bad_nonce.is_transient());

        let malformed = AcmeError::from_problem(
            Some(400),
            Some("urn:ietf:params:acme:error:rejectedIdentifier"),
            Some("invalid domain"),
        );
        assert!(!malformed.is_transient());
        assert_eq!(malformed.kind(), FailureKind::AuthorityRejected);
        assert_eq!(
            malformed.to_string(),
            "Authority rejected request (rejectedIdentifier): invalid domain"
        );
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            AcmeError::ValidationFailed {
                hostname: "example.com".into()
            }
            .kind(),
            FailureKind::ValidationFailed
        );
        assert_eq!(
            AcmeError::KeyGeneration("boom".into()).kind(),
            FailureKind::LocalResource
        );
        assert_eq!(AcmeError::TermsNotAccepted.kind(), FailureKind::Configuration);
        assert_eq!(AcmeError::Cancelled.kind(), FailureKind::Cancelled);
        assert!(!AcmeError::Cancelled.is_transient());
    }

    #[test]
    fn test_authorization_terminal_states() {
        assert!(!AuthorizationStatus::Pending.is_terminal());
        assert!(AuthorizationStatus::Valid.is_terminal());
        assert!(AuthorizationStatus::Invalid.is_terminal());
    }

    #[test]
    fn test_challenge_kind_serde_names() {
        let kind: ChallengeKind = serde_json::from_str("\"tls-alpn-01\"").unwrap();
        assert_eq!(kind, ChallengeKind::TlsAlpn01);
        assert_eq!(ChallengeKind::Http01.to_string(), "http-01");
    }

    #[tokio::test]
    async fn test_registration_requires_terms_of_service() {
        let temp = TempDir::new().unwrap();
        let authority = InstantAcmeAuthority::new(AcmeConfig {
            directory_url: "http://127.0.0.1:9/directory".to_string(),
            account_dir: temp.path().join("acme"),
            ..Default::default()
        });

        let err = authority.ensure_account().await.unwrap_err();
        assert!(matches!(err, AcmeError::TermsNotAccepted));
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[tokio::test]
    async fn test_unreadable_credentials_are_moved_aside() {
        let temp = TempDir::new().unwrap();
        let config = AcmeConfig {
            directory_url: "http://127.0.0.1:9/directory".to_string(),
            account_dir: temp.path().join("acme"),
            ..Default::default()
        };
        let credentials_path = config.credentials_path();
        std::fs::create_dir_all(&config.account_dir).unwrap();
        std::fs::write(&credentials_path, b"{ not json").unwrap();

        // Registration is refused here, so the only effect is the quarantine.
        let authority = InstantAcmeAuthority::new(config);
        let err = authority.ensure_account().await.unwrap_err();
        assert!(matches!(err, AcmeError::TermsNotAccepted));

        assert!(!credentials_path.exists());
        let quarantined = corrupt_path(&credentials_path);
        assert!(quarantined.to_string_lossy().ends_with(".json.corrupt"));
        assert_eq!(std::fs::read(quarantined).unwrap(), b"{ not json");
    }

    #[test]
    fn test_write_new_file_refuses_to_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("credentials.json");
        write_new_file(&path, b"{}").unwrap();
        let err = write_new_file(&path, b"{}").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    }
}

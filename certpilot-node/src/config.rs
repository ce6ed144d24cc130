//! Node configuration: a TOML file plus command-line overrides
//!
//! ```toml
//! role = "master"
//!
//! [[certificates]]
//! hostnames = ["example.com", "www.example.com"]
//!
//! [acme]
//! directory = "staging"
//! email = "ops@example.com"
//! accept_terms_of_service = true
//!
//! [listen]
//! http = "0.0.0.0:80"
//! tls = "0.0.0.0:443"
//! ```

use crate::defaults::{
    AUTHORIZATION_TIMEOUT, DATA_DIR, FAILURE_RETRY_INITIAL, FAILURE_RETRY_MAX, HTTP_LISTEN,
    ORDER_TIMEOUT, RENEWAL_CHECK_INTERVAL, RENEWAL_CHECK_INTERVAL_MIN, STARTUP_LOAD_TIMEOUT,
    STORE_REFRESH_INTERVAL,
};
use crate::paths;
use crate::tls::acme::{LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
use crate::tls::{
    AcmeConfig, ChallengePolicy, ExternalAccountBinding, IssuanceTimeouts, KeyAlgorithm,
    RenewalSchedule,
};
use crate::topology::NodeRole;
use certpilot_core::{DEFAULT_RENEWAL_THRESHOLD, HostnameSet, RenewalPolicy};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// Root for account credentials and the shared store, unless overridden
    pub data_dir: Option<PathBuf>,
    pub certificates: Vec<CertificateEntry>,
    pub acme: AcmeSection,
    pub renewal: RenewalSection,
    pub store: StoreSection,
    pub listen: ListenSection,
    pub log: LogSection,
}

/// One managed hostname set
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CertificateEntry {
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AcmeSection {
    /// `production`, `staging` or a directory URL
    pub directory: String,
    pub email: Option<String>,
    pub accept_terms_of_service: bool,
    pub account_dir: Option<PathBuf>,
    pub challenge: ChallengePolicy,
    pub key_algorithm: KeyAlgorithm,
    pub external_account: Option<ExternalAccountSection>,
}

impl Default for AcmeSection {
    fn default() -> Self {
        Self {
            directory: "production".to_string(),
            email: None,
            accept_terms_of_service: false,
            account_dir: None,
            challenge: ChallengePolicy::default(),
            key_algorithm: KeyAlgorithm::default(),
            external_account: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExternalAccountSection {
    pub key_id: String,
    pub hmac_key: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RenewalSection {
    /// Share of the validity window after which renewal is due
    pub threshold: f64,
    pub check_interval_secs: u64,
    pub retry_initial_secs: u64,
    pub retry_max_secs: u64,
    pub authorization_timeout_secs: u64,
    pub order_timeout_secs: u64,
}

impl Default for RenewalSection {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_RENEWAL_THRESHOLD,
            check_interval_secs: RENEWAL_CHECK_INTERVAL.as_secs(),
            retry_initial_secs: FAILURE_RETRY_INITIAL.as_secs(),
            retry_max_secs: FAILURE_RETRY_MAX.as_secs(),
            authorization_timeout_secs: AUTHORIZATION_TIMEOUT.as_secs(),
            order_timeout_secs: ORDER_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
    /// Follower poll interval
    pub refresh_interval_secs: u64,
    pub startup_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: None,
            refresh_interval_secs: STORE_REFRESH_INTERVAL.as_secs(),
            startup_timeout_secs: STARTUP_LOAD_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ListenSection {
    pub http: String,
    /// TLS-ALPN-01 validation listener; disabled when unset
    pub tls: Option<String>,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            http: HTTP_LISTEN.to_string(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub format: LogFormat,
    /// Daily-rolling log files are written here in addition to stderr
    pub directory: Option<PathBuf>,
}

/// Values given on the command line; each one replaces its file counterpart.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub role: Option<NodeRole>,
    pub data_dir: Option<PathBuf>,
    pub http_listen: Option<String>,
    pub tls_listen: Option<String>,
    pub acme_staging: bool,
    pub acme_email: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl NodeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(path.as_ref().to_path_buf(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(role) = overrides.role {
            self.role = role;
        }
        if let Some(data_dir) = overrides.data_dir {
            self.data_dir = Some(data_dir);
        }
        if let Some(http) = overrides.http_listen {
            self.listen.http = http;
        }
        if let Some(tls) = overrides.tls_listen {
            self.listen.tls = Some(tls);
        }
        if overrides.acme_staging {
            self.acme.directory = "staging".to_string();
        }
        if let Some(email) = overrides.acme_email {
            self.acme.email = Some(email);
        }
        if let Some(format) = overrides.log_format {
            self.log.format = format;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        self.hostname_sets()?;
        self.renewal_policy()?;

        let renewal = &self.renewal;
        if renewal.check_interval_secs < RENEWAL_CHECK_INTERVAL_MIN.as_secs() {
            return Err(ConfigError::Validation(format!(
                "renewal.check_interval_secs must be at least {}",
                RENEWAL_CHECK_INTERVAL_MIN.as_secs()
            )));
        }
        for (name, value) in [
            ("renewal.retry_initial_secs", renewal.retry_initial_secs),
            ("renewal.retry_max_secs", renewal.retry_max_secs),
            ("renewal.authorization_timeout_secs", renewal.authorization_timeout_secs),
            ("renewal.order_timeout_secs", renewal.order_timeout_secs),
            ("store.refresh_interval_secs", self.store.refresh_interval_secs),
            ("store.startup_timeout_secs", self.store.startup_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be positive", name)));
            }
        }
        if renewal.retry_max_secs < renewal.retry_initial_secs {
            return Err(ConfigError::Validation(
                "renewal.retry_max_secs must not be below renewal.retry_initial_secs".to_string(),
            ));
        }

        self.http_addr()?;
        self.tls_addr()?;
        self.directory_url()?;
        Ok(())
    }

    pub fn hostname_sets(&self) -> Result<Vec<HostnameSet>> {
        self.certificates
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let set = HostnameSet::new(&entry.hostnames).map_err(|e| {
                    ConfigError::Validation(format!("certificates[{}]: {}", index, e))
                })?;
                // Wildcards need DNS-01, which this node cannot answer.
                if set.has_wildcard() {
                    return Err(ConfigError::Validation(format!(
                        "certificates[{}]: wildcard names cannot be validated with http-01 or tls-alpn-01",
                        index
                    )));
                }
                Ok(set)
            })
            .collect()
    }

    pub fn renewal_policy(&self) -> Result<RenewalPolicy> {
        RenewalPolicy::new(self.renewal.threshold)
            .map_err(|e| ConfigError::Validation(format!("renewal.threshold: {}", e)))
    }

    pub fn renewal_schedule(&self) -> RenewalSchedule {
        RenewalSchedule {
            check_interval: Duration::from_secs(self.renewal.check_interval_secs),
            retry_initial: Duration::from_secs(self.renewal.retry_initial_secs),
            retry_max: Duration::from_secs(self.renewal.retry_max_secs),
        }
    }

    pub fn issuance_timeouts(&self) -> IssuanceTimeouts {
        IssuanceTimeouts {
            authorization: Duration::from_secs(self.renewal.authorization_timeout_secs),
            order: Duration::from_secs(self.renewal.order_timeout_secs),
        }
    }

    pub fn store_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.store.refresh_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.store.startup_timeout_secs)
    }

    pub fn directory_url(&self) -> Result<String> {
        match self.acme.directory.as_str() {
            "production" => Ok(LETS_ENCRYPT_PRODUCTION.to_string()),
            "staging" => Ok(LETS_ENCRYPT_STAGING.to_string()),
            url if url.starts_with("https://") || url.starts_with("http://") => {
                Ok(url.to_string())
            }
            other => Err(ConfigError::Validation(format!(
                "acme.directory must be 'production', 'staging' or a URL, got '{}'",
                other
            ))),
        }
    }

    /// Data directory: explicit setting, else a checkout-local directory for
    /// debug builds run from `target/`, else the system default.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        if cfg!(debug_assertions)
            && let Ok(exe) = std::env::current_exe()
            && let Some(dir) = paths::debug_default_data_dir_from_exe(&exe)
        {
            return dir;
        }
        PathBuf::from(DATA_DIR)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| paths::store_dir(&self.data_dir()))
    }

    pub fn acme_config(&self) -> Result<AcmeConfig> {
        Ok(AcmeConfig {
            directory_url: self.directory_url()?,
            email: self.acme.email.clone(),
            accept_terms_of_service: self.acme.accept_terms_of_service,
            account_dir: self
                .acme
                .account_dir
                .clone()
                .unwrap_or_else(|| paths::account_dir(&self.data_dir())),
            external_account: self.acme.external_account.as_ref().map(|eab| {
                ExternalAccountBinding {
                    key_id: eab.key_id.clone(),
                    hmac_key: eab.hmac_key.clone(),
                }
            }),
        })
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        parse_addr("listen.http", &self.listen.http)
    }

    pub fn tls_addr(&self) -> Result<Option<SocketAddr>> {
        self.listen
            .tls
            .as_deref()
            .map(|addr| parse_addr("listen.tls", addr))
            .transpose()
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value.parse().map_err(|_| {
        ConfigError::Validation(format!("{} is not a socket address: '{}'", field, value))
    })
}

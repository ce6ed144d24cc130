use std::time::Duration;

pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
pub const RENEWAL_CHECK_INTERVAL_MIN: Duration = Duration::from_secs(60);

pub const FAILURE_RETRY_INITIAL: Duration = Duration::from_secs(5 * 60);
pub const FAILURE_RETRY_MAX: Duration = Duration::from_secs(24 * 60 * 60);

pub const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(120);

pub const POLL_INITIAL_DELAY: Duration = Duration::from_millis(250);
pub const POLL_MAX_DELAY: Duration = Duration::from_secs(5);

/// Attempts per authority call before a transient error is surfaced.
pub const TRANSIENT_RETRY_ATTEMPTS: u32 = 3;
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub const STORE_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const STARTUP_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub const HTTP_LISTEN: &str = "0.0.0.0:80";
pub const DATA_DIR: &str = "/var/lib/certpilot";

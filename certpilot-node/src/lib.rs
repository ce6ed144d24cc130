//! Certpilot Node - ACME certificate lifecycle for a single node or a pool
//!
//! A master node obtains and renews certificates from an ACME authority and
//! publishes them to a shared store; follower nodes answer validation
//! challenges and pick certificates up from that store.
//!
//! - [`tls`] - protocol driver, challenge responders, state machine, store
//! - [`topology`] - `compose_master` / `compose_follower`
//! - [`http`] - HTTP-01 endpoint
//! - [`config`] - TOML configuration

pub mod config;
pub mod defaults;
pub mod http;
pub mod metrics;
pub mod paths;
pub mod tls;
pub mod topology;

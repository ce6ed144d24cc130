//! HTTP-01 challenge responses
//!
//! Token -> key authorization map served at
//! `/.well-known/acme-challenge/<token>`. One instance per process, shared by
//! the issuance driver (writer) and the HTTP endpoint (reader).

use dashmap::DashMap;
use std::sync::Arc;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ChallengeResponseStore {
    responses: Arc<DashMap<String, String>>,
}

impl ChallengeResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, token: &str, key_authorization: &str) {
        tracing::debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.responses
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.responses.get(token).map(|v| v.clone())
    }

    pub fn remove(&self, token: &str) {
        if self.responses.remove(token).is_some() {
            tracing::debug!(token = %token, "Removed ACME HTTP-01 challenge");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.responses.len()
    }

    /// Returns the token if `path` is a challenge request path.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }
}

//! Renewal clock - decides whether a certificate is due for renewal
//!
//! The decision is a pure function of "now" and the certificate's validity
//! window. A certificate is due once the elapsed fraction of its lifetime
//! reaches the configured threshold (inclusive).

use crate::ManagedCertificate;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Renew when less than a third of the validity period remains.
pub const DEFAULT_RENEWAL_THRESHOLD: f64 = 2.0 / 3.0;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Renewal threshold must be within (0, 1], got {0}")]
    InvalidThreshold(f64),
}

/// Outcome of one renewal evaluation. Never stored; recomputed on every check.
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalDecision {
    pub due: bool,
    /// Share of the validity window already elapsed, clamped to `[0, 1]`.
    pub elapsed_fraction: f64,
    pub reason: String,
}

impl RenewalDecision {
    /// Decision for a hostname set that has no certificate at all.
    pub fn missing() -> Self {
        Self {
            due: true,
            elapsed_fraction: 1.0,
            reason: "no certificate held".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenewalPolicy {
    threshold: f64,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_RENEWAL_THRESHOLD,
        }
    }
}

impl RenewalPolicy {
    pub fn new(threshold: f64) -> Result<Self, PolicyError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(PolicyError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// The instant at which a certificate with this window becomes due.
    pub fn due_at(&self, not_before: SystemTime, not_after: SystemTime) -> SystemTime {
        let lifetime = not_after.duration_since(not_before).unwrap_or_default();
        not_before + lifetime.mul_f64(self.threshold)
    }

    pub fn evaluate(
        &self,
        now: SystemTime,
        not_before: SystemTime,
        not_after: SystemTime,
    ) -> RenewalDecision {
        if not_after <= not_before {
            return RenewalDecision {
                due: true,
                elapsed_fraction: 1.0,
                reason: "certificate has an empty validity window".to_string(),
            };
        }
        if now >= not_after {
            return RenewalDecision {
                due: true,
                elapsed_fraction: 1.0,
                reason: "certificate has expired".to_string(),
            };
        }

        let lifetime = not_after.duration_since(not_before).unwrap_or_default();
        let elapsed = now.duration_since(not_before).unwrap_or(Duration::ZERO);
        let elapsed_fraction = (elapsed.as_secs_f64() / lifetime.as_secs_f64()).clamp(0.0, 1.0);
        let due = now >= self.due_at(not_before, not_after);

        RenewalDecision {
            due,
            elapsed_fraction,
            reason: format!(
                "{:.0}% of lifetime elapsed (threshold {:.0}%)",
                elapsed_fraction * 100.0,
                self.threshold * 100.0
            ),
        }
    }

    pub fn evaluate_certificate(
        &self,
        now: SystemTime,
        certificate: &ManagedCertificate,
    ) -> RenewalDecision {
        self.evaluate(now, certificate.not_before(), certificate.not_after())
    }
}

//! Prometheus metrics for certificate lifecycle outcomes
//!
//! Exposed at `/metrics` on the HTTP validation listener.

use crate::tls::{FailureKind, Trigger};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    issuance_attempts: IntCounterVec,
    issuance_successes: IntCounter,
    issuance_failures: IntCounterVec,
    coalesced_triggers: IntCounter,
    challenge_requests: IntCounterVec,
    certificates_loaded: IntCounter,
    certificates_managed: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("certpilot".to_string()), None)?;

        let issuance_attempts = IntCounterVec::new(
            Opts::new("issuance_attempts_total", "Issuance runs started, by trigger"),
            &["trigger"],
        )?;
        let issuance_successes = IntCounter::new(
            "issuance_successes_total",
            "Issuance runs that produced a certificate",
        )?;
        let issuance_failures = IntCounterVec::new(
            Opts::new("issuance_failures_total", "Failed issuance runs, by failure kind"),
            &["kind"],
        )?;
        let coalesced_triggers = IntCounter::new(
            "coalesced_triggers_total",
            "Renewal triggers ignored because a run was already in flight",
        )?;
        let challenge_requests = IntCounterVec::new(
            Opts::new(
                "http01_requests_total",
                "HTTP-01 challenge requests, by result",
            ),
            &["result"],
        )?;
        let certificates_loaded = IntCounter::new(
            "certificates_loaded_total",
            "Certificates loaded into the selector from certificate sources",
        )?;
        let certificates_managed = IntGauge::new(
            "certificates_managed",
            "Hostname sets managed by this node's lifecycle engine",
        )?;

        registry.register(Box::new(issuance_attempts.clone()))?;
        registry.register(Box::new(issuance_successes.clone()))?;
        registry.register(Box::new(issuance_failures.clone()))?;
        registry.register(Box::new(coalesced_triggers.clone()))?;
        registry.register(Box::new(challenge_requests.clone()))?;
        registry.register(Box::new(certificates_loaded.clone()))?;
        registry.register(Box::new(certificates_managed.clone()))?;

        Ok(Self {
            registry,
            issuance_attempts,
            issuance_successes,
            issuance_failures,
            coalesced_triggers,
            challenge_requests,
            certificates_loaded,
            certificates_managed,
        })
    }

    pub fn record_attempt(&self, trigger: Trigger) {
        self.issuance_attempts
            .with_label_values(&[trigger.as_str()])
            .inc();
    }

    pub fn record_success(&self) {
        self.issuance_successes.inc();
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.issuance_failures
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_coalesced(&self) {
        self.coalesced_triggers.inc();
    }

    pub fn record_challenge_request(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.challenge_requests.with_label_values(&[result]).inc();
    }

    pub fn record_loaded(&self, count: usize) {
        self.certificates_loaded.inc_by(count as u64);
    }

    pub fn set_managed(&self, count: usize) {
        self.certificates_managed.set(count as i64);
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposition(metrics: &Metrics) -> String {
        let (_, body) = metrics.encode().unwrap();
        String::from_utf8(body).unwrap()
    }

    #[test]
    fn test_records_lifecycle_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_attempt(Trigger::Timer);
        metrics.record_attempt(Trigger::Manual);
        metrics.record_success();
        metrics.record_failure(FailureKind::ValidationFailed);
        metrics.record_coalesced();
        metrics.record_challenge_request(true);
        metrics.record_challenge_request(false);
        metrics.record_loaded(3);
        metrics.set_managed(2);

        let text = exposition(&metrics);
        assert!(text.contains(r#"certpilot_issuance_attempts_total{trigger="timer"} 1"#));
        assert!(text.contains(r#"certpilot_issuance_attempts_total{trigger="manual"} 1"#));
        assert!(text.contains("certpilot_issuance_successes_total 1"));
        assert!(text.contains(r#"certpilot_issuance_failures_total{kind="validation_failed"} 1"#));
        assert!(text.contains("certpilot_coalesced_triggers_total 1"));
        assert!(text.contains(r#"certpilot_http01_requests_total{result="miss"} 1"#));
        assert!(text.contains("certpilot_certificates_loaded_total 3"));
        assert!(text.contains("certpilot_certificates_managed 2"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_success();
        assert!(exposition(&b).contains("certpilot_issuance_successes_total 0"));
    }
}

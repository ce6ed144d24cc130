//! Certificate lifecycle state machine
//!
//! One lifecycle per managed hostname set:
//!
//! ```text
//! ServerStartup -> CheckForRenewal -> (due) BeginCertificateCreation -> Terminal
//!                                  -> (not due) Terminal
//! Terminal -> CheckForRenewal      (next timer tick or manual trigger)
//! ```
//!
//! Nothing survives a restart except what the certificate sources and the
//! account store hold; startup re-derives everything from them.

use super::acme::{AcmeError, CertificateAuthority, FailureKind};
use super::issuance::IssuanceDriver;
use super::retry;
use super::selector::CertificateSelector;
use super::store::{CertificateSink, StartupCertificateLoader};
use crate::defaults::{FAILURE_RETRY_INITIAL, FAILURE_RETRY_MAX, RENEWAL_CHECK_INTERVAL};
use crate::metrics::Metrics;
use certpilot_core::{Clock, HostnameSet, ManagedCertificate, RenewalDecision, RenewalPolicy};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeState {
    ServerStartup,
    CheckForRenewal,
    BeginCertificateCreation,
    Terminal,
}

impl fmt::Display for AcmeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AcmeState::ServerStartup => "server_startup",
            AcmeState::CheckForRenewal => "check_for_renewal",
            AcmeState::BeginCertificateCreation => "begin_certificate_creation",
            AcmeState::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// What caused an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Timer,
    /// Operator request: issues even when renewal is not due and ignores
    /// failure backoff.
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Renewal not due; the held certificate stays.
    Skipped(RenewalDecision),
    Issued { not_after: SystemTime },
    Failed {
        kind: FailureKind,
        error: String,
        retry_in: Duration,
    },
    /// Another run for the same hostname set was already in flight.
    Coalesced,
    /// Still inside the failure backoff window.
    Deferred { retry_in: Duration },
    Cancelled,
}

/// Timer and failure backoff settings.
#[derive(Debug, Clone, Copy)]
pub struct RenewalSchedule {
    pub check_interval: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for RenewalSchedule {
    fn default() -> Self {
        Self {
            check_interval: RENEWAL_CHECK_INTERVAL,
            retry_initial: FAILURE_RETRY_INITIAL,
            retry_max: FAILURE_RETRY_MAX,
        }
    }
}

/// Point-in-time view of one hostname set's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleStatus {
    pub hostnames: HostnameSet,
    pub state: AcmeState,
    pub in_flight: bool,
    pub last_outcome: Option<Outcome>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub next_retry_at: Option<Instant>,
    pub last_checked_at: Option<SystemTime>,
}

struct Lifecycle {
    state: AcmeState,
    in_flight: bool,
    last_outcome: Option<Outcome>,
    last_error: Option<String>,
    consecutive_failures: u32,
    next_retry_at: Option<Instant>,
    last_checked_at: Option<SystemTime>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: AcmeState::ServerStartup,
            in_flight: false,
            last_outcome: None,
            last_error: None,
            consecutive_failures: 0,
            next_retry_at: None,
            last_checked_at: None,
        }
    }
}

type Lifecycles = Mutex<HashMap<HostnameSet, Lifecycle>>;

/// Held for the duration of one evaluation; clears the in-flight flag on drop,
/// including when the evaluating future is dropped mid-run.
struct InFlight<'a> {
    lifecycles: &'a Lifecycles,
    hostnames: &'a HostnameSet,
}

impl<'a> InFlight<'a> {
    /// `None` when a run for `hostnames` is already in flight.
    fn acquire(lifecycles: &'a Lifecycles, hostnames: &'a HostnameSet) -> Option<Self> {
        let mut map = lifecycles.lock();
        let lifecycle = map.get_mut(hostnames)?;
        if lifecycle.in_flight {
            return None;
        }
        lifecycle.in_flight = true;
        Some(Self {
            lifecycles,
            hostnames,
        })
    }

    fn update(&self, f: impl FnOnce(&mut Lifecycle)) {
        if let Some(lifecycle) = self.lifecycles.lock().get_mut(self.hostnames) {
            f(lifecycle);
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.update(|lifecycle| {
            lifecycle.in_flight = false;
            lifecycle.state = AcmeState::Terminal;
        });
    }
}

/// Master-only orchestrator of issuance and renewal.
pub struct AcmeStateMachine<A: CertificateAuthority> {
    driver: IssuanceDriver<A>,
    selector: Arc<CertificateSelector>,
    sink: Arc<dyn CertificateSink>,
    loader: Arc<StartupCertificateLoader>,
    policy: RenewalPolicy,
    schedule: RenewalSchedule,
    clock: Arc<dyn Clock>,
    sets: Vec<HostnameSet>,
    lifecycles: Lifecycles,
    /// Signalled whenever a failure schedules a retry the timer must honour.
    rescheduled: Notify,
    metrics: Option<Arc<Metrics>>,
}

impl<A: CertificateAuthority> AcmeStateMachine<A> {
    pub fn new(
        driver: IssuanceDriver<A>,
        selector: Arc<CertificateSelector>,
        sink: Arc<dyn CertificateSink>,
        loader: Arc<StartupCertificateLoader>,
        sets: Vec<HostnameSet>,
    ) -> Self {
        let clock = driver.factory().clock().clone();

        let mut unique = Vec::with_capacity(sets.len());
        let mut lifecycles = HashMap::with_capacity(sets.len());
        for set in sets {
            if lifecycles.insert(set.clone(), Lifecycle::new()).is_none() {
                unique.push(set);
            }
        }

        Self {
            driver,
            selector,
            sink,
            loader,
            policy: RenewalPolicy::default(),
            schedule: RenewalSchedule::default(),
            clock,
            sets: unique,
            lifecycles: Mutex::new(lifecycles),
            rescheduled: Notify::new(),
            metrics: None,
        }
    }

    pub fn with_policy(mut self, policy: RenewalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_schedule(mut self, schedule: RenewalSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        metrics.set_managed(self.sets.len());
        self.metrics = Some(metrics);
        self
    }

    pub fn hostname_sets(&self) -> &[HostnameSet] {
        &self.sets
    }

    pub fn driver(&self) -> &IssuanceDriver<A> {
        &self.driver
    }

    /// ServerStartup: load existing certificates, then run the first check
    /// for every managed set.
    pub async fn startup(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Vec<(HostnameSet, Outcome)> {
        if self.sets.is_empty() {
            tracing::warn!(
                "No hostname sets configured, certificate lifecycle has nothing to manage"
            );
        }

        let loaded = self.loader.load(cancel).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_loaded(loaded);
        }
        tracing::info!(
            loaded,
            managed = self.sets.len(),
            "Startup certificate load complete"
        );

        self.check_all(Trigger::Startup, cancel).await
    }

    /// Evaluate every managed set concurrently. One set's failure never
    /// affects another's.
    pub async fn check_all(
        self: &Arc<Self>,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Vec<(HostnameSet, Outcome)> {
        let mut tasks = JoinSet::new();
        for set in &self.sets {
            let machine = Arc::clone(self);
            let set = set.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = machine.evaluate(&set, trigger, &cancel).await;
                (set, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(self.sets.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => tracing::error!(error = %e, "Lifecycle task panicked"),
            }
        }
        outcomes
    }

    /// Issue a certificate for `hostnames` now, regardless of renewal policy.
    ///
    /// Returns `None` if the set is not managed by this machine; returns
    /// `Outcome::Coalesced` if a run for it is already in flight.
    pub async fn renew_now(
        &self,
        hostnames: &HostnameSet,
        cancel: &CancellationToken,
    ) -> Option<Outcome> {
        if !self.sets.contains(hostnames) {
            return None;
        }
        Some(self.evaluate(hostnames, Trigger::Manual, cancel).await)
    }

    pub fn status(&self, hostnames: &HostnameSet) -> Option<LifecycleStatus> {
        let map = self.lifecycles.lock();
        map.get(hostnames).map(|lifecycle| LifecycleStatus {
            hostnames: hostnames.clone(),
            state: lifecycle.state,
            in_flight: lifecycle.in_flight,
            last_outcome: lifecycle.last_outcome.clone(),
            last_error: lifecycle.last_error.clone(),
            consecutive_failures: lifecycle.consecutive_failures,
            next_retry_at: lifecycle.next_retry_at,
            last_checked_at: lifecycle.last_checked_at,
        })
    }

    pub fn statuses(&self) -> Vec<LifecycleStatus> {
        self.sets.iter().filter_map(|set| self.status(set)).collect()
    }

    /// CheckForRenewal for one set, followed by BeginCertificateCreation when
    /// due. At most one evaluation per set runs at a time; overlapping calls
    /// return `Outcome::Coalesced` without touching the authority.
    pub async fn evaluate(
        &self,
        hostnames: &HostnameSet,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(gate) = InFlight::acquire(&self.lifecycles, hostnames) else {
            tracing::debug!(
                hostnames = %hostnames,
                trigger = trigger.as_str(),
                "Renewal already in flight, trigger coalesced"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_coalesced();
            }
            return Outcome::Coalesced;
        };

        let now = self.clock.now();
        let mut next_retry_at = None;
        gate.update(|lifecycle| {
            lifecycle.state = AcmeState::CheckForRenewal;
            lifecycle.last_checked_at = Some(now);
            next_retry_at = lifecycle.next_retry_at;
        });

        let outcome = self
            .check(&gate, hostnames, trigger, now, next_retry_at, cancel)
            .await;
        gate.update(|lifecycle| lifecycle.last_outcome = Some(outcome.clone()));
        outcome
    }

    async fn check(
        &self,
        gate: &InFlight<'_>,
        hostnames: &HostnameSet,
        trigger: Trigger,
        now: SystemTime,
        next_retry_at: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Outcome {
        if trigger != Trigger::Manual
            && let Some(at) = next_retry_at
        {
            let remaining = at.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                tracing::debug!(
                    hostnames = %hostnames,
                    retry_in_secs = remaining.as_secs(),
                    "Previous attempt failed, waiting for backoff"
                );
                return Outcome::Deferred {
                    retry_in: remaining,
                };
            }
        }

        let decision = match self.selector.certificate_for_set(hostnames) {
            Some(held) => self.policy.evaluate_certificate(now, &held),
            None => RenewalDecision::missing(),
        };
        if !decision.due && trigger != Trigger::Manual {
            tracing::debug!(hostnames = %hostnames, reason = %decision.reason, "Renewal not due");
            // The held certificate is healthy; an earlier failed forced run
            // leaves nothing to retry.
            gate.update(|lifecycle| {
                lifecycle.consecutive_failures = 0;
                lifecycle.next_retry_at = None;
            });
            return Outcome::Skipped(decision);
        }

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        tracing::info!(
            hostnames = %hostnames,
            trigger = trigger.as_str(),
            reason = %decision.reason,
            "Beginning certificate creation"
        );
        gate.update(|lifecycle| lifecycle.state = AcmeState::BeginCertificateCreation);
        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(trigger);
        }

        let result = self.driver.issue(hostnames, cancel).await;
        match result {
            Ok(certificate) => match self.install(&certificate).await {
                Ok(()) => {
                    gate.update(|lifecycle| {
                        lifecycle.consecutive_failures = 0;
                        lifecycle.next_retry_at = None;
                        lifecycle.last_error = None;
                    });
                    if let Some(metrics) = &self.metrics {
                        metrics.record_success();
                    }
                    Outcome::Issued {
                        not_after: certificate.not_after(),
                    }
                }
                Err(error) => {
                    self.record_failure(gate, hostnames, FailureKind::LocalResource, error)
                }
            },
            Err(AcmeError::Cancelled) => {
                tracing::info!(hostnames = %hostnames, "Certificate creation cancelled");
                Outcome::Cancelled
            }
            Err(e) => self.record_failure(gate, hostnames, e.kind(), e.to_string()),
        }
    }

    /// Hand a new certificate to the selector and then the shared sink.
    ///
    /// A publish failure only delays followers; the certificate is already
    /// being served here.
    async fn install(&self, certificate: &ManagedCertificate) -> Result<(), String> {
        self.selector.add(certificate).map_err(|e| e.to_string())?;
        tracing::info!(
            hostnames = %certificate.hostnames(),
            not_after = ?certificate.not_after(),
            "Certificate issued"
        );

        if let Err(e) = self.sink.publish(certificate).await {
            tracing::error!(
                hostnames = %certificate.hostnames(),
                error = %e,
                "Failed to publish certificate to shared store"
            );
        }
        Ok(())
    }

    fn record_failure(
        &self,
        gate: &InFlight<'_>,
        hostnames: &HostnameSet,
        kind: FailureKind,
        error: String,
    ) -> Outcome {
        let mut retry_in = Duration::ZERO;
        gate.update(|lifecycle| {
            lifecycle.consecutive_failures = lifecycle.consecutive_failures.saturating_add(1);
            retry_in = retry::failure_delay(
                self.schedule.retry_initial,
                self.schedule.retry_max,
                lifecycle.consecutive_failures,
            );
            lifecycle.next_retry_at = Some(Instant::now() + retry_in);
            lifecycle.last_error = Some(error.clone());
        });
        self.rescheduled.notify_one();

        tracing::error!(
            hostnames = %hostnames,
            kind = %kind,
            error = %error,
            retry_in_secs = retry_in.as_secs(),
            "Certificate creation failed, keeping current certificate"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_failure(kind);
        }
        Outcome::Failed {
            kind,
            error,
            retry_in,
        }
    }

    /// Time until the next timer tick: the check interval, or sooner when a
    /// failed set's backoff ends first. Retry instants already passed are
    /// ignored; the set they belong to was re-evaluated or is in flight.
    fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        let map = self.lifecycles.lock();
        map.values()
            .filter_map(|lifecycle| lifecycle.next_retry_at)
            .filter(|at| *at > now)
            .map(|at| at.duration_since(now))
            .fold(self.schedule.check_interval, Duration::min)
    }

    /// Periodic renewal timer. Runs until `cancel` fires.
    ///
    /// Every tick evaluates each set on its own task; a set whose previous
    /// run is still going is left alone, so one slow authorization never
    /// delays the other sets' checks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            check_interval_secs = self.schedule.check_interval.as_secs(),
            managed = self.sets.len(),
            "Starting renewal timer"
        );
        let mut tasks = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, HostnameSet> = HashMap::new();
        let mut tick_at = Instant::now() + self.next_wakeup();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next_with_id() => {
                    let id = match joined {
                        Ok((id, ())) => id,
                        Err(e) => {
                            tracing::error!(error = %e, "Lifecycle task panicked");
                            e.id()
                        }
                    };
                    running.remove(&id);
                    continue;
                }
                _ = self.rescheduled.notified() => {
                    tick_at = tick_at.min(Instant::now() + self.next_wakeup());
                    continue;
                }
                _ = tokio::time::sleep_until(tick_at) => {}
            }

            let busy: HashSet<&HostnameSet> = running.values().collect();
            let idle: Vec<HostnameSet> = self
                .sets
                .iter()
                .filter(|set| !busy.contains(set))
                .cloned()
                .collect();
            for set in idle {
                let machine = Arc::clone(&self);
                let cancel = cancel.clone();
                let task_set = set.clone();
                let handle = tasks.spawn(async move {
                    machine.evaluate(&task_set, Trigger::Timer, &cancel).await;
                });
                running.insert(handle.id(), set);
            }
            tick_at = Instant::now() + self.next_wakeup();
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!("Renewal timer stopped");
    }
}

//! Master/follower composition
//!
//! Both roles run the startup loader and both challenge responders, so a
//! validation request routed to any node of a pool is answered. Only
//! `compose_master` takes a `CertificateAuthority`; a follower has no way to
//! reach the authority at all.
//!
//! Exactly one master per shared store is an operator responsibility. Two
//! masters issuing for the same hostnames are not detected.

use crate::config::{ConfigError, NodeConfig};
use crate::http::HttpEndpoint;
use crate::metrics::Metrics;
use crate::tls::{
    AcmeCertResolver, AcmeStateMachine, AlpnChallengeResponder, CertificateAuthority,
    CertificateFactory, CertificateRefresher, CertificateSelector, CertificateSink,
    CertificateSource, ChallengeResponseStore, IssuanceDriver, Outcome,
    StartupCertificateLoader,
};
use async_trait::async_trait;
use certpilot_core::Clock;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Master,
    Follower,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => f.write_str("master"),
            NodeRole::Follower => f.write_str("follower"),
        }
    }
}

/// Role-specific certificate work.
#[async_trait]
pub trait LifecycleService: Send + Sync {
    /// Load existing certificates; a master also runs its first renewal check.
    async fn startup(&self, cancel: &CancellationToken);

    /// Start the long-running loop: renewal timer or shared store poller.
    fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()>;
}

struct MasterService<A: CertificateAuthority> {
    state_machine: Arc<AcmeStateMachine<A>>,
}

#[async_trait]
impl<A: CertificateAuthority> LifecycleService for MasterService<A> {
    async fn startup(&self, cancel: &CancellationToken) {
        for (hostnames, outcome) in self.state_machine.startup(cancel).await {
            match outcome {
                Outcome::Failed { .. } => {
                    tracing::warn!(
                        hostnames = %hostnames,
                        "Startup issuance failed, serving without a new certificate"
                    );
                }
                outcome => {
                    tracing::debug!(
                        hostnames = %hostnames,
                        outcome = ?outcome,
                        "Startup check finished"
                    );
                }
            }
        }
    }

    fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.state_machine.clone().run(cancel))
    }
}

struct FollowerService {
    loader: StartupCertificateLoader,
    refresher: Arc<CertificateRefresher>,
    metrics: Option<Arc<Metrics>>,
}

#[async_trait]
impl LifecycleService for FollowerService {
    async fn startup(&self, cancel: &CancellationToken) {
        let loaded = self.loader.load(cancel).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_loaded(loaded);
        }
        tracing::info!(loaded, "Follower startup certificate load complete");
    }

    fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.refresher.clone().run(cancel))
    }
}

/// The fixed component set of one node.
pub struct Node {
    role: NodeRole,
    challenges: ChallengeResponseStore,
    alpn: AlpnChallengeResponder,
    selector: Arc<CertificateSelector>,
    metrics: Option<Arc<Metrics>>,
    service: Arc<dyn LifecycleService>,
}

impl Node {
    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn challenges(&self) -> &ChallengeResponseStore {
        &self.challenges
    }

    pub fn alpn(&self) -> &AlpnChallengeResponder {
        &self.alpn
    }

    pub fn selector(&self) -> &Arc<CertificateSelector> {
        &self.selector
    }

    /// HTTP-01 (and metrics) handler for the host's HTTP layer.
    pub fn http_endpoint(&self) -> HttpEndpoint {
        HttpEndpoint::new(self.challenges.clone(), self.metrics.clone())
    }

    /// Handshake-time certificate callback for the host's TLS layer.
    pub fn cert_resolver(&self) -> Arc<AcmeCertResolver> {
        Arc::new(AcmeCertResolver::new(
            self.alpn.clone(),
            self.selector.clone(),
        ))
    }

    pub async fn startup(&self, cancel: &CancellationToken) {
        self.service.startup(cancel).await;
    }

    pub fn spawn_lifecycle(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.service.spawn(cancel)
    }
}

/// A master node and a handle on its state machine (manual renewal, status).
pub struct MasterNode<A: CertificateAuthority> {
    pub node: Node,
    pub state_machine: Arc<AcmeStateMachine<A>>,
}

/// Wire a master: loader, state machine, responders, authority, factory.
pub fn compose_master<A, S>(
    config: &NodeConfig,
    authority: Arc<A>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
) -> Result<MasterNode<A>, ConfigError>
where
    A: CertificateAuthority,
    S: CertificateSource + CertificateSink + 'static,
{
    let sets = config.hostname_sets()?;
    if sets.is_empty() {
        tracing::error!("Master has no [[certificates]] configured, nothing will be issued");
    }

    let challenges = ChallengeResponseStore::new();
    let alpn = AlpnChallengeResponder::new();
    let selector = Arc::new(CertificateSelector::new(clock.clone()));

    let tls_listener = config.tls_addr()?.is_some();
    let timeouts = config.issuance_timeouts();
    let factory = CertificateFactory::new(config.acme.key_algorithm, clock, timeouts.order);
    let driver = IssuanceDriver::new(authority, challenges.clone(), alpn.clone(), factory)
        .with_challenge_policy(config.acme.challenge, tls_listener)
        .with_timeouts(timeouts);

    let source: Arc<dyn CertificateSource> = store.clone();
    let sink: Arc<dyn CertificateSink> = store;
    let loader = Arc::new(StartupCertificateLoader::new(
        vec![source],
        selector.clone(),
        config.startup_timeout(),
    ));

    let mut state_machine = AcmeStateMachine::new(driver, selector.clone(), sink, loader, sets)
        .with_policy(config.renewal_policy()?)
        .with_schedule(config.renewal_schedule());
    if let Some(metrics) = &metrics {
        state_machine = state_machine.with_metrics(metrics.clone());
    }
    let state_machine = Arc::new(state_machine);

    tracing::info!(
        managed = state_machine.hostname_sets().len(),
        challenge = ?config.acme.challenge,
        "Composed master node"
    );

    Ok(MasterNode {
        node: Node {
            role: NodeRole::Master,
            challenges,
            alpn,
            selector,
            metrics,
            service: Arc::new(MasterService {
                state_machine: state_machine.clone(),
            }),
        },
        state_machine,
    })
}

/// Wire a follower: loader, shared store poller, responders. No authority.
pub fn compose_follower(
    config: &NodeConfig,
    source: Arc<dyn CertificateSource>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
) -> Node {
    let challenges = ChallengeResponseStore::new();
    let alpn = AlpnChallengeResponder::new();
    let selector = Arc::new(CertificateSelector::new(clock));

    let loader = StartupCertificateLoader::new(
        vec![source.clone()],
        selector.clone(),
        config.startup_timeout(),
    );
    let refresher = Arc::new(CertificateRefresher::new(
        source,
        selector.clone(),
        config.store_refresh_interval(),
    ));

    tracing::info!(
        refresh_interval_secs = config.store.refresh_interval_secs,
        "Composed follower node"
    );

    Node {
        role: NodeRole::Follower,
        challenges,
        alpn,
        selector,
        metrics: metrics.clone(),
        service: Arc::new(FollowerService {
            loader,
            refresher,
            metrics,
        }),
    }
}

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use certpilot_core::{HostnameSet, ManagedCertificate};
use certpilot_node::config::{CertificateEntry, NodeConfig};
use certpilot_node::tls::{
    AcmeAccount, AcmeError, Authorization, AuthorizationStatus, CertificateAuthority,
    CertificateSink, CertificateSource, Challenge, ChallengeKind, ChallengeResponseStore,
    ChallengeStatus, Order, OrderStatus, StoreError,
};
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair, date_time_ymd};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub type Ymd = (i32, u8, u8);

pub fn at(ymd: Ymd) -> SystemTime {
    let timestamp = date_time_ymd(ymd.0, ymd.1, ymd.2).unix_timestamp();
    UNIX_EPOCH + Duration::from_secs(timestamp as u64)
}

pub fn hostnames(names: &[&str]) -> HostnameSet {
    HostnameSet::new(names.iter().copied()).unwrap()
}

/// Self-signed certificate for `names`, valid between the two dates.
pub fn certificate(names: &[&str], from: Ymd, to: Ymd) -> ManagedCertificate {
    let set = hostnames(names);
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let (chain_pem, key_pem) = chain_pem(&names, from, to);
    ManagedCertificate::from_pem(set, &chain_pem, &key_pem, at(from)).unwrap()
}

/// Leaf plus an unrelated issuer certificate, leaf first.
fn chain_pem(names: &[String], from: Ymd, to: Ymd) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(names.to_vec()).unwrap();
    params.not_before = date_time_ymd(from.0, from.1, from.2);
    params.not_after = date_time_ymd(to.0, to.1, to.2);
    let leaf = params.self_signed(&key).unwrap();

    let issuer_key = KeyPair::generate().unwrap();
    let issuer = CertificateParams::new(vec!["issuer.ca.test".to_string()])
        .unwrap()
        .self_signed(&issuer_key)
        .unwrap();

    (format!("{}{}", leaf.pem(), issuer.pem()), key.serialize_pem())
}

/// Master config managing the given hostname sets with short timers.
pub fn master_config(sets: &[&[&str]]) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.certificates = sets
        .iter()
        .map(|names| CertificateEntry {
            hostnames: names.iter().map(|n| n.to_string()).collect(),
        })
        .collect();
    config.renewal.check_interval_secs = 3600;
    config.renewal.retry_initial_secs = 60;
    config.renewal.retry_max_secs = 600;
    config.store.refresh_interval_secs = 30;
    config.validate().unwrap();
    config
}

/// In-memory shared store; stands in for the volume masters publish to.
#[derive(Default)]
pub struct MemoryStore {
    certificates: Mutex<Vec<ManagedCertificate>>,
    publishes: AtomicUsize,
}

impl MemoryStore {
    pub fn with(certificates: Vec<ManagedCertificate>) -> Self {
        Self {
            certificates: Mutex::new(certificates),
            publishes: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, hostnames: &HostnameSet) -> Option<ManagedCertificate> {
        self.certificates
            .lock()
            .iter()
            .find(|c| c.hostnames() == hostnames)
            .cloned()
    }

    pub fn publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateSource for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn certificates(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ManagedCertificate>, StoreError> {
        Ok(self.certificates.lock().clone())
    }
}

#[async_trait]
impl CertificateSink for MemoryStore {
    async fn publish(&self, certificate: &ManagedCertificate) -> Result<(), StoreError> {
        let mut certificates = self.certificates.lock();
        certificates.retain(|c| c.hostnames() != certificate.hostnames());
        certificates.push(certificate.clone());
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How the fake authority treats the next orders.
#[derive(Debug, Clone)]
pub struct Script {
    /// Polls after `set_challenge_ready` that still report `pending`.
    pub polls_before_verdict: u32,
    pub invalid_hostnames: Vec<String>,
    /// Authorizations never leave `pending`.
    pub never_validate: bool,
    pub validity: (Ymd, Ymd),
}

impl Default for Script {
    fn default() -> Self {
        Self {
            polls_before_verdict: 0,
            invalid_hostnames: Vec::new(),
            never_validate: false,
            validity: ((2020, 1, 1), (2020, 4, 1)),
        }
    }
}

/// One `set_challenge_ready` call and whether the HTTP-01 response was
/// already being served at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCall {
    pub hostname: String,
    pub kind: ChallengeKind,
    pub token: String,
    pub served: bool,
}

struct FakeAuthorization {
    hostname: String,
    token: String,
    status: AuthorizationStatus,
    ready: bool,
    polls: u32,
}

impl FakeAuthorization {
    fn view(&self, order: usize) -> Authorization {
        let challenge = |kind: ChallengeKind| Challenge {
            kind,
            token: self.token.clone(),
            status: match self.status {
                AuthorizationStatus::Pending if self.ready => ChallengeStatus::Processing,
                AuthorizationStatus::Pending => ChallengeStatus::Pending,
                AuthorizationStatus::Valid => ChallengeStatus::Valid,
                AuthorizationStatus::Invalid => ChallengeStatus::Invalid,
            },
            url: format!("https://ca.test/chall/{order}/{}/{kind}", self.hostname),
            key_authorization: format!("{}.thumbprint", self.token),
        };
        Authorization {
            hostname: self.hostname.clone(),
            status: self.status,
            challenges: vec![
                challenge(ChallengeKind::Http01),
                challenge(ChallengeKind::TlsAlpn01),
            ],
        }
    }
}

pub struct FakeOrder {
    id: usize,
    hostnames: HostnameSet,
    authorizations: Vec<FakeAuthorization>,
    status: OrderStatus,
    chain_pem: Option<String>,
}

/// Scripted ACME authority. Records what the node asked of it.
pub struct FakeAuthority {
    script: Mutex<Script>,
    hold: Mutex<Option<Arc<Notify>>>,
    watched: OnceLock<ChallengeResponseStore>,
    accounts: AtomicUsize,
    orders: AtomicUsize,
    finalized: AtomicUsize,
    ready_calls: Mutex<Vec<ReadyCall>>,
    served_at_verdict: Mutex<Vec<(String, bool)>>,
}

impl FakeAuthority {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            hold: Mutex::new(None),
            watched: OnceLock::new(),
            accounts: AtomicUsize::new(0),
            orders: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
            ready_calls: Mutex::new(Vec::new()),
            served_at_verdict: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    /// New orders block in `new_order` until the returned handle is notified.
    pub fn hold_orders(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock() = Some(notify.clone());
        notify
    }

    /// Watch the node's HTTP-01 store so challenge visibility is recorded.
    pub fn watch(&self, challenges: &ChallengeResponseStore) {
        let _ = self.watched.set(challenges.clone());
    }

    pub fn orders(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }

    pub fn accounts(&self) -> usize {
        self.accounts.load(Ordering::SeqCst)
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn ready_calls(&self) -> Vec<ReadyCall> {
        self.ready_calls.lock().clone()
    }

    /// `(hostname, served)` for every authorization that reached a verdict.
    pub fn served_at_verdict(&self) -> Vec<(String, bool)> {
        self.served_at_verdict.lock().clone()
    }

    fn served(&self, token: &str) -> bool {
        self.watched
            .get()
            .is_some_and(|challenges| challenges.get(token).is_some())
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    type OrderHandle = FakeOrder;

    async fn ensure_account(&self) -> Result<AcmeAccount, AcmeError> {
        self.accounts.fetch_add(1, Ordering::SeqCst);
        Ok(AcmeAccount {
            directory_url: "https://ca.test/directory".to_string(),
            account_url: "https://ca.test/acct/1".to_string(),
            created_timestamp: 0,
        })
    }

    async fn new_order(&self, hostnames: &HostnameSet) -> Result<FakeOrder, AcmeError> {
        let id = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        let hold = self.hold.lock().clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }

        let authorizations = hostnames
            .iter()
            .map(|hostname| FakeAuthorization {
                hostname: hostname.to_string(),
                token: format!("token-{id}-{}", hostname.replace('.', "-")),
                status: AuthorizationStatus::Pending,
                ready: false,
                polls: 0,
            })
            .collect();
        Ok(FakeOrder {
            id,
            hostnames: hostnames.clone(),
            authorizations,
            status: OrderStatus::Pending,
            chain_pem: None,
        })
    }

    async fn authorizations(&self, order: &mut FakeOrder) -> Result<Vec<Authorization>, AcmeError> {
        let script = self.script.lock().clone();
        for authz in &mut order.authorizations {
            if !authz.ready || authz.status.is_terminal() || script.never_validate {
                continue;
            }
            authz.polls += 1;
            if authz.polls <= script.polls_before_verdict {
                continue;
            }
            let served = self.served(&authz.token);
            self.served_at_verdict
                .lock()
                .push((authz.hostname.clone(), served));
            authz.status = if script.invalid_hostnames.contains(&authz.hostname) {
                AuthorizationStatus::Invalid
            } else {
                AuthorizationStatus::Valid
            };
        }

        if order
            .authorizations
            .iter()
            .any(|a| a.status == AuthorizationStatus::Invalid)
        {
            order.status = OrderStatus::Invalid;
        } else if order.status == OrderStatus::Pending
            && order
                .authorizations
                .iter()
                .all(|a| a.status == AuthorizationStatus::Valid)
        {
            order.status = OrderStatus::Ready;
        }

        Ok(order
            .authorizations
            .iter()
            .map(|authz| authz.view(order.id))
            .collect())
    }

    async fn set_challenge_ready(
        &self,
        order: &mut FakeOrder,
        hostname: &str,
        kind: ChallengeKind,
    ) -> Result<(), AcmeError> {
        let authz = order
            .authorizations
            .iter_mut()
            .find(|a| a.hostname == hostname)
            .ok_or_else(|| AcmeError::UnknownAuthorization {
                hostname: hostname.to_string(),
            })?;
        authz.ready = true;
        let served = self.served(&authz.token);
        self.ready_calls.lock().push(ReadyCall {
            hostname: hostname.to_string(),
            kind,
            token: authz.token.clone(),
            served,
        });
        Ok(())
    }

    async fn refresh(&self, order: &mut FakeOrder) -> Result<Order, AcmeError> {
        Ok(Order {
            status: order.status,
            finalize_url: format!("https://ca.test/order/{}/finalize", order.id),
            certificate_url: order
                .chain_pem
                .as_ref()
                .map(|_| format!("https://ca.test/cert/{}", order.id)),
        })
    }

    async fn finalize(&self, order: &mut FakeOrder, csr_der: &[u8]) -> Result<(), AcmeError> {
        if order.status != OrderStatus::Ready || csr_der.is_empty() {
            return Err(AcmeError::Rejected {
                problem: "urn:ietf:params:acme:error:orderNotReady".to_string(),
                detail: format!("order is {}", order.status),
            });
        }
        let (from, to) = self.script.lock().validity;
        let (chain_pem, _) = chain_pem(&order.hostnames.to_vec(), from, to);
        order.chain_pem = Some(chain_pem);
        order.status = OrderStatus::Valid;
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn certificate(&self, order: &mut FakeOrder) -> Result<Option<String>, AcmeError> {
        Ok(order.chain_pem.clone())
    }
}

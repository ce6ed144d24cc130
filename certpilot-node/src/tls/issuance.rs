//! One issuance run: account, order, challenges, validation, finalize, download

use super::acme::{AcmeError, AuthorizationStatus, CertificateAuthority, ChallengeKind, OrderStatus};
use super::alpn::AlpnChallengeResponder;
use super::challenge::ChallengeResponseStore;
use super::factory::CertificateFactory;
use super::retry::{self, Backoff, retry_transient};
use crate::defaults::{AUTHORIZATION_TIMEOUT, ORDER_TIMEOUT};
use certpilot_core::{HostnameSet, ManagedCertificate};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which challenge types the driver may answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ChallengePolicy {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    /// tls-alpn-01 when a TLS validation listener is running, else http-01.
    #[default]
    #[serde(rename = "any")]
    Any,
}

impl ChallengePolicy {
    pub fn preference(&self, tls_listener: bool) -> &'static [ChallengeKind] {
        match (self, tls_listener) {
            (ChallengePolicy::Http01, _) => &[ChallengeKind::Http01],
            (ChallengePolicy::TlsAlpn01, _) => &[ChallengeKind::TlsAlpn01],
            (ChallengePolicy::Any, true) => &[ChallengeKind::TlsAlpn01, ChallengeKind::Http01],
            (ChallengePolicy::Any, false) => &[ChallengeKind::Http01],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IssuanceTimeouts {
    /// Per-authorization validation window
    pub authorization: Duration,
    pub order: Duration,
}

impl Default for IssuanceTimeouts {
    fn default() -> Self {
        Self {
            authorization: AUTHORIZATION_TIMEOUT,
            order: ORDER_TIMEOUT,
        }
    }
}

/// Drives the authority through one complete issuance for a hostname set.
pub struct IssuanceDriver<A: CertificateAuthority> {
    authority: Arc<A>,
    challenges: ChallengeResponseStore,
    alpn: AlpnChallengeResponder,
    factory: CertificateFactory,
    policy: ChallengePolicy,
    tls_listener: bool,
    timeouts: IssuanceTimeouts,
}

impl<A: CertificateAuthority> IssuanceDriver<A> {
    pub fn new(
        authority: Arc<A>,
        challenges: ChallengeResponseStore,
        alpn: AlpnChallengeResponder,
        factory: CertificateFactory,
    ) -> Self {
        Self {
            authority,
            challenges,
            alpn,
            factory,
            policy: ChallengePolicy::default(),
            tls_listener: false,
            timeouts: IssuanceTimeouts::default(),
        }
    }

    pub fn with_challenge_policy(mut self, policy: ChallengePolicy, tls_listener: bool) -> Self {
        self.policy = policy;
        self.tls_listener = tls_listener;
        self
    }

    pub fn with_timeouts(mut self, timeouts: IssuanceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn authority(&self) -> &Arc<A> {
        &self.authority
    }

    pub fn factory(&self) -> &CertificateFactory {
        &self.factory
    }

    /// Obtain a new certificate for `hostnames`.
    ///
    /// Every challenge entry registered during the run is removed before this
    /// returns, on success, failure and cancellation alike.
    pub async fn issue(
        &self,
        hostnames: &HostnameSet,
        cancel: &CancellationToken,
    ) -> Result<ManagedCertificate, AcmeError> {
        let authority = self.authority.as_ref();

        let account = retry_transient!(cancel, "new_account", authority.ensure_account())?;
        tracing::debug!(account = %account.account_url, "Using ACME account");

        tracing::info!(hostnames = %hostnames, "Requesting certificate via ACME");
        let mut order = retry_transient!(cancel, "new_order", authority.new_order(hostnames))?;

        let mut registrations = ChallengeRegistrations::new(&self.challenges, &self.alpn);
        let mut pending = BTreeSet::new();

        let authorizations =
            retry_transient!(cancel, "authorizations", authority.authorizations(&mut order))?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => {
                    tracing::debug!(hostname = %authz.hostname, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Invalid => {
                    return Err(AcmeError::ValidationFailed {
                        hostname: authz.hostname.clone(),
                    });
                }
                AuthorizationStatus::Pending => {}
            }

            let preference = self.policy.preference(self.tls_listener);
            let challenge = preference
                .iter()
                .find_map(|kind| authz.challenge(*kind))
                .ok_or_else(|| AcmeError::ChallengeUnavailable {
                    hostname: authz.hostname.clone(),
                    kind: preference[0],
                })?;

            match challenge.kind {
                ChallengeKind::Http01 => registrations.http(
                    &authz.hostname,
                    &challenge.token,
                    &challenge.key_authorization,
                ),
                ChallengeKind::TlsAlpn01 => {
                    registrations.alpn(&authz.hostname, &challenge.key_authorization)?
                }
            }
            tracing::info!(
                hostname = %authz.hostname,
                challenge = %challenge.kind,
                token = %challenge.token,
                "Challenge ready"
            );

            retry_transient!(
                cancel,
                "challenge_ready",
                authority.set_challenge_ready(&mut order, &authz.hostname, challenge.kind)
            )?;
            pending.insert(authz.hostname.clone());
        }

        self.await_authorizations(&mut order, &mut registrations, pending, cancel)
            .await?;
        self.await_order_ready(&mut order, hostnames, cancel).await?;

        let certificate = self
            .factory
            .issue(authority, &mut order, hostnames, cancel)
            .await?;
        drop(registrations);

        tracing::info!(
            hostnames = %hostnames,
            not_after = ?certificate.not_after(),
            "Certificate issued successfully"
        );
        Ok(certificate)
    }

    /// Poll until every pending authorization is terminal. Each entry is
    /// deregistered as soon as its authorization leaves `pending`.
    async fn await_authorizations(
        &self,
        order: &mut A::OrderHandle,
        registrations: &mut ChallengeRegistrations<'_>,
        mut pending: BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<(), AcmeError> {
        let deadline = Instant::now() + self.timeouts.authorization;
        let mut backoff = Backoff::polling();

        while !pending.is_empty() {
            retry::sleep(cancel, backoff.next_delay()).await?;

            match retry::cancellable(cancel, self.authority.authorizations(order)).await {
                Ok(authorizations) => {
                    for authz in authorizations {
                        if !authz.status.is_terminal() || !pending.remove(&authz.hostname) {
                            continue;
                        }
                        registrations.release(&authz.hostname);
                        if authz.status == AuthorizationStatus::Invalid {
                            tracing::warn!(hostname = %authz.hostname, "Authorization invalid");
                            return Err(AcmeError::ValidationFailed {
                                hostname: authz.hostname,
                            });
                        }
                        tracing::debug!(hostname = %authz.hostname, "Authorization valid");
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Transient error polling authorizations");
                }
                Err(e) => return Err(e),
            }

            if !pending.is_empty() && Instant::now() >= deadline {
                let hostname = pending.into_iter().next().unwrap_or_default();
                return Err(AcmeError::AuthorizationTimeout { hostname });
            }
        }
        Ok(())
    }

    async fn await_order_ready(
        &self,
        order: &mut A::OrderHandle,
        hostnames: &HostnameSet,
        cancel: &CancellationToken,
    ) -> Result<(), AcmeError> {
        let deadline = Instant::now() + self.timeouts.order;
        let mut backoff = Backoff::polling();
        loop {
            let last = match retry::cancellable(cancel, self.authority.refresh(order)).await {
                Ok(state) => match state.status {
                    OrderStatus::Ready => {
                        tracing::info!(hostnames = %hostnames, "Order ready, finalizing");
                        return Ok(());
                    }
                    OrderStatus::Invalid => {
                        return Err(AcmeError::OrderInvalid { stage: "validating" });
                    }
                    status => status,
                },
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Transient error polling order");
                    OrderStatus::Pending
                }
                Err(e) => return Err(e),
            };
            if Instant::now() >= deadline {
                return Err(AcmeError::OrderTimeout {
                    expected: OrderStatus::Ready,
                    last,
                });
            }
            retry::sleep(cancel, backoff.next_delay()).await?;
        }
    }
}

enum Registration {
    Http { hostname: String, token: String },
    Alpn { hostname: String },
}

impl Registration {
    fn hostname(&self) -> &str {
        match self {
            Registration::Http { hostname, .. } | Registration::Alpn { hostname } => hostname,
        }
    }
}

/// Challenge entries owned by one run; whatever is left is removed on drop.
struct ChallengeRegistrations<'a> {
    http: &'a ChallengeResponseStore,
    alpn: &'a AlpnChallengeResponder,
    entries: Vec<Registration>,
}

impl<'a> ChallengeRegistrations<'a> {
    fn new(http: &'a ChallengeResponseStore, alpn: &'a AlpnChallengeResponder) -> Self {
        Self {
            http,
            alpn,
            entries: Vec::new(),
        }
    }

    fn http(&mut self, hostname: &str, token: &str, key_authorization: &str) {
        self.http.put(token, key_authorization);
        self.entries.push(Registration::Http {
            hostname: hostname.to_string(),
            token: token.to_string(),
        });
    }

    fn alpn(&mut self, hostname: &str, key_authorization: &str) -> Result<(), AcmeError> {
        self.alpn.register(hostname, key_authorization)?;
        self.entries.push(Registration::Alpn {
            hostname: hostname.to_string(),
        });
        Ok(())
    }

    fn release(&mut self, hostname: &str) {
        let (released, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.hostname() == hostname);
        self.entries = kept;
        for entry in released {
            self.remove(&entry);
        }
    }

    fn remove(&self, entry: &Registration) {
        match entry {
            Registration::Http { token, .. } => self.http.remove(token),
            Registration::Alpn { hostname } => self.alpn.remove(hostname),
        }
    }
}

impl Drop for ChallengeRegistrations<'_> {
    fn drop(&mut self) {
        for entry in &self.entries {
            self.remove(entry);
        }
    }
}

//! TLS/Certificate lifecycle
//!
//! Handles:
//! - ACME issuance and renewal (HTTP-01 and TLS-ALPN-01 challenges)
//! - Challenge responders for both validation methods
//! - Certificate selection for TLS handshakes
//! - The shared certificate store masters publish to and followers read from

pub mod acme;
pub mod alpn;
pub mod challenge;
pub mod factory;
pub mod issuance;
pub mod listener;
pub mod retry;
pub mod selector;
pub mod state_machine;
pub mod store;

pub use acme::{
    AcmeAccount, AcmeConfig, AcmeError, Authorization, AuthorizationStatus, CertificateAuthority,
    Challenge, ChallengeKind, ChallengeStatus, ExternalAccountBinding, FailureKind,
    InstantAcmeAuthority, Order, OrderStatus,
};
pub use alpn::{ACME_TLS_ALPN_NAME, AlpnChallengeResponder};
pub use challenge::{ACME_CHALLENGE_PREFIX, ChallengeResponseStore};
pub use factory::{CertificateFactory, KeyAlgorithm};
pub use issuance::{ChallengePolicy, IssuanceDriver, IssuanceTimeouts};
pub use retry::Backoff;
pub use selector::{AcmeCertResolver, CertificateSelector, SelectorError};
pub use state_machine::{
    AcmeState, AcmeStateMachine, LifecycleStatus, Outcome, RenewalSchedule, Trigger,
};
pub use store::{
    CertificateRefresher, CertificateSink, CertificateSource, DirectoryCertificateStore,
    StartupCertificateLoader, StoreError,
};

use rustls::crypto::CryptoProvider;
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::SigningKey;
use std::sync::Arc;

pub fn install_rustls_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Load a private key with the process-wide crypto provider.
pub(crate) fn load_signing_key(
    key: PrivateKeyDer<'static>,
) -> Result<Arc<dyn SigningKey>, rustls::Error> {
    match CryptoProvider::get_default() {
        Some(provider) => provider.key_provider.load_private_key(key),
        None => rustls::crypto::aws_lc_rs::default_provider()
            .key_provider
            .load_private_key(key),
    }
}

//! Certpilot Core - shared certificate domain types
//!
//! This crate holds the pieces every certpilot node agrees on, whatever its
//! role in the pool:
//!
//! - [`HostnameSet`] - the unit of issuance and renewal
//! - [`ManagedCertificate`] - an issued certificate chain plus its private key
//! - [`RenewalPolicy`] - the pure "is renewal due" decision
//! - [`Clock`] - the source of "now" for that decision
//!
//! Nothing here performs network or filesystem I/O.

mod certificate;
mod clock;
mod renewal;

pub use certificate::{CertificateError, HostnameSet, ManagedCertificate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use renewal::{DEFAULT_RENEWAL_THRESHOLD, PolicyError, RenewalDecision, RenewalPolicy};

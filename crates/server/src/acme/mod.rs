//! On-demand certificate automation
//!
//! Certificates are obtained from an ACME CA the first time a hostname is
//! seen in a TLS handshake, but only for hostnames the
//! [`DomainAuthorizationGate`] allows. The pieces:
//!
//! - [`CaEnvironment`]: which CA directory and trust roots to use
//! - [`DomainAuthorizationGate`]: the allow/deny decision for a hostname
//! - [`CertificateCache`] and [`IssuerConfig`]: in-memory certificates and the
//!   issuer configuration they are bound to after construction
//! - [`OnDemandManager`]: cache lookup, gate check and issuance per handshake
//! - [`AcmeClient`]: the HTTP-01 ACME protocol flow
//! - [`MaintenanceScheduler`]: background renewal and storage cleaning
//! - [`CertificateStorage`]: account credentials and certificates on disk

pub mod cache;
pub mod challenge;
pub mod client;
pub mod environment;
pub mod error;
pub mod gate;
pub mod manager;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
pub(crate) mod tests_support;

pub use cache::{
    build_issuer_config, CacheEntry, CertificateCache, IssuancePolicy, IssuerConfig, IssuerSlot,
};
pub use challenge::ChallengeManager;
pub use client::{AcmeClient, CertificateIssuer, IssuedCertificate};
pub use environment::CaEnvironment;
pub use error::{AcmeError, CacheError, EnvironmentError, GenerationError, StorageError};
pub use gate::{Decision, DomainAuthorizationGate};
pub use manager::OnDemandManager;
pub use scheduler::{MaintenanceReport, MaintenanceScheduler};
pub use storage::CertificateStorage;

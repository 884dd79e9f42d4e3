//! Keygate TLS Engine Library
//!
//! Terminates TLS for an open-ended set of hostnames and obtains their
//! certificates from an ACME CA on first use. A hostname only ever gets a
//! certificate when the domain registry says it should.
//!
//! This library provides:
//!
//! - **Authorization**: per-hostname allow/deny against the domain registry
//! - **Certificate automation**: on-demand issuance, caching, renewal and storage
//! - **Bootstrap certificates**: a self-signed admin certificate for first start
//! - **TLS termination**: SNI-driven certificate selection and forwarding
//! - **Log noise filtering**: suppression of one known startup log line
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keygate_common::MemoryRegistry;
//! use keygate_config::Config;
//! use keygate_server::Engine;
//!
//! let config = Config::from_file("keygate.toml")?;
//! let registry = Arc::new(MemoryRegistry::with_records(config.domains.clone()));
//! let engine = Engine::build(config, registry)?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod bootstrap;
pub mod engine;
pub mod http;
pub mod logging;
pub mod reload;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use acme::{
    AcmeError, CaEnvironment, CertificateCache, DomainAuthorizationGate, IssuerConfig,
    OnDemandManager,
};
pub use bootstrap::{BootstrapCertificate, BootstrapCertificateGenerator, Subject};
pub use engine::{Engine, EngineError, Listeners};
pub use logging::{init_tracing, NoiseFilter};

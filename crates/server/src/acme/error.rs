//! Error types for certificate automation

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the on-disk certificate store
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored metadata could not be (de)serialized
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Domain name cannot be used as a storage key
    #[error("invalid domain for storage: {0:?}")]
    InvalidDomain(String),
}

/// Errors raised while selecting the CA environment
///
/// Any of these at startup is fatal: serving TLS against the wrong trust
/// store makes every handshake fail in ways that are hard to diagnose.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The embedded development root certificate is unusable
    #[error("embedded development root certificate is invalid: {0}")]
    InvalidTrustRoot(String),
}

/// Errors from the certificate cache and its issuer binding
#[derive(Debug, Error)]
pub enum CacheError {
    /// The issuer configuration was read before startup bound it
    #[error("issuer configuration read before it was bound")]
    Unbound,

    /// A second issuer configuration was bound to the same cache
    #[error("issuer configuration already bound")]
    AlreadyBound,

    /// The bound issuer configuration has been dropped
    #[error("issuer configuration is no longer alive")]
    Released,

    /// The resolver returned a configuration other than the one just bound
    #[error("cache resolver returned a different issuer configuration")]
    Mismatch,
}

/// Errors from on-demand certificate management
#[derive(Debug, Error)]
pub enum AcmeError {
    /// The gate refused the hostname
    #[error("certificate for {hostname:?} not permitted")]
    AuthorizationDenied { hostname: String },

    /// Failed to create or load the ACME account
    #[error("ACME account error: {0}")]
    Account(String),

    /// Failed to create a certificate order
    #[error("order creation failed: {0}")]
    OrderCreation(String),

    /// Challenge validation failed or timed out
    #[error("challenge failed: {0}")]
    Challenge(String),

    /// Order finalization or certificate download failed
    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    /// CSR or key generation failed
    #[error("certificate generation error: {0}")]
    CertGeneration(String),

    /// Issued certificate could not be parsed or loaded
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Certificate store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Cache binding failure
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl AcmeError {
    /// Whether this error is an expected refusal rather than a fault
    pub fn is_denial(&self) -> bool {
        matches!(self, AcmeError::AuthorizationDenied { .. })
    }
}

/// Errors from bootstrap certificate generation, one per step
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The OS random source failed while drawing the serial number
    #[error("failed to generate serial number: {0}")]
    Serial(String),

    /// RSA key generation or encoding failed
    #[error("failed to generate private key: {0}")]
    KeyGeneration(String),

    /// The certificate could not be built or signed
    #[error("failed to create certificate: {0}")]
    Certificate(String),

    /// A parent directory could not be created
    #[error("failed to create directory {path:?}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An output file could not be opened or written
    #[error("failed to write {path:?}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

//! TLS termination
//!
//! Each connection is accepted lazily: the ClientHello is read first, the
//! certificate for its SNI name is looked up (or obtained), and only then is
//! the handshake completed. Decrypted bytes are forwarded to the admin or the
//! public backend.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, ServerConfig};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, trace, warn};

use crate::acme::{AcmeError, OnDemandManager};

/// Errors from certificate loading and TLS serving
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    #[error("no certificate found in PEM")]
    NoCertificate,

    #[error("no private key found in PEM")]
    NoPrivateKey,

    #[error("unsupported private key: {0}")]
    UnsupportedKey(String),

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("private key does not match certificate: {0}")]
    KeyMismatch(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("backend {addr} unreachable: {source}")]
    Backend {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Certificate loading
// ============================================================================

/// Parse a PEM certificate chain and private key into a signing-ready key
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, TlsError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::InvalidPem(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(|e| TlsError::InvalidPem(e.to_string()))?
        .ok_or(TlsError::NoPrivateKey)?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| TlsError::UnsupportedKey(e.to_string()))?;

    let key = CertifiedKey::new(certs, signing_key);
    match key.keys_match() {
        // Signing keys that cannot report their public half are not checked
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => Ok(key),
        Err(e) => Err(TlsError::KeyMismatch(e.to_string())),
    }
}

/// Load a certificate and key from disk
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
    };

    let key = certified_key_from_pem(&read(cert_path)?, &read(key_path)?)?;
    debug!(cert = %cert_path.display(), "Loaded certificate from disk");
    Ok(key)
}

/// Validity window `(not_before, not_after)` of a DER certificate
pub fn certificate_validity(
    cert: &CertificateDer<'_>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), TlsError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| TlsError::Parse(e.to_string()))?;

    let validity = parsed.validity();
    let to_utc = |ts: i64| {
        DateTime::from_timestamp(ts, 0)
            .ok_or_else(|| TlsError::Parse(format!("timestamp {} out of range", ts)))
    };

    Ok((
        to_utc(validity.not_before.timestamp())?,
        to_utc(validity.not_after.timestamp())?,
    ))
}

/// Validity window of the leaf certificate of a certified key
pub fn leaf_validity(key: &CertifiedKey) -> Result<(DateTime<Utc>, DateTime<Utc>), TlsError> {
    let leaf = key.cert.first().ok_or(TlsError::NoCertificate)?;
    certificate_validity(leaf)
}

// ============================================================================
// Certificate selection
// ============================================================================

/// Which backend a connection is forwarded to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Admin,
    Public,
}

/// Picks the certificate for a ClientHello
pub struct CertificateSelector {
    manager: Arc<OnDemandManager>,
    admin_hostname: String,
    /// Bootstrap or operator-supplied certificate for the admin hostname
    admin_key: Arc<CertifiedKey>,
}

impl CertificateSelector {
    pub fn new(
        manager: Arc<OnDemandManager>,
        admin_hostname: impl Into<String>,
        admin_key: Arc<CertifiedKey>,
    ) -> Self {
        Self {
            manager,
            admin_hostname: admin_hostname.into(),
            admin_key,
        }
    }

    /// Certificate and route for a server name
    ///
    /// The admin hostname, and connections without SNI, always get a
    /// certificate: an ACME one when admin auto-TLS is on and issuance
    /// works, the static one otherwise. Every other name goes through the
    /// on-demand manager and may be refused.
    pub async fn select(
        &self,
        server_name: Option<&str>,
    ) -> Result<(Route, Arc<CertifiedKey>), AcmeError> {
        let Some(name) = server_name else {
            trace!("No SNI in ClientHello, serving admin certificate");
            return Ok((Route::Admin, Arc::clone(&self.admin_key)));
        };

        if name != self.admin_hostname {
            let entry = self.manager.certificate_for(name).await?;
            return Ok((Route::Public, Arc::clone(&entry.certified_key)));
        }

        if self.manager.config().gate().admin_auto_tls() {
            match self.manager.certificate_for(name).await {
                Ok(entry) => return Ok((Route::Admin, Arc::clone(&entry.certified_key))),
                Err(e) => {
                    warn!(
                        hostname = %name,
                        error = %e,
                        "Admin certificate unavailable, serving fallback"
                    );
                }
            }
        }

        Ok((Route::Admin, Arc::clone(&self.admin_key)))
    }
}

impl std::fmt::Debug for CertificateSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSelector")
            .field("admin_hostname", &self.admin_hostname)
            .finish()
    }
}

/// Serves one already-chosen certificate
#[derive(Debug)]
struct FixedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Server configuration presenting `key`
pub fn server_config(key: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertificate(key)));
    Ok(Arc::new(config))
}

// ============================================================================
// Listener
// ============================================================================

/// Where decrypted traffic goes
#[derive(Debug, Clone, Copy)]
pub struct Backends {
    pub admin: SocketAddr,
    pub public: SocketAddr,
}

impl Backends {
    pub fn for_route(&self, route: Route) -> SocketAddr {
        match route {
            Route::Admin => self.admin,
            Route::Public => self.public,
        }
    }
}

/// Connection limits for the TLS listener
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Open connections, handshaking or forwarding
    pub max_connections: usize,
    /// Bound on each of the ClientHello read and the handshake completion
    pub handshake_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Accept TLS connections until `shutdown` flips to true
pub async fn serve_tls(
    listener: TcpListener,
    selector: Arc<CertificateSelector>,
    backends: Backends,
    shutdown: watch::Receiver<bool>,
) {
    let limits = ConnectionLimits::default();
    serve_tls_with_limits(listener, selector, backends, limits, shutdown).await
}

pub async fn serve_tls_with_limits(
    listener: TcpListener,
    selector: Arc<CertificateSelector>,
    backends: Backends,
    limits: ConnectionLimits,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(
            addr = %addr,
            max_connections = limits.max_connections,
            "HTTPS listener started"
        );
    }

    let connection_semaphore = Arc::new(Semaphore::new(limits.max_connections));

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "TCP accept error");
                        continue;
                    }
                };

                let Ok(permit) = Arc::clone(&connection_semaphore).try_acquire_owned() else {
                    warn!(peer = %peer, "TLS connection limit reached, rejecting");
                    continue;
                };

                let selector = Arc::clone(&selector);
                tokio::spawn(async move {
                    let _permit = permit;
                    let timeout = limits.handshake_timeout;
                    if let Err(e) =
                        handle_connection(stream, peer, &selector, backends, timeout).await
                    {
                        debug!(peer = %peer, error = %e, "TLS connection ended with error");
                    }
                });
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("HTTPS listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    selector: &CertificateSelector,
    backends: Backends,
    handshake_timeout: Duration,
) -> Result<(), TlsError> {
    let start = tokio::time::timeout(
        handshake_timeout,
        LazyConfigAcceptor::new(Acceptor::default(), stream),
    )
    .await
    .map_err(|_| TlsError::HandshakeTimeout(handshake_timeout))?
    .map_err(TlsError::Handshake)?;

    let server_name = start.client_hello().server_name().map(str::to_owned);

    let (route, key) = match selector.select(server_name.as_deref()).await {
        Ok(selected) => selected,
        Err(e) if e.is_denial() => {
            // Already logged by the gate; the handshake just fails
            trace!(peer = %peer, "Dropping connection for unauthorized hostname");
            return Ok(());
        }
        Err(e) => {
            warn!(
                peer = %peer,
                hostname = server_name.as_deref().unwrap_or("-"),
                error = %e,
                "No certificate available"
            );
            return Ok(());
        }
    };

    let handshake = start.into_stream(server_config(key)?);
    let mut tls = tokio::time::timeout(handshake_timeout, handshake)
        .await
        .map_err(|_| TlsError::HandshakeTimeout(handshake_timeout))?
        .map_err(TlsError::Handshake)?;

    let addr = backends.for_route(route);
    let mut backend = TcpStream::connect(addr)
        .await
        .map_err(|source| TlsError::Backend { addr, source })?;

    match tokio::io::copy_bidirectional(&mut tls, &mut backend).await {
        Ok((from_client, from_backend)) => {
            trace!(
                peer = %peer,
                route = ?route,
                from_client,
                from_backend,
                "Connection closed"
            );
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Forwarding interrupted");
        }
    }

    Ok(())
}

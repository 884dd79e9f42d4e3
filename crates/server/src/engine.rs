//! Startup sequencing and task wiring
//!
//! [`Engine::build`] runs every fallible startup step in order: CA
//! environment, admin certificate, certificate store, authorization gate,
//! cache/issuer wiring, ACME client. Any failure aborts before a socket is
//! bound. [`Engine::serve`] then runs the listeners and the maintenance task
//! until shutdown.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keygate_common::{DomainRegistry, MemoryRegistry};
use keygate_config::{AdminConfig, Config, ListenerConfig};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::acme::{
    build_issuer_config, AcmeClient, AcmeError, CaEnvironment, CacheError, CertificateIssuer,
    CertificateStorage, ChallengeManager, DomainAuthorizationGate, EnvironmentError,
    GenerationError, IssuancePolicy, MaintenanceScheduler, OnDemandManager, StorageError,
};
use crate::bootstrap::{BootstrapCertificateGenerator, Subject};
use crate::http::serve_http;
use crate::reload::{run_signal_loop, ConfigReloader, SignalManager};
use crate::tls::{load_certified_key, serve_tls, Backends, CertificateSelector, TlsError};

/// Errors that abort startup
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("CA environment selection failed: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("admin certificate unavailable: {0}")]
    AdminCertificate(#[from] TlsError),

    #[error("bootstrap certificate generation failed: {0}")]
    Bootstrap(#[from] GenerationError),

    #[error("only one of {cert:?} and {key:?} exists; provide both or neither")]
    IncompleteAdminCertificate { cert: PathBuf, key: PathBuf },

    #[error("certificate store unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("certificate cache wiring failed: {0}")]
    Cache(#[from] CacheError),

    #[error("ACME client setup failed: {0}")]
    Acme(#[from] AcmeError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to register signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// Listening sockets, bound before any task starts
#[derive(Debug)]
pub struct Listeners {
    pub https: TcpListener,
    pub http: TcpListener,
}

impl Listeners {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, EngineError> {
        Ok(Self {
            https: bind(config.https).await?,
            http: bind(config.http).await?,
        })
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, EngineError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| EngineError::Bind { addr, source })
}

/// A fully wired certificate engine
pub struct Engine {
    config: Config,
    registry: Arc<MemoryRegistry>,
    challenges: ChallengeManager,
    manager: Arc<OnDemandManager>,
    selector: Arc<CertificateSelector>,
}

impl Engine {
    /// Wire the engine with an ACME client for the configured CA
    pub fn build(config: Config, registry: Arc<MemoryRegistry>) -> Result<Self, EngineError> {
        Self::build_inner(config, registry, None)
    }

    /// Wire the engine with a caller-supplied issuer instead of ACME
    pub fn build_with_issuer(
        config: Config,
        registry: Arc<MemoryRegistry>,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Result<Self, EngineError> {
        Self::build_inner(config, registry, Some(issuer))
    }

    fn build_inner(
        config: Config,
        registry: Arc<MemoryRegistry>,
        issuer: Option<Arc<dyn CertificateIssuer>>,
    ) -> Result<Self, EngineError> {
        let environment = Arc::new(CaEnvironment::select(
            config.mode,
            config.acme.email.as_str(),
        )?);

        let admin_key = Arc::new(admin_certificate(&config.admin)?);

        let storage = Arc::new(CertificateStorage::new(&config.acme.storage_path)?);

        let gate = Arc::new(DomainAuthorizationGate::new(
            config.admin.hostname.as_str(),
            config.admin.auto_tls,
            Arc::clone(&registry) as Arc<dyn DomainRegistry>,
        ));

        let policy = IssuancePolicy {
            staging: config.acme.staging,
            renew_before: chrono::Duration::days(i64::from(config.acme.renew_before_days)),
        };
        let issuer_config = build_issuer_config(Arc::clone(&environment), storage, gate, policy)?;

        let challenges = ChallengeManager::new();
        let issuer: Arc<dyn CertificateIssuer> = match issuer {
            Some(issuer) => issuer,
            None => Arc::new(AcmeClient::new(&environment, challenges.clone())?),
        };

        let manager = Arc::new(OnDemandManager::new(issuer_config, issuer));
        let selector = Arc::new(CertificateSelector::new(
            Arc::clone(&manager),
            config.admin.hostname.as_str(),
            admin_key,
        ));

        info!(
            mode = ?config.mode,
            admin = %config.admin.hostname,
            admin_auto_tls = config.admin.auto_tls,
            domains = registry.len(),
            "Certificate engine ready"
        );

        Ok(Self {
            config,
            registry,
            challenges,
            manager,
            selector,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<OnDemandManager> {
        &self.manager
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    /// Run listeners and maintenance until `shutdown` flips to true
    pub async fn serve(self, listeners: Listeners, shutdown: watch::Receiver<bool>) {
        let backends = Backends {
            admin: self.config.admin.backend,
            public: self.config.listeners.backend,
        };
        let https_port = listeners
            .https
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.listeners.https.port());

        let scheduler = MaintenanceScheduler::new(Arc::clone(&self.manager)).with_interval(
            Duration::from_secs(self.config.acme.maintenance_interval_secs),
        );

        let tasks = vec![
            tokio::spawn(scheduler.run(shutdown.clone())),
            tokio::spawn(serve_http(
                listeners.http,
                self.challenges.clone(),
                https_port,
                shutdown.clone(),
            )),
            tokio::spawn(serve_tls(
                listeners.https,
                Arc::clone(&self.selector),
                backends,
                shutdown,
            )),
        ];

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Engine task panicked");
            }
        }
        info!("Certificate engine stopped");
    }

    /// Bind the configured sockets and serve until SIGTERM or SIGINT
    ///
    /// SIGHUP reloads the domain list from `config_path`.
    pub async fn run(self, config_path: PathBuf) -> Result<(), EngineError> {
        let listeners = Listeners::bind(&self.config.listeners).await?;

        let signals = SignalManager::new();
        signals.listen_os_signals().map_err(EngineError::Signals)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reloader = ConfigReloader::new(
            config_path,
            Arc::clone(&self.registry),
            self.config.clone(),
        );
        let control = tokio::spawn(run_signal_loop(signals, reloader, shutdown_tx));

        self.serve(listeners, shutdown_rx).await;

        if !control.is_finished() {
            warn!("Listeners stopped before a shutdown signal");
            control.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.config.mode)
            .field("admin_hostname", &self.config.admin.hostname)
            .field("domains", &self.registry.len())
            .finish()
    }
}

/// Load the admin certificate, generating a bootstrap one on first start
///
/// Generation only happens when neither file exists, so an operator's
/// certificate is never overwritten.
pub fn admin_certificate(admin: &AdminConfig) -> Result<CertifiedKey, EngineError> {
    let cert_exists = admin.cert_path.exists();
    let key_exists = admin.key_path.exists();

    match (cert_exists, key_exists) {
        (true, true) => {}
        (false, false) => {
            info!(
                hostname = %admin.hostname,
                cert = %admin.cert_path.display(),
                "No admin certificate found, generating bootstrap certificate"
            );
            generate_bootstrap(&admin.hostname, &admin.cert_path, &admin.key_path)?;
        }
        _ => {
            return Err(EngineError::IncompleteAdminCertificate {
                cert: admin.cert_path.clone(),
                key: admin.key_path.clone(),
            });
        }
    }

    Ok(load_certified_key(&admin.cert_path, &admin.key_path)?)
}

fn generate_bootstrap(
    hostname: &str,
    cert_path: &Path,
    key_path: &Path,
) -> Result<(), EngineError> {
    BootstrapCertificateGenerator::new().generate(
        &Subject::new(hostname),
        &[hostname.to_string()],
        cert_path,
        key_path,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn admin_in(dir: &TempDir) -> AdminConfig {
        let mut admin = AdminConfig::with_hostname("admin.example.com");
        admin.cert_path = dir.path().join("certs/admin.crt");
        admin.key_path = dir.path().join("certs/admin.key");
        admin
    }

    #[test]
    fn test_bootstrap_generated_once() {
        let dir = TempDir::new().unwrap();
        let admin = admin_in(&dir);

        admin_certificate(&admin).unwrap();
        let first = std::fs::read(&admin.cert_path).unwrap();
        admin_certificate(&admin).unwrap();
        let second = std::fs::read(&admin.cert_path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_half_present_certificate_rejected() {
        let dir = TempDir::new().unwrap();
        let admin = admin_in(&dir);
        std::fs::create_dir_all(admin.cert_path.parent().unwrap()).unwrap();
        std::fs::write(&admin.cert_path, "not a key pair").unwrap();

        let err = admin_certificate(&admin).unwrap_err();

        assert!(matches!(err, EngineError::IncompleteAdminCertificate { .. }));
        assert!(!admin.key_path.exists());
    }
}

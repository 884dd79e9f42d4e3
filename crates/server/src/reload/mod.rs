//! Configuration reload.
//!
//! On SIGHUP the configuration file is read again and the domain list it
//! carries replaces the in-memory registry. Everything else in the file
//! (listeners, CA mode, admin settings) is fixed at startup; changes to it
//! are logged and ignored until restart.

pub mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use keygate_common::MemoryRegistry;
use keygate_config::{Config, ConfigError};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub use signals::{SignalManager, SignalType};

/// Outcome of a successful reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub domain_count: usize,
    /// Settings that changed on disk but need a restart
    pub restart_required: Vec<&'static str>,
}

/// Re-reads the configuration file into the registry
pub struct ConfigReloader {
    path: PathBuf,
    registry: Arc<MemoryRegistry>,
    /// Configuration the process was started with
    startup: Config,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>, registry: Arc<MemoryRegistry>, startup: Config) -> Self {
        Self {
            path: path.into(),
            registry,
            startup,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the domain list
    ///
    /// A file that fails to load or validate leaves the registry untouched.
    pub fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let config = Config::from_file(&self.path)?;

        let restart_required = self.restart_required(&config);
        for setting in &restart_required {
            warn!(setting = %setting, "Setting changed on disk; restart to apply");
        }

        let domain_count = config.domains.len();
        self.registry.replace_all(config.domains);

        info!(
            path = %self.path.display(),
            domain_count,
            "Configuration reloaded"
        );
        Ok(ReloadSummary {
            domain_count,
            restart_required,
        })
    }

    fn restart_required(&self, config: &Config) -> Vec<&'static str> {
        let old = &self.startup;
        let mut changed = Vec::new();
        if old.mode != config.mode {
            changed.push("mode");
        }
        if old.admin.hostname != config.admin.hostname
            || old.admin.auto_tls != config.admin.auto_tls
        {
            changed.push("admin");
        }
        if old.acme.email != config.acme.email
            || old.acme.storage_path != config.acme.storage_path
            || old.acme.staging != config.acme.staging
        {
            changed.push("acme");
        }
        if old.listeners.https != config.listeners.https
            || old.listeners.http != config.listeners.http
            || old.listeners.backend != config.listeners.backend
        {
            changed.push("listeners");
        }
        changed
    }
}

/// Handle signals until shutdown is requested
///
/// Reload failures are logged and the previous registry stays in effect.
pub async fn run_signal_loop(
    mut signals: SignalManager,
    reloader: ConfigReloader,
    shutdown: watch::Sender<bool>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            SignalType::Reload => {
                info!("Received SIGHUP, reloading configuration");
                if let Err(e) = reloader.reload() {
                    error!(
                        path = %reloader.path().display(),
                        error = %e,
                        "Configuration reload failed, keeping current domains"
                    );
                }
            }
            SignalType::Shutdown => {
                info!("Received shutdown signal, initiating graceful shutdown");
                let _ = shutdown.send(true);
                break;
            }
        }
    }
}

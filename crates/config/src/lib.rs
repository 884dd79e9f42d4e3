//! Configuration for the keygate TLS engine.
//!
//! Configuration is read from a TOML file:
//!
//! ```toml
//! mode = "production"
//!
//! [admin]
//! hostname = "admin.example.com"
//! auto_tls = true
//! backend = "127.0.0.1:3333"
//!
//! [acme]
//! email = "ops@example.com"
//! storage_path = "/var/lib/keygate/acme"
//!
//! [listeners]
//! https = "0.0.0.0:443"
//! http = "0.0.0.0:80"
//! backend = "127.0.0.1:8080"
//!
//! [logging]
//! level = "info"
//!
//! [[domains]]
//! name = "login.example.net"
//! managed_tls = true
//! ```
//!
//! Only `admin.hostname` and `acme.email` are required.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use validator::Validate;

pub use keygate_common::DomainRecord;

pub mod validate;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading or checking configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration is not valid TOML or does not match the schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field failed validation
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    /// Fields are individually valid but contradict each other
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

// ============================================================================
// Top-level configuration
// ============================================================================

/// Which certificate authority the engine talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Public CA with the system trust store
    #[default]
    Production,
    /// Local throwaway test CA trusted through an embedded root
    Development,
}

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Deployment mode
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Administrative interface
    #[validate(nested)]
    pub admin: AdminConfig,

    /// ACME account and storage
    #[validate(nested)]
    pub acme: AcmeSettings,

    /// Listening sockets and the public backend
    #[serde(default)]
    pub listeners: ListenerConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Initial registry contents
    #[serde(default)]
    pub domains: Vec<DomainRecord>,
}

/// Administrative interface settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdminConfig {
    /// Hostname the admin interface is served under
    #[validate(length(min = 1, max = 253))]
    pub hostname: String,

    /// Obtain an ACME certificate for the admin hostname
    #[serde(default)]
    pub auto_tls: bool,

    /// Certificate served when auto TLS is off or has not succeeded yet
    #[serde(default = "default_admin_cert_path")]
    pub cert_path: PathBuf,

    /// Private key for `cert_path`
    #[serde(default = "default_admin_key_path")]
    pub key_path: PathBuf,

    /// Plaintext backend for the admin application
    #[serde(default = "default_admin_backend")]
    pub backend: SocketAddr,
}

/// ACME settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AcmeSettings {
    /// Contact address registered with the CA
    #[validate(email)]
    pub email: String,

    /// Directory holding account credentials and issued certificates
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Use the CA's test directory instead of its main directory
    #[serde(default)]
    pub staging: bool,

    /// Renew certificates this many days before they expire
    #[serde(default = "default_renew_before_days")]
    #[validate(range(min = 1, max = 60))]
    pub renew_before_days: u32,

    /// Seconds between maintenance ticks
    #[serde(default = "default_maintenance_interval_secs")]
    #[validate(range(min = 60))]
    pub maintenance_interval_secs: u64,
}

/// Listening sockets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// TLS listener
    #[serde(default = "default_https_address")]
    pub https: SocketAddr,

    /// Plain HTTP listener for HTTP-01 challenges and redirects
    #[serde(default = "default_http_address")]
    pub http: SocketAddr,

    /// Plaintext backend for every non-admin hostname
    #[serde(default = "default_backend_address")]
    pub backend: SocketAddr,
}

/// Log verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_admin_cert_path() -> PathBuf {
    PathBuf::from("certs/admin.crt")
}

fn default_admin_key_path() -> PathBuf {
    PathBuf::from("certs/admin.key")
}

fn default_admin_backend() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3333))
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/keygate/acme")
}

fn default_renew_before_days() -> u32 {
    30
}

fn default_maintenance_interval_secs() -> u64 {
    3600
}

fn default_https_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_http_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

fn default_backend_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            https: default_https_address(),
            http: default_http_address(),
            backend: default_backend_address(),
        }
    }
}

impl AcmeSettings {
    /// Create settings with defaults for everything but the contact address
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            storage_path: default_storage_path(),
            staging: false,
            renew_before_days: default_renew_before_days(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl AdminConfig {
    /// Create settings with defaults for everything but the hostname
    pub fn with_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            auto_tls: false,
            cert_path: default_admin_cert_path(),
            key_path: default_admin_key_path(),
            backend: default_admin_backend(),
        }
    }
}

impl Config {
    /// Minimal configuration, mostly useful for tests and `gen-cert`
    pub fn new(admin_hostname: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            mode: DeploymentMode::default(),
            admin: AdminConfig::with_hostname(admin_hostname),
            acme: AcmeSettings::with_email(email),
            listeners: ListenerConfig::default(),
            logging: LoggingConfig::default(),
            domains: Vec::new(),
        }
    }

    /// Load, parse and check a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        trace!(path = %path.display(), "Reading configuration file");

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml_str(&content)?;
        debug!(
            path = %path.display(),
            mode = ?config.mode,
            domain_count = config.domains.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and check configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Run field validation and cross-field consistency checks
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.admin.hostname.contains('*') {
            return Err(ConfigError::Inconsistent(format!(
                "admin hostname '{}' must not be a wildcard",
                self.admin.hostname
            )));
        }

        let mut seen = HashSet::new();
        for record in &self.domains {
            if record.name.is_empty() {
                return Err(ConfigError::Inconsistent(
                    "domain entries require a non-empty name".to_string(),
                ));
            }
            if !seen.insert(record.name.as_str()) {
                return Err(ConfigError::Inconsistent(format!(
                    "domain '{}' is listed more than once",
                    record.name
                )));
            }
        }

        if self.listeners.https == self.listeners.http {
            return Err(ConfigError::Inconsistent(format!(
                "https and http listeners share the address {}",
                self.listeners.https
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [admin]
        hostname = "admin.example.com"

        [acme]
        email = "ops@example.com"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.mode, DeploymentMode::Production);
        assert!(!config.admin.auto_tls);
        assert_eq!(config.acme.renew_before_days, 30);
        assert_eq!(config.listeners.https.port(), 443);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.domains.is_empty());
    }

    #[test]
    fn test_full_config() {
        let content = r#"
            mode = "development"

            [admin]
            hostname = "admin.example.com"
            auto_tls = true
            backend = "127.0.0.1:4000"

            [acme]
            email = "ops@example.com"
            storage_path = "/tmp/keygate"
            staging = true
            renew_before_days = 20

            [listeners]
            https = "0.0.0.0:8443"
            http = "0.0.0.0:8080"
            backend = "127.0.0.1:9000"

            [logging]
            level = "debug"
            format = "json"

            [[domains]]
            name = "login.example.net"
            managed_tls = true

            [[domains]]
            name = "parked.example.net"
        "#;

        let config = Config::from_toml_str(content).unwrap();

        assert_eq!(config.mode, DeploymentMode::Development);
        assert!(config.admin.auto_tls);
        assert!(config.acme.staging);
        assert_eq!(config.acme.renew_before_days, 20);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.domains.len(), 2);
        assert!(config.domains[0].managed_tls);
        assert!(!config.domains[1].managed_tls);
    }

    #[test]
    fn test_invalid_email_rejected() {
        let content = r#"
            [admin]
            hostname = "admin.example.com"

            [acme]
            email = "not-an-email"
        "#;

        let err = Config::from_toml_str(content).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_admin_hostname_rejected() {
        let content = r#"
            [acme]
            email = "ops@example.com"
        "#;

        assert!(matches!(
            Config::from_toml_str(content),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_duplicate_domains_rejected() {
        let content = format!(
            "{}\n[[domains]]\nname = \"a.test\"\n[[domains]]\nname = \"a.test\"\n",
            MINIMAL
        );

        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_wildcard_admin_rejected() {
        let mut config = Config::new("*.example.com", "ops@example.com");
        config.admin.auto_tls = true;

        assert!(matches!(config.check(), Err(ConfigError::Inconsistent(_))));
    }

    #[test]
    fn test_renew_window_range() {
        let mut config = Config::new("admin.example.com", "ops@example.com");
        config.acme.renew_before_days = 0;

        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keygate.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.admin.hostname, "admin.example.com");

        let missing = Config::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}

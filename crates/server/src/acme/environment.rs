//! Certificate authority environment selection
//!
//! Exactly two environments exist. Production talks to the public Let's Encrypt
//! directory and trusts the default web roots. Development talks to a local
//! throwaway test CA whose root certificate is compiled into the binary.

use std::sync::Arc;

use keygate_config::DeploymentMode;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use tracing::{debug, info};

use super::error::EnvironmentError;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING_DIRECTORY: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Local test CA directory used in development
pub const DEVELOPMENT_DIRECTORY: &str = "https://127.0.0.1:14000/dir";

/// Root certificate of the local test CA
const DEVELOPMENT_ROOT_PEM: &[u8] = include_bytes!("../../assets/dev-root-ca.pem");

/// CA endpoint and trust configuration for this process
///
/// Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct CaEnvironment {
    mode: DeploymentMode,
    directory_url: String,
    test_directory_url: String,
    /// `None` means the default web trust store
    trusted_roots: Option<Arc<RootCertStore>>,
    account_email: String,
    agreed_to_terms: bool,
}

impl CaEnvironment {
    /// Select the environment for a deployment mode
    ///
    /// # Errors
    ///
    /// Fails only in development mode, when the embedded root certificate
    /// cannot be parsed. Callers must treat this as fatal.
    pub fn select(
        mode: DeploymentMode,
        account_email: impl Into<String>,
    ) -> Result<Self, EnvironmentError> {
        let account_email = account_email.into();
        let environment = match mode {
            DeploymentMode::Production => Self::production(account_email),
            DeploymentMode::Development => {
                Self::development_with_root(account_email, DEVELOPMENT_ROOT_PEM)?
            }
        };

        info!(
            mode = ?environment.mode,
            directory = %environment.directory_url,
            custom_roots = environment.trusted_roots.is_some(),
            "Selected certificate authority environment"
        );
        Ok(environment)
    }

    fn production(account_email: String) -> Self {
        Self {
            mode: DeploymentMode::Production,
            directory_url: LETS_ENCRYPT_DIRECTORY.to_string(),
            test_directory_url: LETS_ENCRYPT_STAGING_DIRECTORY.to_string(),
            trusted_roots: None,
            account_email,
            agreed_to_terms: true,
        }
    }

    fn development_with_root(
        account_email: String,
        root_pem: &[u8],
    ) -> Result<Self, EnvironmentError> {
        let roots = parse_root_store(root_pem)?;
        debug!(anchors = roots.len(), "Loaded development trust root");

        // Agreeing is only acceptable because the test CA is private and disposable
        Ok(Self {
            mode: DeploymentMode::Development,
            directory_url: DEVELOPMENT_DIRECTORY.to_string(),
            test_directory_url: DEVELOPMENT_DIRECTORY.to_string(),
            trusted_roots: Some(Arc::new(roots)),
            account_email,
            agreed_to_terms: true,
        })
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub fn test_directory_url(&self) -> &str {
        &self.test_directory_url
    }

    /// Directory to use, honouring the operator's staging choice
    pub fn active_directory(&self, staging: bool) -> &str {
        if staging {
            &self.test_directory_url
        } else {
            &self.directory_url
        }
    }

    /// Custom root store, or `None` for the default web roots
    pub fn trusted_roots(&self) -> Option<&Arc<RootCertStore>> {
        self.trusted_roots.as_ref()
    }

    pub fn account_email(&self) -> &str {
        &self.account_email
    }

    pub fn agreed_to_terms(&self) -> bool {
        self.agreed_to_terms
    }
}

/// Build a root store from a PEM file holding exactly one certificate
fn parse_root_store(pem: &[u8]) -> Result<RootCertStore, EnvironmentError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| EnvironmentError::InvalidTrustRoot(e.to_string()))?;

    if certs.len() != 1 {
        return Err(EnvironmentError::InvalidTrustRoot(format!(
            "expected exactly one certificate, found {}",
            certs.len()
        )));
    }

    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| EnvironmentError::InvalidTrustRoot(e.to_string()))?;
    }
    Ok(store)
}

//! Shared fixtures for certificate engine tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keygate_common::{DomainRecord, MemoryRegistry};
use keygate_config::DeploymentMode;
use tempfile::TempDir;

use super::cache::{build_issuer_config, IssuancePolicy, IssuerConfig};
use super::client::{CertificateIssuer, IssuedCertificate};
use super::environment::CaEnvironment;
use super::error::AcmeError;
use super::gate::DomainAuthorizationGate;
use super::manager::OnDemandManager;
use super::storage::CertificateStorage;

pub(crate) const ADMIN_HOSTNAME: &str = "admin.example.com";

/// Issuer that self-signs instead of talking to a CA
pub(crate) struct FakeIssuer {
    calls: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl FakeIssuer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::ZERO,
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
            delay: Duration::ZERO,
        })
    }

    pub(crate) fn slow() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::from_millis(50),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn issue(
        &self,
        _config: &IssuerConfig,
        domain: &str,
    ) -> Result<IssuedCertificate, AcmeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(AcmeError::Issuance("CA unavailable".to_string()));
        }

        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()])
            .map_err(|e| AcmeError::CertGeneration(e.to_string()))?;
        Ok(IssuedCertificate {
            domain: domain.to_string(),
            cert_pem: cert.cert.pem(),
            key_pem: cert.signing_key.serialize_pem(),
        })
    }
}

/// Issuer configuration over a temporary store and the given registry
pub(crate) fn config_with(
    registry: Arc<MemoryRegistry>,
    admin_auto_tls: bool,
) -> (TempDir, Arc<IssuerConfig>) {
    let dir = TempDir::new().unwrap();
    let environment =
        Arc::new(CaEnvironment::select(DeploymentMode::Production, "ops@example.com").unwrap());
    let storage = Arc::new(CertificateStorage::new(dir.path()).unwrap());
    let gate = Arc::new(DomainAuthorizationGate::new(
        ADMIN_HOSTNAME,
        admin_auto_tls,
        registry,
    ));

    let config =
        build_issuer_config(environment, storage, gate, IssuancePolicy::default()).unwrap();
    (dir, config)
}

pub(crate) fn manager_with_registry(
    records: Vec<DomainRecord>,
    admin_auto_tls: bool,
    issuer: Arc<FakeIssuer>,
) -> (
    TempDir,
    Arc<OnDemandManager>,
    Arc<FakeIssuer>,
    Arc<MemoryRegistry>,
) {
    let registry = Arc::new(MemoryRegistry::with_records(records));
    let (dir, config) = config_with(Arc::clone(&registry), admin_auto_tls);
    let manager = Arc::new(OnDemandManager::new(
        config,
        Arc::clone(&issuer) as Arc<dyn CertificateIssuer>,
    ));
    (dir, manager, issuer, registry)
}

pub(crate) fn manager_with(
    records: Vec<DomainRecord>,
    admin_auto_tls: bool,
    issuer: Arc<FakeIssuer>,
) -> (TempDir, Arc<OnDemandManager>, Arc<FakeIssuer>) {
    let (dir, manager, issuer, _) = manager_with_registry(records, admin_auto_tls, issuer);
    (dir, manager, issuer)
}

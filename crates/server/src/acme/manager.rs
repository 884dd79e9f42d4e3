//! On-demand certificate management
//!
//! Answers "which certificate do I present for this name?" at handshake time:
//! the in-memory cache first, then the gate, then the on-disk store, and only
//! then a fresh issuance. Concurrent handshakes for the same new name share
//! one issuance.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cache::{CacheEntry, IssuerConfig};
use super::client::{CertificateIssuer, IssuedCertificate};
use super::error::AcmeError;
use super::storage::CertificateMeta;
use crate::tls::{certified_key_from_pem, leaf_validity};

/// Handshake-time certificate lookup and issuance
pub struct OnDemandManager {
    config: Arc<IssuerConfig>,
    issuer: Arc<dyn CertificateIssuer>,
    /// One lock per domain with an issuance in progress
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl OnDemandManager {
    pub fn new(config: Arc<IssuerConfig>, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            config,
            issuer,
            in_flight: DashMap::new(),
        }
    }

    pub fn config(&self) -> &Arc<IssuerConfig> {
        &self.config
    }

    /// Certificate to present for `domain`
    ///
    /// # Errors
    ///
    /// [`AcmeError::AuthorizationDenied`] when the gate refuses the name;
    /// nothing is cached or stored for it in that case.
    pub async fn certificate_for(&self, domain: &str) -> Result<Arc<CacheEntry>, AcmeError> {
        let cache = self.config.cache();
        if let Some(entry) = cache.get_valid(domain, Utc::now()) {
            return Ok(entry);
        }

        self.config.gate().authorize(domain)?;

        let lock = self.lock_for(domain);
        let result = {
            let _guard = lock.lock().await;

            // Another handshake may have finished while this one waited
            if let Some(entry) = cache.get_valid(domain, Utc::now()) {
                Ok(entry)
            } else {
                match self.load_stored(domain) {
                    Some(entry) => Ok(cache.insert(entry)),
                    None => self.obtain(domain).await,
                }
            }
        };
        self.release_lock(domain, lock);

        result
    }

    /// Replace the certificate for `domain` with a fresh one
    ///
    /// The gate is consulted again; a domain that lost eligibility since it
    /// was first issued is evicted instead of renewed.
    pub async fn renew(&self, domain: &str) -> Result<Arc<CacheEntry>, AcmeError> {
        if let Err(e) = self.config.gate().authorize(domain) {
            info!(domain = %domain, "Domain no longer eligible, evicting certificate");
            self.config.cache().remove(domain);
            return Err(e);
        }

        let lock = self.lock_for(domain);
        let result = {
            let _guard = lock.lock().await;
            self.obtain(domain).await
        };
        self.release_lock(domain, lock);

        result
    }

    fn lock_for(&self, domain: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.in_flight.entry(domain.to_string()).or_default().value())
    }

    fn release_lock(&self, domain: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        // Only the map's own reference left means nobody is waiting
        self.in_flight
            .remove_if(domain, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Valid certificate from the on-disk store, if any
    fn load_stored(&self, domain: &str) -> Option<CacheEntry> {
        let stored = match self.config.storage().load_certificate(domain) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Failed to read stored certificate");
                return None;
            }
        };

        let now = Utc::now();
        if stored.meta.expires <= now {
            debug!(domain = %domain, "Stored certificate has expired");
            return None;
        }

        match certified_key_from_pem(stored.cert_pem.as_bytes(), stored.key_pem.as_bytes()) {
            Ok(key) => {
                debug!(
                    domain = %domain,
                    expires = %stored.meta.expires,
                    "Using stored certificate"
                );
                Some(CacheEntry::new(
                    domain,
                    Arc::new(key),
                    stored.meta.issued,
                    stored.meta.expires,
                ))
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Stored certificate is unusable");
                None
            }
        }
    }

    /// Issue, persist and cache a new certificate
    async fn obtain(&self, domain: &str) -> Result<Arc<CacheEntry>, AcmeError> {
        let started = std::time::Instant::now();

        let issued = self
            .issuer
            .issue(&self.config, domain)
            .await
            .map_err(|e| {
                warn!(domain = %domain, error = %e, "Certificate issuance failed");
                e
            })?;

        let entry = self.entry_from_issued(&issued)?;

        let meta = CertificateMeta {
            expires: entry.expires_at,
            issued: entry.issued_at,
            domains: vec![domain.to_string()],
            directory: Some(self.config.directory_url().to_string()),
        };
        self.config
            .storage()
            .save_certificate(domain, &issued.cert_pem, &issued.key_pem, &meta)?;

        info!(
            domain = %domain,
            expires = %entry.expires_at,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Obtained certificate"
        );

        Ok(self.config.cache().insert(entry))
    }

    fn entry_from_issued(&self, issued: &IssuedCertificate) -> Result<CacheEntry, AcmeError> {
        let key = certified_key_from_pem(issued.cert_pem.as_bytes(), issued.key_pem.as_bytes())
            .map_err(|e| AcmeError::InvalidCertificate(e.to_string()))?;
        let (_, not_after) =
            leaf_validity(&key).map_err(|e| AcmeError::InvalidCertificate(e.to_string()))?;

        Ok(CacheEntry::new(
            issued.domain.clone(),
            Arc::new(key),
            Utc::now(),
            not_after,
        ))
    }
}

impl std::fmt::Debug for OnDemandManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDemandManager")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

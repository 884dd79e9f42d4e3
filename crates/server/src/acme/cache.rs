//! In-memory certificate cache and its issuer configuration
//!
//! The cache must exist before the issuer configuration can be built, yet the
//! cache needs that same configuration whenever it renews an entry. The cycle
//! is broken with a single-assignment slot: the cache is handed a resolver
//! that reads the slot, the configuration is built around the cache, and only
//! then is the configuration written into the slot. Reading the slot before
//! that is an error, never a silently substituted default.

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rustls::sign::CertifiedKey;
use tracing::{debug, error, info, trace};

use super::environment::CaEnvironment;
use super::error::CacheError;
use super::gate::DomainAuthorizationGate;
use super::storage::CertificateStorage;

// ============================================================================
// Cache entries
// ============================================================================

/// A certificate ready to be served
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub domain: String,
    pub certified_key: Arc<CertifiedKey>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        domain: impl Into<String>,
        certified_key: Arc<CertifiedKey>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            certified_key,
            issued_at,
            expires_at,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether the entry expires within `window` of `now`
    pub fn needs_renewal(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at - now <= window
    }
}

// ============================================================================
// Issuer configuration
// ============================================================================

/// Everything needed to obtain and renew certificates
///
/// Built exactly once per process by [`build_issuer_config`].
pub struct IssuerConfig {
    environment: Arc<CaEnvironment>,
    storage: Arc<CertificateStorage>,
    gate: Arc<DomainAuthorizationGate>,
    cache: Arc<CertificateCache>,
    staging: bool,
    renew_before: Duration,
}

impl IssuerConfig {
    pub fn environment(&self) -> &Arc<CaEnvironment> {
        &self.environment
    }

    pub fn storage(&self) -> &Arc<CertificateStorage> {
        &self.storage
    }

    pub fn gate(&self) -> &Arc<DomainAuthorizationGate> {
        &self.gate
    }

    pub fn cache(&self) -> &Arc<CertificateCache> {
        &self.cache
    }

    /// ACME directory this configuration issues against
    pub fn directory_url(&self) -> &str {
        self.environment.active_directory(self.staging)
    }

    pub fn renew_before(&self) -> Duration {
        self.renew_before
    }
}

impl fmt::Debug for IssuerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuerConfig")
            .field("directory", &self.directory_url())
            .field("storage", &self.storage.base_path())
            .field("renew_before_days", &self.renew_before.num_days())
            .finish()
    }
}

/// Settings that shape issuance but are not collaborators
#[derive(Debug, Clone, Copy)]
pub struct IssuancePolicy {
    pub staging: bool,
    pub renew_before: Duration,
}

impl Default for IssuancePolicy {
    fn default() -> Self {
        Self {
            staging: false,
            renew_before: Duration::days(30),
        }
    }
}

// ============================================================================
// Late-bound slot
// ============================================================================

/// Single-assignment reference to the issuer configuration
///
/// Holds a weak reference so that the configuration, which owns the cache,
/// is not kept alive by the cache's own resolver.
#[derive(Clone, Default)]
pub struct IssuerSlot {
    cell: Arc<OnceCell<Weak<IssuerConfig>>>,
}

impl IssuerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the configuration. Succeeds at most once per slot.
    pub fn bind(&self, config: &Arc<IssuerConfig>) -> Result<(), CacheError> {
        self.cell
            .set(Arc::downgrade(config))
            .map_err(|_| CacheError::AlreadyBound)
    }

    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Read the bound configuration
    pub fn get(&self) -> Result<Arc<IssuerConfig>, CacheError> {
        let weak = self.cell.get().ok_or(CacheError::Unbound)?;
        weak.upgrade().ok_or(CacheError::Released)
    }
}

impl fmt::Debug for IssuerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuerSlot")
            .field("bound", &self.is_bound())
            .finish()
    }
}

// ============================================================================
// Cache
// ============================================================================

type ConfigResolver = Box<dyn Fn(&str) -> Result<Arc<IssuerConfig>, CacheError> + Send + Sync>;

/// Process-wide map of domain to served certificate
pub struct CertificateCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    resolver: ConfigResolver,
}

impl CertificateCache {
    /// Create a cache whose configuration comes from `resolver`
    pub fn new<F>(resolver: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<IssuerConfig>, CacheError> + Send + Sync + 'static,
    {
        Self {
            entries: DashMap::new(),
            resolver: Box::new(resolver),
        }
    }

    /// Create a cache that resolves its configuration through `slot`
    pub fn with_slot(slot: IssuerSlot) -> Self {
        Self::new(move |_domain| slot.get())
    }

    /// Issuer configuration responsible for `entry`
    pub fn resolve(&self, entry: &CacheEntry) -> Result<Arc<IssuerConfig>, CacheError> {
        self.resolve_domain(&entry.domain)
    }

    /// Issuer configuration responsible for `domain`
    pub fn resolve_domain(&self, domain: &str) -> Result<Arc<IssuerConfig>, CacheError> {
        (self.resolver)(domain).map_err(|e| {
            error!(domain = %domain, error = %e, "Certificate cache has no issuer configuration");
            e
        })
    }

    /// Entry for `domain`, expired or not
    pub fn get(&self, domain: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(domain).map(|entry| Arc::clone(entry.value()))
    }

    /// Entry for `domain` if it is still valid at `now`
    pub fn get_valid(&self, domain: &str, now: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        let entry = self.get(domain)?;
        if entry.is_valid_at(now) {
            trace!(domain = %domain, "Certificate cache hit");
            Some(entry)
        } else {
            debug!(domain = %domain, expired = %entry.expires_at, "Cached certificate has expired");
            None
        }
    }

    /// Insert or replace the entry for its domain
    pub fn insert(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        debug!(
            domain = %entry.domain,
            expires = %entry.expires_at,
            "Cached certificate"
        );
        self.entries.insert(entry.domain.clone(), Arc::clone(&entry));
        entry
    }

    pub fn remove(&self, domain: &str) -> Option<Arc<CacheEntry>> {
        let removed = self.entries.remove(domain).map(|(_, entry)| entry);
        if removed.is_some() {
            debug!(domain = %domain, "Evicted certificate from cache");
        }
        removed
    }

    /// Entries that expire within `window` of `now`
    pub fn expiring_within(&self, window: Duration, now: DateTime<Utc>) -> Vec<Arc<CacheEntry>> {
        self.entries
            .iter()
            .filter(|entry| entry.value().needs_renewal(now, window))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn domains(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

// ============================================================================
// Construction
// ============================================================================

/// Build the issuer configuration and its cache together
///
/// Order matters: slot, then cache, then configuration, then binding. The
/// result is checked before it is returned, so a caller never sees a cache
/// that resolves to anything but this configuration.
pub fn build_issuer_config(
    environment: Arc<CaEnvironment>,
    storage: Arc<CertificateStorage>,
    gate: Arc<DomainAuthorizationGate>,
    policy: IssuancePolicy,
) -> Result<Arc<IssuerConfig>, CacheError> {
    let slot = IssuerSlot::new();

    let cache = Arc::new(CertificateCache::with_slot(slot.clone()));

    let config = Arc::new(IssuerConfig {
        environment,
        storage,
        gate,
        cache,
        staging: policy.staging,
        renew_before: policy.renew_before,
    });

    slot.bind(&config)?;

    verify_binding(&config)?;

    info!(
        directory = %config.directory_url(),
        renew_before_days = config.renew_before.num_days(),
        "Certificate cache bound to issuer configuration"
    );
    Ok(config)
}

/// Check that the configuration's cache resolves back to it
pub fn verify_binding(config: &Arc<IssuerConfig>) -> Result<(), CacheError> {
    let resolved = config.cache.resolve_domain(config.gate.admin_hostname())?;
    if Arc::ptr_eq(&resolved, config) {
        Ok(())
    } else {
        error!("Certificate cache resolves to a different issuer configuration");
        Err(CacheError::Mismatch)
    }
}

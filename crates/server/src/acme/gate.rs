//! On-demand issuance authorization
//!
//! Every TLS handshake for a hostname without a valid cached certificate asks
//! the gate whether a certificate may be obtained. Without it, anyone able to
//! point DNS at this server could make it request certificates for arbitrary
//! names.
//!
//! A hostname is allowed when it is the admin hostname and admin auto-TLS is
//! on, or when the registry holds a record with exactly that name and
//! `managed_tls` set. Matching is case-sensitive with no wildcard expansion.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keygate_common::DomainRegistry;
use tracing::{debug, info, trace, warn};

use super::error::AcmeError;

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Why a hostname was refused
///
/// Deliberately names only the hostname: a caller cannot tell an unknown name
/// from a registered name that is not eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyReason {
    hostname: String,
}

impl DenyReason {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hostname {:?} is not authorized for managed TLS", self.hostname)
    }
}

/// Per-hostname issuance policy
///
/// Holds no lock and caches nothing; each call performs one point lookup
/// against the registry, which is responsible for its own synchronization.
/// Registry outages are reported once when they start and once when they end.
pub struct DomainAuthorizationGate {
    admin_hostname: String,
    admin_auto_tls: bool,
    registry: Arc<dyn DomainRegistry>,
    registry_down: AtomicBool,
}

impl DomainAuthorizationGate {
    pub fn new(
        admin_hostname: impl Into<String>,
        admin_auto_tls: bool,
        registry: Arc<dyn DomainRegistry>,
    ) -> Self {
        Self {
            admin_hostname: admin_hostname.into(),
            admin_auto_tls,
            registry,
            registry_down: AtomicBool::new(false),
        }
    }

    pub fn admin_hostname(&self) -> &str {
        &self.admin_hostname
    }

    pub fn admin_auto_tls(&self) -> bool {
        self.admin_auto_tls
    }

    /// Whether the last registry lookup failed
    pub fn registry_degraded(&self) -> bool {
        self.registry_down.load(Ordering::Relaxed)
    }

    /// Decide whether a certificate may be issued or reused for `hostname`
    pub fn decide(&self, hostname: &str) -> Decision {
        if self.admin_auto_tls && hostname == self.admin_hostname {
            trace!(hostname = %hostname, "Admin hostname authorized");
            return Decision::Allow;
        }

        let eligible = match self.registry.lookup(hostname) {
            Ok(found) => {
                if self.registry_down.load(Ordering::Relaxed)
                    && self.registry_down.swap(false, Ordering::Relaxed)
                {
                    info!("Domain registry reachable again");
                }
                found.is_some_and(|record| record.managed_tls)
            }
            Err(e) => {
                // Handshakes are attacker-driven; one warning per outage
                if self.registry_down.swap(true, Ordering::Relaxed) {
                    debug!(hostname = %hostname, error = %e, "Domain registry lookup failed");
                } else {
                    warn!(
                        hostname = %hostname,
                        error = %e,
                        "Domain registry unavailable, refusing on-demand certificates"
                    );
                }
                false
            }
        };

        if eligible {
            trace!(hostname = %hostname, "Registered hostname authorized");
            Decision::Allow
        } else {
            debug!(hostname = %hostname, "On-demand certificate refused");
            Decision::Deny(DenyReason {
                hostname: hostname.to_string(),
            })
        }
    }

    /// Error-typed form of [`decide`](Self::decide)
    pub fn authorize(&self, hostname: &str) -> Result<(), AcmeError> {
        match self.decide(hostname) {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(AcmeError::AuthorizationDenied {
                hostname: reason.hostname,
            }),
        }
    }
}

impl fmt::Debug for DomainAuthorizationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainAuthorizationGate")
            .field("admin_hostname", &self.admin_hostname)
            .field("admin_auto_tls", &self.admin_auto_tls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_common::{DomainRecord, MemoryRegistry, RegistryError};
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    const ADMIN: &str = "admin.example.com";

    fn gate_with(records: Vec<DomainRecord>, admin_auto_tls: bool) -> DomainAuthorizationGate {
        let registry = Arc::new(MemoryRegistry::with_records(records));
        DomainAuthorizationGate::new(ADMIN, admin_auto_tls, registry)
    }

    /// Registry that counts lookups and can be made to fail
    struct CountingRegistry {
        inner: MemoryRegistry,
        lookups: AtomicUsize,
        fail: AtomicBool,
    }

    impl DomainRegistry for CountingRegistry {
        fn lookup(&self, name: &str) -> Result<Option<DomainRecord>, RegistryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Unavailable("connection refused".to_string()));
            }
            self.inner.lookup(name)
        }
    }

    #[test]
    fn test_managed_record_allowed() {
        let gate = gate_with(vec![DomainRecord::new("login.example.net", true)], false);
        assert_eq!(gate.decide("login.example.net"), Decision::Allow);
    }

    #[test]
    fn test_unmanaged_record_denied() {
        let gate = gate_with(vec![DomainRecord::new("parked.example.net", false)], false);
        assert!(!gate.decide("parked.example.net").is_allowed());
    }

    #[test]
    fn test_unknown_host_denied() {
        let gate = gate_with(vec![], true);
        assert!(!gate.decide("random.example.org").is_allowed());
    }

    #[test]
    fn test_admin_requires_auto_tls() {
        assert!(gate_with(vec![], true).decide(ADMIN).is_allowed());
        assert!(!gate_with(vec![], false).decide(ADMIN).is_allowed());
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let gate = gate_with(vec![DomainRecord::new("Example.com", true)], false);

        assert!(gate.decide("Example.com").is_allowed());
        assert!(!gate.decide("example.com").is_allowed());
    }

    #[test]
    fn test_no_wildcard_expansion() {
        let gate = gate_with(vec![DomainRecord::new("*.example.com", true)], false);
        assert!(!gate.decide("www.example.com").is_allowed());
    }

    #[test]
    fn test_deny_reason_does_not_leak_record_state() {
        let gate = gate_with(vec![DomainRecord::new("parked.example.net", false)], false);

        let Decision::Deny(known) = gate.decide("parked.example.net") else {
            panic!("expected deny");
        };
        let Decision::Deny(unknown) = gate.decide("unknown.example.net") else {
            panic!("expected deny");
        };

        assert_eq!(
            known.to_string().replace("parked", "X"),
            unknown.to_string().replace("unknown", "X")
        );
    }

    #[test]
    fn test_one_lookup_per_call_without_caching() {
        let registry = Arc::new(CountingRegistry {
            inner: MemoryRegistry::with_records([DomainRecord::new("a.test", true)]),
            lookups: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });
        let gate = DomainAuthorizationGate::new(ADMIN, false, registry.clone());

        assert!(gate.decide("a.test").is_allowed());
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);

        registry.inner.set_managed_tls("a.test", false);
        assert!(!gate.decide("a.test").is_allowed());
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registry_failure_denies() {
        let registry = Arc::new(CountingRegistry {
            inner: MemoryRegistry::with_records([DomainRecord::new("a.test", true)]),
            lookups: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
        });
        let gate = DomainAuthorizationGate::new(ADMIN, false, registry);

        assert!(!gate.decide("a.test").is_allowed());
    }

    /// Counts WARN events
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_registry_outage_warns_once() {
        use tracing_subscriber::layer::SubscriberExt;

        let registry = Arc::new(CountingRegistry {
            inner: MemoryRegistry::with_records([DomainRecord::new("a.test", true)]),
            lookups: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
        });
        let gate = DomainAuthorizationGate::new(ADMIN, false, Arc::clone(&registry) as _);
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warnings)));

        tracing::subscriber::with_default(subscriber, || {
            for host in ["a.test", "b.test", "c.test", "a.test"] {
                assert!(!gate.decide(host).is_allowed());
            }
            assert!(gate.registry_degraded());
            assert_eq!(warnings.load(Ordering::SeqCst), 1);

            registry.fail.store(false, Ordering::SeqCst);
            assert!(gate.decide("a.test").is_allowed());
            assert!(!gate.registry_degraded());

            registry.fail.store(true, Ordering::SeqCst);
            assert!(!gate.decide("a.test").is_allowed());
        });

        assert_eq!(warnings.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_authorize_maps_to_error() {
        let gate = gate_with(vec![], false);

        let err = gate.authorize("evil.test").unwrap_err();
        assert!(matches!(
            err,
            AcmeError::AuthorizationDenied { ref hostname } if hostname == "evil.test"
        ));
    }

    fn hostname() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,12}(\\.[a-z][a-z0-9-]{0,12}){1,3}"
    }

    proptest! {
        #[test]
        fn proptest_unregistered_hosts_denied(host in hostname()) {
            prop_assume!(host != ADMIN);
            let gate = gate_with(vec![], true);
            prop_assert!(!gate.decide(&host).is_allowed());
        }

        #[test]
        fn proptest_unmanaged_hosts_denied(host in hostname()) {
            let gate = gate_with(vec![DomainRecord::new(host.clone(), false)], false);
            prop_assert!(!gate.decide(&host).is_allowed());
        }

        #[test]
        fn proptest_managed_hosts_allowed(host in hostname()) {
            let gate = gate_with(vec![DomainRecord::new(host.clone(), true)], false);
            prop_assert!(gate.decide(&host).is_allowed());
        }

        #[test]
        fn proptest_case_variants_denied(host in hostname()) {
            let upper = host.to_ascii_uppercase();
            let gate = gate_with(vec![DomainRecord::new(upper, true)], false);
            prop_assert!(!gate.decide(&host).is_allowed());
        }
    }
}

//! Background certificate maintenance
//!
//! Periodically renews cached certificates that are close to expiry and
//! removes expired certificates from the on-disk store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::manager::OnDemandManager;
use crate::logging::STORAGE_CLEAN_SKIPPED;

/// Default time between maintenance runs (1 hour)
const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Minimum time between maintenance runs
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Storage is cleaned at most this often
const STORAGE_CLEAN_INTERVAL_HOURS: i64 = 24;

/// What one maintenance run did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub renewed: usize,
    pub failed: usize,
    pub evicted: usize,
    /// Certificates removed from storage, or `None` when cleaning was skipped
    pub cleaned: Option<usize>,
}

/// Background renewal and storage maintenance
pub struct MaintenanceScheduler {
    manager: Arc<OnDemandManager>,
    check_interval: Duration,
}

impl MaintenanceScheduler {
    pub fn new(manager: Arc<OnDemandManager>) -> Self {
        Self {
            manager,
            check_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }

    /// Set the check interval, clamped to a minimum of one minute
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_MAINTENANCE_INTERVAL);
        self
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Starting certificate maintenance scheduler"
        );

        let mut ticker = interval(self.check_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running scheduled certificate maintenance");
                    let report = self.run_once(Utc::now()).await;
                    if report.renewed + report.failed + report.evicted > 0 {
                        info!(
                            renewed = report.renewed,
                            failed = report.failed,
                            evicted = report.evicted,
                            "Certificate maintenance finished"
                        );
                    }
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Certificate maintenance scheduler stopped");
                        break;
                    }
                }
            }
        }
    }

    /// One maintenance pass as of `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        self.renew_expiring(now, &mut report).await;
        report.cleaned = self.clean_storage(now);
        report
    }

    async fn renew_expiring(&self, now: DateTime<Utc>, report: &mut MaintenanceReport) {
        let cache = self.manager.config().cache();
        let window = self.manager.config().renew_before();

        for entry in cache.expiring_within(window, now) {
            let config = match cache.resolve(&entry) {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %e, "Cannot renew certificates without issuer configuration");
                    return;
                }
            };

            if !entry.needs_renewal(now, config.renew_before()) {
                continue;
            }

            info!(
                domain = %entry.domain,
                expires = %entry.expires_at,
                "Certificate needs renewal"
            );

            match self.manager.renew(&entry.domain).await {
                Ok(renewed) => {
                    info!(
                        domain = %entry.domain,
                        expires = %renewed.expires_at,
                        "Certificate renewed successfully"
                    );
                    report.renewed += 1;
                }
                Err(e) if e.is_denial() => {
                    report.evicted += 1;
                }
                Err(e) => {
                    error!(
                        domain = %entry.domain,
                        error = %e,
                        "Certificate renewal failed"
                    );
                    report.failed += 1;
                }
            }
        }
    }

    /// Remove expired certificates from storage, at most once per day
    fn clean_storage(&self, now: DateTime<Utc>) -> Option<usize> {
        let storage = self.manager.config().storage();

        match storage.last_cleaned() {
            Ok(Some(last)) if (now - last).num_hours() < STORAGE_CLEAN_INTERVAL_HOURS => {
                info!("{}", STORAGE_CLEAN_SKIPPED);
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Could not read last storage cleaning time");
            }
        }

        match storage.remove_expired(now) {
            Ok(removed) => {
                let cache = self.manager.config().cache();
                for domain in &removed {
                    cache.remove(domain);
                }
                if !removed.is_empty() {
                    info!(removed = removed.len(), "Removed expired certificates from storage");
                }
                Some(removed.len())
            }
            Err(e) => {
                error!(error = %e, "Storage cleaning failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::cache::CacheEntry;
    use super::super::tests_support::{manager_with, manager_with_registry, FakeIssuer};
    use super::*;
    use keygate_common::DomainRecord;

    /// Cache `domain` with a certificate that expires in `days`
    async fn cache_expiring(manager: &OnDemandManager, domain: &str, days: i64) {
        let entry = manager.certificate_for(domain).await.unwrap();
        let now = Utc::now();
        manager.config().cache().insert(CacheEntry::new(
            domain,
            Arc::clone(&entry.certified_key),
            now,
            now + chrono::Duration::days(days),
        ));
    }

    #[test]
    fn test_interval_is_clamped() {
        let (_dir, manager, _) = manager_with(vec![], false, FakeIssuer::new());

        let scheduler = MaintenanceScheduler::new(manager).with_interval(Duration::from_secs(1));

        assert_eq!(scheduler.check_interval, MIN_MAINTENANCE_INTERVAL);
    }

    #[tokio::test]
    async fn test_renews_expiring_certificates() {
        let (_dir, manager, issuer) = manager_with(
            vec![
                DomainRecord::new("soon.test", true),
                DomainRecord::new("later.test", true),
            ],
            false,
            FakeIssuer::new(),
        );
        cache_expiring(&manager, "soon.test", 5).await;
        cache_expiring(&manager, "later.test", 80).await;
        assert_eq!(issuer.calls(), 2);

        let scheduler = MaintenanceScheduler::new(Arc::clone(&manager));
        let report = scheduler.run_once(Utc::now()).await;

        assert_eq!(report.renewed, 1);
        assert_eq!(issuer.calls(), 3);
    }

    #[tokio::test]
    async fn test_deregistered_domain_evicted() {
        let (_dir, manager, issuer, registry) = manager_with_registry(
            vec![DomainRecord::new("gone.test", true)],
            false,
            FakeIssuer::new(),
        );
        cache_expiring(&manager, "gone.test", 5).await;
        registry.set_managed_tls("gone.test", false);

        let scheduler = MaintenanceScheduler::new(Arc::clone(&manager));
        let report = scheduler.run_once(Utc::now()).await;

        assert_eq!(report.evicted, 1);
        assert_eq!(report.renewed, 0);
        assert_eq!(issuer.calls(), 1);
        assert!(manager.config().cache().get("gone.test").is_none());
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_entry() {
        let (_dir, manager, _) = manager_with(
            vec![DomainRecord::new("a.test", true)],
            false,
            FakeIssuer::new(),
        );
        cache_expiring(&manager, "a.test", 5).await;

        // Same config, but an issuer that always fails
        let failing = Arc::new(OnDemandManager::new(
            Arc::clone(manager.config()),
            FakeIssuer::failing(),
        ));
        let report = MaintenanceScheduler::new(failing).run_once(Utc::now()).await;

        assert_eq!(report.failed, 1);
        assert!(manager.config().cache().get("a.test").is_some());
    }

    #[tokio::test]
    async fn test_storage_cleaned_at_most_daily() {
        let (_dir, manager, _) = manager_with(vec![], false, FakeIssuer::new());
        let scheduler = MaintenanceScheduler::new(manager);
        let now = Utc::now();

        assert_eq!(scheduler.run_once(now).await.cleaned, Some(0));
        assert_eq!(
            scheduler
                .run_once(now + chrono::Duration::hours(1))
                .await
                .cleaned,
            None
        );
        assert_eq!(
            scheduler
                .run_once(now + chrono::Duration::hours(25))
                .await
                .cleaned,
            Some(0)
        );
    }
}

//! Scheduled maintenance
//!
//! One pass rotates keys nearing expiry, applies audit retention, drops
//! expired cache entries and reports incidents past their escalation
//! threshold. A failing step is logged and the remaining steps still run.

use crate::audit::{AuditLedger, CleanupReport};
use crate::cache::MemoryCache;
use crate::config::MaintenanceConfig;
use crate::incidents::IncidentManager;
use crate::keys::{KeyManager, RotationOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    /// Keys rotated
    pub rotated: Vec<RotationOutcome>,
    /// Audit retention outcome
    pub retention: Option<CleanupReport>,
    /// Expired cache entries dropped
    pub cache_entries_purged: usize,
    /// Open incidents past their escalation threshold
    pub overdue_incidents: Vec<String>,
    /// Steps that failed
    pub failures: Vec<String>,
}

impl MaintenanceReport {
    /// Every step succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Maintenance jobs
pub struct MaintenanceJobs {
    keys: Arc<KeyManager>,
    audit: Arc<AuditLedger>,
    retention_days: i64,
    config: MaintenanceConfig,
    cache: Option<Arc<MemoryCache>>,
    incidents: Option<Arc<IncidentManager>>,
}

impl MaintenanceJobs {
    /// Create jobs over the key manager and audit ledger
    pub fn new(
        keys: Arc<KeyManager>,
        audit: Arc<AuditLedger>,
        retention_days: i64,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            keys,
            audit,
            retention_days,
            config,
            cache: None,
            incidents: None,
        }
    }

    /// Also purge expired entries from an in-process cache
    pub fn with_cache(mut self, cache: Arc<MemoryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Also report overdue incidents
    pub fn with_incidents(mut self, incidents: Arc<IncidentManager>) -> Self {
        self.incidents = Some(incidents);
        self
    }

    /// Configured interval between passes
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    /// Run every job once
    pub fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.keys.rotate_expiring(self.config.rotate_within_days) {
            Ok(rotated) => report.rotated = rotated,
            Err(e) => {
                error!(error = %e, "Scheduled key rotation failed");
                report.failures.push(format!("key rotation: {}", e));
            }
        }

        match self.audit.cleanup(self.retention_days) {
            Ok(cleanup) => {
                if cleanup.aborted {
                    report.failures.push("audit retention: archive failed".to_string());
                }
                report.retention = Some(cleanup);
            }
            Err(e) => {
                error!(error = %e, "Audit retention failed");
                report.failures.push(format!("audit retention: {}", e));
            }
        }

        if let Some(cache) = &self.cache {
            report.cache_entries_purged = cache.purge_expired();
        }

        if let Some(incidents) = &self.incidents {
            match incidents.overdue() {
                Ok(overdue) => {
                    for incident in &overdue {
                        warn!(
                            incident_id = %incident.incident_id,
                            severity = %incident.severity,
                            "Incident past escalation threshold"
                        );
                    }
                    report.overdue_incidents = overdue.into_iter().map(|i| i.incident_id).collect();
                }
                Err(e) => report.failures.push(format!("incident review: {}", e)),
            }
        }

        info!(
            rotated = report.rotated.len(),
            purged = report.cache_entries_purged,
            overdue = report.overdue_incidents.len(),
            failures = report.failures.len(),
            "Maintenance pass complete"
        );
        report
    }

    /// Run passes every `interval` until `shutdown` flips to `true` or its
    /// sender is dropped. The first pass runs immediately.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting maintenance scheduler");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let jobs = self.clone();
                    // key generation and retention are CPU and file bound
                    match tokio::task::spawn_blocking(move || jobs.run_once()).await {
                        Ok(report) if !report.is_clean() => {
                            warn!(failures = ?report.failures, "Maintenance pass had failures");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Maintenance task panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Maintenance scheduler stopped");
    }
}

impl std::fmt::Debug for MaintenanceJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceJobs")
            .field("retention_days", &self.retention_days)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEntry, SearchCriteria};
    use crate::clock::ManualClock;
    use crate::config::KeyConfig;
    use crate::crypto::MasterKey;
    use crate::keys::{KeyAlgorithm, MemoryKeyStore};
    use chrono::Duration as ChronoDuration;

    fn jobs() -> (Arc<ManualClock>, Arc<KeyManager>, Arc<AuditLedger>, MaintenanceJobs) {
        let clock = ManualClock::starting_now();
        let master = MasterKey::from_secret("maintenance-master-secret-0123456789abcdef").unwrap();
        let keys = Arc::new(KeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            master,
            KeyConfig::default(),
            clock.clone(),
        ));
        let audit = Arc::new(AuditLedger::in_memory(clock.clone()));
        let jobs = MaintenanceJobs::new(keys.clone(), audit.clone(), 30, MaintenanceConfig::default());
        (clock, keys, audit, jobs)
    }

    #[test]
    fn test_run_once_rotates_and_applies_retention() {
        let (clock, keys, audit, jobs) = jobs();
        let original = keys.generate_key("pii", KeyAlgorithm::Aes256Gcm).unwrap();
        audit.log(AuditEntry::new("login", "User logged in").with_actor_id("u1"));

        // 85 days later the key is due within the 7 day window and the
        // login event is past the 30 day retention
        clock.advance(ChronoDuration::days(85));
        let report = jobs.run_once();

        assert!(report.is_clean());
        assert_eq!(report.rotated.len(), 1);
        assert_eq!(report.rotated[0].old_key_id, Some(original.key_id));
        assert_eq!(report.retention.as_ref().unwrap().deleted, 1);
        assert_eq!(
            audit.search(&SearchCriteria::new().event_type("login")).unwrap().total,
            0
        );

        // nothing left to do
        let again = jobs.run_once();
        assert!(again.rotated.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, _, _, jobs) = jobs();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(jobs).run(Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}

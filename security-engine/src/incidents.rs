//! Security incident management
//!
//! Lifecycle:
//!
//! ```text
//! detected -> investigating | contained | closed
//! investigating -> contained | resolved | closed
//! contained -> resolved | closed
//! resolved -> closed
//! ```
//!
//! Every change is appended to the incident's timeline and to the audit
//! ledger.

use crate::audit::{AuditEntry, AuditLedger, RequestContext, Severity};
use crate::clock::Clock;
use crate::crypto;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Incident lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Reported, not yet triaged
    Detected,
    /// Under investigation
    Investigating,
    /// Impact stopped
    Contained,
    /// Root cause addressed
    Resolved,
    /// Final
    Closed,
}

impl IncidentStatus {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Detected => "detected",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Contained => "contained",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Closed => "closed",
        }
    }

    /// Whether `next` is a legal successor
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Detected, Investigating | Contained | Closed)
                | (Investigating, Contained | Resolved | Closed)
                | (Contained, Resolved | Closed)
                | (Resolved, Closed)
        )
    }

    /// Neither resolved nor closed
    pub fn is_open(&self) -> bool {
        !matches!(self, IncidentStatus::Resolved | IncidentStatus::Closed)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    /// Data breach
    DataBreach,
    /// Unauthorized access
    UnauthorizedAccess,
    /// Malware detection
    Malware,
    /// Phishing attempt
    Phishing,
    /// DoS/DDoS attack
    DosAttack,
    /// Insider threat
    InsiderThreat,
    /// Physical security breach
    PhysicalSecurity,
    /// Social engineering
    SocialEngineering,
    /// System compromise
    SystemCompromise,
    /// Data loss
    DataLoss,
    /// Security policy violation
    PolicyViolation,
    /// Vulnerability exploitation
    VulnerabilityExploit,
}

impl IncidentType {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::DataBreach => "data_breach",
            IncidentType::UnauthorizedAccess => "unauthorized_access",
            IncidentType::Malware => "malware",
            IncidentType::Phishing => "phishing",
            IncidentType::DosAttack => "dos_attack",
            IncidentType::InsiderThreat => "insider_threat",
            IncidentType::PhysicalSecurity => "physical_security",
            IncidentType::SocialEngineering => "social_engineering",
            IncidentType::SystemCompromise => "system_compromise",
            IncidentType::DataLoss => "data_loss",
            IncidentType::PolicyViolation => "policy_violation",
            IncidentType::VulnerabilityExploit => "vulnerability_exploit",
        }
    }
}

/// Timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentAction {
    /// What was done
    pub action: String,
    /// Who did it
    pub performed_by: Option<String>,
    /// When
    pub performed_at: DateTime<Utc>,
    /// Free-form detail
    pub details: Value,
}

/// Security incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// `INC-YYYYMM-XXXXXX`
    pub incident_id: String,
    /// Classification
    pub incident_type: IncidentType,
    /// Current severity
    pub severity: Severity,
    /// Lifecycle state
    pub status: IncidentStatus,
    /// What happened
    pub description: String,
    /// Systems, accounts or records involved
    pub affected_resources: Vec<String>,
    /// Reporter
    pub reported_by: Option<String>,
    /// Owner
    pub assigned_to: Option<String>,
    /// Detection time
    pub detected_at: DateTime<Utc>,
    /// Containment time
    pub contained_at: Option<DateTime<Utc>>,
    /// Resolution time
    pub resolved_at: Option<DateTime<Utc>>,
    /// Closing time
    pub closed_at: Option<DateTime<Utc>>,
    /// Resolution summary
    pub resolution: Option<String>,
    /// Root cause
    pub root_cause: Option<String>,
    /// Last escalation
    pub escalated_at: Option<DateTime<Utc>>,
    /// Actions in order
    pub timeline: Vec<IncidentAction>,
}

impl Incident {
    /// Hours allowed before an open incident must be escalated
    pub fn escalation_threshold(&self) -> Duration {
        Duration::hours(match self.severity {
            Severity::Low => 48,
            Severity::Medium => 24,
            Severity::High => 4,
            Severity::Critical => 1,
        })
    }

    /// Open and older than its escalation threshold at `now`
    pub fn needs_escalation(&self, now: DateTime<Utc>) -> bool {
        let since = self.escalated_at.unwrap_or(self.detected_at);
        self.status.is_open() && now - since > self.escalation_threshold()
    }
}

/// Input to [`IncidentManager::create_incident`]
#[derive(Debug, Clone)]
pub struct NewIncident {
    /// Classification
    pub incident_type: IncidentType,
    /// Initial severity
    pub severity: Severity,
    /// What happened
    pub description: String,
    /// Systems, accounts or records involved
    pub affected_resources: Vec<String>,
    /// Detection time, defaults to now
    pub detected_at: Option<DateTime<Utc>>,
}

impl NewIncident {
    /// New incident report
    pub fn new(incident_type: IncidentType, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            incident_type,
            severity,
            description: description.into(),
            affected_resources: Vec::new(),
            detected_at: None,
        }
    }

    /// Add an affected resource
    pub fn affecting(mut self, resource: impl Into<String>) -> Self {
        self.affected_resources.push(resource.into());
        self
    }

    /// Backdate detection
    pub fn detected_at(mut self, at: DateTime<Utc>) -> Self {
        self.detected_at = Some(at);
        self
    }
}

/// Summary over a window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IncidentMetrics {
    /// Window length in days
    pub period_days: i64,
    /// Incidents detected in the window
    pub total: usize,
    /// Still open
    pub open: usize,
    /// Count per status
    pub by_status: BTreeMap<String, usize>,
    /// Count per severity
    pub by_severity: BTreeMap<String, usize>,
    /// Count per type
    pub by_type: BTreeMap<String, usize>,
    /// Mean detection-to-containment, hours
    pub mean_time_to_contain_hours: Option<f64>,
    /// Mean detection-to-resolution, hours
    pub mean_time_to_resolve_hours: Option<f64>,
}

/// Incident persistence seam
pub trait IncidentStore: Send + Sync {
    /// Insert. `Conflict` if the id exists.
    fn insert(&self, incident: Incident) -> Result<()>;
    /// Replace an existing incident
    fn update(&self, incident: Incident) -> Result<()>;
    /// Incident by id
    fn get(&self, incident_id: &str) -> Result<Option<Incident>>;
    /// All incidents
    fn list(&self) -> Result<Vec<Incident>>;
}

/// In-memory incident store
#[derive(Debug, Default)]
pub struct MemoryIncidentStore {
    incidents: RwLock<BTreeMap<String, Incident>>,
}

impl MemoryIncidentStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl IncidentStore for MemoryIncidentStore {
    fn insert(&self, incident: Incident) -> Result<()> {
        let mut incidents = self.incidents.write();
        if incidents.contains_key(&incident.incident_id) {
            return Err(Error::Conflict(format!("Incident already exists: {}", incident.incident_id)));
        }
        incidents.insert(incident.incident_id.clone(), incident);
        Ok(())
    }

    fn update(&self, incident: Incident) -> Result<()> {
        let mut incidents = self.incidents.write();
        match incidents.get_mut(&incident.incident_id) {
            Some(existing) => {
                *existing = incident;
                Ok(())
            }
            None => Err(Error::NotFound(format!("Incident not found: {}", incident.incident_id))),
        }
    }

    fn get(&self, incident_id: &str) -> Result<Option<Incident>> {
        Ok(self.incidents.read().get(incident_id).cloned())
    }

    fn list(&self) -> Result<Vec<Incident>> {
        Ok(self.incidents.read().values().cloned().collect())
    }
}

/// Incident manager
pub struct IncidentManager {
    store: Arc<dyn IncidentStore>,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLedger>>,
    // serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl IncidentManager {
    /// Create a manager
    pub fn new(store: Arc<dyn IncidentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            audit: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Emit events to an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            audit.log(entry);
        }
    }

    fn generate_id(&self) -> String {
        format!(
            "INC-{}-{}",
            self.clock.now().format("%Y%m"),
            crypto::random_alphanumeric(6).to_ascii_uppercase()
        )
    }

    /// Incident by id
    pub fn get(&self, incident_id: &str) -> Result<Incident> {
        self.store
            .get(incident_id)?
            .ok_or_else(|| Error::NotFound(format!("Incident not found: {}", incident_id)))
    }

    /// Incidents, newest first, optionally filtered by status
    pub fn list(&self, status: Option<IncidentStatus>) -> Result<Vec<Incident>> {
        let mut incidents: Vec<Incident> = self
            .store
            .list()?
            .into_iter()
            .filter(|incident| status.map_or(true, |s| incident.status == s))
            .collect();
        incidents.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(incidents)
    }

    /// Open a new incident in `detected` state.
    ///
    /// High and critical incidents are recorded as `security_incident`, which
    /// the ledger treats as critical and routes to the alert hook. Lower
    /// severities are recorded as `incident_created`.
    pub fn create_incident(
        &self,
        report: NewIncident,
        reporter: Option<&str>,
        context: &RequestContext,
    ) -> Result<Incident> {
        let now = self.clock.now();
        let mut incident = Incident {
            incident_id: self.generate_id(),
            incident_type: report.incident_type,
            severity: report.severity,
            status: IncidentStatus::Detected,
            description: report.description,
            affected_resources: report.affected_resources,
            reported_by: reporter.map(str::to_string),
            assigned_to: None,
            detected_at: report.detected_at.unwrap_or(now),
            contained_at: None,
            resolved_at: None,
            closed_at: None,
            resolution: None,
            root_cause: None,
            escalated_at: None,
            timeline: Vec::new(),
        };
        incident.timeline.push(IncidentAction {
            action: "Incident reported".to_string(),
            performed_by: incident.reported_by.clone(),
            performed_at: now,
            details: serde_json::json!({ "severity": incident.severity }),
        });

        // retry on the rare id collision
        let mut attempts = 0;
        loop {
            match self.store.insert(incident.clone()) {
                Ok(()) => break,
                Err(Error::Conflict(_)) if attempts < 3 => {
                    attempts += 1;
                    incident.incident_id = self.generate_id();
                }
                Err(e) => return Err(e),
            }
        }

        let metadata = serde_json::json!({
            "incident_id": incident.incident_id,
            "incident_type": incident.incident_type,
            "severity": incident.severity,
            "affected_resources": incident.affected_resources,
        });
        if incident.severity >= Severity::High {
            warn!(incident_id = %incident.incident_id, severity = %incident.severity, "Security incident reported");
            if let Some(audit) = &self.audit {
                audit.log_security_incident(&incident.description, reporter, context, metadata);
            }
        } else {
            info!(incident_id = %incident.incident_id, severity = %incident.severity, "Security incident reported");
            let mut entry = AuditEntry::new("incident_created", incident.description.clone())
                .with_resource("security_incident", incident.incident_id.clone())
                .with_context(context)
                .with_metadata(metadata);
            if let Some(reporter) = reporter {
                entry = entry.with_actor_id(reporter);
            }
            self.audit(entry);
        }
        Ok(incident)
    }

    fn modify<F>(&self, incident_id: &str, change: F) -> Result<Incident>
    where
        F: FnOnce(&mut Incident, DateTime<Utc>) -> Result<()>,
    {
        let _guard = self.write_lock.lock();
        let mut incident = self.get(incident_id)?;
        change(&mut incident, self.clock.now())?;
        self.store.update(incident.clone())?;
        Ok(incident)
    }

    fn transition(incident: &mut Incident, next: IncidentStatus, now: DateTime<Utc>) -> Result<()> {
        if !incident.status.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "Invalid status transition from {} to {}",
                incident.status, next
            )));
        }
        incident.status = next;
        match next {
            IncidentStatus::Contained => incident.contained_at = Some(now),
            IncidentStatus::Resolved => incident.resolved_at = Some(now),
            IncidentStatus::Closed => incident.closed_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Move to `next`. Illegal transitions are a `Conflict`.
    pub fn update_status(
        &self,
        incident_id: &str,
        next: IncidentStatus,
        updated_by: &str,
        note: Option<&str>,
    ) -> Result<Incident> {
        let mut previous = IncidentStatus::Detected;
        let incident = self.modify(incident_id, |incident, now| {
            previous = incident.status;
            Self::transition(incident, next, now)?;
            incident.timeline.push(IncidentAction {
                action: format!("Status changed from {} to {}", previous, next),
                performed_by: Some(updated_by.to_string()),
                performed_at: now,
                details: serde_json::json!({ "note": note }),
            });
            Ok(())
        })?;

        info!(incident_id = %incident_id, from = %previous, to = %next, "Incident status changed");
        self.audit(
            AuditEntry::new(
                "incident_status_changed",
                format!("Incident {} status changed from {} to {}", incident_id, previous, next),
            )
            .with_actor_id(updated_by)
            .with_resource("security_incident", incident_id)
            .with_old_values(serde_json::json!({ "status": previous }))
            .with_new_values(serde_json::json!({ "status": next })),
        );
        Ok(incident)
    }

    /// Give the incident an owner
    pub fn assign(&self, incident_id: &str, assignee: &str, assigned_by: &str) -> Result<Incident> {
        let incident = self.modify(incident_id, |incident, now| {
            incident.assigned_to = Some(assignee.to_string());
            incident.timeline.push(IncidentAction {
                action: format!("Assigned to {}", assignee),
                performed_by: Some(assigned_by.to_string()),
                performed_at: now,
                details: Value::Null,
            });
            Ok(())
        })?;

        self.audit(
            AuditEntry::new("incident_assigned", format!("Incident {} assigned", incident_id))
                .with_actor_id(assigned_by)
                .with_resource("security_incident", incident_id)
                .with_new_values(serde_json::json!({ "assigned_to": assignee })),
        );
        Ok(incident)
    }

    /// Record an action on the timeline
    pub fn add_action(&self, incident_id: &str, action: &str, performed_by: &str, details: Value) -> Result<Incident> {
        let incident = self.modify(incident_id, |incident, now| {
            incident.timeline.push(IncidentAction {
                action: action.to_string(),
                performed_by: Some(performed_by.to_string()),
                performed_at: now,
                details,
            });
            Ok(())
        })?;

        self.audit(
            AuditEntry::new(
                "incident_action_taken",
                format!("Action taken on incident {}: {}", incident_id, action),
            )
            .with_actor_id(performed_by)
            .with_resource("security_incident", incident_id),
        );
        Ok(incident)
    }

    /// Resolve with a summary. Follows the transition table.
    pub fn resolve(
        &self,
        incident_id: &str,
        summary: &str,
        resolved_by: &str,
        root_cause: Option<&str>,
    ) -> Result<Incident> {
        let incident = self.modify(incident_id, |incident, now| {
            Self::transition(incident, IncidentStatus::Resolved, now)?;
            incident.resolution = Some(summary.to_string());
            incident.root_cause = root_cause.map(str::to_string);
            incident.timeline.push(IncidentAction {
                action: "Incident resolved".to_string(),
                performed_by: Some(resolved_by.to_string()),
                performed_at: now,
                details: serde_json::json!({ "resolution": summary, "root_cause": root_cause }),
            });
            Ok(())
        })?;

        info!(incident_id = %incident_id, "Incident resolved");
        self.audit(
            AuditEntry::new("incident_resolved", format!("Incident {} resolved", incident_id))
                .with_actor_id(resolved_by)
                .with_resource("security_incident", incident_id)
                .with_new_values(serde_json::json!({ "resolution": summary })),
        );
        Ok(incident)
    }

    /// Raise severity one level (saturating at critical)
    pub fn escalate(&self, incident_id: &str, reason: &str) -> Result<Incident> {
        let incident = self.modify(incident_id, |incident, now| {
            let previous = incident.severity;
            incident.severity = previous.escalated();
            incident.escalated_at = Some(now);
            incident.timeline.push(IncidentAction {
                action: "Incident escalated".to_string(),
                performed_by: None,
                performed_at: now,
                details: serde_json::json!({ "reason": reason, "from": previous, "to": incident.severity }),
            });
            Ok(())
        })?;

        warn!(incident_id = %incident_id, severity = %incident.severity, reason = %reason, "Incident escalated");
        self.audit(
            AuditEntry::new("incident_escalated", format!("Incident {} escalated", incident_id))
                .with_resource("security_incident", incident_id)
                .with_metadata(serde_json::json!({ "reason": reason, "severity": incident.severity })),
        );
        Ok(incident)
    }

    /// Open incidents past their escalation threshold
    pub fn overdue(&self) -> Result<Vec<Incident>> {
        let now = self.clock.now();
        Ok(self
            .list(None)?
            .into_iter()
            .filter(|incident| incident.needs_escalation(now))
            .collect())
    }

    /// Counts and mean times for incidents detected in the last `days`
    pub fn metrics(&self, days: i64) -> Result<IncidentMetrics> {
        let since = self.clock.now() - Duration::days(days);
        let incidents: Vec<Incident> = self
            .store
            .list()?
            .into_iter()
            .filter(|incident| incident.detected_at >= since)
            .collect();

        let mut metrics = IncidentMetrics {
            period_days: days,
            total: incidents.len(),
            ..IncidentMetrics::default()
        };
        for incident in &incidents {
            if incident.status.is_open() {
                metrics.open += 1;
            }
            *metrics.by_status.entry(incident.status.as_str().to_string()).or_default() += 1;
            *metrics.by_severity.entry(incident.severity.as_str().to_string()).or_default() += 1;
            *metrics.by_type.entry(incident.incident_type.as_str().to_string()).or_default() += 1;
        }

        let mean_hours = |end: fn(&Incident) -> Option<DateTime<Utc>>| {
            let durations: Vec<i64> = incidents
                .iter()
                .filter_map(|incident| end(incident).map(|at| (at - incident.detected_at).num_minutes()))
                .collect();
            if durations.is_empty() {
                None
            } else {
                let mean = durations.iter().sum::<i64>() as f64 / durations.len() as f64 / 60.0;
                Some((mean * 100.0).round() / 100.0)
            }
        };
        metrics.mean_time_to_contain_hours = mean_hours(|incident| incident.contained_at);
        metrics.mean_time_to_resolve_hours = mean_hours(|incident| incident.resolved_at);
        Ok(metrics)
    }
}

impl fmt::Debug for IncidentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncidentManager").finish_non_exhaustive()
    }
}

//! Audit ledger
//!
//! Append-only structured security event log:
//! - Severity, risk and category derived from injected policy tables
//! - Recursive redaction of denylisted fields before persistence
//! - Correlation IDs and derived tags
//! - Critical-event alert hook that never fails the write
//! - Search, timeline, anomaly detection, export and retention
//!
//! A failing sink degrades observability, not availability: [`AuditLedger::log`]
//! reports the failure to the process log (target `audit_fallback`) and
//! returns the event anyway.

mod policy;
mod query;
mod sink;

pub use policy::{AuditPolicy, REDACTION_MARKER};
pub use query::{
    AuditStatistics, CleanupReport, ExportFormat, Page, SearchCriteria, SortField, SortOrder,
    SuspiciousActivity, TimelineEntry,
};
pub use sink::{
    AlertHook, ArchiveSink, EventSink, JsonArchiveSink, JsonLinesEventSink, LogAlertHook,
    MemoryEventSink,
};

use crate::clock::Clock;
use crate::config::AuditConfig;
use crate::crypto;
use crate::error::Result;
use crate::metrics::SecurityMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine
    Low,
    /// Worth reviewing
    Medium,
    /// Security relevant
    High,
    /// Requires immediate attention
    Critical,
}

impl Severity {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// One level up, saturating at critical
    pub fn escalated(&self) -> Severity {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk assessment attached to each event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Low risk
    Low,
    /// Medium risk
    Medium,
    /// High risk
    High,
    /// Critical risk
    Critical,
}

impl RiskLevel {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Event classification bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Logins, MFA, token checks
    Authentication,
    /// Roles, permissions, denials
    Authorization,
    /// Reads and exports
    DataAccess,
    /// Creates, updates, deletes
    DataModification,
    /// Keys, credentials, incidents
    SystemSecurity,
    /// Regulatory events
    Compliance,
}

impl EventCategory {
    /// Tag name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Authentication => "authentication",
            EventCategory::Authorization => "authorization",
            EventCategory::DataAccess => "data_access",
            EventCategory::DataModification => "data_modification",
            EventCategory::SystemSecurity => "system_security",
            EventCategory::Compliance => "compliance",
        }
    }
}

/// Reference to the acting user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    /// Stable user identifier
    pub id: String,

    /// Display name or email, if known
    pub name: Option<String>,
}

impl UserRef {
    /// Reference by id only
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Reference with a display name
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

/// Request-scoped context supplied by the transport layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client IP
    pub ip: Option<IpAddr>,

    /// Client user agent
    pub user_agent: Option<String>,

    /// Session identifier
    pub session_id: Option<String>,

    /// Correlation id propagated from an upstream request
    pub correlation_id: Option<Uuid>,
}

impl RequestContext {
    /// Context with client IP and user agent
    pub fn client(ip: IpAddr, user_agent: impl Into<String>) -> Self {
        Self {
            ip: Some(ip),
            user_agent: Some(user_agent.into()),
            ..Self::default()
        }
    }

    /// Attach a session identifier
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Persisted audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Write time
    pub timestamp: DateTime<Utc>,

    /// Acting user, `None` for system or anonymous actions
    pub actor: Option<UserRef>,

    /// Event type (e.g. `login`, `key_rotated`)
    pub event_type: String,

    /// Affected resource type
    pub resource_type: Option<String>,

    /// Affected resource id
    pub resource_id: Option<String>,

    /// Human-readable action
    pub action: String,

    /// Redacted values before the change
    pub old_values: Option<Value>,

    /// Redacted values after the change
    pub new_values: Option<Value>,

    /// Client IP
    pub ip: Option<IpAddr>,

    /// Client user agent
    pub user_agent: Option<String>,

    /// Session identifier
    pub session_id: Option<String>,

    /// Derived severity
    pub severity: Severity,

    /// Derived risk level
    pub risk_level: RiskLevel,

    /// Classification bucket
    pub category: Option<EventCategory>,

    /// Correlation ID
    pub correlation_id: Uuid,

    /// Derived and caller-supplied tags
    pub tags: BTreeSet<String>,

    /// Redacted free-form metadata
    pub metadata: Value,

    /// Hash of the preceding event in the sink
    pub previous_hash: String,

    /// Hash over this event
    pub hash: String,
}

impl AuditEvent {
    /// Compute the event hash (all fields except `hash`)
    pub fn compute_hash(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.hash = String::new();
        let bytes = serde_json::to_vec(&unsealed)?;
        Ok(crypto::sha256_hex(&bytes))
    }

    /// Verify event hash
    pub fn verify_hash(&self) -> Result<bool> {
        Ok(self.hash == self.compute_hash()?)
    }

    /// Link to the previous event and compute the hash
    pub fn seal(&mut self, previous_hash: String) -> Result<()> {
        self.previous_hash = previous_hash;
        self.hash = self.compute_hash()?;
        Ok(())
    }

    /// Whether the actor was authenticated
    pub fn is_authenticated(&self) -> bool {
        self.actor.is_some()
    }
}

/// Input to [`AuditLedger::log`]
#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
    event_type: String,
    action: String,
    actor: Option<UserRef>,
    resource_type: Option<String>,
    resource_id: Option<String>,
    old_values: Option<Value>,
    new_values: Option<Value>,
    metadata: Option<Value>,
    context: RequestContext,
    tags: Vec<String>,
}

impl AuditEntry {
    /// New entry for an event type
    pub fn new(event_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            action: action.into(),
            ..Self::default()
        }
    }

    /// Set acting user
    pub fn with_actor(mut self, actor: UserRef) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Set acting user by id
    pub fn with_actor_id(self, actor_id: impl Into<String>) -> Self {
        self.with_actor(UserRef::id(actor_id))
    }

    /// Set affected resource
    pub fn with_resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Set pre-change values
    pub fn with_old_values(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    /// Set post-change values
    pub fn with_new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set request context
    pub fn with_context(mut self, context: &RequestContext) -> Self {
        self.context = context.clone();
        self
    }

    /// Add a custom tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Audit ledger
pub struct AuditLedger {
    sink: Arc<dyn EventSink>,
    archive: Arc<dyn ArchiveSink>,
    alert: Arc<dyn AlertHook>,
    policy: Arc<AuditPolicy>,
    clock: Arc<dyn Clock>,
    config: AuditConfig,
    metrics: Option<Arc<SecurityMetrics>>,
}

impl AuditLedger {
    /// Create a ledger over a sink
    pub fn new(sink: Arc<dyn EventSink>, policy: AuditPolicy, clock: Arc<dyn Clock>) -> Self {
        let config = AuditConfig::default();
        Self {
            sink,
            archive: Arc::new(JsonArchiveSink::new(config.archive_dir.clone(), clock.clone())),
            alert: Arc::new(LogAlertHook),
            policy: Arc::new(policy),
            clock,
            config,
            metrics: None,
        }
    }

    /// In-memory ledger with the stock policy
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryEventSink::new()), AuditPolicy::default(), clock)
    }

    /// Apply configuration; archive directory follows `config.archive_dir`
    pub fn with_config(mut self, config: AuditConfig) -> Self {
        self.archive = Arc::new(JsonArchiveSink::new(config.archive_dir.clone(), self.clock.clone()));
        self.config = config;
        self
    }

    /// Replace the archive sink
    pub fn with_archive(mut self, archive: Arc<dyn ArchiveSink>) -> Self {
        self.archive = archive;
        self
    }

    /// Replace the critical-alert hook
    pub fn with_alert_hook(mut self, alert: Arc<dyn AlertHook>) -> Self {
        self.alert = alert;
        self
    }

    /// Record metrics for every logged event
    pub fn with_metrics(mut self, metrics: Arc<SecurityMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Classification policy
    pub fn policy(&self) -> &AuditPolicy {
        &self.policy
    }

    fn build(&self, entry: AuditEntry) -> AuditEvent {
        let policy = &self.policy;
        let severity = policy.severity_for(&entry.event_type);
        let risk_level = policy.risk_for(&entry.event_type);
        let category = policy.category_for(&entry.event_type);

        let mut tags = BTreeSet::new();
        tags.insert("audit".to_string());
        if let Some(category) = category {
            tags.insert(category.as_str().to_string());
        }
        tags.insert(format!("risk_{}", risk_level.as_str()));
        tags.insert(if entry.actor.is_some() { "authenticated" } else { "anonymous" }.to_string());
        tags.extend(entry.tags);

        let metadata = match entry.metadata {
            Some(Value::Object(map)) => policy.redact(Value::Object(map)),
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(other) => policy.redact(serde_json::json!({ "value": other })),
        };

        AuditEvent {
            id: Uuid::now_v7(),
            timestamp: self.clock.now(),
            actor: entry.actor,
            event_type: entry.event_type,
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            action: entry.action,
            old_values: entry.old_values.map(|v| policy.redact(v)),
            new_values: entry.new_values.map(|v| policy.redact(v)),
            ip: entry.context.ip,
            user_agent: entry.context.user_agent,
            session_id: entry.context.session_id,
            severity,
            risk_level,
            category,
            correlation_id: entry.context.correlation_id.unwrap_or_else(Uuid::new_v4),
            tags,
            metadata,
            previous_hash: String::new(),
            hash: String::new(),
        }
    }

    /// Record an event, surfacing sink failures
    pub fn try_log(&self, entry: AuditEntry) -> Result<AuditEvent> {
        let event = self.build(entry);
        let stored = self.sink.append(event)?;
        self.after_write(&stored);
        Ok(stored)
    }

    /// Record an event.
    ///
    /// Never fails: a sink error is written to the process log with the
    /// redacted event and counted, and the unsealed event is returned.
    pub fn log(&self, entry: AuditEntry) -> AuditEvent {
        let event = self.build(entry);
        match self.sink.append(event.clone()) {
            Ok(stored) => {
                self.after_write(&stored);
                stored
            }
            Err(e) => {
                let serialized = serde_json::to_string(&event).unwrap_or_default();
                error!(
                    target: "audit_fallback",
                    error = %e,
                    event = %serialized,
                    "Audit sink write failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.audit_write_failures.inc();
                }
                self.after_write(&event);
                event
            }
        }
    }

    fn after_write(&self, event: &AuditEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_event(event);
        }

        if event.severity == Severity::Critical {
            if let Some(metrics) = &self.metrics {
                metrics.critical_alerts.inc();
            }
            if let Err(e) = self.alert.critical(event) {
                warn!(event_id = %event.id, error = %e, "Critical alert hook failed");
                if let Some(metrics) = &self.metrics {
                    metrics.alert_hook_failures.inc();
                }
            }
        }
    }

    /// Authentication event (login, logout, failed_login, mfa_*)
    pub fn log_authentication(
        &self,
        event_type: &str,
        user_id: Option<&str>,
        context: &RequestContext,
        metadata: Value,
    ) -> AuditEvent {
        let action = match event_type {
            "login" => "User logged in".to_string(),
            "logout" => "User logged out".to_string(),
            "failed_login" => "Failed login attempt".to_string(),
            "password_changed" => "Password was changed".to_string(),
            "mfa_enabled" => "Multi-factor authentication enabled".to_string(),
            "mfa_disabled" => "Multi-factor authentication disabled".to_string(),
            other => other.to_string(),
        };
        let mut entry = AuditEntry::new(event_type, action)
            .with_context(context)
            .with_metadata(metadata);
        if let Some(user_id) = user_id {
            entry = entry.with_actor_id(user_id);
        }
        self.log(entry)
    }

    /// Role or permission change, or access denial
    pub fn log_access_control(
        &self,
        event_type: &str,
        actor_id: Option<&str>,
        target_user: &str,
        detail: Value,
    ) -> AuditEvent {
        let mut entry = AuditEntry::new(event_type, format!("{} for user {}", event_type, target_user))
            .with_resource("user", target_user)
            .with_metadata(detail);
        if let Some(actor_id) = actor_id {
            entry = entry.with_actor_id(actor_id);
        }
        self.log(entry)
    }

    /// Security incident (always critical)
    pub fn log_security_incident(
        &self,
        description: &str,
        actor_id: Option<&str>,
        context: &RequestContext,
        metadata: Value,
    ) -> AuditEvent {
        let mut entry = AuditEntry::new("security_incident", description)
            .with_context(context)
            .with_metadata(metadata);
        if let Some(actor_id) = actor_id {
            entry = entry.with_actor_id(actor_id);
        }
        self.log(entry)
    }

    /// Read or export of a data set
    pub fn log_data_access(
        &self,
        actor_id: &str,
        data_type: &str,
        operation: &str,
        record_count: usize,
    ) -> AuditEvent {
        let event_type = if operation == "export" { "data_exported" } else { "data_viewed" };
        self.log(
            AuditEntry::new(event_type, format!("Data access: {} on {}", operation, data_type))
                .with_actor_id(actor_id)
                .with_resource(data_type, "*")
                .with_metadata(serde_json::json!({
                    "data_type": data_type,
                    "operation": operation,
                    "record_count": record_count,
                })),
        )
    }
}

impl fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

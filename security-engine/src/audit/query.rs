//! Search, reporting, export and retention over the audit ledger

use super::{AuditEntry, AuditEvent, AuditLedger, Severity};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use tracing::{error, info};

/// Sort key for searches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortField {
    /// Write time
    #[default]
    Timestamp,
    /// Severity
    Severity,
    /// Event type
    EventType,
}

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending
    Asc,
    /// Descending
    #[default]
    Desc,
}

/// Search filters. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    /// Acting user id
    pub actor_id: Option<String>,
    /// Any of these event types
    pub event_types: Vec<String>,
    /// Resource type
    pub resource_type: Option<String>,
    /// Resource id (with `resource_type`)
    pub resource_id: Option<String>,
    /// Any of these severities
    pub severities: Vec<Severity>,
    /// Inclusive lower bound
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub date_to: Option<DateTime<Utc>>,
    /// Client IP
    pub ip: Option<IpAddr>,
    /// Case-insensitive substring over action and metadata
    pub text: Option<String>,
    /// Sort key
    pub order_by: SortField,
    /// Sort direction
    pub order: SortOrder,
    /// 1-based page
    pub page: usize,
    /// Page size; ledger default when unset
    pub per_page: Option<usize>,
}

impl SearchCriteria {
    /// Match everything, newest first
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by actor
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Add an event type
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    /// Add a severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severities.push(severity);
        self
    }

    /// Filter by resource
    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: Option<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = resource_id;
        self
    }

    /// Restrict to a time range
    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.date_from = Some(from);
        self.date_to = Some(to);
        self
    }

    /// Filter by client IP
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Free-text search
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sort order
    pub fn order_by(mut self, field: SortField, order: SortOrder) -> Self {
        self.order_by = field;
        self.order = order;
        self
    }

    /// Page selection
    pub fn page(mut self, page: usize, per_page: usize) -> Self {
        self.page = page;
        self.per_page = Some(per_page);
        self
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(actor_id) = &self.actor_id {
            if event.actor.as_ref().map(|a| &a.id) != Some(actor_id) {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(resource_type) = &self.resource_type {
            if event.resource_type.as_ref() != Some(resource_type) {
                return false;
            }
            if let Some(resource_id) = &self.resource_id {
                if event.resource_id.as_ref() != Some(resource_id) {
                    return false;
                }
            }
        }
        if !self.severities.is_empty() && !self.severities.contains(&event.severity) {
            return false;
        }
        if self.date_from.map_or(false, |from| event.timestamp < from) {
            return false;
        }
        if self.date_to.map_or(false, |to| event.timestamp > to) {
            return false;
        }
        if self.ip.is_some() && event.ip != self.ip {
            return false;
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let in_action = event.action.to_lowercase().contains(&needle);
            let in_metadata = event.metadata.to_string().to_lowercase().contains(&needle);
            if !in_action && !in_metadata {
                return false;
            }
        }
        true
    }

    fn compare(&self, a: &AuditEvent, b: &AuditEvent) -> Ordering {
        let ordering = match self.order_by {
            SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
            SortField::Severity => a.severity.cmp(&b.severity),
            SortField::EventType => a.event_type.cmp(&b.event_type),
        }
        .then_with(|| a.timestamp.cmp(&b.timestamp));

        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Matches across all pages
    pub total: usize,
    /// 1-based page number
    pub page: usize,
    /// Page size
    pub per_page: usize,
    /// Last page number (at least 1)
    pub last_page: usize,
}

/// Timeline row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    /// `HH:MM:SS`
    pub time: String,
    /// Event type
    pub event_type: String,
    /// Action
    pub action: String,
    /// Severity
    pub severity: Severity,
    /// Client IP
    pub ip: Option<IpAddr>,
}

/// Actor/IP group flagged as anomalous
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspiciousActivity {
    /// Acting user, `None` for anonymous traffic
    pub actor_id: Option<String>,
    /// Client IP
    pub ip: Option<IpAddr>,
    /// Events in the window
    pub event_count: usize,
    /// Distinct event types
    pub unique_events: usize,
    /// `failed_login` events
    pub failed_logins: usize,
    /// High or critical events
    pub high_severity_events: usize,
}

/// Aggregate counts over a window
#[derive(Debug, Clone, Serialize)]
pub struct AuditStatistics {
    /// All events
    pub total_events: usize,
    /// Distinct authenticated actors
    pub unique_actors: usize,
    /// Count per severity
    pub by_severity: BTreeMap<String, usize>,
    /// Ten most frequent event types
    pub top_event_types: Vec<(String, usize)>,
    /// Count per calendar day
    pub daily_trend: BTreeMap<NaiveDate, usize>,
}

/// Export renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Comma-separated values
    Csv,
    /// Pretty-printed JSON array
    Json,
}

impl std::str::FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(Error::Validation(format!("Unsupported export format: {}", other))),
        }
    }
}

/// Outcome of a retention run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Events older than this were eligible
    pub cutoff: DateTime<Utc>,
    /// High/critical events written to cold storage
    pub archived: usize,
    /// Events removed
    pub deleted: usize,
    /// Whether an archive failure stopped the run
    pub aborted: bool,
}

impl AuditLedger {
    fn matching(&self, criteria: &SearchCriteria) -> Result<Vec<AuditEvent>> {
        let mut events: Vec<AuditEvent> = self
            .sink
            .scan()?
            .into_iter()
            .filter(|e| criteria.matches(e))
            .collect();
        // stable sort: ties keep write order, newest write first when descending
        if criteria.order == SortOrder::Desc {
            events.reverse();
        }
        events.sort_by(|a, b| criteria.compare(a, b));
        Ok(events)
    }

    /// Filtered, sorted, paginated search
    pub fn search(&self, criteria: &SearchCriteria) -> Result<Page<AuditEvent>> {
        let per_page = criteria.per_page.unwrap_or(self.config.default_per_page).max(1);
        let page = criteria.page.max(1);
        let events = self.matching(criteria)?;
        let total = events.len();

        let items = events
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        Ok(Page {
            items,
            total,
            page,
            per_page,
            last_page: total.div_ceil(per_page).max(1),
        })
    }

    /// A user's events over the last `days`, bucketed by calendar date
    pub fn activity_timeline(
        &self,
        actor_id: &str,
        days: i64,
    ) -> Result<BTreeMap<NaiveDate, Vec<TimelineEntry>>> {
        let criteria = SearchCriteria {
            actor_id: Some(actor_id.to_string()),
            date_from: Some(self.clock.now() - Duration::days(days)),
            ..SearchCriteria::default()
        };

        let mut timeline: BTreeMap<NaiveDate, Vec<TimelineEntry>> = BTreeMap::new();
        for event in self.matching(&criteria)? {
            timeline
                .entry(event.timestamp.date_naive())
                .or_default()
                .push(TimelineEntry {
                    time: event.timestamp.format("%H:%M:%S").to_string(),
                    event_type: event.event_type,
                    action: event.action,
                    severity: event.severity,
                    ip: event.ip,
                });
        }
        Ok(timeline)
    }

    /// Actor/IP groups within the window exceeding the failed-login or
    /// high-severity thresholds, most high-severity first
    pub fn detect_suspicious_activity(&self, window_hours: i64) -> Result<Vec<SuspiciousActivity>> {
        let since = self.clock.now() - Duration::hours(window_hours);
        let mut groups: HashMap<(Option<String>, Option<IpAddr>), (usize, HashSet<String>, usize, usize)> =
            HashMap::new();

        for event in self.sink.scan()?.into_iter().filter(|e| e.timestamp >= since) {
            let key = (event.actor.map(|a| a.id), event.ip);
            let group = groups.entry(key).or_default();
            group.0 += 1;
            if event.event_type == "failed_login" {
                group.2 += 1;
            }
            if event.severity >= Severity::High {
                group.3 += 1;
            }
            group.1.insert(event.event_type);
        }

        let policy = &self.policy;
        let mut flagged: Vec<SuspiciousActivity> = groups
            .into_iter()
            .filter(|(_, g)| {
                g.2 > policy.failed_login_threshold || g.3 > policy.high_severity_threshold
            })
            .map(|((actor_id, ip), (count, types, failed, high))| SuspiciousActivity {
                actor_id,
                ip,
                event_count: count,
                unique_events: types.len(),
                failed_logins: failed,
                high_severity_events: high,
            })
            .collect();

        flagged.sort_by(|a, b| {
            b.high_severity_events
                .cmp(&a.high_severity_events)
                .then(b.failed_logins.cmp(&a.failed_logins))
        });
        Ok(flagged)
    }

    /// Aggregates over the last `days`
    pub fn statistics(&self, days: i64) -> Result<AuditStatistics> {
        let since = self.clock.now() - Duration::days(days);
        let events: Vec<AuditEvent> = self
            .sink
            .scan()?
            .into_iter()
            .filter(|e| e.timestamp >= since)
            .collect();

        let mut by_severity = BTreeMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut daily_trend = BTreeMap::new();
        let mut actors = HashSet::new();

        for event in &events {
            *by_severity.entry(event.severity.as_str().to_string()).or_insert(0) += 1;
            *by_type.entry(event.event_type.clone()).or_insert(0) += 1;
            *daily_trend.entry(event.timestamp.date_naive()).or_insert(0) += 1;
            if let Some(actor) = &event.actor {
                actors.insert(actor.id.clone());
            }
        }

        let mut top_event_types: Vec<(String, usize)> = by_type.into_iter().collect();
        top_event_types.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_event_types.truncate(10);

        Ok(AuditStatistics {
            total_events: events.len(),
            unique_actors: actors.len(),
            by_severity,
            top_event_types,
            daily_trend,
        })
    }

    /// Render every match (ignoring pagination) as CSV or JSON
    pub fn export(&self, criteria: &SearchCriteria, format: ExportFormat) -> Result<Vec<u8>> {
        let events = self.matching(criteria)?;
        let (body, format_name) = match format {
            ExportFormat::Csv => (render_csv(&events)?, "csv"),
            ExportFormat::Json => (render_json(&events)?, "json"),
        };

        self.log(
            AuditEntry::new("audit_trail_exported", format!("Exported {} audit events", events.len()))
                .with_metadata(serde_json::json!({
                    "format": format_name,
                    "count": events.len(),
                })),
        );
        Ok(body)
    }

    /// Apply retention.
    ///
    /// Eligible events are processed oldest-first in batches. High/critical
    /// events of a batch are archived before the batch is deleted; if
    /// archiving fails the batch is kept and the run stops, so archived
    /// history never has a gap.
    pub fn cleanup(&self, retention_days: i64) -> Result<CleanupReport> {
        let cutoff = self.clock.now() - Duration::days(retention_days);
        let mut expired: Vec<AuditEvent> = self
            .sink
            .scan()?
            .into_iter()
            .filter(|e| e.timestamp < cutoff)
            .collect();
        expired.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut report = CleanupReport {
            cutoff,
            archived: 0,
            deleted: 0,
            aborted: false,
        };

        for batch in expired.chunks(self.config.cleanup_batch_size) {
            let significant: Vec<AuditEvent> = batch
                .iter()
                .filter(|e| e.severity >= Severity::High)
                .cloned()
                .collect();

            if !significant.is_empty() {
                if let Err(e) = self.archive.archive(&significant) {
                    error!(error = %e, batch = batch.len(), "Audit archive failed, retention stopped");
                    report.aborted = true;
                    break;
                }
                report.archived += significant.len();
            }

            let ids: HashSet<_> = batch.iter().map(|e| e.id).collect();
            report.deleted += self.sink.delete(&ids)?;
        }

        info!(
            cutoff = %cutoff,
            archived = report.archived,
            deleted = report.deleted,
            aborted = report.aborted,
            "Audit retention applied"
        );
        self.log(
            AuditEntry::new("audit_retention_applied", format!("Removed {} audit events", report.deleted))
                .with_metadata(serde_json::json!({
                    "retention_days": retention_days,
                    "archived": report.archived,
                    "deleted": report.deleted,
                    "aborted": report.aborted,
                })),
        );
        Ok(report)
    }
}

fn render_csv(events: &[AuditEvent]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_err = |e: csv::Error| Error::Serialization(format!("CSV export failed: {}", e));

    writer
        .write_record([
            "Date",
            "Time",
            "User",
            "Event Type",
            "Action",
            "Severity",
            "IP Address",
            "Model",
        ])
        .map_err(csv_err)?;

    for event in events {
        let user = event
            .actor
            .as_ref()
            .map(|a| a.name.clone().unwrap_or_else(|| a.id.clone()))
            .unwrap_or_else(|| "System".to_string());
        writer
            .write_record([
                event.timestamp.format("%Y-%m-%d").to_string(),
                event.timestamp.format("%H:%M:%S").to_string(),
                user,
                event.event_type.clone(),
                event.action.replace(',', ";"),
                event.severity.as_str().to_string(),
                event.ip.map(|ip| ip.to_string()).unwrap_or_default(),
                event.resource_type.clone().unwrap_or_else(|| "N/A".to_string()),
            ])
            .map_err(csv_err)?;
    }

    writer
        .into_inner()
        .map_err(|e| Error::Serialization(format!("CSV export failed: {}", e)))
}

fn render_json(events: &[AuditEvent]) -> Result<Vec<u8>> {
    let rows: Vec<serde_json::Value> = events
        .iter()
        .map(|event| {
            serde_json::json!({
                "timestamp": event.timestamp.to_rfc3339(),
                "user": event.actor.as_ref().map(|a| a.name.clone().unwrap_or_else(|| a.id.clone())),
                "event_type": event.event_type,
                "action": event.action,
                "severity": event.severity,
                "ip_address": event.ip,
                "model": {
                    "type": event.resource_type,
                    "id": event.resource_id,
                },
                "changes": {
                    "old": event.old_values,
                    "new": event.new_values,
                },
                "metadata": event.metadata,
                "correlation_id": event.correlation_id,
            })
        })
        .collect();
    Ok(serde_json::to_vec_pretty(&rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ArchiveSink, RequestContext};
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingArchive {
        batches: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl ArchiveSink for RecordingArchive {
        fn archive(&self, events: &[AuditEvent]) -> Result<()> {
            if self.fail {
                return Err(Error::Storage("cold storage offline".into()));
            }
            self.batches
                .lock()
                .push(events.iter().map(|e| e.event_type.clone()).collect());
            Ok(())
        }
    }

    fn ledger() -> (Arc<ManualClock>, AuditLedger) {
        let clock = ManualClock::starting_now();
        (clock.clone(), AuditLedger::in_memory(clock))
    }

    fn ctx(ip: &str) -> RequestContext {
        RequestContext::client(ip.parse().unwrap(), "Mozilla/5.0")
    }

    #[test]
    fn test_search_filters_and_paginates() {
        let (clock, ledger) = ledger();
        for i in 0..7 {
            ledger.log(
                AuditEntry::new("login", format!("login {}", i))
                    .with_actor_id("alice")
                    .with_context(&ctx("10.0.0.1")),
            );
            clock.advance(Duration::seconds(1));
        }
        ledger.log(AuditEntry::new("data_deleted", "Deleted invoice 9").with_actor_id("bob"));

        let page = ledger
            .search(&SearchCriteria::new().actor("alice").page(2, 3))
            .unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.items.len(), 3);
        // newest first: page 2 holds logins 3, 2, 1
        assert_eq!(page.items[0].action, "login 3");

        let high = ledger
            .search(&SearchCriteria::new().severity(Severity::High))
            .unwrap();
        assert_eq!(high.total, 1);
        assert_eq!(high.per_page, 50);

        let text = ledger.search(&SearchCriteria::new().text("INVOICE")).unwrap();
        assert_eq!(text.total, 1);

        let by_ip = ledger
            .search(&SearchCriteria::new().ip("10.0.0.1".parse().unwrap()))
            .unwrap();
        assert_eq!(by_ip.total, 7);

        let oldest_first = ledger
            .search(&SearchCriteria::new().actor("alice").order_by(SortField::Timestamp, SortOrder::Asc))
            .unwrap();
        assert_eq!(oldest_first.items[0].action, "login 0");
    }

    #[test]
    fn test_suspicious_activity_thresholds() {
        let (_, ledger) = ledger();
        for _ in 0..4 {
            ledger.log(AuditEntry::new("failed_login", "x").with_context(&ctx("203.0.113.9")));
        }
        for _ in 0..3 {
            ledger.log(AuditEntry::new("failed_login", "x").with_context(&ctx("198.51.100.1")));
        }
        for _ in 0..6 {
            ledger.log(
                AuditEntry::new("permission_granted", "x")
                    .with_actor_id("admin")
                    .with_context(&ctx("10.1.1.1")),
            );
        }

        let flagged = ledger.detect_suspicious_activity(24).unwrap();
        assert_eq!(flagged.len(), 2);
        assert_eq!(flagged[0].actor_id.as_deref(), Some("admin"));
        assert_eq!(flagged[0].high_severity_events, 6);
        assert_eq!(flagged[1].failed_logins, 4);
    }

    #[test]
    fn test_csv_export() {
        let (_, ledger) = ledger();
        ledger.log(
            AuditEntry::new("data_exported", "Exported orders, invoices")
                .with_actor(crate::audit::UserRef::named("u1", "ann@example.com"))
                .with_resource("order", "42")
                .with_context(&ctx("192.0.2.5")),
        );
        ledger.log(AuditEntry::new("login", "System tick"));

        let csv = ledger
            .export(&SearchCriteria::new().order_by(SortField::Timestamp, SortOrder::Asc), ExportFormat::Csv)
            .unwrap();
        let text = String::from_utf8(csv).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Date,Time,User,Event Type,Action,Severity,IP Address,Model");
        assert!(lines[1].contains("ann@example.com,data_exported,Exported orders; invoices,medium,192.0.2.5,order"));
        assert!(lines[2].contains("System,login,System tick,low,,N/A"));
    }

    #[test]
    fn test_json_export_and_format_parse() {
        let (_, ledger) = ledger();
        ledger.log(AuditEntry::new("login", "hello").with_actor_id("u1"));
        let json = ledger
            .export(&SearchCriteria::new(), "JSON".parse().unwrap())
            .unwrap();
        let rows: Vec<serde_json::Value> = serde_json::from_slice(&json).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["event_type"], "login");
        assert!("pdf".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_cleanup_archives_significant_then_deletes() {
        let clock = ManualClock::starting_now();
        let archive = Arc::new(RecordingArchive::default());
        let ledger = AuditLedger::in_memory(clock.clone()).with_archive(archive.clone());

        ledger.log(AuditEntry::new("login", "old low"));
        ledger.log(AuditEntry::new("data_deleted", "old high"));
        clock.advance(Duration::days(100));
        ledger.log(AuditEntry::new("login", "recent"));

        let report = ledger.cleanup(90).unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(report.archived, 1);
        assert!(!report.aborted);
        assert_eq!(archive.batches.lock()[0], vec!["data_deleted".to_string()]);

        let remaining = ledger.search(&SearchCriteria::new()).unwrap();
        let types: Vec<&str> = remaining.items.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"login"));
        assert!(types.contains(&"audit_retention_applied"));
        assert!(!types.contains(&"data_deleted"));
    }

    #[test]
    fn test_cleanup_aborts_when_archive_fails() {
        let clock = ManualClock::starting_now();
        let archive = Arc::new(RecordingArchive {
            fail: true,
            ..RecordingArchive::default()
        });
        let ledger = AuditLedger::in_memory(clock.clone()).with_archive(archive);

        ledger.log_security_incident("old incident", None, &RequestContext::default(), serde_json::json!({}));
        clock.advance(Duration::days(400));

        let report = ledger.cleanup(365).unwrap();
        assert!(report.aborted);
        assert_eq!(report.deleted, 0);
        let kept = ledger
            .search(&SearchCriteria::new().event_type("security_incident"))
            .unwrap();
        assert_eq!(kept.total, 1);
    }

    #[test]
    fn test_statistics() {
        let (_, ledger) = ledger();
        ledger.log(AuditEntry::new("login", "a").with_actor_id("u1"));
        ledger.log(AuditEntry::new("login", "b").with_actor_id("u2"));
        ledger.log(AuditEntry::new("data_deleted", "c").with_actor_id("u1"));

        let stats = ledger.statistics(30).unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.unique_actors, 2);
        assert_eq!(stats.by_severity.get("low"), Some(&2));
        assert_eq!(stats.top_event_types[0], ("login".to_string(), 2));
        assert_eq!(stats.daily_trend.values().sum::<usize>(), 3);
    }
}

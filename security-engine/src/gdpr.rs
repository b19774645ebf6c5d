//! Data-subject rights: consent, export, erasure and rectification
//!
//! Personal data owned by the host application is reached through
//! [`SubjectData`]. Exports and pre-erasure backups are sealed with the
//! secret store before they are kept; the audit trail itself is never
//! erased, it only ages out through ledger retention.

use crate::audit::{AuditEntry, AuditLedger, RequestContext, SearchCriteria};
use crate::clock::Clock;
use crate::config::{GdprConfig, RetentionPolicy};
use crate::crypto;
use crate::error::{Error, Result};
use crate::incidents::{IncidentManager, IncidentType};
use crate::secret_store::SecretCipher;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

const EXPORT_PURPOSE: &str = "data_export";
const BACKUP_PURPOSE: &str = "deletion_backup";
const ACTIVITY_LOG_LIMIT: usize = 1000;

/// Export category holding the subject's consent choices
pub const CONSENTS: &str = "consents";

/// Export category holding the subject's own audit trail
pub const ACTIVITY_LOGS: &str = "activity_logs";

/// Processing purposes and rectifiable fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GdprPolicy {
    /// Purpose -> description shown to the subject
    pub purposes: BTreeMap<String, String>,
    /// Profile fields a subject may correct
    pub rectifiable_fields: Vec<String>,
}

impl Default for GdprPolicy {
    fn default() -> Self {
        let purposes = [
            ("marketing", "Processing data for marketing and promotional purposes"),
            ("analytics", "Processing data for analytics and service improvement"),
            ("third_party", "Sharing data with third-party service providers"),
            ("profiling", "Creating user profiles for personalized experiences"),
            ("newsletters", "Sending newsletters and updates"),
            ("research", "Using data for research and development"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            purposes,
            rectifiable_fields: ["name", "phone", "address", "date_of_birth"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// A subject's latest choice for one purpose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// Data subject
    pub subject: String,
    /// Processing purpose
    pub purpose: String,
    /// Purpose description at the time of the choice
    pub description: String,
    /// Current choice
    pub granted: bool,
    /// Set when granted
    pub granted_at: Option<DateTime<Utc>>,
    /// Set when revoked
    pub revoked_at: Option<DateTime<Utc>>,
    /// Client address the choice came from
    pub ip: Option<IpAddr>,
    /// Caller-supplied detail
    pub metadata: Option<Value>,
}

/// Consent view over every known purpose
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsentSummary {
    /// Processing purpose
    pub purpose: String,
    /// Description
    pub description: String,
    /// `false` when never recorded
    pub granted: bool,
    /// Last grant
    pub granted_at: Option<DateTime<Utc>>,
    /// Last revocation
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Right being exercised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Right of access
    Export,
    /// Right to erasure
    Deletion,
    /// Right to rectification
    Rectification,
}

impl RequestType {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Export => "export",
            RequestType::Deletion => "deletion",
            RequestType::Rectification => "rectification",
        }
    }
}

/// Request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting processing
    Pending,
    /// Picked up
    Processing,
    /// Done
    Completed,
    /// Aborted; `error` holds the reason
    Failed,
}

impl RequestStatus {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

/// What a request covers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestScope {
    /// Categories to export or erase. Everything when unset.
    pub include: Option<Vec<String>>,
    /// Field -> corrected value, for rectification
    pub changes: BTreeMap<String, Value>,
}

impl RequestScope {
    /// Whole record
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the named categories
    pub fn only<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: Some(categories.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Corrections to apply
    pub fn changes(changes: BTreeMap<String, Value>) -> Self {
        Self {
            changes,
            ..Self::default()
        }
    }

    /// Whether `category` is in scope
    pub fn covers(&self, category: &str) -> bool {
        self.include
            .as_ref()
            .map_or(true, |include| include.iter().any(|c| c == category))
    }
}

/// Data-subject request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSubjectRequest {
    /// Identifier
    pub request_id: Uuid,
    /// Data subject
    pub subject: String,
    /// Right exercised
    pub request_type: RequestType,
    /// Lifecycle state
    pub status: RequestStatus,
    /// Coverage
    pub scope: RequestScope,
    /// Filing time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub processed_at: Option<DateTime<Utc>>,
    /// When the sealed export stops being downloadable
    pub expires_at: Option<DateTime<Utc>>,
    /// Sealed export envelope
    pub export: Option<String>,
    /// Requested corrections that were not applied
    pub skipped_fields: Vec<String>,
    /// Failure reason
    pub error: Option<String>,
    /// Filing client address
    pub ip: Option<IpAddr>,
    /// Filing client user agent
    pub user_agent: Option<String>,
}

/// Sealed copy of a subject's data taken before erasure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionBackup {
    /// Identifier
    pub backup_id: Uuid,
    /// Erased subject
    pub subject: String,
    /// Request that triggered the erasure
    pub request_id: Uuid,
    /// Sealing time
    pub created_at: DateTime<Utc>,
    /// Encryption envelope
    pub envelope: String,
}

/// Outcome of [`GdprCompliance::apply_retention`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionOutcome {
    /// Expired export requests removed
    pub expired_exports: usize,
    /// Pre-erasure backups removed
    pub expired_backups: usize,
}

/// Per-purpose consent counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsentStatistics {
    /// Currently granted
    pub granted: usize,
    /// Currently revoked
    pub revoked: usize,
    /// Share granted, percent with two decimals
    pub percentage: Decimal,
}

/// Data-protection overview
#[derive(Debug, Clone, Serialize)]
pub struct PrivacyReport {
    /// Report time
    pub generated_at: DateTime<Utc>,
    /// Distinct subjects granting at least one purpose
    pub subjects_with_consent: usize,
    /// Requests not yet picked up
    pub pending_requests: usize,
    /// Exports delivered
    pub completed_exports: usize,
    /// Erasure requests of any status
    pub deletion_requests: usize,
    /// Requests that failed
    pub failed_requests: usize,
    /// Known purpose -> counts
    pub consent_statistics: BTreeMap<String, ConsentStatistics>,
    /// Data-breach incidents on record
    pub data_breach_count: usize,
}

/// Host-owned personal data
pub trait SubjectData: Send + Sync {
    /// Personal data held for `subject`, keyed by category
    fn collect(&self, subject: &str) -> Result<BTreeMap<String, Value>>;

    /// Replace personal data with anonymous placeholders
    fn anonymize(&self, subject: &str) -> Result<()>;

    /// Overwrite one field, returning the previous value
    fn rectify(&self, subject: &str, field: &str, value: Value) -> Result<Value>;
}

/// In-memory subject profiles, one flat field map per subject
#[derive(Debug, Default)]
pub struct MemorySubjectData {
    profiles: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemorySubjectData {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a profile
    pub fn insert(&self, subject: impl Into<String>, fields: BTreeMap<String, Value>) {
        self.profiles.write().insert(subject.into(), fields);
    }

    /// Current profile
    pub fn profile(&self, subject: &str) -> Option<BTreeMap<String, Value>> {
        self.profiles.read().get(subject).cloned()
    }
}

impl SubjectData for MemorySubjectData {
    fn collect(&self, subject: &str) -> Result<BTreeMap<String, Value>> {
        let mut data = BTreeMap::new();
        if let Some(profile) = self.profiles.read().get(subject) {
            data.insert("personal_information".to_string(), json!(profile));
        }
        Ok(data)
    }

    fn anonymize(&self, subject: &str) -> Result<()> {
        let mut profiles = self.profiles.write();
        let Some(profile) = profiles.get_mut(subject) else {
            return Ok(());
        };
        for (field, value) in profile.iter_mut() {
            *value = match field.as_str() {
                "name" => json!(format!("Deleted User {}", crypto::random_alphanumeric(8))),
                "email" => json!(format!(
                    "deleted_{}@example.invalid",
                    crypto::random_alphanumeric(16).to_ascii_lowercase()
                )),
                _ => Value::Null,
            };
        }
        Ok(())
    }

    fn rectify(&self, subject: &str, field: &str, value: Value) -> Result<Value> {
        let mut profiles = self.profiles.write();
        let profile = profiles
            .get_mut(subject)
            .ok_or_else(|| Error::NotFound(format!("Subject not found: {}", subject)))?;
        Ok(profile.insert(field.to_string(), value).unwrap_or(Value::Null))
    }
}

/// Consent, request and backup persistence
pub trait GdprStore: Send + Sync {
    /// Insert or replace the choice for `(subject, purpose)`
    fn upsert_consent(&self, consent: ConsentRecord) -> Result<()>;
    /// Choices of one subject, or of everyone
    fn consents(&self, subject: Option<&str>) -> Result<Vec<ConsentRecord>>;
    /// Drop a subject's choices. Returns the number removed.
    fn delete_consents(&self, subject: &str) -> Result<usize>;

    /// Insert. `Conflict` if the id exists.
    fn insert_request(&self, request: DataSubjectRequest) -> Result<()>;
    /// Replace an existing request
    fn update_request(&self, request: DataSubjectRequest) -> Result<()>;
    /// Request by id
    fn get_request(&self, request_id: Uuid) -> Result<Option<DataSubjectRequest>>;
    /// All requests
    fn list_requests(&self) -> Result<Vec<DataSubjectRequest>>;
    /// Delete by id. Returns `true` when removed.
    fn remove_request(&self, request_id: Uuid) -> Result<bool>;

    /// Keep a sealed backup
    fn insert_backup(&self, backup: DeletionBackup) -> Result<()>;
    /// All backups
    fn list_backups(&self) -> Result<Vec<DeletionBackup>>;
    /// Delete by id. Returns `true` when removed.
    fn remove_backup(&self, backup_id: Uuid) -> Result<bool>;
}

/// In-memory GDPR store
#[derive(Debug, Default)]
pub struct MemoryGdprStore {
    consents: RwLock<BTreeMap<(String, String), ConsentRecord>>,
    requests: RwLock<BTreeMap<Uuid, DataSubjectRequest>>,
    backups: RwLock<BTreeMap<Uuid, DeletionBackup>>,
}

impl MemoryGdprStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl GdprStore for MemoryGdprStore {
    fn upsert_consent(&self, consent: ConsentRecord) -> Result<()> {
        self.consents
            .write()
            .insert((consent.subject.clone(), consent.purpose.clone()), consent);
        Ok(())
    }

    fn consents(&self, subject: Option<&str>) -> Result<Vec<ConsentRecord>> {
        Ok(self
            .consents
            .read()
            .values()
            .filter(|c| subject.map_or(true, |s| c.subject == s))
            .cloned()
            .collect())
    }

    fn delete_consents(&self, subject: &str) -> Result<usize> {
        let mut consents = self.consents.write();
        let before = consents.len();
        consents.retain(|(s, _), _| s != subject);
        Ok(before - consents.len())
    }

    fn insert_request(&self, request: DataSubjectRequest) -> Result<()> {
        let mut requests = self.requests.write();
        if requests.contains_key(&request.request_id) {
            return Err(Error::Conflict(format!("Request already exists: {}", request.request_id)));
        }
        requests.insert(request.request_id, request);
        Ok(())
    }

    fn update_request(&self, request: DataSubjectRequest) -> Result<()> {
        match self.requests.write().get_mut(&request.request_id) {
            Some(existing) => {
                *existing = request;
                Ok(())
            }
            None => Err(Error::NotFound(format!("Request not found: {}", request.request_id))),
        }
    }

    fn get_request(&self, request_id: Uuid) -> Result<Option<DataSubjectRequest>> {
        Ok(self.requests.read().get(&request_id).cloned())
    }

    fn list_requests(&self) -> Result<Vec<DataSubjectRequest>> {
        Ok(self.requests.read().values().cloned().collect())
    }

    fn remove_request(&self, request_id: Uuid) -> Result<bool> {
        Ok(self.requests.write().remove(&request_id).is_some())
    }

    fn insert_backup(&self, backup: DeletionBackup) -> Result<()> {
        self.backups.write().insert(backup.backup_id, backup);
        Ok(())
    }

    fn list_backups(&self) -> Result<Vec<DeletionBackup>> {
        Ok(self.backups.read().values().cloned().collect())
    }

    fn remove_backup(&self, backup_id: Uuid) -> Result<bool> {
        Ok(self.backups.write().remove(&backup_id).is_some())
    }
}

/// Data-subject rights service
pub struct GdprCompliance {
    store: Arc<dyn GdprStore>,
    subjects: Arc<dyn SubjectData>,
    cipher: Arc<dyn SecretCipher>,
    policy: GdprPolicy,
    config: GdprConfig,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLedger>>,
    incidents: Option<Arc<IncidentManager>>,
    // one request is claimed by one worker
    claim_lock: Mutex<()>,
}

impl GdprCompliance {
    /// Create a service
    pub fn new(
        store: Arc<dyn GdprStore>,
        subjects: Arc<dyn SubjectData>,
        cipher: Arc<dyn SecretCipher>,
        config: GdprConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            subjects,
            cipher,
            policy: GdprPolicy::default(),
            config,
            clock,
            audit: None,
            incidents: None,
            claim_lock: Mutex::new(()),
        }
    }

    /// Replace the purpose and field tables
    pub fn with_policy(mut self, policy: GdprPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Emit events to, and read activity from, an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Count data-breach incidents in privacy reports
    pub fn with_incidents(mut self, incidents: Arc<IncidentManager>) -> Self {
        self.incidents = Some(incidents);
        self
    }

    fn audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            audit.log(entry);
        }
    }

    /// Record a subject's choice for a purpose, replacing any earlier one
    pub fn record_consent(
        &self,
        subject: &str,
        purpose: &str,
        granted: bool,
        context: &RequestContext,
        metadata: Option<Value>,
    ) -> Result<ConsentRecord> {
        if subject.is_empty() || purpose.is_empty() {
            return Err(Error::Validation("Subject and purpose are required".into()));
        }
        let now = self.clock.now();
        let consent = ConsentRecord {
            subject: subject.to_string(),
            purpose: purpose.to_string(),
            description: self
                .policy
                .purposes
                .get(purpose)
                .cloned()
                .unwrap_or_else(|| purpose.to_string()),
            granted,
            granted_at: granted.then_some(now),
            revoked_at: (!granted).then_some(now),
            ip: context.ip,
            metadata,
        };
        self.store.upsert_consent(consent.clone())?;

        let verb = if granted { "granted" } else { "revoked" };
        info!(subject = %subject, purpose = %purpose, granted, "Consent recorded");
        self.audit(
            AuditEntry::new(
                format!("consent_{}", verb),
                format!("User {} consent for {}", verb, purpose),
            )
            .with_actor_id(subject)
            .with_resource("consent", purpose)
            .with_context(context)
            .with_tag("gdpr")
            .with_metadata(json!({ "purpose": purpose })),
        );
        Ok(consent)
    }

    /// Whether the subject's latest choice for `purpose` is a grant
    pub fn has_consent(&self, subject: &str, purpose: &str) -> Result<bool> {
        Ok(self
            .store
            .consents(Some(subject))?
            .iter()
            .any(|c| c.purpose == purpose && c.granted))
    }

    /// Every known purpose with the subject's choice, unrecorded as not granted
    pub fn user_consents(&self, subject: &str) -> Result<Vec<ConsentSummary>> {
        let recorded: HashMap<String, ConsentRecord> = self
            .store
            .consents(Some(subject))?
            .into_iter()
            .map(|c| (c.purpose.clone(), c))
            .collect();

        Ok(self
            .policy
            .purposes
            .iter()
            .map(|(purpose, description)| {
                let consent = recorded.get(purpose);
                ConsentSummary {
                    purpose: purpose.clone(),
                    description: description.clone(),
                    granted: consent.is_some_and(|c| c.granted),
                    granted_at: consent.and_then(|c| c.granted_at),
                    revoked_at: consent.and_then(|c| c.revoked_at),
                }
            })
            .collect())
    }

    /// File a request. It stays `pending` until [`GdprCompliance::process_request`].
    pub fn create_request(
        &self,
        subject: &str,
        request_type: RequestType,
        scope: RequestScope,
        context: &RequestContext,
    ) -> Result<DataSubjectRequest> {
        if subject.is_empty() {
            return Err(Error::Validation("Subject is required".into()));
        }
        if request_type == RequestType::Rectification && scope.changes.is_empty() {
            return Err(Error::Validation("Rectification needs at least one change".into()));
        }

        let request = DataSubjectRequest {
            request_id: Uuid::now_v7(),
            subject: subject.to_string(),
            request_type,
            status: RequestStatus::Pending,
            scope,
            created_at: self.clock.now(),
            processed_at: None,
            expires_at: None,
            export: None,
            skipped_fields: Vec::new(),
            error: None,
            ip: context.ip,
            user_agent: context.user_agent.clone(),
        };
        self.store.insert_request(request.clone())?;

        info!(subject = %subject, request_id = %request.request_id, kind = request_type.as_str(), "Data subject request filed");
        self.audit(
            AuditEntry::new("gdpr_request", format!("User requested data {}", request_type.as_str()))
                .with_actor_id(subject)
                .with_resource("data_subject_request", request.request_id.to_string())
                .with_context(context)
                .with_tag("gdpr")
                .with_metadata(json!({ "request_type": request_type })),
        );
        Ok(request)
    }

    /// Request by id
    pub fn get_request(&self, request_id: Uuid) -> Result<DataSubjectRequest> {
        self.store
            .get_request(request_id)?
            .ok_or_else(|| Error::NotFound(format!("Request not found: {}", request_id)))
    }

    /// Requests, optionally for one subject, oldest first
    pub fn list_requests(&self, subject: Option<&str>) -> Result<Vec<DataSubjectRequest>> {
        let mut requests: Vec<DataSubjectRequest> = self
            .store
            .list_requests()?
            .into_iter()
            .filter(|r| subject.map_or(true, |s| r.subject == s))
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    /// Carry out a pending request.
    ///
    /// Any failure marks the request `failed` with the reason and is
    /// returned to the caller.
    pub fn process_request(&self, request_id: Uuid) -> Result<DataSubjectRequest> {
        let mut request = {
            let _guard = self.claim_lock.lock();
            let mut request = self.get_request(request_id)?;
            if request.status != RequestStatus::Pending {
                return Err(Error::Conflict(format!(
                    "Request {} is {}",
                    request_id,
                    request.status.as_str()
                )));
            }
            request.status = RequestStatus::Processing;
            self.store.update_request(request.clone())?;
            request
        };

        let outcome = match request.request_type {
            RequestType::Export => self.run_export(&mut request),
            RequestType::Deletion => self.run_deletion(&request),
            RequestType::Rectification => self.run_rectification(&mut request),
        };

        match outcome {
            Ok(()) => {
                request.status = RequestStatus::Completed;
                request.processed_at = Some(self.clock.now());
                self.store.update_request(request.clone())?;
                info!(request_id = %request_id, kind = request.request_type.as_str(), "Data subject request completed");
                Ok(request)
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Data subject request failed");
                request.status = RequestStatus::Failed;
                request.error = Some(e.to_string());
                if let Err(store_err) = self.store.update_request(request) {
                    error!(request_id = %request_id, error = %store_err, "Failed to record request failure");
                }
                Err(e)
            }
        }
    }

    fn activity_logs(&self, subject: &str) -> Result<Vec<Value>> {
        let Some(audit) = &self.audit else {
            return Ok(Vec::new());
        };
        let page = audit.search(&SearchCriteria::new().actor(subject).page(1, ACTIVITY_LOG_LIMIT))?;
        Ok(page
            .items
            .iter()
            .map(|event| {
                json!({
                    "event": event.event_type,
                    "action": event.action,
                    "timestamp": event.timestamp,
                    "ip_address": event.ip,
                })
            })
            .collect())
    }

    fn collect(&self, subject: &str, scope: &RequestScope) -> Result<BTreeMap<String, Value>> {
        let mut data = self.subjects.collect(subject)?;
        data.insert(CONSENTS.to_string(), serde_json::to_value(self.user_consents(subject)?)?);
        data.insert(ACTIVITY_LOGS.to_string(), Value::Array(self.activity_logs(subject)?));
        data.retain(|category, _| scope.covers(category));
        Ok(data)
    }

    fn seal(&self, data: &BTreeMap<String, Value>, purpose: &str) -> Result<String> {
        let json = Zeroizing::new(serde_json::to_string_pretty(data)?);
        self.cipher.encrypt_string(&json, purpose)
    }

    fn run_export(&self, request: &mut DataSubjectRequest) -> Result<()> {
        let data = self.collect(&request.subject, &request.scope)?;
        request.export = Some(self.seal(&data, EXPORT_PURPOSE)?);
        request.expires_at =
            Some(self.clock.now() + Duration::days(self.config.retention.export_files_days));

        self.audit(
            AuditEntry::new("data_exported", "User data export completed")
                .with_actor_id(request.subject.clone())
                .with_resource("data_subject_request", request.request_id.to_string())
                .with_tag("gdpr")
                .with_metadata(json!({ "categories": data.keys().collect::<Vec<_>>() })),
        );
        Ok(())
    }

    fn run_deletion(&self, request: &DataSubjectRequest) -> Result<()> {
        let subject = request.subject.as_str();
        let data = self.collect(subject, &RequestScope::all())?;
        self.store.insert_backup(DeletionBackup {
            backup_id: Uuid::now_v7(),
            subject: subject.to_string(),
            request_id: request.request_id,
            created_at: self.clock.now(),
            envelope: self.seal(&data, BACKUP_PURPOSE)?,
        })?;

        self.subjects.anonymize(subject)?;
        let consents_removed = if request.scope.covers(CONSENTS) {
            self.store.delete_consents(subject)?
        } else {
            0
        };

        warn!(subject = %subject, request_id = %request.request_id, "Subject data erased");
        self.audit(
            AuditEntry::new("data_deleted", "User data deletion completed")
                .with_actor_id(subject)
                .with_resource("data_subject_request", request.request_id.to_string())
                .with_tag("gdpr")
                .with_metadata(json!({
                    "scope": request.scope.include,
                    "consents_removed": consents_removed,
                })),
        );
        Ok(())
    }

    fn run_rectification(&self, request: &mut DataSubjectRequest) -> Result<()> {
        let subject = request.subject.clone();
        let mut skipped = Vec::new();
        for (field, value) in &request.scope.changes {
            if !self.policy.rectifiable_fields.iter().any(|f| f == field) {
                warn!(subject = %subject, field = %field, "Field is not rectifiable");
                skipped.push(field.clone());
                continue;
            }
            let old = self.subjects.rectify(&subject, field, value.clone())?;
            self.audit(
                AuditEntry::new("data_rectified", format!("User data field {} rectified", field))
                    .with_actor_id(subject.clone())
                    .with_resource("data_subject_request", request.request_id.to_string())
                    .with_tag("gdpr")
                    .with_old_values(json!({ field.as_str(): old }))
                    .with_new_values(json!({ field.as_str(): value })),
            );
        }
        request.skipped_fields = skipped;
        Ok(())
    }

    /// Open a completed export for its subject.
    ///
    /// Another subject's export is `PermissionDenied`; an expired one is
    /// `NotFound`.
    pub fn download_export(&self, request_id: Uuid, subject: &str) -> Result<Zeroizing<String>> {
        let request = self.get_request(request_id)?;
        if request.subject != subject {
            warn!(request_id = %request_id, requested_by = %subject, "Export requested by another subject");
            return Err(Error::PermissionDenied("Export belongs to another subject".into()));
        }
        let envelope = match (&request.status, &request.export) {
            (RequestStatus::Completed, Some(envelope)) => envelope,
            _ => return Err(Error::NotFound(format!("No export ready for request {}", request_id))),
        };
        if request.expires_at.is_some_and(|at| at <= self.clock.now()) {
            return Err(Error::NotFound(format!("Export for request {} has expired", request_id)));
        }
        self.cipher.decrypt_string(envelope)
    }

    /// Retention windows in force
    pub fn retention_policy(&self) -> &RetentionPolicy {
        &self.config.retention
    }

    /// Drop expired exports and pre-erasure backups past their window
    pub fn apply_retention(&self) -> Result<RetentionOutcome> {
        let now = self.clock.now();
        let mut outcome = RetentionOutcome::default();

        for request in self.store.list_requests()? {
            let expired = request.request_type == RequestType::Export
                && request.expires_at.is_some_and(|at| at < now);
            if expired && self.store.remove_request(request.request_id)? {
                outcome.expired_exports += 1;
            }
        }

        let cutoff = now - Duration::days(self.config.retention.backup_files_days);
        for backup in self.store.list_backups()? {
            if backup.created_at < cutoff && self.store.remove_backup(backup.backup_id)? {
                outcome.expired_backups += 1;
            }
        }

        info!(
            expired_exports = outcome.expired_exports,
            expired_backups = outcome.expired_backups,
            "Data retention applied"
        );
        if outcome != RetentionOutcome::default() {
            self.audit(
                AuditEntry::new("gdpr_retention_applied", "Applied data retention policy")
                    .with_resource("gdpr", "retention")
                    .with_tag("gdpr")
                    .with_metadata(json!(outcome)),
            );
        }
        Ok(outcome)
    }

    /// Consent and request overview
    pub fn privacy_report(&self) -> Result<PrivacyReport> {
        let consents = self.store.consents(None)?;
        let requests = self.store.list_requests()?;

        let subjects_with_consent = consents
            .iter()
            .filter(|c| c.granted)
            .map(|c| c.subject.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        let consent_statistics = self
            .policy
            .purposes
            .keys()
            .map(|purpose| {
                let (granted, total) = consents
                    .iter()
                    .filter(|c| &c.purpose == purpose)
                    .fold((0usize, 0usize), |(g, t), c| (g + usize::from(c.granted), t + 1));
                let percentage = if total == 0 {
                    Decimal::ZERO
                } else {
                    (Decimal::from(granted) * Decimal::ONE_HUNDRED / Decimal::from(total)).round_dp(2)
                };
                (
                    purpose.clone(),
                    ConsentStatistics {
                        granted,
                        revoked: total - granted,
                        percentage,
                    },
                )
            })
            .collect();

        let data_breach_count = match &self.incidents {
            Some(incidents) => incidents
                .list(None)?
                .iter()
                .filter(|i| i.incident_type == IncidentType::DataBreach)
                .count(),
            None => 0,
        };

        let mut report = PrivacyReport {
            generated_at: self.clock.now(),
            subjects_with_consent,
            pending_requests: 0,
            completed_exports: 0,
            deletion_requests: 0,
            failed_requests: 0,
            consent_statistics,
            data_breach_count,
        };
        for request in &requests {
            match request.status {
                RequestStatus::Pending => report.pending_requests += 1,
                RequestStatus::Failed => report.failed_requests += 1,
                RequestStatus::Completed if request.request_type == RequestType::Export => {
                    report.completed_exports += 1
                }
                _ => {}
            }
            if request.request_type == RequestType::Deletion {
                report.deletion_requests += 1;
            }
        }
        Ok(report)
    }
}

impl fmt::Debug for GdprCompliance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GdprCompliance")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::config::KeyConfig;
    use crate::crypto::MasterKey;
    use crate::incidents::{MemoryIncidentStore, NewIncident};
    use crate::keys::{KeyManager, MemoryKeyStore};
    use crate::audit::Severity;
    use crate::secret_store::SecretStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        subjects: Arc<MemorySubjectData>,
        audit: Arc<AuditLedger>,
        gdpr: GdprCompliance,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let master = MasterKey::from_secret("gdpr-compliance-master-0123456789abcdef").unwrap();
        let keys = Arc::new(KeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            master,
            KeyConfig::default(),
            clock.clone(),
        ));
        let store = Arc::new(SecretStore::new(keys, Arc::new(MemoryCache::with_clock(clock.clone()))));
        let audit = Arc::new(AuditLedger::in_memory(clock.clone()));
        let subjects = Arc::new(MemorySubjectData::new());
        subjects.insert(
            "u1",
            BTreeMap::from([
                ("name".to_string(), json!("Ann Example")),
                ("email".to_string(), json!("ann@example.com")),
                ("phone".to_string(), json!("+15550100")),
            ]),
        );
        let gdpr = GdprCompliance::new(
            Arc::new(MemoryGdprStore::new()),
            subjects.clone(),
            store,
            GdprConfig::default(),
            clock.clone(),
        )
        .with_audit(audit.clone());
        Fixture {
            clock,
            subjects,
            audit,
            gdpr,
        }
    }

    fn events(audit: &AuditLedger, event_type: &str) -> usize {
        audit
            .search(&SearchCriteria::new().event_type(event_type))
            .unwrap()
            .total
    }

    #[test]
    fn test_consent_latest_choice_wins() {
        let f = fixture();
        let context = RequestContext::client("10.1.2.3".parse().unwrap(), "browser");
        assert!(!f.gdpr.has_consent("u1", "marketing").unwrap());

        f.gdpr.record_consent("u1", "marketing", true, &context, None).unwrap();
        assert!(f.gdpr.has_consent("u1", "marketing").unwrap());

        f.clock.advance(Duration::hours(1));
        let revoked = f.gdpr.record_consent("u1", "marketing", false, &context, None).unwrap();
        assert!(!f.gdpr.has_consent("u1", "marketing").unwrap());
        assert!(revoked.granted_at.is_none());
        assert_eq!(revoked.revoked_at, Some(f.clock.now()));

        let summary = f.gdpr.user_consents("u1").unwrap();
        assert_eq!(summary.len(), 6);
        let marketing = summary.iter().find(|c| c.purpose == "marketing").unwrap();
        assert!(!marketing.granted);
        assert!(marketing.revoked_at.is_some());
        assert_eq!(events(&f.audit, "consent_granted"), 1);
        assert_eq!(events(&f.audit, "consent_revoked"), 1);
    }

    #[test]
    fn test_export_is_sealed_and_scoped() {
        let f = fixture();
        let context = RequestContext::default();
        f.gdpr.record_consent("u1", "analytics", true, &context, None).unwrap();

        let request = f
            .gdpr
            .create_request("u1", RequestType::Export, RequestScope::only(["personal_information", CONSENTS]), &context)
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending);

        let done = f.gdpr.process_request(request.request_id).unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        let envelope = done.export.as_deref().unwrap();
        assert!(!envelope.contains("ann@example.com"));
        assert_eq!(done.expires_at, Some(f.clock.now() + Duration::days(7)));

        let json = f.gdpr.download_export(request.request_id, "u1").unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(data.keys().collect::<Vec<_>>(), ["consents", "personal_information"]);
        assert_eq!(data["personal_information"]["email"], "ann@example.com");

        assert!(matches!(
            f.gdpr.download_export(request.request_id, "u2"),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(f.gdpr.process_request(request.request_id), Err(Error::Conflict(_))));
        assert_eq!(events(&f.audit, "gdpr_request"), 1);
        assert_eq!(events(&f.audit, "data_exported"), 1);
    }

    #[test]
    fn test_export_includes_activity_trail() {
        let f = fixture();
        f.audit.log(AuditEntry::new("login", "User logged in").with_actor_id("u1"));
        f.audit.log(AuditEntry::new("login", "Someone else").with_actor_id("u2"));

        let request = f
            .gdpr
            .create_request("u1", RequestType::Export, RequestScope::only([ACTIVITY_LOGS]), &RequestContext::default())
            .unwrap();
        f.gdpr.process_request(request.request_id).unwrap();

        let json = f.gdpr.download_export(request.request_id, "u1").unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&json).unwrap();
        let trail = data[ACTIVITY_LOGS].as_array().unwrap();
        // the login plus the request filing itself
        assert_eq!(trail.len(), 2);
        assert!(trail.iter().all(|e| e["action"] != "Someone else"));
    }

    #[test]
    fn test_deletion_backs_up_then_anonymizes() {
        let f = fixture();
        let context = RequestContext::default();
        f.gdpr.record_consent("u1", "marketing", true, &context, None).unwrap();

        let request = f
            .gdpr
            .create_request("u1", RequestType::Deletion, RequestScope::all(), &context)
            .unwrap();
        f.gdpr.process_request(request.request_id).unwrap();

        let profile = f.subjects.profile("u1").unwrap();
        assert!(profile["name"].as_str().unwrap().starts_with("Deleted User "));
        assert!(profile["email"].as_str().unwrap().ends_with("@example.invalid"));
        assert_eq!(profile["phone"], Value::Null);
        assert!(!f.gdpr.has_consent("u1", "marketing").unwrap());

        let backups = f.gdpr.store.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert!(!backups[0].envelope.contains("ann@example.com"));
        let restored = f.gdpr.cipher.decrypt_string(&backups[0].envelope).unwrap();
        assert!(restored.contains("ann@example.com"));
        assert_eq!(events(&f.audit, "data_deleted"), 1);
    }

    #[test]
    fn test_rectification_skips_protected_fields() {
        let f = fixture();
        let changes = BTreeMap::from([
            ("phone".to_string(), json!("+15550199")),
            ("email".to_string(), json!("mallory@example.com")),
        ]);
        let request = f
            .gdpr
            .create_request("u1", RequestType::Rectification, RequestScope::changes(changes), &RequestContext::default())
            .unwrap();
        let done = f.gdpr.process_request(request.request_id).unwrap();

        assert_eq!(done.skipped_fields, vec!["email".to_string()]);
        let profile = f.subjects.profile("u1").unwrap();
        assert_eq!(profile["phone"], "+15550199");
        assert_eq!(profile["email"], "ann@example.com");

        let rectified = f
            .audit
            .search(&SearchCriteria::new().event_type("data_rectified"))
            .unwrap();
        assert_eq!(rectified.total, 1);
        assert_eq!(rectified.items[0].old_values.as_ref().unwrap()["phone"], "+15550100");
    }

    #[test]
    fn test_failed_request_records_reason() {
        let f = fixture();
        let changes = BTreeMap::from([("name".to_string(), json!("Nobody"))]);
        let request = f
            .gdpr
            .create_request("ghost", RequestType::Rectification, RequestScope::changes(changes), &RequestContext::default())
            .unwrap();

        assert!(matches!(f.gdpr.process_request(request.request_id), Err(Error::NotFound(_))));
        let failed = f.gdpr.get_request(request.request_id).unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert!(failed.error.unwrap().contains("ghost"));

        assert!(matches!(
            f.gdpr.create_request("u1", RequestType::Rectification, RequestScope::all(), &RequestContext::default()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_retention_drops_expired_exports_and_backups() {
        let f = fixture();
        let context = RequestContext::default();
        let export = f.gdpr.create_request("u1", RequestType::Export, RequestScope::all(), &context).unwrap();
        f.gdpr.process_request(export.request_id).unwrap();
        let deletion = f.gdpr.create_request("u1", RequestType::Deletion, RequestScope::all(), &context).unwrap();
        f.gdpr.process_request(deletion.request_id).unwrap();

        assert_eq!(f.gdpr.apply_retention().unwrap(), RetentionOutcome::default());

        f.clock.advance(Duration::days(8));
        assert!(matches!(f.gdpr.download_export(export.request_id, "u1"), Err(Error::NotFound(_))));
        let outcome = f.gdpr.apply_retention().unwrap();
        assert_eq!(outcome.expired_exports, 1);
        assert_eq!(outcome.expired_backups, 0);
        assert!(matches!(f.gdpr.get_request(export.request_id), Err(Error::NotFound(_))));

        f.clock.advance(Duration::days(90));
        assert_eq!(f.gdpr.apply_retention().unwrap().expired_backups, 1);
        assert_eq!(f.gdpr.retention_policy().backup_files_days, 90);
    }

    #[test]
    fn test_privacy_report() {
        let f = fixture();
        let context = RequestContext::default();
        let incidents = Arc::new(IncidentManager::new(Arc::new(MemoryIncidentStore::new()), f.clock.clone()));
        incidents
            .create_incident(
                NewIncident::new(IncidentType::DataBreach, Severity::High, "Leaked export"),
                None,
                &context,
            )
            .unwrap();
        let gdpr = f.gdpr.with_incidents(incidents);

        gdpr.record_consent("u1", "marketing", true, &context, None).unwrap();
        gdpr.record_consent("u2", "marketing", false, &context, None).unwrap();
        gdpr.record_consent("u3", "marketing", true, &context, None).unwrap();
        gdpr.create_request("u1", RequestType::Deletion, RequestScope::all(), &context).unwrap();

        let report = gdpr.privacy_report().unwrap();
        assert_eq!(report.subjects_with_consent, 2);
        assert_eq!(report.pending_requests, 1);
        assert_eq!(report.deletion_requests, 1);
        assert_eq!(report.completed_exports, 0);
        assert_eq!(report.data_breach_count, 1);
        let marketing = &report.consent_statistics["marketing"];
        assert_eq!((marketing.granted, marketing.revoked), (2, 1));
        assert_eq!(marketing.percentage, Decimal::new(6667, 2));
        assert_eq!(report.consent_statistics["research"], ConsentStatistics::default());
    }
}

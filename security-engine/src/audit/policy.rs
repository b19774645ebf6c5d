//! Audit classification tables
//!
//! Severity, category and risk tables plus the sensitive-field denylist.
//! Built once and injected into the ledger; [`AuditPolicy::default`] carries
//! the stock tables.

use super::{EventCategory, RiskLevel, Severity};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Marker written in place of redacted values
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Immutable audit classification policy
#[derive(Debug, Clone)]
pub struct AuditPolicy {
    /// Event type to severity. Unlisted types are `low`.
    pub severities: HashMap<String, Severity>,

    /// Event type to classification bucket
    pub categories: HashMap<String, EventCategory>,

    /// Event type to risk level. Unlisted types are `low`.
    pub risk_levels: HashMap<String, RiskLevel>,

    /// Lowercase field names whose values are never persisted
    pub sensitive_fields: HashSet<String>,

    /// Failed logins per (actor, ip) before a group is suspicious
    pub failed_login_threshold: usize,

    /// High/critical events per (actor, ip) before a group is suspicious
    pub high_severity_threshold: usize,
}

fn table<T: Copy>(entries: &[(&str, T)]) -> HashMap<String, T> {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

impl Default for AuditPolicy {
    fn default() -> Self {
        use EventCategory::*;

        let severities = table(&[
            ("login", Severity::Low),
            ("logout", Severity::Low),
            ("failed_login", Severity::Medium),
            ("password_changed", Severity::Medium),
            ("mfa_enabled", Severity::Low),
            ("mfa_disabled", Severity::Medium),
            ("mfa_failed", Severity::Medium),
            ("mfa_locked", Severity::High),
            ("role_assigned", Severity::Medium),
            ("role_revoked", Severity::Medium),
            ("permission_granted", Severity::High),
            ("permission_revoked", Severity::High),
            ("data_exported", Severity::Medium),
            ("data_deleted", Severity::High),
            ("security_incident", Severity::Critical),
            ("access_denied", Severity::Medium),
            ("user_deleted", Severity::High),
            ("payment_processed", Severity::Medium),
            ("refund_issued", Severity::Medium),
            ("key_rotated", Severity::Medium),
            ("key_revoked", Severity::High),
            ("key_purged", Severity::High),
            ("credential_rotated", Severity::Medium),
            ("credential_fallback_used", Severity::High),
            ("jwt_blacklisted_token_used", Severity::High),
            ("jwt_replay_limit_exceeded", Severity::High),
            ("jwt_ip_mismatch", Severity::Medium),
            ("jwt_subject_revoked", Severity::Medium),
            ("api_key_revoked", Severity::Medium),
            ("pci_violation", Severity::High),
            ("incident_escalated", Severity::High),
            ("incident_created", Severity::Medium),
            ("revoked_key_decrypt", Severity::High),
            ("jwt_all_tokens_revoked", Severity::Medium),
        ]);

        let categories = table(&[
            ("login", Authentication),
            ("logout", Authentication),
            ("failed_login", Authentication),
            ("password_changed", Authentication),
            ("mfa_enabled", Authentication),
            ("mfa_disabled", Authentication),
            ("mfa_verified", Authentication),
            ("mfa_failed", Authentication),
            ("mfa_locked", Authentication),
            ("jwt_validation_failed", Authentication),
            ("jwt_blacklisted_token_used", Authentication),
            ("jwt_replay_limit_exceeded", Authentication),
            ("jwt_ip_mismatch", Authentication),
            ("jwt_user_agent_change", Authentication),
            ("jwt_subject_revoked", Authentication),
            ("jwt_subject_reinstated", Authentication),
            ("jwt_tokens_generated", Authentication),
            ("jwt_token_blacklisted", Authentication),
            ("jwt_all_tokens_revoked", Authentication),
            ("role_assigned", Authorization),
            ("role_revoked", Authorization),
            ("permission_granted", Authorization),
            ("permission_revoked", Authorization),
            ("access_denied", Authorization),
            ("privilege_escalation", Authorization),
            ("unauthorized_access", Authorization),
            ("data_viewed", DataAccess),
            ("data_exported", DataAccess),
            ("sensitive_data_accessed", DataAccess),
            ("data_created", DataModification),
            ("data_updated", DataModification),
            ("data_deleted", DataModification),
            ("user_deleted", DataModification),
            ("security_incident", SystemSecurity),
            ("suspicious_activity", SystemSecurity),
            ("file_upload_blocked", SystemSecurity),
            ("key_generated", SystemSecurity),
            ("key_rotated", SystemSecurity),
            ("key_revoked", SystemSecurity),
            ("key_purged", SystemSecurity),
            ("credential_stored", SystemSecurity),
            ("credential_rotated", SystemSecurity),
            ("credential_fallback_used", SystemSecurity),
            ("api_key_created", SystemSecurity),
            ("api_key_revoked", SystemSecurity),
            ("incident_created", SystemSecurity),
            ("incident_status_changed", SystemSecurity),
            ("incident_escalated", SystemSecurity),
            ("incident_resolved", SystemSecurity),
            ("revoked_key_decrypt", SystemSecurity),
            ("pci_violation", Compliance),
            ("payment_data_stored", Compliance),
            ("gdpr_request", Compliance),
            ("consent_granted", Compliance),
            ("consent_revoked", Compliance),
            ("data_rectified", Compliance),
            ("gdpr_retention_applied", Compliance),
            ("audit_trail_exported", Compliance),
            ("audit_retention_applied", Compliance),
        ]);

        let risk_levels = table(&[
            ("security_incident", RiskLevel::Critical),
            ("data_breach", RiskLevel::Critical),
            ("unauthorized_access", RiskLevel::Critical),
            ("privilege_escalation", RiskLevel::Critical),
            ("system_configuration_changed", RiskLevel::High),
            ("failed_login", RiskLevel::High),
            ("access_denied", RiskLevel::High),
            ("suspicious_activity", RiskLevel::High),
            ("data_exported", RiskLevel::High),
            ("user_deleted", RiskLevel::High),
            ("role_assigned", RiskLevel::High),
            ("permission_granted", RiskLevel::High),
            ("credential_fallback_used", RiskLevel::High),
            ("jwt_replay_limit_exceeded", RiskLevel::High),
            ("pci_violation", RiskLevel::High),
            ("login", RiskLevel::Medium),
            ("logout", RiskLevel::Medium),
            ("password_changed", RiskLevel::Medium),
            ("data_updated", RiskLevel::Medium),
            ("data_modified", RiskLevel::Medium),
            ("key_revoked", RiskLevel::Medium),
            ("revoked_key_decrypt", RiskLevel::High),
        ]);

        let sensitive_fields = [
            "password",
            "password_confirmation",
            "current_password",
            "new_password",
            "token",
            "access_token",
            "refresh_token",
            "api_key",
            "api_secret",
            "secret",
            "credit_card",
            "card_number",
            "cvv",
            "ssn",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            severities,
            categories,
            risk_levels,
            sensitive_fields,
            failed_login_threshold: 3,
            high_severity_threshold: 5,
        }
    }
}

impl AuditPolicy {
    /// Severity for an event type
    pub fn severity_for(&self, event_type: &str) -> Severity {
        self.severities
            .get(event_type)
            .copied()
            .unwrap_or(Severity::Low)
    }

    /// Classification bucket for an event type
    pub fn category_for(&self, event_type: &str) -> Option<EventCategory> {
        self.categories.get(event_type).copied()
    }

    /// Risk level for an event type
    pub fn risk_for(&self, event_type: &str) -> RiskLevel {
        self.risk_levels
            .get(event_type)
            .copied()
            .unwrap_or(RiskLevel::Low)
    }

    /// Whether a field name is on the denylist (case-insensitive)
    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive_fields.contains(&field.to_ascii_lowercase())
    }

    /// Replace denylisted values at any depth
    pub fn redact(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        if self.is_sensitive(&k) {
                            (k, Value::String(REDACTION_MARKER.to_string()))
                        } else {
                            (k, self.redact(v))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.redact(v)).collect()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_tables() {
        let policy = AuditPolicy::default();
        assert_eq!(policy.severity_for("login"), Severity::Low);
        assert_eq!(policy.severity_for("security_incident"), Severity::Critical);
        assert_eq!(policy.severity_for("never_heard_of_it"), Severity::Low);
        assert_eq!(policy.category_for("access_denied"), Some(EventCategory::Authorization));
        assert_eq!(policy.risk_for("privilege_escalation"), RiskLevel::Critical);
    }

    #[test]
    fn test_risk_table_matches_documented_levels() {
        let policy = AuditPolicy::default();
        let expected = [
            (RiskLevel::Critical, &["security_incident", "data_breach", "unauthorized_access", "privilege_escalation"][..]),
            (
                RiskLevel::High,
                &[
                    "user_deleted",
                    "role_assigned",
                    "permission_granted",
                    "data_exported",
                    "system_configuration_changed",
                    "failed_login",
                    "access_denied",
                    "suspicious_activity",
                    "credential_fallback_used",
                    "jwt_replay_limit_exceeded",
                    "pci_violation",
                    "revoked_key_decrypt",
                ][..],
            ),
            (
                RiskLevel::Medium,
                &["login", "logout", "password_changed", "data_modified", "data_updated", "key_revoked"][..],
            ),
        ];

        let mut listed = 0;
        for (level, events) in expected {
            for event in events {
                assert_eq!(policy.risk_for(event), level, "{}", event);
                listed += 1;
            }
        }
        assert_eq!(policy.risk_levels.len(), listed);
        assert_eq!(policy.risk_for("gdpr_request"), RiskLevel::Low);
    }

    #[test]
    fn test_redact_nested_case_insensitive() {
        let policy = AuditPolicy::default();
        let redacted = policy.redact(json!({
            "user": {"Password": "hunter2", "name": "ann"},
            "items": [{"CVV": "123"}, {"card_number": "4111111111111111"}],
            "API_KEY": {"nested": "whole subtree replaced"},
            "amount": 10
        }));

        assert_eq!(redacted["user"]["Password"], REDACTION_MARKER);
        assert_eq!(redacted["user"]["name"], "ann");
        assert_eq!(redacted["items"][0]["CVV"], REDACTION_MARKER);
        assert_eq!(redacted["items"][1]["card_number"], REDACTION_MARKER);
        assert_eq!(redacted["API_KEY"], REDACTION_MARKER);
        assert_eq!(redacted["amount"], 10);
        assert!(!redacted.to_string().contains("hunter2"));
    }
}

//! Metrics collection for observability
//!
//! Prometheus metrics derived from the audit stream. Every component reports
//! through the audit ledger, so observing events there covers all of them.
//!
//! # Metrics
//!
//! - `security_audit_events_total{category,severity}` - Events logged
//! - `security_audit_write_failures_total` - Sink writes that fell back to the process log
//! - `security_critical_alerts_total` - Critical events passed to the alert hook
//! - `security_alert_hook_failures_total` - Alert hook errors
//! - `security_key_rotations_total` - Key rotations
//! - `security_tokens_rejected_total{reason}` - Token validation rejections
//! - `security_mfa_lockouts_total` - MFA lockouts
//! - `security_credential_fallbacks_total` - Credential reads served from the environment

use crate::audit::AuditEvent;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct SecurityMetrics {
    /// Events logged, by category and severity
    pub audit_events: IntCounterVec,

    /// Sink write failures
    pub audit_write_failures: IntCounter,

    /// Critical alerts raised
    pub critical_alerts: IntCounter,

    /// Alert hook failures
    pub alert_hook_failures: IntCounter,

    /// Key rotations
    pub key_rotations: IntCounter,

    /// Token rejections, by reason
    pub tokens_rejected: IntCounterVec,

    /// MFA lockouts
    pub mfa_lockouts: IntCounter,

    /// Credential environment fallbacks
    pub credential_fallbacks: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl SecurityMetrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let audit_events = IntCounterVec::new(
            Opts::new("security_audit_events_total", "Audit events logged"),
            &["category", "severity"],
        )?;
        registry.register(Box::new(audit_events.clone()))?;

        let audit_write_failures = IntCounter::new(
            "security_audit_write_failures_total",
            "Audit sink writes that fell back to the process log",
        )?;
        registry.register(Box::new(audit_write_failures.clone()))?;

        let critical_alerts = IntCounter::new(
            "security_critical_alerts_total",
            "Critical events passed to the alert hook",
        )?;
        registry.register(Box::new(critical_alerts.clone()))?;

        let alert_hook_failures = IntCounter::new(
            "security_alert_hook_failures_total",
            "Alert hook errors",
        )?;
        registry.register(Box::new(alert_hook_failures.clone()))?;

        let key_rotations = IntCounter::new("security_key_rotations_total", "Key rotations")?;
        registry.register(Box::new(key_rotations.clone()))?;

        let tokens_rejected = IntCounterVec::new(
            Opts::new("security_tokens_rejected_total", "Token validation rejections"),
            &["reason"],
        )?;
        registry.register(Box::new(tokens_rejected.clone()))?;

        let mfa_lockouts = IntCounter::new("security_mfa_lockouts_total", "MFA lockouts")?;
        registry.register(Box::new(mfa_lockouts.clone()))?;

        let credential_fallbacks = IntCounter::new(
            "security_credential_fallbacks_total",
            "Credential reads served from the environment fallback",
        )?;
        registry.register(Box::new(credential_fallbacks.clone()))?;

        Ok(Self {
            audit_events,
            audit_write_failures,
            critical_alerts,
            alert_hook_failures,
            key_rotations,
            tokens_rejected,
            mfa_lockouts,
            credential_fallbacks,
            registry,
        })
    }

    /// Update counters for a logged event
    pub fn observe_event(&self, event: &AuditEvent) {
        let category = event.category.map(|c| c.as_str()).unwrap_or("general");
        self.audit_events
            .with_label_values(&[category, event.severity.as_str()])
            .inc();

        match event.event_type.as_str() {
            "key_rotated" => self.key_rotations.inc(),
            "mfa_locked" => self.mfa_lockouts.inc(),
            "credential_fallback_used" => self.credential_fallbacks.inc(),
            "jwt_validation_failed"
            | "jwt_blacklisted_token_used"
            | "jwt_replay_limit_exceeded"
            | "jwt_ip_mismatch"
            | "jwt_subject_revoked" => self
                .tokens_rejected
                .with_label_values(&[event.event_type.trim_start_matches("jwt_")])
                .inc(),
            _ => {}
        }
    }

    /// Text exposition format
    pub fn gather_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for SecurityMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityMetrics").finish_non_exhaustive()
    }
}

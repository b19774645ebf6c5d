//! PCI DSS payment-data checks and protected storage
//!
//! Sensitive authentication data (CVV, PIN, track data) must never be
//! stored. Cardholder data may be stored only encrypted or tokenized.

use crate::audit::{AuditEntry, AuditLedger, Severity};
use crate::clock::Clock;
use crate::crypto;
use crate::error::{Error, Result};
use crate::secret_store::{SecretCipher, SecretRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

const PAYMENT_PURPOSE: &str = "payment";
const COMPLIANCE_VERSION: &str = "PCI_DSS_4.0";
const PAN_FIELD: &str = "card_number";

/// Static PCI tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PciPolicy {
    /// Fields that must never be stored
    pub prohibited_fields: Vec<String>,
    /// Cardholder fields that may be stored only in protected form
    pub protected_fields: Vec<String>,
    /// Prefixes of processor-issued tokens
    pub token_prefixes: Vec<String>,
    /// Retention of stored payment data (years)
    pub retention_years: i32,
}

impl Default for PciPolicy {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            prohibited_fields: strings(&[
                "cvv",
                "cvc",
                "cid",
                "cav2",
                "pin",
                "pin_verification_value",
                "magnetic_stripe_track_data",
                "chip_data",
                "full_track_data",
            ]),
            protected_fields: strings(&["card_number", "expiry_date", "cardholder_name", "service_code"]),
            token_prefixes: strings(&["tok_", "card_", "pm_", "src_"]),
            retention_years: 7,
        }
    }
}

impl PciPolicy {
    /// Whether a value is a processor token or an encryption envelope
    pub fn is_protected(&self, value: &str) -> bool {
        self.token_prefixes.iter().any(|prefix| value.starts_with(prefix.as_str()))
            || SecretRecord::from_envelope(value).is_ok()
    }
}

/// Card network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardBrand {
    /// Visa
    Visa,
    /// Mastercard
    Mastercard,
    /// American Express
    Amex,
    /// Discover
    Discover,
    /// Not recognized
    Unknown,
}

fn digits(pan: &str) -> String {
    pan.chars().filter(char::is_ascii_digit).collect()
}

/// Card network from the leading digits
pub fn detect_brand(pan: &str) -> CardBrand {
    let pan = digits(pan);
    let prefix2: u32 = pan.get(..2).and_then(|p| p.parse().ok()).unwrap_or(0);
    if pan.starts_with('4') {
        CardBrand::Visa
    } else if (51..=55).contains(&prefix2) || (22..=27).contains(&prefix2) {
        CardBrand::Mastercard
    } else if prefix2 == 34 || prefix2 == 37 {
        CardBrand::Amex
    } else if pan.starts_with("6011") || pan.starts_with("65") {
        CardBrand::Discover
    } else {
        CardBrand::Unknown
    }
}

/// 13-19 digits passing the Luhn checksum. Separators are ignored.
pub fn is_valid_pan(pan: &str) -> bool {
    let pan = digits(pan);
    if !(13..=19).contains(&pan.len()) {
        return false;
    }
    let sum: u32 = pan
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let n = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = n * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                n
            }
        })
        .sum();
    sum % 10 == 0
}

/// Last four digits
pub fn last_four(pan: &str) -> String {
    let pan = digits(pan);
    pan[pan.len().saturating_sub(4)..].to_string()
}

/// One failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PciViolation {
    /// Offending field
    pub field: String,
    /// What is wrong
    pub violation: String,
    /// Requirement reference
    pub requirement: String,
    /// How bad
    pub severity: Severity,
}

/// Outcome of [`PciCompliance::validate_payment_data`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    /// No violations
    pub valid: bool,
    /// Failed checks
    pub violations: Vec<PciViolation>,
    /// Findings that do not fail validation
    pub warnings: Vec<String>,
}

/// Protected payment record returned by
/// [`PciCompliance::secure_store_payment_data`]
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredPayment {
    /// Order the payment belongs to
    pub order_id: Option<String>,
    /// Opaque reference for this record
    pub payment_token: String,
    /// Last four PAN digits
    pub last_four: String,
    /// Card network
    pub brand: CardBrand,
    /// Field -> encryption envelope
    pub encrypted_data: BTreeMap<String, String>,
    /// Storage time
    pub stored_at: DateTime<Utc>,
    /// Deletion due
    pub retention_expires: DateTime<Utc>,
    /// Standard version the record was stored under
    pub compliance_version: String,
}

impl fmt::Debug for StoredPayment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredPayment")
            .field("order_id", &self.order_id)
            .field("last_four", &self.last_four)
            .field("brand", &self.brand)
            .field("fields", &self.encrypted_data.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Payment-data validation and protected storage
pub struct PciCompliance {
    cipher: Arc<dyn SecretCipher>,
    policy: PciPolicy,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLedger>>,
}

impl PciCompliance {
    /// Create with the given policy
    pub fn new(cipher: Arc<dyn SecretCipher>, policy: PciPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            cipher,
            policy,
            clock,
            audit: None,
        }
    }

    /// Emit events to an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Policy in use
    pub fn policy(&self) -> &PciPolicy {
        &self.policy
    }

    fn check(&self, data: &BTreeMap<String, String>, allow_raw_pan: bool) -> ValidationReport {
        let mut report = ValidationReport::default();

        for field in &self.policy.prohibited_fields {
            if data.contains_key(field) {
                report.violations.push(PciViolation {
                    field: field.clone(),
                    violation: "Prohibited sensitive authentication data present".into(),
                    requirement: "PCI DSS Requirement 3.2".into(),
                    severity: Severity::Critical,
                });
            }
        }

        if let Some(pan) = data.get(PAN_FIELD) {
            if !self.policy.is_protected(pan) {
                if !is_valid_pan(pan) {
                    report.violations.push(PciViolation {
                        field: PAN_FIELD.into(),
                        violation: "Invalid card number format".into(),
                        requirement: "Data validation".into(),
                        severity: Severity::High,
                    });
                }
                if !allow_raw_pan {
                    report.violations.push(PciViolation {
                        field: PAN_FIELD.into(),
                        violation: "Cardholder data not properly protected".into(),
                        requirement: "PCI DSS Requirement 3.4".into(),
                        severity: Severity::Critical,
                    });
                }
            }
        }

        for field in &self.policy.protected_fields {
            if field == PAN_FIELD {
                continue;
            }
            if let Some(value) = data.get(field) {
                if !value.is_empty() && !self.policy.is_protected(value) {
                    report
                        .warnings
                        .push(format!("{} is stored unprotected (PCI DSS Requirement 3.4)", field));
                }
            }
        }

        report.valid = report.violations.is_empty();
        report
    }

    fn log_violations(&self, event: &str, violations: &[PciViolation]) {
        if violations.iter().any(|v| v.severity == Severity::Critical) {
            error!(event = %event, violations = violations.len(), "Critical PCI DSS violation detected");
        } else {
            warn!(event = %event, violations = violations.len(), "PCI DSS violation detected");
        }
        if let Some(audit) = &self.audit {
            audit.log(
                AuditEntry::new("pci_violation", format!("PCI DSS compliance event: {}", event))
                    .with_resource("pci_compliance", event)
                    .with_tag("pci_compliance")
                    .with_tag("violation")
                    .with_metadata(serde_json::json!({
                        "event": event,
                        "violations": violations,
                        "pci_dss_version": "4.0",
                    })),
            );
        }
    }

    /// Check data about to be processed or persisted.
    ///
    /// A cleartext PAN is itself a violation here.
    pub fn validate_payment_data(&self, data: &BTreeMap<String, String>) -> ValidationReport {
        let report = self.check(data, false);
        if !report.valid {
            self.log_violations("payment_data_validation_failed", &report.violations);
        }
        report
    }

    /// Encrypt the cardholder fields of `data` for storage.
    ///
    /// The PAN may arrive in cleartext but must be well formed. Prohibited
    /// fields reject the whole request.
    pub fn secure_store_payment_data(
        &self,
        data: &BTreeMap<String, String>,
        order_id: Option<&str>,
    ) -> Result<StoredPayment> {
        let report = self.check(data, true);
        if !report.valid {
            self.log_violations("payment_data_store_rejected", &report.violations);
            let fields: Vec<&str> = report.violations.iter().map(|v| v.field.as_str()).collect();
            return Err(Error::Validation(format!(
                "Payment data rejected by PCI checks: {}",
                fields.join(", ")
            )));
        }

        let pan = data.get(PAN_FIELD).map(String::as_str).unwrap_or_default();
        let raw_pan = !self.policy.is_protected(pan);
        let mut encrypted_data = BTreeMap::new();
        for field in &self.policy.protected_fields {
            let Some(value) = data.get(field).filter(|v| !v.is_empty()) else {
                continue;
            };
            let protected = if self.policy.is_protected(value) {
                value.clone()
            } else {
                self.cipher.encrypt_string(value, PAYMENT_PURPOSE)?
            };
            encrypted_data.insert(field.clone(), protected);
        }

        let now = self.clock.now();
        let stored = StoredPayment {
            order_id: order_id.map(str::to_string),
            payment_token: format!("tok_{}", crypto::random_alphanumeric(32)),
            last_four: if raw_pan { last_four(pan) } else { String::new() },
            brand: if raw_pan { detect_brand(pan) } else { CardBrand::Unknown },
            encrypted_data,
            stored_at: now,
            retention_expires: now + Duration::days(365 * i64::from(self.policy.retention_years)),
            compliance_version: COMPLIANCE_VERSION.to_string(),
        };

        info!(order_id = ?order_id, brand = ?stored.brand, "Payment data stored");
        if let Some(audit) = &self.audit {
            audit.log(
                AuditEntry::new("payment_data_stored", "Payment data stored encrypted")
                    .with_resource("payment", stored.payment_token.clone())
                    .with_metadata(serde_json::json!({
                        "order_id": order_id,
                        "payment_token": stored.payment_token,
                        "storage_type": "encrypted",
                        "fields": stored.encrypted_data.keys().collect::<Vec<_>>(),
                    })),
            );
        }
        Ok(stored)
    }
}

impl fmt::Debug for PciCompliance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciCompliance")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

//! Multi-factor authentication
//!
//! Per-user state machine: `Disabled -> Pending(method) -> Enabled -> Disabled`.
//!
//! - TOTP secrets and SMS/email destinations are stored as encrypted envelopes
//! - SMS/email codes live in the shared cache for `code_ttl_secs` and are
//!   single-use
//! - Backup codes are stored as Argon2id hashes and removed when used
//! - `max_attempts` consecutive failures lock the user out for
//!   `lockout_minutes`; an expired lock resets the counter on the next attempt

use crate::audit::{AuditLedger, RequestContext};
use crate::cache::KeyValueCache;
use crate::clock::Clock;
use crate::config::MfaConfig;
use crate::crypto;
use crate::error::{Error, Result};
use crate::masking::{self, MaskKind};
use crate::secret_store::SecretCipher;
use crate::totp;
use argon2::password_hash::rand_core::OsRng as HashRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

const MFA_PURPOSE: &str = "mfa";

/// Second-factor method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaMethod {
    /// Authenticator app
    Totp,
    /// Code sent by SMS
    Sms,
    /// Code sent by email
    Email,
    /// Backup codes only
    BackupCodes,
}

impl MfaMethod {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaMethod::Totp => "totp",
            MfaMethod::Sms => "sms",
            MfaMethod::Email => "email",
            MfaMethod::BackupCodes => "backup_codes",
        }
    }
}

/// Persisted MFA state for one user
#[derive(Clone, Serialize, Deserialize)]
pub struct MfaSetting {
    /// Owner
    pub user_id: String,
    /// Configured method
    pub method: MfaMethod,
    /// Encrypted TOTP secret
    pub secret: Option<String>,
    /// Encrypted phone number or email address
    pub destination: Option<String>,
    /// Argon2id hashes of unused backup codes
    pub backup_codes: Vec<String>,
    /// Enrollment confirmed
    pub enabled: bool,
    /// Consecutive failures
    pub failed_attempts: u32,
    /// Lockout end
    pub locked_until: Option<DateTime<Utc>>,
    /// Last successful verification
    pub last_used_at: Option<DateTime<Utc>>,
    /// Enrollment confirmation time
    pub verified_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for MfaSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfaSetting")
            .field("user_id", &self.user_id)
            .field("method", &self.method)
            .field("enabled", &self.enabled)
            .field("failed_attempts", &self.failed_attempts)
            .field("locked_until", &self.locked_until)
            .finish_non_exhaustive()
    }
}

/// MFA persistence seam
pub trait MfaStore: Send + Sync {
    /// Setting for a user
    fn get(&self, user_id: &str) -> Result<Option<MfaSetting>>;
    /// Insert or replace
    fn save(&self, setting: &MfaSetting) -> Result<()>;
    /// Remove. Returns `true` if a setting existed.
    fn delete(&self, user_id: &str) -> Result<bool>;
}

/// In-memory MFA store
#[derive(Debug, Default)]
pub struct MemoryMfaStore {
    settings: RwLock<HashMap<String, MfaSetting>>,
}

impl MemoryMfaStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl MfaStore for MemoryMfaStore {
    fn get(&self, user_id: &str) -> Result<Option<MfaSetting>> {
        Ok(self.settings.read().get(user_id).cloned())
    }

    fn save(&self, setting: &MfaSetting) -> Result<()> {
        self.settings
            .write()
            .insert(setting.user_id.clone(), setting.clone());
        Ok(())
    }

    fn delete(&self, user_id: &str) -> Result<bool> {
        Ok(self.settings.write().remove(user_id).is_some())
    }
}

/// Notification collaborator for SMS/email codes
pub trait CodeSender: Send + Sync {
    /// Deliver `code` to `destination`
    fn send(&self, method: MfaMethod, destination: &str, code: &str) -> Result<()>;
}

/// Sender that records the masked destination only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send(&self, method: MfaMethod, destination: &str, _code: &str) -> Result<()> {
        let kind = if method == MfaMethod::Sms { MaskKind::Phone } else { MaskKind::Email };
        info!(method = method.as_str(), destination = %masking::mask(destination, kind), "MFA code dispatched");
        Ok(())
    }
}

/// Returned by [`MfaEngine::enroll`]
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentPayload {
    /// Method being enrolled
    pub method: MfaMethod,
    /// TOTP shared secret (shown once)
    pub secret: Option<String>,
    /// `otpauth://` URI for QR rendering
    pub provisioning_uri: Option<String>,
    /// Secret grouped in fours for manual entry
    pub manual_entry_key: Option<String>,
    /// Masked SMS/email destination
    pub destination: Option<String>,
    /// Plaintext backup codes (shown once)
    pub backup_codes: Vec<String>,
    /// A code must be confirmed before MFA is enabled
    pub requires_verification: bool,
}

/// Operator/user-facing summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MfaStatus {
    /// Enrollment confirmed
    pub enabled: bool,
    /// Configured method
    pub method: Option<MfaMethod>,
    /// Enrollment ever confirmed
    pub verified: bool,
    /// Last successful verification
    pub last_used_at: Option<DateTime<Utc>>,
    /// Unused backup codes
    pub backup_codes_remaining: usize,
    /// Lockout end, if currently locked
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct PendingCode {
    code: String,
    purpose: String,
}

/// MFA engine
pub struct MfaEngine {
    store: Arc<dyn MfaStore>,
    cipher: Arc<dyn SecretCipher>,
    cache: Arc<dyn KeyValueCache>,
    sender: Arc<dyn CodeSender>,
    config: MfaConfig,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLedger>>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MfaEngine {
    /// Create an engine
    pub fn new(
        store: Arc<dyn MfaStore>,
        cipher: Arc<dyn SecretCipher>,
        cache: Arc<dyn KeyValueCache>,
        config: MfaConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cipher,
            cache,
            sender: Arc::new(LogCodeSender),
            config,
            clock,
            audit: None,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the code sender
    pub fn with_sender(mut self, sender: Arc<dyn CodeSender>) -> Self {
        self.sender = sender;
        self
    }

    /// Emit events to an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn audit(&self, event_type: &str, user_id: &str, context: &RequestContext, metadata: serde_json::Value) {
        if let Some(audit) = &self.audit {
            audit.log_authentication(event_type, Some(user_id), context, metadata);
        }
    }

    fn code_key(user_id: &str) -> String {
        format!("mfa_code:{}", user_id)
    }

    fn session_key(user_id: &str, session_id: &str) -> String {
        format!("mfa_session:{}:{}", user_id, session_id)
    }

    /// Start enrollment.
    ///
    /// `account` labels the TOTP entry in authenticator apps. `destination`
    /// is required for SMS (phone) and email (address).
    pub fn enroll(
        &self,
        user_id: &str,
        account: &str,
        method: MfaMethod,
        destination: Option<&str>,
    ) -> Result<EnrollmentPayload> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        if let Some(existing) = self.store.get(user_id)? {
            if existing.enabled {
                return Err(Error::Conflict("MFA is already enabled; disable it first".into()));
            }
        }

        let mut setting = MfaSetting {
            user_id: user_id.to_string(),
            method,
            secret: None,
            destination: None,
            backup_codes: Vec::new(),
            enabled: false,
            failed_attempts: 0,
            locked_until: None,
            last_used_at: None,
            verified_at: None,
        };
        let mut payload = EnrollmentPayload {
            method,
            secret: None,
            provisioning_uri: None,
            manual_entry_key: None,
            destination: None,
            backup_codes: Vec::new(),
            requires_verification: true,
        };

        match method {
            MfaMethod::Totp => {
                let secret = totp::generate_secret();
                setting.secret = Some(self.cipher.encrypt_string(&secret, MFA_PURPOSE)?);
                payload.provisioning_uri = Some(totp::provisioning_uri(&self.config.issuer, account, &secret));
                payload.manual_entry_key = Some(group_by_four(&secret));
                payload.secret = Some(secret);
            }
            MfaMethod::Sms | MfaMethod::Email => {
                let destination = destination
                    .filter(|d| !d.trim().is_empty())
                    .ok_or_else(|| Error::Validation(format!("A destination is required for {} MFA", method.as_str())))?;
                setting.destination = Some(self.cipher.encrypt_string(destination, MFA_PURPOSE)?);
                let kind = if method == MfaMethod::Sms { MaskKind::Phone } else { MaskKind::Email };
                payload.destination = Some(masking::mask(destination, kind));
                self.issue_code(user_id, method, destination, "setup")?;
            }
            MfaMethod::BackupCodes => {
                let (plain, hashed) = self.generate_backup_codes()?;
                setting.backup_codes = hashed;
                payload.backup_codes = plain;
            }
        }

        self.store.save(&setting)?;
        info!(user_id = %user_id, method = method.as_str(), "MFA enrollment started");
        Ok(payload)
    }

    /// Confirm a pending enrollment with a first valid code.
    ///
    /// Returns freshly generated backup codes for methods other than
    /// `backup_codes` (whose codes were issued at enrollment).
    pub fn confirm_enrollment(&self, user_id: &str, code: &str, context: &RequestContext) -> Result<Vec<String>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let mut setting = self
            .store
            .get(user_id)?
            .ok_or_else(|| Error::NotFound("No MFA enrollment in progress".into()))?;
        if setting.enabled {
            return Err(Error::Conflict("MFA is already enabled".into()));
        }

        if !self.attempt(&mut setting, code, context)? {
            return Err(Error::Validation("Invalid verification code".into()));
        }

        let now = self.clock.now();
        setting.enabled = true;
        setting.verified_at = Some(now);
        let codes = if setting.method == MfaMethod::BackupCodes {
            Vec::new()
        } else {
            let (plain, hashed) = self.generate_backup_codes()?;
            setting.backup_codes = hashed;
            plain
        };
        self.store.save(&setting)?;

        self.audit("mfa_enabled", user_id, context, serde_json::json!({ "method": setting.method }));
        Ok(codes)
    }

    /// Verify a second factor for an enabled user.
    ///
    /// `Ok(false)` for a wrong code, `Err(Locked)` while locked out. On
    /// success the session in `context`, if any, is marked verified.
    pub fn verify(&self, user_id: &str, code: &str, context: &RequestContext) -> Result<bool> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let mut setting = self.enabled_setting(user_id)?;
        let valid = self.attempt(&mut setting, code, context)?;
        if valid {
            if let Some(session_id) = &context.session_id {
                self.mark_session_verified(user_id, session_id)?;
            }
        }
        Ok(valid)
    }

    /// Verify and consume a backup code
    pub fn verify_backup_code(&self, user_id: &str, code: &str, context: &RequestContext) -> Result<bool> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let mut setting = self.enabled_setting(user_id)?;
        self.check_lock(&mut setting)?;
        let valid = self.consume_backup_code(&mut setting, code)?;
        self.record_outcome(&mut setting, valid, "backup_code", context)?;
        Ok(valid)
    }

    fn enabled_setting(&self, user_id: &str) -> Result<MfaSetting> {
        match self.store.get(user_id)? {
            Some(setting) if setting.enabled => Ok(setting),
            _ => Err(Error::Validation("MFA is not enabled for this user".into())),
        }
    }

    /// Lock check, factor check and attempt accounting. Persists the setting.
    fn attempt(&self, setting: &mut MfaSetting, code: &str, context: &RequestContext) -> Result<bool> {
        self.check_lock(setting)?;

        let mut factor = setting.method.as_str();
        let mut valid = self.check_factor(setting, code)?;
        if !valid && setting.method != MfaMethod::BackupCodes && looks_like_backup_code(code) {
            valid = self.consume_backup_code(setting, code)?;
            factor = "backup_code";
        }

        self.record_outcome(setting, valid, factor, context)?;
        Ok(valid)
    }

    fn check_lock(&self, setting: &mut MfaSetting) -> Result<()> {
        let now = self.clock.now();
        match setting.locked_until {
            Some(until) if until > now => Err(Error::Locked {
                remaining_secs: (until - now).num_seconds().max(1),
            }),
            Some(_) => {
                setting.locked_until = None;
                setting.failed_attempts = 0;
                self.store.save(setting)?;
                debug!(user_id = %setting.user_id, "MFA lockout expired");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_factor(&self, setting: &mut MfaSetting, code: &str) -> Result<bool> {
        match setting.method {
            MfaMethod::Totp => {
                let Some(envelope) = &setting.secret else {
                    return Ok(false);
                };
                let secret = self.cipher.decrypt_string(envelope)?;
                let skew = self.config.totp_skew.max(0) as u32;
                totp::verify(&secret, code, self.clock.now(), skew)
            }
            MfaMethod::Sms | MfaMethod::Email => {
                let key = Self::code_key(&setting.user_id);
                let Some(pending) = self.cache.get_json::<PendingCode>(&key)? else {
                    return Ok(false);
                };
                let valid = crypto::ct_eq(pending.code.as_bytes(), code.trim().as_bytes());
                if valid {
                    self.cache.forget(&key)?;
                }
                Ok(valid)
            }
            MfaMethod::BackupCodes => self.consume_backup_code(setting, code),
        }
    }

    fn record_outcome(
        &self,
        setting: &mut MfaSetting,
        valid: bool,
        factor: &str,
        context: &RequestContext,
    ) -> Result<()> {
        let user_id = setting.user_id.clone();
        if valid {
            setting.failed_attempts = 0;
            setting.locked_until = None;
            setting.last_used_at = Some(self.clock.now());
            self.store.save(setting)?;
            if setting.enabled {
                self.audit("mfa_verified", &user_id, context, serde_json::json!({ "factor": factor }));
            }
            return Ok(());
        }

        setting.failed_attempts += 1;
        let locked = setting.failed_attempts >= self.config.max_attempts;
        if locked {
            setting.locked_until = Some(self.clock.now() + Duration::minutes(self.config.lockout_minutes));
        }
        self.store.save(setting)?;

        if locked {
            warn!(user_id = %user_id, attempts = setting.failed_attempts, "MFA locked after repeated failures");
            self.audit(
                "mfa_locked",
                &user_id,
                context,
                serde_json::json!({
                    "failed_attempts": setting.failed_attempts,
                    "locked_until": setting.locked_until,
                }),
            );
        } else {
            self.audit(
                "mfa_failed",
                &user_id,
                context,
                serde_json::json!({ "failed_attempts": setting.failed_attempts, "factor": factor }),
            );
        }
        Ok(())
    }

    /// Resend a login code to an SMS/email user
    pub fn send_code(&self, user_id: &str) -> Result<()> {
        let setting = self.enabled_setting(user_id)?;
        if !matches!(setting.method, MfaMethod::Sms | MfaMethod::Email) {
            return Err(Error::Validation("Code sending is not supported for this MFA method".into()));
        }
        let envelope = setting
            .destination
            .as_deref()
            .ok_or_else(|| Error::Validation("No destination on file".into()))?;
        let destination = self.cipher.decrypt_string(envelope)?;
        self.issue_code(user_id, setting.method, &destination, "login")
    }

    fn issue_code(&self, user_id: &str, method: MfaMethod, destination: &str, purpose: &str) -> Result<()> {
        let code = format!("{:06}", rand::rngs::OsRng.gen_range(0..1_000_000u32));
        let pending = PendingCode {
            code: code.clone(),
            purpose: purpose.to_string(),
        };
        self.cache.put_json(
            &Self::code_key(user_id),
            &pending,
            StdDuration::from_secs(self.config.code_ttl_secs),
        )?;
        self.sender.send(method, destination, &code)
    }

    fn argon(&self) -> Result<Argon2<'static>> {
        let params = Params::new(
            self.config.backup_hash_memory_kib,
            self.config.backup_hash_iterations,
            1,
            None,
        )
        .map_err(|e| Error::Config(format!("Invalid backup code hashing parameters: {}", e)))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    fn generate_backup_codes(&self) -> Result<(Vec<String>, Vec<String>)> {
        let argon = self.argon()?;
        let mut plain = Vec::with_capacity(self.config.backup_code_count);
        let mut hashed = Vec::with_capacity(self.config.backup_code_count);
        for _ in 0..self.config.backup_code_count {
            let raw = crypto::random_alphanumeric(8).to_ascii_uppercase();
            let code = format!("{}-{}", &raw[..4], &raw[4..]);
            let salt = SaltString::generate(&mut HashRng);
            let hash = argon
                .hash_password(code.as_bytes(), &salt)
                .map_err(|e| Error::Crypto(format!("Backup code hashing failed: {}", e)))?
                .to_string();
            plain.push(code);
            hashed.push(hash);
        }
        Ok((plain, hashed))
    }

    fn consume_backup_code(&self, setting: &mut MfaSetting, code: &str) -> Result<bool> {
        let candidate = code.trim().to_ascii_uppercase();
        let argon = self.argon()?;
        let position = setting.backup_codes.iter().position(|stored| {
            PasswordHash::new(stored)
                .map(|parsed| argon.verify_password(candidate.as_bytes(), &parsed).is_ok())
                .unwrap_or(false)
        });
        match position {
            Some(index) => {
                setting.backup_codes.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace all backup codes at once
    pub fn regenerate_backup_codes(&self, user_id: &str) -> Result<Vec<String>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let mut setting = self
            .store
            .get(user_id)?
            .ok_or_else(|| Error::Validation("MFA must be set up first".into()))?;
        let (plain, hashed) = self.generate_backup_codes()?;
        setting.backup_codes = hashed;
        self.store.save(&setting)?;

        info!(user_id = %user_id, count = plain.len(), "Backup codes regenerated");
        Ok(plain)
    }

    /// Disable MFA.
    ///
    /// Requires a valid second factor or backup code. When the caller
    /// re-checked the primary credential it passes the outcome in
    /// `primary_verified`; `Some(false)` refuses without consuming an attempt.
    pub fn disable(
        &self,
        user_id: &str,
        code: &str,
        primary_verified: Option<bool>,
        context: &RequestContext,
    ) -> Result<()> {
        if primary_verified == Some(false) {
            return Err(Error::PermissionDenied("Primary credential check failed".into()));
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let mut setting = self.enabled_setting(user_id)?;
        if !self.attempt(&mut setting, code, context)? {
            return Err(Error::PermissionDenied("Invalid verification code".into()));
        }
        self.store.delete(user_id)?;
        self.cache.forget(&Self::code_key(user_id))?;

        self.audit("mfa_disabled", user_id, context, serde_json::json!({ "method": setting.method }));
        Ok(())
    }

    /// Current state
    pub fn status(&self, user_id: &str) -> Result<MfaStatus> {
        let now = self.clock.now();
        Ok(match self.store.get(user_id)? {
            Some(setting) => MfaStatus {
                enabled: setting.enabled,
                method: Some(setting.method),
                verified: setting.verified_at.is_some(),
                last_used_at: setting.last_used_at,
                backup_codes_remaining: setting.backup_codes.len(),
                locked_until: setting.locked_until.filter(|until| *until > now),
            },
            None => MfaStatus {
                enabled: false,
                method: None,
                verified: false,
                last_used_at: None,
                backup_codes_remaining: 0,
                locked_until: None,
            },
        })
    }

    /// Whether this session still needs a second factor
    pub fn requires_verification(&self, user_id: &str, session_id: &str) -> Result<bool> {
        match self.store.get(user_id)? {
            Some(setting) if setting.enabled => Ok(!self.cache.has(&Self::session_key(user_id, session_id))?),
            _ => Ok(false),
        }
    }

    /// Skip re-prompting this session for `session_ttl_secs`
    pub fn mark_session_verified(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.cache.put(
            &Self::session_key(user_id, session_id),
            self.clock.now().to_rfc3339(),
            StdDuration::from_secs(self.config.session_ttl_secs),
        )
    }
}

impl std::fmt::Debug for MfaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfaEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn group_by_four(secret: &str) -> String {
    secret
        .as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_backup_code(code: &str) -> bool {
    let code = code.trim();
    code.len() == 9
        && code.as_bytes()[4] == b'-'
        && code
            .bytes()
            .enumerate()
            .all(|(i, b)| i == 4 || b.is_ascii_alphanumeric())
}

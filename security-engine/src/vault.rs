//! Credential vault
//!
//! Long-lived external API credentials (registry GUIDs) kept encrypted on
//! disk, with a backup slot, rotation history and an environment fallback.
//!
//! On-disk layout under `storage_dir` (directories 0700, files 0600):
//!
//! ```text
//! credentials.encrypted      current credential envelope
//! backups/credentials-*.encrypted
//! rotation-history.json      last N rotations, previews only
//! ```
//!
//! Reads that cannot produce a verified credential fall back to the
//! configured environment variables and emit `credential_fallback_used`.

use crate::audit::{AuditEntry, AuditLedger};
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::crypto;
use crate::error::{Error, Result};
use crate::files;
use crate::keys::{EncryptionKey, KeyManager, Reencryptor};
use crate::masking::{self, MaskKind};
use crate::secret_store::{SecretCipher, SecretRecord};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use zeroize::Zeroize;

/// Key purpose for vault envelopes
pub const VAULT_PURPOSE: &str = "credential_vault";

const CREDENTIAL_FILE: &str = "credentials.encrypted";
const BACKUP_DIR: &str = "backups";
const HISTORY_FILE: &str = "rotation-history.json";
const GUID_PATTERN: &str =
    r"^(?i)[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$";

/// Where a credential was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Verified encrypted file
    EncryptedFile,
    /// Environment fallback
    Environment,
}

/// Stored credential
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Current secret
    pub primary_secret: String,

    /// Previous secret, kept after rotation
    pub backup_secret: Option<String>,

    /// When this version was written
    pub stored_at: DateTime<Utc>,

    /// Who wrote it
    pub stored_by: String,

    /// Deployment environment it belongs to
    pub environment: String,

    /// Last rotation time
    pub rotated_at: Option<DateTime<Utc>>,

    /// Last rotation reason
    pub rotation_reason: Option<String>,

    /// Keyed SHA-256 over primary, backup and environment
    pub checksum: String,

    /// Where this copy came from
    #[serde(skip, default = "default_source")]
    pub source: CredentialSource,
}

fn default_source() -> CredentialSource {
    CredentialSource::EncryptedFile
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("stored_at", &self.stored_at)
            .field("stored_by", &self.stored_by)
            .field("environment", &self.environment)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.primary_secret.zeroize();
        self.backup_secret.zeroize();
    }
}

/// Summary for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultStatus {
    /// Any credential resolvable
    pub configured: bool,
    /// Source of the resolvable credential
    pub source: Option<CredentialSource>,
    /// Backup slot filled
    pub has_backup: bool,
    /// Write time
    pub stored_at: Option<DateTime<Utc>>,
    /// Writer
    pub stored_by: Option<String>,
    /// Last rotation
    pub rotated_at: Option<DateTime<Utc>>,
    /// Environment
    pub environment: String,
}

/// Masked export for display and backups
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaskedCredential {
    /// Masked primary
    pub primary: String,
    /// Masked backup
    pub backup: Option<String>,
    /// Environment
    pub environment: String,
    /// Export time
    pub exported_at: DateTime<Utc>,
}

/// Rotation history entry. Holds previews only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRecord {
    /// First 8 characters of the old secret plus `****`
    pub old_preview: String,
    /// First 8 characters of the new secret plus `****`
    pub new_preview: String,
    /// Stated reason
    pub reason: Option<String>,
    /// Operator
    pub rotated_by: String,
    /// Environment
    pub environment: String,
    /// Time
    pub rotated_at: DateTime<Utc>,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Credential vault
pub struct CredentialVault {
    cipher: Arc<dyn SecretCipher>,
    checksum_secret: Vec<u8>,
    config: VaultConfig,
    environment: String,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLedger>>,
    env_lookup: EnvLookup,
    guid: Regex,
    cached: RwLock<Option<(Credential, DateTime<Utc>)>>,
    write_lock: Mutex<()>,
}

impl CredentialVault {
    /// Create a vault.
    ///
    /// `checksum_secret` is the server-side application secret mixed into
    /// the credential checksum.
    pub fn new(
        cipher: Arc<dyn SecretCipher>,
        checksum_secret: &[u8],
        config: VaultConfig,
        environment: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let guid = Regex::new(GUID_PATTERN)
            .map_err(|e| Error::Config(format!("GUID pattern: {}", e)))?;
        Ok(Self {
            cipher,
            checksum_secret: checksum_secret.to_vec(),
            config,
            environment: environment.into(),
            clock,
            audit: None,
            env_lookup: Arc::new(|name| std::env::var(name).ok()),
            guid,
            cached: RwLock::new(None),
            write_lock: Mutex::new(()),
        })
    }

    /// Emit events to an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Replace the environment lookup used for the fallback
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env_lookup = Arc::new(lookup);
        self
    }

    fn credential_path(&self) -> PathBuf {
        self.config.storage_dir.join(CREDENTIAL_FILE)
    }

    fn history_path(&self) -> PathBuf {
        self.config.storage_dir.join(HISTORY_FILE)
    }

    fn audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            audit.log(entry);
        }
    }

    /// Check a secret against the canonical GUID format
    pub fn validate(&self, secret: &str) -> Result<()> {
        if self.guid.is_match(secret) {
            Ok(())
        } else {
            Err(Error::Validation("Invalid GUID format".into()))
        }
    }

    fn checksum(&self, primary: &str, backup: Option<&str>, environment: &str) -> String {
        crypto::sha256_hex_parts(&[
            primary.as_bytes(),
            backup.unwrap_or("").as_bytes(),
            environment.as_bytes(),
            &self.checksum_secret,
        ])
    }

    /// Store a credential, replacing the current one.
    ///
    /// The existing file is copied to `backups/` first; the new file is
    /// written through a temp file and atomic rename.
    pub fn store(&self, primary: &str, backup: Option<&str>, actor: &str) -> Result<()> {
        self.validate(primary)?;
        if let Some(backup) = backup {
            self.validate(backup)
                .map_err(|_| Error::Validation("Invalid backup GUID format".into()))?;
        }

        let _guard = self.write_lock.lock();
        let credential = self.build(primary, backup, actor, None, None);
        self.write(&credential)?;

        info!(environment = %self.environment, stored_by = %actor, "Credential stored");
        self.audit(
            AuditEntry::new("credential_stored", "Stored external API credential")
                .with_actor_id(actor)
                .with_resource("credential", VAULT_PURPOSE)
                .with_metadata(serde_json::json!({
                    "environment": self.environment,
                    "has_backup": backup.is_some(),
                })),
        );
        Ok(())
    }

    fn build(
        &self,
        primary: &str,
        backup: Option<&str>,
        actor: &str,
        rotated_at: Option<DateTime<Utc>>,
        rotation_reason: Option<String>,
    ) -> Credential {
        Credential {
            primary_secret: primary.to_string(),
            backup_secret: backup.map(str::to_string),
            stored_at: self.clock.now(),
            stored_by: actor.to_string(),
            environment: self.environment.clone(),
            rotated_at,
            rotation_reason,
            checksum: self.checksum(primary, backup, &self.environment),
            source: CredentialSource::EncryptedFile,
        }
    }

    fn write(&self, credential: &Credential) -> Result<()> {
        let mut json = serde_json::to_string(credential)?;
        let envelope = self.cipher.encrypt_string(&json, VAULT_PURPOSE);
        json.zeroize();
        let envelope = envelope?;

        self.backup_current()?;
        files::write_atomic(&self.credential_path(), envelope.as_bytes())?;
        *self.cached.write() = None;
        Ok(())
    }

    fn backup_current(&self) -> Result<()> {
        let source = self.credential_path();
        if !source.exists() {
            return Ok(());
        }
        let dir = self.config.storage_dir.join(BACKUP_DIR);
        files::ensure_private_dir(&dir)?;

        let target = dir.join(format!(
            "credentials-{}-{}.encrypted",
            self.clock.now().format("%Y-%m-%d-%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));
        fs::copy(&source, &target)?;
        files::set_mode(&target, 0o600)
    }

    fn read_file(&self) -> Result<Option<Credential>> {
        let path = self.credential_path();
        if !path.exists() {
            return Ok(None);
        }
        let envelope = fs::read_to_string(&path)?;
        let json = self.cipher.decrypt_string(envelope.trim())?;
        let credential: Credential = serde_json::from_str(&json)?;

        let expected = self.checksum(
            &credential.primary_secret,
            credential.backup_secret.as_deref(),
            &credential.environment,
        );
        if !crypto::ct_eq(expected.as_bytes(), credential.checksum.as_bytes()) {
            return Err(Error::Integrity("Credential checksum verification failed".into()));
        }
        Ok(Some(credential))
    }

    fn from_environment(&self, reason: &str) -> Option<Credential> {
        let primary = (self.env_lookup)(&self.config.fallback_env)?;
        if self.validate(&primary).is_err() {
            warn!(variable = %self.config.fallback_env, "Fallback credential is not a valid GUID");
            return None;
        }
        let backup = (self.env_lookup)(&self.config.fallback_backup_env)
            .filter(|b| self.validate(b).is_ok());

        warn!(reason = %reason, "Serving credential from environment fallback");
        self.audit(
            AuditEntry::new("credential_fallback_used", "Credential served from environment fallback")
                .with_resource("credential", VAULT_PURPOSE)
                .with_metadata(serde_json::json!({
                    "reason": reason,
                    "variable": self.config.fallback_env,
                    "environment": self.environment,
                })),
        );

        let mut credential = self.build(&primary, backup.as_deref(), "environment", None, None);
        credential.source = CredentialSource::Environment;
        Some(credential)
    }

    /// Current credential.
    ///
    /// Cache first, then the encrypted file. A missing, undecryptable or
    /// checksum-failing file degrades to the environment fallback; only
    /// when that is also unavailable does this return `NotFound`.
    pub fn get(&self) -> Result<Credential> {
        if let Some((credential, expires_at)) = self.cached.read().as_ref() {
            if *expires_at > self.clock.now() {
                return Ok(credential.clone());
            }
        }
        self.load()
    }

    /// Read past the cache, refreshing it on a good file read
    fn load(&self) -> Result<Credential> {
        let reason = match self.read_file() {
            Ok(Some(credential)) => {
                let ttl = Duration::seconds(self.config.cache_ttl_secs as i64);
                *self.cached.write() = Some((credential.clone(), self.clock.now() + ttl));
                return Ok(credential);
            }
            Ok(None) => "not_configured".to_string(),
            Err(e) => {
                error!(error = %e, "Failed to read stored credential");
                match e {
                    Error::Integrity(_) => "integrity_failure".to_string(),
                    _ => "read_failure".to_string(),
                }
            }
        };

        self.from_environment(&reason)
            .ok_or_else(|| Error::NotFound("No credential configured".into()))
    }

    /// Primary secret
    pub fn get_guid(&self) -> Result<String> {
        Ok(self.get()?.primary_secret.clone())
    }

    /// Backup secret, if any
    pub fn get_backup_guid(&self) -> Result<Option<String>> {
        Ok(self.get()?.backup_secret.clone())
    }

    /// Rotate: current primary moves to the backup slot, `new_primary`
    /// becomes primary, and a preview entry is appended to the history.
    ///
    /// The current credential is read under the write lock so concurrent
    /// rotations serialize. History is only written once the new file is.
    pub fn rotate(&self, new_primary: &str, reason: Option<&str>, actor: &str) -> Result<()> {
        self.validate(new_primary)?;

        let _guard = self.write_lock.lock();
        let current = self.load()?;

        let now = self.clock.now();
        let credential = self.build(
            new_primary,
            Some(&current.primary_secret),
            actor,
            Some(now),
            reason.map(str::to_string),
        );
        self.write(&credential)?;
        self.record_rotation(&current.primary_secret, new_primary, reason, actor);

        info!(environment = %self.environment, rotated_by = %actor, "Credential rotated");
        self.audit(
            AuditEntry::new("credential_rotated", "Rotated external API credential")
                .with_actor_id(actor)
                .with_resource("credential", VAULT_PURPOSE)
                .with_metadata(serde_json::json!({
                    "reason": reason,
                    "previous_source": current.source,
                    "environment": self.environment,
                })),
        );
        Ok(())
    }

    fn record_rotation(&self, old: &str, new: &str, reason: Option<&str>, actor: &str) {
        let entry = RotationRecord {
            old_preview: preview(old),
            new_preview: preview(new),
            reason: reason.map(str::to_string),
            rotated_by: actor.to_string(),
            environment: self.environment.clone(),
            rotated_at: self.clock.now(),
        };

        let result = self.load_history().and_then(|mut history| {
            history.push(entry);
            let excess = history.len().saturating_sub(self.config.history_limit);
            history.drain(..excess);
            let json = serde_json::to_vec_pretty(&history)?;
            files::write_atomic(&self.history_path(), &json)
        });
        if let Err(e) = result {
            warn!(error = %e, "Failed to record credential rotation");
        }
    }

    fn load_history(&self) -> Result<Vec<RotationRecord>> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Most recent rotations, newest first
    pub fn rotation_history(&self, limit: usize) -> Result<Vec<RotationRecord>> {
        let mut history = self.load_history()?;
        history.reverse();
        history.truncate(limit);
        Ok(history)
    }

    /// Operator status
    pub fn status(&self) -> VaultStatus {
        match self.get() {
            Ok(credential) => VaultStatus {
                configured: true,
                source: Some(credential.source),
                has_backup: credential.backup_secret.is_some(),
                stored_at: Some(credential.stored_at),
                stored_by: Some(credential.stored_by.clone()),
                rotated_at: credential.rotated_at,
                environment: credential.environment.clone(),
            },
            Err(_) => VaultStatus {
                configured: false,
                source: None,
                has_backup: false,
                stored_at: None,
                stored_by: None,
                rotated_at: None,
                environment: self.environment.clone(),
            },
        }
    }

    /// Masked copy of the current credential
    pub fn export_masked(&self) -> Option<MaskedCredential> {
        let credential = self.get().ok()?;
        Some(MaskedCredential {
            primary: masking::mask(&credential.primary_secret, MaskKind::Guid),
            backup: credential
                .backup_secret
                .as_deref()
                .map(|b| masking::mask(b, MaskKind::Guid)),
            environment: credential.environment.clone(),
            exported_at: self.clock.now(),
        })
    }

    /// Drop the in-process cached credential
    pub fn clear_cache(&self) {
        *self.cached.write() = None;
    }
}

fn preview(secret: &str) -> String {
    let head: String = secret.chars().take(8).collect();
    format!("{}****", head)
}

impl Reencryptor for CredentialVault {
    fn reencrypt(&self, _keys: &KeyManager, from: &EncryptionKey, to: &EncryptionKey) -> Result<usize> {
        if from.purpose != VAULT_PURPOSE {
            return Ok(0);
        }
        let _guard = self.write_lock.lock();
        let path = self.credential_path();
        if !path.exists() {
            return Ok(0);
        }

        let envelope = fs::read_to_string(&path)?;
        let record = SecretRecord::from_envelope(envelope.trim())?;
        if record.key_id != from.key_id {
            return Ok(0);
        }

        let plaintext = self.cipher.decrypt(&record)?;
        let migrated = self.cipher.encrypt(&plaintext, VAULT_PURPOSE)?;
        if migrated.key_id != to.key_id {
            warn!(expected = %to.key_id, actual = %migrated.key_id, "Active key changed during re-encryption");
        }
        files::write_atomic(&path, migrated.to_envelope().as_bytes())?;
        info!(from = %from.key_id, to = %migrated.key_id, "Credential re-encrypted");
        Ok(1)
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("config", &self.config)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SearchCriteria;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::config::KeyConfig;
    use crate::crypto::MasterKey;
    use crate::keys::MemoryKeyStore;
    use crate::secret_store::SecretStore;
    use std::collections::HashMap;

    const A: &str = "11111111-aaaa-4bbb-8ccc-222222222222";
    const B: &str = "33333333-dddd-4eee-8fff-444444444444";
    const C: &str = "55555555-eeee-4fff-8aaa-666666666666";
    const ENV_GUID: &str = "99999999-0000-4000-8000-000000000000";

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        keys: Arc<KeyManager>,
        audit: Arc<AuditLedger>,
        vault: Arc<CredentialVault>,
    }

    fn fixture(env: HashMap<&'static str, &'static str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let master = MasterKey::from_secret("vault-test-master-secret-0123456789abcdef").unwrap();
        let checksum_secret = master.checksum_secret().to_vec();
        let keys = Arc::new(KeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            master,
            KeyConfig::default(),
            clock.clone(),
        ));
        let store = Arc::new(SecretStore::new(
            keys.clone(),
            Arc::new(MemoryCache::with_clock(clock.clone())),
        ));
        let audit = Arc::new(AuditLedger::in_memory(clock.clone()));
        let config = VaultConfig {
            storage_dir: dir.path().join("registry"),
            ..VaultConfig::default()
        };
        let vault = CredentialVault::new(store, &checksum_secret, config, "testing", clock.clone())
            .unwrap()
            .with_audit(audit.clone())
            .with_env_lookup(move |name| env.get(name).map(|v| v.to_string()));
        Fixture {
            _dir: dir,
            clock,
            keys,
            audit,
            vault: Arc::new(vault),
        }
    }

    #[test]
    fn test_store_then_get() {
        let f = fixture(HashMap::new());
        f.vault.store(A, None, "ops@example.com").unwrap();

        let credential = f.vault.get().unwrap();
        assert_eq!(credential.primary_secret, A);
        assert_eq!(credential.source, CredentialSource::EncryptedFile);
        assert_eq!(credential.stored_by, "ops@example.com");

        let raw = fs::read_to_string(f.vault.credential_path()).unwrap();
        assert!(!raw.contains(A));
        assert!(raw.starts_with("enc:v1:"));
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let f = fixture(HashMap::new());
        f.vault.store(A, None, "ops").unwrap();
        f.vault.store(B, None, "ops").unwrap();

        let mode = |p: &std::path::Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&f.vault.credential_path()), 0o600);
        assert_eq!(mode(&f.vault.config.storage_dir), 0o700);

        let backups: Vec<_> = fs::read_dir(f.vault.config.storage_dir.join(BACKUP_DIR))
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_invalid_guid_rejected() {
        let f = fixture(HashMap::new());
        assert!(matches!(f.vault.store("not-a-guid", None, "ops"), Err(Error::Validation(_))));
        assert!(matches!(f.vault.store(A, Some("bad"), "ops"), Err(Error::Validation(_))));
        assert!(f.vault.validate(&A.to_uppercase()).is_ok());
    }

    #[test]
    fn test_rotation_moves_primary_to_backup() {
        let f = fixture(HashMap::new());
        f.vault.store(A, None, "ops").unwrap();
        f.vault.rotate(B, Some("scheduled"), "ops").unwrap();

        assert_eq!(f.vault.get_guid().unwrap(), B);
        assert_eq!(f.vault.get_backup_guid().unwrap().as_deref(), Some(A));

        let history = f.vault.rotation_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_preview, "11111111****");
        assert_eq!(history[0].new_preview, "33333333****");
        assert_eq!(history[0].reason.as_deref(), Some("scheduled"));

        let status = f.vault.status();
        assert!(status.configured);
        assert!(status.has_backup);
        assert!(status.rotated_at.is_some());
    }

    #[test]
    fn test_concurrent_rotations_keep_every_primary() {
        let f = fixture(HashMap::new());
        for _ in 0..10 {
            f.vault.store(A, None, "ops").unwrap();
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|s| {
                for next in [B, C] {
                    let vault = &f.vault;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        vault.rotate(next, Some("race"), "ops").unwrap();
                    });
                }
            });

            let credential = f.vault.get().unwrap();
            let mut slots = vec![
                credential.primary_secret.clone(),
                credential.backup_secret.clone().unwrap(),
            ];
            slots.sort();
            assert_eq!(slots, vec![B.to_string(), C.to_string()]);
        }
    }

    #[test]
    fn test_failed_write_leaves_history_untouched() {
        let f = fixture(HashMap::from([("REGISTRY_API_GUID", ENV_GUID)]));
        // a directory in place of the credential file: reads fall back, writes fail
        fs::create_dir_all(f.vault.credential_path()).unwrap();

        assert_eq!(f.vault.get_guid().unwrap(), ENV_GUID);
        assert!(f.vault.rotate(B, Some("scheduled"), "ops").is_err());
        assert!(f.vault.rotation_history(10).unwrap().is_empty());
        assert!(!f.vault.history_path().exists());
    }

    #[test]
    fn test_history_is_capped() {
        let f = fixture(HashMap::new());
        f.vault.store(A, None, "ops").unwrap();
        for i in 0..105 {
            let next = if i % 2 == 0 { B } else { A };
            f.vault.rotate(next, None, "ops").unwrap();
            f.clock.advance(Duration::seconds(1));
        }
        assert_eq!(f.vault.load_history().unwrap().len(), 100);
        assert_eq!(f.vault.rotation_history(5).unwrap().len(), 5);
    }

    #[test]
    fn test_tampered_file_falls_back_to_environment() {
        let f = fixture(HashMap::from([("REGISTRY_API_GUID", ENV_GUID)]));
        f.vault.store(A, None, "ops").unwrap();

        let path = f.vault.credential_path();
        let mut record = SecretRecord::from_envelope(fs::read_to_string(&path).unwrap().trim()).unwrap();
        record.ciphertext[3] ^= 0x10;
        fs::write(&path, record.to_envelope()).unwrap();
        f.vault.clear_cache();

        let credential = f.vault.get().unwrap();
        assert_eq!(credential.primary_secret, ENV_GUID);
        assert_eq!(credential.source, CredentialSource::Environment);

        let events = f
            .audit
            .search(&SearchCriteria::new().event_type("credential_fallback_used"))
            .unwrap();
        assert_eq!(events.total, 1);
        assert_eq!(events.items[0].metadata["reason"], "integrity_failure");
    }

    #[test]
    fn test_checksum_mismatch_falls_back() {
        let f = fixture(HashMap::from([("REGISTRY_API_GUID", ENV_GUID)]));
        // correctly encrypted, but the checksum does not cover these values
        let mut credential = f.vault.build(A, None, "ops", None, None);
        credential.primary_secret = B.to_string();
        let envelope = f
            .vault
            .cipher
            .encrypt_string(&serde_json::to_string(&credential).unwrap(), VAULT_PURPOSE)
            .unwrap();
        files::write_atomic(&f.vault.credential_path(), envelope.as_bytes()).unwrap();

        assert_eq!(f.vault.get_guid().unwrap(), ENV_GUID);
    }

    #[test]
    fn test_unconfigured_without_environment() {
        let f = fixture(HashMap::new());
        assert!(matches!(f.vault.get(), Err(Error::NotFound(_))));
        assert!(!f.vault.status().configured);
        assert!(f.vault.export_masked().is_none());
        assert!(matches!(f.vault.rotate(B, None, "ops"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_export_masked() {
        let f = fixture(HashMap::new());
        f.vault.store(A, Some(B), "ops").unwrap();
        let masked = f.vault.export_masked().unwrap();
        assert_eq!(masked.primary, "11111111-****-****-****-222222222222");
        assert_eq!(masked.backup.as_deref(), Some("33333333-****-****-****-444444444444"));
    }

    #[test]
    fn test_cache_serves_until_ttl() {
        let f = fixture(HashMap::new());
        f.vault.store(A, None, "ops").unwrap();
        f.vault.get().unwrap();

        fs::remove_file(f.vault.credential_path()).unwrap();
        assert_eq!(f.vault.get_guid().unwrap(), A);

        f.clock.advance(Duration::hours(25));
        assert!(f.vault.get().is_err());
    }

    #[test]
    fn test_rotation_reencrypts_vault_file() {
        let f = fixture(HashMap::new());
        f.keys.register_reencryptor(f.vault.clone());
        f.vault.store(A, None, "ops").unwrap();

        let outcome = f.keys.rotate_key(VAULT_PURPOSE).unwrap();
        assert_eq!(outcome.reencrypted_count, 1);

        let record =
            SecretRecord::from_envelope(fs::read_to_string(f.vault.credential_path()).unwrap().trim()).unwrap();
        assert_eq!(record.key_id, outcome.new_key_id);
        f.vault.clear_cache();
        assert_eq!(f.vault.get_guid().unwrap(), A);
    }
}

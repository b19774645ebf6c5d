//! Key management
//!
//! Issues, rotates and revokes the data keys used by the secret store.
//!
//! - Exactly one `active` key per purpose. Rotation and first-use creation
//!   run under a per-purpose lock, so concurrent rotations serialize.
//! - Key material is wrapped with the master key before it reaches a
//!   [`KeyStore`]; the wrapped bytes are all that is ever persisted.
//! - Rotated and revoked keys stay retrievable for decrypting old data until
//!   explicitly purged.

use crate::audit::{AuditEntry, AuditLedger};
use crate::clock::Clock;
use crate::config::KeyConfig;
use crate::crypto::{self, MasterKey};
use crate::error::{Error, Result};
use crate::files;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Key algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// AES-256-GCM data key
    Aes256Gcm,
    /// RSA key pair; bulk payloads use an AES-256-GCM session key
    RsaHybrid,
}

impl KeyAlgorithm {
    /// Short tag used in ciphertext envelopes
    pub fn tag(&self) -> &'static str {
        match self {
            KeyAlgorithm::Aes256Gcm => "aes256gcm",
            KeyAlgorithm::RsaHybrid => "rsa-hybrid",
        }
    }

    /// Parse an envelope tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "aes256gcm" => Some(KeyAlgorithm::Aes256Gcm),
            "rsa-hybrid" => Some(KeyAlgorithm::RsaHybrid),
            _ => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Key lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Used for new ciphertext
    Active,
    /// Superseded, still decrypts
    Rotated,
    /// Terminal
    Revoked,
}

/// Encryption key record
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionKey {
    /// Key identifier
    pub key_id: Uuid,

    /// Algorithm
    pub algorithm: KeyAlgorithm,

    /// SPKI DER public key (RSA only)
    pub public_key: Option<Vec<u8>>,

    /// Symmetric key or PKCS#8 private key, wrapped by the master key
    pub wrapped_key: Vec<u8>,

    /// Logical purpose (e.g. `pii`, `payment`, `credential_vault`)
    pub purpose: String,

    /// Lifecycle status
    pub status: KeyStatus,

    /// Monotonic version within the purpose
    pub version: u32,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Rotation due date
    pub expires_at: DateTime<Utc>,

    /// When the key was superseded
    pub rotated_at: Option<DateTime<Utc>>,

    /// When the key was revoked
    pub revoked_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("purpose", &self.purpose)
            .field("status", &self.status)
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Result of a rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationOutcome {
    /// Purpose rotated
    pub purpose: String,
    /// Previously active key, if any
    pub old_key_id: Option<Uuid>,
    /// Newly active key
    pub new_key_id: Uuid,
    /// Records migrated to the new key by registered re-encryptors
    pub reencrypted_count: usize,
}

/// Key inventory summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyStatistics {
    /// All keys
    pub total: usize,
    /// Active keys
    pub active: usize,
    /// Rotated keys
    pub rotated: usize,
    /// Revoked keys
    pub revoked: usize,
    /// Active keys due for rotation within 30 days
    pub expiring_soon: usize,
    /// Key count per purpose
    pub by_purpose: BTreeMap<String, usize>,
}

/// Persistence for key records
pub trait KeyStore: Send + Sync {
    /// Insert a new key
    fn insert(&self, key: &EncryptionKey) -> Result<()>;

    /// Replace an existing key
    fn update(&self, key: &EncryptionKey) -> Result<()>;

    /// Fetch by id
    fn get(&self, key_id: Uuid) -> Result<Option<EncryptionKey>>;

    /// All keys
    fn list(&self) -> Result<Vec<EncryptionKey>>;

    /// Delete by id. Returns `true` when a key was removed.
    fn remove(&self, key_id: Uuid) -> Result<bool>;

    /// Keys for one purpose
    fn list_by_purpose(&self, purpose: &str) -> Result<Vec<EncryptionKey>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|k| k.purpose == purpose)
            .collect())
    }
}

/// In-memory key store
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<Uuid, EncryptionKey>>,
}

impl MemoryKeyStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn insert(&self, key: &EncryptionKey) -> Result<()> {
        let mut keys = self.keys.write();
        if keys.contains_key(&key.key_id) {
            return Err(Error::Conflict(format!("Key {} already exists", key.key_id)));
        }
        keys.insert(key.key_id, key.clone());
        Ok(())
    }

    fn update(&self, key: &EncryptionKey) -> Result<()> {
        let mut keys = self.keys.write();
        match keys.get_mut(&key.key_id) {
            Some(existing) => {
                *existing = key.clone();
                Ok(())
            }
            None => Err(Error::KeyNotFound(key.key_id.to_string())),
        }
    }

    fn get(&self, key_id: Uuid) -> Result<Option<EncryptionKey>> {
        Ok(self.keys.read().get(&key_id).cloned())
    }

    fn list(&self) -> Result<Vec<EncryptionKey>> {
        Ok(self.keys.read().values().cloned().collect())
    }

    fn remove(&self, key_id: Uuid) -> Result<bool> {
        Ok(self.keys.write().remove(&key_id).is_some())
    }
}

/// Key store persisted as a single bincode snapshot sealed with the master key
pub struct FileKeyStore {
    path: PathBuf,
    master: MasterKey,
    keys: RwLock<HashMap<Uuid, EncryptionKey>>,
}

const KEY_STORE_AAD: &[u8] = b"security-engine/key-store/v1";

impl FileKeyStore {
    /// Open (or create) a key store file
    pub fn open(path: impl Into<PathBuf>, master: MasterKey) -> Result<Self> {
        let path = path.into();
        let keys = if path.exists() {
            Self::load(&path, &master)?
        } else {
            HashMap::new()
        };

        info!("Key store opened: {} ({} keys)", path.display(), keys.len());

        Ok(Self {
            path,
            master,
            keys: RwLock::new(keys),
        })
    }

    fn load(path: &std::path::Path, master: &MasterKey) -> Result<HashMap<Uuid, EncryptionKey>> {
        let data = std::fs::read(path)?;
        if data.len() < crypto::NONCE_LEN + crypto::TAG_LEN {
            return Err(Error::Integrity("Key store file truncated".into()));
        }

        // nonce | tag | ciphertext
        let (nonce, rest) = data.split_at(crypto::NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(crypto::TAG_LEN);
        let plain = Zeroizing::new(crypto::open(
            master.key_bytes(),
            nonce,
            ciphertext,
            tag,
            KEY_STORE_AAD,
        )?);

        let list: Vec<EncryptionKey> = bincode::deserialize(&plain)?;
        Ok(list.into_iter().map(|k| (k.key_id, k)).collect())
    }

    fn save(&self, keys: &HashMap<Uuid, EncryptionKey>) -> Result<()> {
        let list: Vec<&EncryptionKey> = keys.values().collect();
        let serialized = Zeroizing::new(bincode::serialize(&list)?);
        let sealed = crypto::seal(self.master.key_bytes(), &serialized, KEY_STORE_AAD)?;

        let mut data =
            Vec::with_capacity(crypto::NONCE_LEN + crypto::TAG_LEN + sealed.ciphertext.len());
        data.extend_from_slice(&sealed.nonce);
        data.extend_from_slice(&sealed.tag);
        data.extend_from_slice(&sealed.ciphertext);

        files::write_atomic(&self.path, &data)
    }
}

impl fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl KeyStore for FileKeyStore {
    fn insert(&self, key: &EncryptionKey) -> Result<()> {
        let mut keys = self.keys.write();
        if keys.contains_key(&key.key_id) {
            return Err(Error::Conflict(format!("Key {} already exists", key.key_id)));
        }
        keys.insert(key.key_id, key.clone());
        if let Err(e) = self.save(&keys) {
            keys.remove(&key.key_id);
            return Err(e);
        }
        Ok(())
    }

    fn update(&self, key: &EncryptionKey) -> Result<()> {
        let mut keys = self.keys.write();
        let previous = match keys.get(&key.key_id) {
            Some(previous) => previous.clone(),
            None => return Err(Error::KeyNotFound(key.key_id.to_string())),
        };
        keys.insert(key.key_id, key.clone());
        if let Err(e) = self.save(&keys) {
            keys.insert(key.key_id, previous);
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, key_id: Uuid) -> Result<Option<EncryptionKey>> {
        Ok(self.keys.read().get(&key_id).cloned())
    }

    fn list(&self) -> Result<Vec<EncryptionKey>> {
        Ok(self.keys.read().values().cloned().collect())
    }

    fn remove(&self, key_id: Uuid) -> Result<bool> {
        let mut keys = self.keys.write();
        match keys.remove(&key_id) {
            Some(removed) => {
                if let Err(e) = self.save(&keys) {
                    keys.insert(key_id, removed);
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Records that depend on a purpose's key and can migrate on rotation
pub trait Reencryptor: Send + Sync {
    /// Re-encrypt records under `from` with `to`. Returns the migrated count.
    fn reencrypt(&self, keys: &KeyManager, from: &EncryptionKey, to: &EncryptionKey)
        -> Result<usize>;
}

/// Key manager
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    master: MasterKey,
    clock: Arc<dyn Clock>,
    config: KeyConfig,
    audit: Option<Arc<AuditLedger>>,
    active_cache: RwLock<HashMap<String, EncryptionKey>>,
    purpose_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    reencryptors: RwLock<Vec<Arc<dyn Reencryptor>>>,
}

impl KeyManager {
    /// Create a key manager over a store
    pub fn new(
        store: Arc<dyn KeyStore>,
        master: MasterKey,
        config: KeyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            master,
            clock,
            config,
            audit: None,
            active_cache: RwLock::new(HashMap::new()),
            purpose_locks: Mutex::new(HashMap::new()),
            reencryptors: RwLock::new(Vec::new()),
        }
    }

    /// Emit lifecycle events to an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register a dependent that migrates records on rotation
    pub fn register_reencryptor(&self, reencryptor: Arc<dyn Reencryptor>) {
        self.reencryptors.write().push(reencryptor);
    }

    /// Master key used for wrapping and checksums
    pub fn master(&self) -> &MasterKey {
        &self.master
    }

    fn purpose_lock(&self, purpose: &str) -> Arc<Mutex<()>> {
        self.purpose_locks
            .lock()
            .entry(purpose.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn find_active(&self, purpose: &str) -> Result<Option<EncryptionKey>> {
        let mut active: Vec<EncryptionKey> = self
            .store
            .list_by_purpose(purpose)?
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active)
            .collect();

        if active.len() > 1 {
            // Only reachable if the store was written outside this manager
            warn!(purpose = %purpose, count = active.len(), "Multiple active keys for purpose");
            active.sort_by_key(|k| std::cmp::Reverse(k.version));
        }
        Ok(active.into_iter().next())
    }

    fn next_version(&self, purpose: &str) -> Result<u32> {
        Ok(self
            .store
            .list_by_purpose(purpose)?
            .iter()
            .map(|k| k.version)
            .max()
            .unwrap_or(0)
            + 1)
    }

    fn build_key(&self, purpose: &str, algorithm: KeyAlgorithm) -> Result<EncryptionKey> {
        let key_id = Uuid::new_v4();
        let now = self.clock.now();

        let (public_key, material) = match algorithm {
            KeyAlgorithm::Aes256Gcm => (None, Zeroizing::new(crypto::random_bytes(crypto::KEY_LEN))),
            KeyAlgorithm::RsaHybrid => {
                let (private_der, public_der) = crypto::generate_rsa_pair(self.config.rsa_bits)?;
                (Some(public_der), private_der)
            }
        };
        let wrapped_key = self.master.wrap(&material, key_id.as_bytes())?;

        Ok(EncryptionKey {
            key_id,
            algorithm,
            public_key,
            wrapped_key,
            purpose: purpose.to_string(),
            status: KeyStatus::Active,
            version: self.next_version(purpose)?,
            created_at: now,
            expires_at: now + Duration::days(self.config.rotation_days),
            rotated_at: None,
            revoked_at: None,
        })
    }

    fn audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            audit.log(entry);
        }
    }

    /// Generate the first active key for a purpose.
    ///
    /// Fails with `Conflict` if the purpose already has an active key; use
    /// [`KeyManager::rotate_key`] to replace it.
    pub fn generate_key(&self, purpose: &str, algorithm: KeyAlgorithm) -> Result<EncryptionKey> {
        validate_purpose(purpose)?;
        let lock = self.purpose_lock(purpose);
        let _guard = lock.lock();

        if let Some(existing) = self.find_active(purpose)? {
            return Err(Error::Conflict(format!(
                "Purpose {} already has active key {}",
                purpose, existing.key_id
            )));
        }
        self.create_locked(purpose, algorithm)
    }

    fn create_locked(&self, purpose: &str, algorithm: KeyAlgorithm) -> Result<EncryptionKey> {
        let key = self.build_key(purpose, algorithm)?;
        self.store.insert(&key)?;
        self.active_cache
            .write()
            .insert(purpose.to_string(), key.clone());

        info!(purpose = %purpose, key_id = %key.key_id, algorithm = %algorithm, "Encryption key generated");
        self.audit(
            AuditEntry::new("key_generated", format!("Generated {} key for {}", algorithm, purpose))
                .with_resource("encryption_key", key.key_id.to_string())
                .with_metadata(serde_json::json!({
                    "purpose": purpose,
                    "algorithm": algorithm.tag(),
                    "version": key.version,
                })),
        );
        Ok(key)
    }

    /// Active key for a purpose, created as AES-256-GCM on first use
    pub fn active_key(&self, purpose: &str) -> Result<EncryptionKey> {
        if let Some(key) = self.active_cache.read().get(purpose) {
            return Ok(key.clone());
        }

        validate_purpose(purpose)?;
        let lock = self.purpose_lock(purpose);
        let _guard = lock.lock();

        if let Some(key) = self.find_active(purpose)? {
            self.active_cache
                .write()
                .insert(purpose.to_string(), key.clone());
            return Ok(key);
        }
        self.create_locked(purpose, KeyAlgorithm::Aes256Gcm)
    }

    /// Key by id, regardless of status
    pub fn get_key(&self, key_id: Uuid) -> Result<EncryptionKey> {
        self.store
            .get(key_id)?
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }

    /// Keys, optionally restricted to one purpose, newest version first
    pub fn list_keys(&self, purpose: Option<&str>) -> Result<Vec<EncryptionKey>> {
        let mut keys = match purpose {
            Some(purpose) => self.store.list_by_purpose(purpose)?,
            None => self.store.list()?,
        };
        keys.sort_by(|a, b| a.purpose.cmp(&b.purpose).then(b.version.cmp(&a.version)));
        Ok(keys)
    }

    /// Unwrapped key material
    pub(crate) fn key_material(&self, key: &EncryptionKey) -> Result<Zeroizing<Vec<u8>>> {
        self.master
            .unwrap_material(&key.wrapped_key, key.key_id.as_bytes())
    }

    /// Supersede the active key for a purpose.
    ///
    /// The swap happens under the purpose lock: the new key is inserted
    /// first, then the old one is marked `rotated`. If that update fails the
    /// new key is removed again, so a purpose never loses its active key.
    /// Registered re-encryptors run afterwards; their failures are logged and
    /// do not undo the rotation.
    pub fn rotate_key(&self, purpose: &str) -> Result<RotationOutcome> {
        validate_purpose(purpose)?;
        let (old, new) = {
            let lock = self.purpose_lock(purpose);
            let _guard = lock.lock();

            let current = self.find_active(purpose)?;
            let algorithm = current
                .as_ref()
                .map(|k| k.algorithm)
                .unwrap_or(KeyAlgorithm::Aes256Gcm);

            let new = self.build_key(purpose, algorithm)?;
            self.store.insert(&new)?;
            if let Some(current) = &current {
                let mut rotated = current.clone();
                rotated.status = KeyStatus::Rotated;
                rotated.rotated_at = Some(self.clock.now());
                if let Err(e) = self.store.update(&rotated) {
                    error!(
                        purpose = %purpose,
                        key_id = %current.key_id,
                        error = %e,
                        "Failed to retire key, rolling back rotation"
                    );
                    if let Err(undo) = self.store.remove(new.key_id) {
                        error!(key_id = %new.key_id, error = %undo, "Failed to remove replacement key");
                    }
                    return Err(e);
                }
            }
            self.active_cache
                .write()
                .insert(purpose.to_string(), new.clone());

            (current, new)
        };

        let mut reencrypted_count = 0;
        if let Some(old) = &old {
            let reencryptors: Vec<Arc<dyn Reencryptor>> = self.reencryptors.read().clone();
            for reencryptor in reencryptors {
                match reencryptor.reencrypt(self, old, &new) {
                    Ok(count) => reencrypted_count += count,
                    Err(e) => warn!(purpose = %purpose, error = %e, "Re-encryption after rotation failed"),
                }
            }
        }

        let outcome = RotationOutcome {
            purpose: purpose.to_string(),
            old_key_id: old.as_ref().map(|k| k.key_id),
            new_key_id: new.key_id,
            reencrypted_count,
        };

        info!(
            purpose = %purpose,
            new_key_id = %outcome.new_key_id,
            reencrypted = reencrypted_count,
            "Encryption key rotated"
        );
        self.audit(
            AuditEntry::new("key_rotated", format!("Rotated key for {}", purpose))
                .with_resource("encryption_key", new.key_id.to_string())
                .with_metadata(serde_json::json!({
                    "purpose": purpose,
                    "old_key_id": outcome.old_key_id,
                    "new_key_id": outcome.new_key_id,
                    "reencrypted_count": reencrypted_count,
                })),
        );
        Ok(outcome)
    }

    /// Revoke a key. Revoked keys still decrypt until purged.
    pub fn revoke_key(&self, key_id: Uuid) -> Result<EncryptionKey> {
        let key = self.get_key(key_id)?;
        let lock = self.purpose_lock(&key.purpose);
        let _guard = lock.lock();

        // re-read under the lock
        let mut key = self.get_key(key_id)?;
        if key.status == KeyStatus::Revoked {
            return Err(Error::AlreadyRevoked(key_id.to_string()));
        }
        key.status = KeyStatus::Revoked;
        key.revoked_at = Some(self.clock.now());
        self.store.update(&key)?;
        self.active_cache.write().remove(&key.purpose);

        warn!(purpose = %key.purpose, key_id = %key_id, "Encryption key revoked");
        self.audit(
            AuditEntry::new("key_revoked", format!("Revoked key for {}", key.purpose))
                .with_resource("encryption_key", key_id.to_string())
                .with_metadata(serde_json::json!({ "purpose": key.purpose })),
        );
        Ok(key)
    }

    /// Destroy a revoked key. Ciphertext under it becomes unrecoverable.
    pub fn purge_key(&self, key_id: Uuid) -> Result<()> {
        let key = self.get_key(key_id)?;
        if key.status != KeyStatus::Revoked {
            return Err(Error::Conflict(format!(
                "Key {} must be revoked before it can be purged",
                key_id
            )));
        }
        self.store.remove(key_id)?;

        warn!(purpose = %key.purpose, key_id = %key_id, "Encryption key purged");
        self.audit(
            AuditEntry::new("key_purged", format!("Purged key for {}", key.purpose))
                .with_resource("encryption_key", key_id.to_string()),
        );
        Ok(())
    }

    /// Rotate every active key due within `within_days`
    pub fn rotate_expiring(&self, within_days: i64) -> Result<Vec<RotationOutcome>> {
        let horizon = self.clock.now() + Duration::days(within_days);
        let due: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active && k.expires_at <= horizon)
            .map(|k| k.purpose)
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for purpose in due {
            outcomes.push(self.rotate_key(&purpose)?);
        }
        Ok(outcomes)
    }

    /// Inventory summary
    pub fn statistics(&self) -> Result<KeyStatistics> {
        let horizon = self.clock.now() + Duration::days(30);
        let mut stats = KeyStatistics::default();

        for key in self.store.list()? {
            stats.total += 1;
            match key.status {
                KeyStatus::Active => {
                    stats.active += 1;
                    if key.expires_at <= horizon {
                        stats.expiring_soon += 1;
                    }
                }
                KeyStatus::Rotated => stats.rotated += 1,
                KeyStatus::Revoked => stats.revoked += 1,
            }
            *stats.by_purpose.entry(key.purpose).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate_purpose(purpose: &str) -> Result<()> {
    let valid = !purpose.is_empty()
        && purpose.len() <= 64
        && purpose
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid key purpose: {:?}", purpose)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager() -> (Arc<ManualClock>, KeyManager) {
        let clock = ManualClock::starting_now();
        let config = KeyConfig {
            rsa_bits: 1024,
            ..KeyConfig::default()
        };
        let master = MasterKey::from_secret("unit-test-master-secret-0123456789abcdef").unwrap();
        let manager = KeyManager::new(Arc::new(MemoryKeyStore::new()), master, config, clock.clone());
        (clock, manager)
    }

    #[test]
    fn test_active_key_created_on_first_use() {
        let (_, keys) = manager();
        let first = keys.active_key("pii").unwrap();
        let again = keys.active_key("pii").unwrap();
        assert_eq!(first.key_id, again.key_id);
        assert_eq!(first.algorithm, KeyAlgorithm::Aes256Gcm);
        assert_eq!(first.status, KeyStatus::Active);
        assert_eq!(first.version, 1);
        assert_eq!(first.expires_at - first.created_at, Duration::days(90));
    }

    #[test]
    fn test_generate_conflicts_with_active() {
        let (_, keys) = manager();
        keys.generate_key("payment", KeyAlgorithm::Aes256Gcm).unwrap();
        let err = keys
            .generate_key("payment", KeyAlgorithm::Aes256Gcm)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_wrapped_material_is_not_plaintext() {
        let (_, keys) = manager();
        let key = keys.active_key("pii").unwrap();
        let material = keys.key_material(&key).unwrap();
        assert_eq!(material.len(), crypto::KEY_LEN);
        assert!(!key
            .wrapped_key
            .windows(material.len())
            .any(|w| w == &material[..]));
    }

    #[test]
    fn test_rotate_marks_old_rotated() {
        let (_, keys) = manager();
        let old = keys.active_key("pii").unwrap();
        let outcome = keys.rotate_key("pii").unwrap();

        assert_eq!(outcome.old_key_id, Some(old.key_id));
        assert_ne!(outcome.new_key_id, old.key_id);
        assert_eq!(keys.get_key(old.key_id).unwrap().status, KeyStatus::Rotated);
        assert_eq!(keys.active_key("pii").unwrap().key_id, outcome.new_key_id);
        assert_eq!(keys.active_key("pii").unwrap().version, 2);
    }

    #[test]
    fn test_rotation_keeps_algorithm() {
        let (_, keys) = manager();
        keys.generate_key("documents", KeyAlgorithm::RsaHybrid).unwrap();
        let outcome = keys.rotate_key("documents").unwrap();
        let new = keys.get_key(outcome.new_key_id).unwrap();
        assert_eq!(new.algorithm, KeyAlgorithm::RsaHybrid);
        assert!(new.public_key.is_some());
    }

    #[test]
    fn test_revoke_twice_fails() {
        let (_, keys) = manager();
        let key = keys.active_key("pii").unwrap();
        keys.revoke_key(key.key_id).unwrap();
        let err = keys.revoke_key(key.key_id).unwrap_err();
        assert!(matches!(err, Error::AlreadyRevoked(_)));

        // revoked active key is replaced on next use
        let next = keys.active_key("pii").unwrap();
        assert_ne!(next.key_id, key.key_id);
    }

    #[test]
    fn test_purge_requires_revocation() {
        let (_, keys) = manager();
        let key = keys.active_key("pii").unwrap();
        assert!(matches!(keys.purge_key(key.key_id), Err(Error::Conflict(_))));

        keys.revoke_key(key.key_id).unwrap();
        keys.purge_key(key.key_id).unwrap();
        assert!(matches!(keys.get_key(key.key_id), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_rotate_expiring() {
        let (clock, keys) = manager();
        keys.active_key("pii").unwrap();
        clock.advance(Duration::days(30));
        keys.active_key("payment").unwrap();

        clock.advance(Duration::days(55));
        // pii due in 5 days, payment in 35
        let outcomes = keys.rotate_expiring(7).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].purpose, "pii");

        let stats = keys.statistics().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.rotated, 1);
        assert_eq!(stats.by_purpose.get("pii"), Some(&2));
    }

    #[test]
    fn test_invalid_purpose() {
        let (_, keys) = manager();
        assert!(matches!(keys.active_key(""), Err(Error::Validation(_))));
        assert!(matches!(keys.active_key("a:b"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        let master = MasterKey::from_secret("file-store-master-secret-0123456789abcd").unwrap();

        let key_id = {
            let store = FileKeyStore::open(&path, master.clone()).unwrap();
            let keys = KeyManager::new(
                Arc::new(store),
                master.clone(),
                KeyConfig::default(),
                crate::clock::system(),
            );
            keys.active_key("pii").unwrap().key_id
        };

        let reopened = FileKeyStore::open(&path, master).unwrap();
        let key = reopened.get(key_id).unwrap().unwrap();
        assert_eq!(key.purpose, "pii");

        let wrong = MasterKey::from_secret("some-other-master-secret-0123456789abcd").unwrap();
        assert!(matches!(FileKeyStore::open(&path, wrong), Err(Error::Integrity(_))));
    }

    struct FlakyKeyStore {
        inner: MemoryKeyStore,
        fail_insert: AtomicBool,
        fail_update: AtomicBool,
    }

    impl FlakyKeyStore {
        fn new() -> Self {
            Self {
                inner: MemoryKeyStore::new(),
                fail_insert: AtomicBool::new(false),
                fail_update: AtomicBool::new(false),
            }
        }
    }

    impl KeyStore for FlakyKeyStore {
        fn insert(&self, key: &EncryptionKey) -> Result<()> {
            if self.fail_insert.load(Ordering::SeqCst) {
                return Err(Error::Storage("insert refused".into()));
            }
            self.inner.insert(key)
        }
        fn update(&self, key: &EncryptionKey) -> Result<()> {
            if self.fail_update.load(Ordering::SeqCst) {
                return Err(Error::Storage("update refused".into()));
            }
            self.inner.update(key)
        }
        fn get(&self, key_id: Uuid) -> Result<Option<EncryptionKey>> {
            self.inner.get(key_id)
        }
        fn list(&self) -> Result<Vec<EncryptionKey>> {
            self.inner.list()
        }
        fn remove(&self, key_id: Uuid) -> Result<bool> {
            self.inner.remove(key_id)
        }
    }

    fn flaky_manager() -> (Arc<FlakyKeyStore>, KeyManager) {
        let store = Arc::new(FlakyKeyStore::new());
        let master = MasterKey::from_secret("unit-test-master-secret-0123456789abcdef").unwrap();
        let config = KeyConfig {
            rsa_bits: 1024,
            ..KeyConfig::default()
        };
        let manager = KeyManager::new(store.clone(), master, config, ManualClock::starting_now());
        (store, manager)
    }

    fn active_ids(store: &FlakyKeyStore, purpose: &str) -> Vec<Uuid> {
        store
            .list_by_purpose(purpose)
            .unwrap()
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active)
            .map(|k| k.key_id)
            .collect()
    }

    #[test]
    fn test_failed_insert_keeps_old_key_active() {
        let (store, keys) = flaky_manager();
        let original = keys.active_key("pii").unwrap();

        store.fail_insert.store(true, Ordering::SeqCst);
        assert!(matches!(keys.rotate_key("pii"), Err(Error::Storage(_))));

        assert_eq!(active_ids(&store, "pii"), vec![original.key_id]);
        assert_eq!(keys.active_key("pii").unwrap().key_id, original.key_id);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_retire_rolls_back_new_key() {
        let (store, keys) = flaky_manager();
        let original = keys.active_key("pii").unwrap();

        store.fail_update.store(true, Ordering::SeqCst);
        assert!(matches!(keys.rotate_key("pii"), Err(Error::Storage(_))));

        assert_eq!(active_ids(&store, "pii"), vec![original.key_id]);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(keys.active_key("pii").unwrap().key_id, original.key_id);

        store.fail_update.store(false, Ordering::SeqCst);
        let outcome = keys.rotate_key("pii").unwrap();
        assert_eq!(outcome.old_key_id, Some(original.key_id));
        assert_eq!(active_ids(&store, "pii"), vec![outcome.new_key_id]);
    }
}

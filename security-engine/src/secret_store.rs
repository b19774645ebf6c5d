//! Secret store
//!
//! Envelope encryption over the key manager's per-purpose data keys.
//!
//! - AES-256-GCM keys: fresh nonce per call, key id bound as associated data
//! - RSA keys: OAEP directly when the payload fits, otherwise a random
//!   AES-256-GCM session key wrapped by the RSA public key
//! - Tags are always verified before plaintext is returned
//!
//! Records serialize to a single-line string envelope:
//!
//! ```text
//! enc:v1:<key_id>:<alg>:<b64 nonce>:<b64 tag>:<b64 ciphertext>
//! ```
//!
//! For hybrid records the ciphertext part is `<b64 wrapped key>::<b64 ciphertext>`.

use crate::audit::{AuditEntry, AuditLedger};
use crate::cache::KeyValueCache;
use crate::crypto;
use crate::error::{Error, Result};
use crate::keys::{EncryptionKey, KeyAlgorithm, KeyManager, KeyStatus};
use crate::masking::{self, MaskKind};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

const ENVELOPE_PREFIX: &str = "enc:v1:";
const HYBRID_DELIMITER: &str = "::";
const TOKEN_PREFIX: &str = "tok_";
const TOKEN_CACHE_PREFIX: &str = "secret_token:";
const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const TOKENIZATION_PURPOSE: &str = "tokenization";

type HmacSha256 = Hmac<Sha256>;

/// Ciphertext plus everything needed to decrypt it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Key that produced the ciphertext
    pub key_id: Uuid,

    /// Algorithm of that key
    pub algorithm: KeyAlgorithm,

    /// AES-GCM nonce (empty for direct RSA)
    pub nonce: Vec<u8>,

    /// AES-GCM tag (empty for direct RSA)
    pub tag: Vec<u8>,

    /// Ciphertext
    pub ciphertext: Vec<u8>,

    /// RSA-wrapped session key for hybrid records
    pub wrapped_data_key: Option<Vec<u8>>,
}

impl SecretRecord {
    /// Serialize to the string envelope
    pub fn to_envelope(&self) -> String {
        let body = match &self.wrapped_data_key {
            Some(wrapped) => format!(
                "{}{}{}",
                B64.encode(wrapped),
                HYBRID_DELIMITER,
                B64.encode(&self.ciphertext)
            ),
            None => B64.encode(&self.ciphertext),
        };
        format!(
            "{}{}:{}:{}:{}:{}",
            ENVELOPE_PREFIX,
            self.key_id,
            self.algorithm.tag(),
            B64.encode(&self.nonce),
            B64.encode(&self.tag),
            body
        )
    }

    /// Parse a string envelope
    pub fn from_envelope(envelope: &str) -> Result<Self> {
        let rest = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| Error::Validation("Not an encrypted envelope".into()))?;

        let parts: Vec<&str> = rest.splitn(5, ':').collect();
        if parts.len() != 5 {
            return Err(Error::Validation("Truncated encrypted envelope".into()));
        }

        let key_id = Uuid::parse_str(parts[0])
            .map_err(|_| Error::Validation("Envelope key id is not a UUID".into()))?;
        let algorithm = KeyAlgorithm::from_tag(parts[1])
            .ok_or_else(|| Error::Validation(format!("Unknown envelope algorithm {}", parts[1])))?;
        let nonce = decode_part(parts[2])?;
        let tag = decode_part(parts[3])?;

        let (wrapped_data_key, ciphertext) = match parts[4].split_once(HYBRID_DELIMITER) {
            Some((wrapped, body)) => (Some(decode_part(wrapped)?), decode_part(body)?),
            None => (None, decode_part(parts[4])?),
        };

        Ok(Self {
            key_id,
            algorithm,
            nonce,
            tag,
            ciphertext,
            wrapped_data_key,
        })
    }

    /// Hybrid (RSA-wrapped session key) record
    pub fn is_hybrid(&self) -> bool {
        self.wrapped_data_key.is_some()
    }
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("ciphertext_len", &self.ciphertext.len())
            .field("hybrid", &self.is_hybrid())
            .finish()
    }
}

fn decode_part(part: &str) -> Result<Vec<u8>> {
    B64.decode(part)
        .map_err(|_| Error::Validation("Envelope contains invalid base64".into()))
}

/// Encrypt/decrypt seam consumed by the vault and the field encryptor
pub trait SecretCipher: Send + Sync {
    /// Encrypt under the active key for `purpose`
    fn encrypt(&self, plaintext: &[u8], purpose: &str) -> Result<SecretRecord>;

    /// Decrypt, verifying integrity first
    fn decrypt(&self, record: &SecretRecord) -> Result<Zeroizing<Vec<u8>>>;

    /// Encrypt a string into an envelope
    fn encrypt_string(&self, plaintext: &str, purpose: &str) -> Result<String> {
        Ok(self.encrypt(plaintext.as_bytes(), purpose)?.to_envelope())
    }

    /// Decrypt an envelope into a string
    fn decrypt_string(&self, envelope: &str) -> Result<Zeroizing<String>> {
        let record = SecretRecord::from_envelope(envelope)?;
        let plaintext = self.decrypt(&record)?;
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| Error::Serialization("Decrypted value is not UTF-8".into()))?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

/// Outcome of a bulk decrypt
#[derive(Debug, Default)]
pub struct BatchDecryption {
    /// One slot per input, `None` where decryption failed
    pub values: Vec<Option<Zeroizing<String>>>,

    /// Number of failed inputs
    pub failures: usize,
}

/// Secret store
pub struct SecretStore {
    keys: Arc<KeyManager>,
    cache: Arc<dyn KeyValueCache>,
    audit: Option<Arc<AuditLedger>>,
}

impl SecretStore {
    /// Create a store over a key manager and the shared cache
    pub fn new(keys: Arc<KeyManager>, cache: Arc<dyn KeyValueCache>) -> Self {
        Self {
            keys,
            cache,
            audit: None,
        }
    }

    /// Emit events to an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Underlying key manager
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    fn encrypt_with(&self, key: &EncryptionKey, plaintext: &[u8]) -> Result<SecretRecord> {
        match key.algorithm {
            KeyAlgorithm::Aes256Gcm => {
                let material = self.keys.key_material(key)?;
                let sealed = crypto::seal(&material, plaintext, key.key_id.as_bytes())?;
                Ok(SecretRecord {
                    key_id: key.key_id,
                    algorithm: key.algorithm,
                    nonce: sealed.nonce,
                    tag: sealed.tag,
                    ciphertext: sealed.ciphertext,
                    wrapped_data_key: None,
                })
            }
            KeyAlgorithm::RsaHybrid => {
                let public = key
                    .public_key
                    .as_deref()
                    .ok_or_else(|| Error::Crypto(format!("Key {} has no public half", key.key_id)))?;

                if plaintext.len() <= crypto::rsa_max_payload(public)? {
                    return Ok(SecretRecord {
                        key_id: key.key_id,
                        algorithm: key.algorithm,
                        nonce: Vec::new(),
                        tag: Vec::new(),
                        ciphertext: crypto::rsa_encrypt(public, plaintext)?,
                        wrapped_data_key: None,
                    });
                }

                let session_key = Zeroizing::new(crypto::random_bytes(crypto::KEY_LEN));
                let sealed = crypto::seal(&session_key, plaintext, key.key_id.as_bytes())?;
                Ok(SecretRecord {
                    key_id: key.key_id,
                    algorithm: key.algorithm,
                    nonce: sealed.nonce,
                    tag: sealed.tag,
                    ciphertext: sealed.ciphertext,
                    wrapped_data_key: Some(crypto::rsa_encrypt(public, &session_key)?),
                })
            }
        }
    }

    fn decrypt_with(&self, key: &EncryptionKey, record: &SecretRecord) -> Result<Zeroizing<Vec<u8>>> {
        if key.algorithm != record.algorithm {
            return Err(Error::Integrity(format!(
                "Record algorithm {} does not match key {}",
                record.algorithm, key.key_id
            )));
        }
        let material = self.keys.key_material(key)?;
        let aad = key.key_id.as_bytes();

        let plaintext = match (key.algorithm, &record.wrapped_data_key) {
            (KeyAlgorithm::Aes256Gcm, None) => {
                crypto::open(&material, &record.nonce, &record.ciphertext, &record.tag, aad)?
            }
            (KeyAlgorithm::Aes256Gcm, Some(_)) => {
                return Err(Error::Integrity("Symmetric record carries a wrapped key".into()))
            }
            (KeyAlgorithm::RsaHybrid, None) => crypto::rsa_decrypt(&material, &record.ciphertext)?,
            (KeyAlgorithm::RsaHybrid, Some(wrapped)) => {
                let session_key = Zeroizing::new(crypto::rsa_decrypt(&material, wrapped)?);
                if session_key.len() != crypto::KEY_LEN {
                    return Err(Error::Integrity("Wrapped session key has wrong length".into()));
                }
                crypto::open(&session_key, &record.nonce, &record.ciphertext, &record.tag, aad)?
            }
        };
        Ok(Zeroizing::new(plaintext))
    }

    /// Decrypt under a revoked key.
    ///
    /// Plain [`SecretCipher::decrypt`] refuses revoked keys. This path exists
    /// for recovering old data before a purge and is always audited.
    pub fn decrypt_revoked(&self, record: &SecretRecord, actor: &str, reason: &str) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.keys.get_key(record.key_id)?;
        let plaintext = self.decrypt_with(&key, record)?;

        warn!(key_id = %key.key_id, purpose = %key.purpose, actor = %actor, "Decrypted under revoked key");
        if let Some(audit) = &self.audit {
            audit.log(
                AuditEntry::new("revoked_key_decrypt", format!("Recovered data under revoked key: {}", reason))
                    .with_actor_id(actor)
                    .with_resource("encryption_key", key.key_id.to_string())
                    .with_metadata(serde_json::json!({
                        "purpose": key.purpose,
                        "status": key.status,
                        "reason": reason,
                    })),
            );
        }
        Ok(plaintext)
    }

    /// Decrypt many envelopes. Failures are logged and counted, never fatal.
    pub fn decrypt_batch<S: AsRef<str>>(&self, envelopes: &[S]) -> BatchDecryption {
        let mut outcome = BatchDecryption::default();
        for (index, envelope) in envelopes.iter().enumerate() {
            match self.decrypt_string(envelope.as_ref()) {
                Ok(value) => outcome.values.push(Some(value)),
                Err(e) => {
                    warn!(index, error = %e, "Skipping record that failed to decrypt");
                    outcome.failures += 1;
                    outcome.values.push(None);
                }
            }
        }
        outcome
    }

    /// Re-encrypt a record under the current active key of its purpose.
    ///
    /// Returns `None` when the record already uses the active key.
    pub fn reencrypt(&self, record: &SecretRecord) -> Result<Option<SecretRecord>> {
        let key = self.keys.get_key(record.key_id)?;
        let active = self.keys.active_key(&key.purpose)?;
        if active.key_id == key.key_id {
            return Ok(None);
        }
        let plaintext = self.decrypt(record)?;
        Ok(Some(self.encrypt_with(&active, &plaintext)?))
    }

    /// Envelope shape check, used to avoid double encryption
    pub fn is_encrypted(&self, value: &str) -> bool {
        SecretRecord::from_envelope(value).is_ok()
    }

    /// Display-safe partial redaction
    pub fn mask(&self, value: &str, kind: MaskKind) -> String {
        masking::mask(value, kind)
    }

    /// Swap a value for an opaque handle valid for 24 hours
    pub fn tokenize(&self, value: &str) -> Result<String> {
        let token = format!("{}{}", TOKEN_PREFIX, crypto::random_alphanumeric(32));
        let envelope = self.encrypt_string(value, TOKENIZATION_PURPOSE)?;
        self.cache
            .put(&format!("{}{}", TOKEN_CACHE_PREFIX, token), envelope, TOKEN_TTL)?;
        debug!("Value tokenized");
        Ok(token)
    }

    /// Resolve a handle issued by [`SecretStore::tokenize`]
    pub fn detokenize(&self, token: &str) -> Result<Zeroizing<String>> {
        if !token.starts_with(TOKEN_PREFIX) {
            return Err(Error::Validation("Not a secret token".into()));
        }
        let envelope = self
            .cache
            .get(&format!("{}{}", TOKEN_CACHE_PREFIX, token))?
            .ok_or_else(|| Error::NotFound("Token not found or expired".into()))?;
        self.decrypt_string(&envelope)
    }

    /// Deterministic keyed digest for equality lookups on encrypted columns
    pub fn hash_for_search(&self, value: &str) -> Result<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.keys.master().checksum_secret())
            .map_err(|e| Error::Crypto(format!("HMAC key rejected: {}", e)))?;
        mac.update(value.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Salted one-way hash, formatted `<salt hex>$<digest hex>`
    pub fn hash(&self, value: &str) -> String {
        let salt = hex::encode(crypto::random_bytes(16));
        let digest = self.salted_digest(&salt, value);
        format!("{}${}", salt, digest)
    }

    /// Verify a value against [`SecretStore::hash`] output in constant time
    pub fn verify_hash(&self, value: &str, stored: &str) -> bool {
        let Some((salt, digest)) = stored.split_once('$') else {
            return false;
        };
        let expected = self.salted_digest(salt, value);
        crypto::ct_eq(expected.as_bytes(), digest.as_bytes())
    }

    fn salted_digest(&self, salt: &str, value: &str) -> String {
        crypto::sha256_hex_parts(&[
            salt.as_bytes(),
            value.as_bytes(),
            self.keys.master().checksum_secret(),
        ])
    }
}

impl SecretCipher for SecretStore {
    fn encrypt(&self, plaintext: &[u8], purpose: &str) -> Result<SecretRecord> {
        let key = self.keys.active_key(purpose)?;
        self.encrypt_with(&key, plaintext)
    }

    fn decrypt(&self, record: &SecretRecord) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.keys.get_key(record.key_id)?;
        if key.status == KeyStatus::Revoked {
            return Err(Error::KeyRevoked(key.key_id.to_string()));
        }
        self.decrypt_with(&key, record)
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::config::KeyConfig;
    use crate::crypto::MasterKey;
    use crate::keys::MemoryKeyStore;

    fn store() -> (Arc<ManualClock>, SecretStore) {
        let clock = ManualClock::starting_now();
        let master = MasterKey::from_secret("secret-store-test-master-0123456789abcdef").unwrap();
        let config = KeyConfig {
            rsa_bits: 1024,
            ..KeyConfig::default()
        };
        let keys = Arc::new(KeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            master,
            config,
            clock.clone(),
        ));
        let cache = Arc::new(MemoryCache::with_clock(clock.clone()));
        (clock, SecretStore::new(keys, cache))
    }

    #[test]
    fn test_symmetric_roundtrip() {
        let (_, store) = store();
        let record = store.encrypt(b"tax file number 123 456 782", "pii").unwrap();
        assert_eq!(record.algorithm, KeyAlgorithm::Aes256Gcm);
        assert_eq!(record.nonce.len(), crypto::NONCE_LEN);
        assert_eq!(&store.decrypt(&record).unwrap()[..], b"tax file number 123 456 782");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let (_, store) = store();
        let a = store.encrypt(b"same", "pii").unwrap();
        let b = store.encrypt(b"same", "pii").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_rsa_direct_and_hybrid() {
        let (_, store) = store();
        store
            .keys()
            .generate_key("documents", KeyAlgorithm::RsaHybrid)
            .unwrap();

        let small = store.encrypt(b"short", "documents").unwrap();
        assert!(!small.is_hybrid());
        assert_eq!(&store.decrypt(&small).unwrap()[..], b"short");

        let large = vec![7u8; 4096];
        let record = store.encrypt(&large, "documents").unwrap();
        assert!(record.is_hybrid());
        assert_eq!(&store.decrypt(&record).unwrap()[..], &large[..]);

        let envelope = record.to_envelope();
        assert!(envelope.contains(HYBRID_DELIMITER));
        let parsed = SecretRecord::from_envelope(&envelope).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_tamper_is_integrity_error() {
        let (_, store) = store();
        let mut record = store.encrypt(b"account 062-000 1234 5678", "payment").unwrap();
        record.ciphertext[0] ^= 0x01;
        assert!(matches!(store.decrypt(&record), Err(Error::Integrity(_))));

        let mut record = store.encrypt(b"account 062-000 1234 5678", "payment").unwrap();
        record.tag[15] ^= 0x80;
        assert!(matches!(store.decrypt(&record), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_unknown_and_revoked_keys() {
        let (_, store) = store();
        let mut record = store.encrypt(b"x", "pii").unwrap();

        store.keys().revoke_key(record.key_id).unwrap();
        assert!(matches!(store.decrypt(&record), Err(Error::KeyRevoked(_))));
        let recovered = store.decrypt_revoked(&record, "ops", "pre-purge export").unwrap();
        assert_eq!(&recovered[..], b"x");

        record.key_id = Uuid::new_v4();
        assert!(matches!(store.decrypt(&record), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_rotated_key_still_decrypts_and_reencrypts() {
        let (_, store) = store();
        let record = store.encrypt(b"legacy", "pii").unwrap();
        store.keys().rotate_key("pii").unwrap();

        assert_eq!(&store.decrypt(&record).unwrap()[..], b"legacy");
        let migrated = store.reencrypt(&record).unwrap().unwrap();
        assert_ne!(migrated.key_id, record.key_id);
        assert_eq!(&store.decrypt(&migrated).unwrap()[..], b"legacy");
        assert!(store.reencrypt(&migrated).unwrap().is_none());
    }

    #[test]
    fn test_is_encrypted() {
        let (_, store) = store();
        let envelope = store.encrypt_string("hello", "pii").unwrap();
        assert!(store.is_encrypted(&envelope));
        assert!(!store.is_encrypted("hello"));
        assert!(!store.is_encrypted("enc:v1:not-a-uuid:aes256gcm:::"));
    }

    #[test]
    fn test_decrypt_batch_continues_past_failures() {
        let (_, store) = store();
        let good = store.encrypt_string("one", "pii").unwrap();
        let batch = store.decrypt_batch(&[good.as_str(), "garbage", good.as_str()]);
        assert_eq!(batch.failures, 1);
        assert_eq!(batch.values.len(), 3);
        assert!(batch.values[1].is_none());
        assert_eq!(batch.values[2].as_deref().map(|s| s.as_str()), Some("one"));
    }

    #[test]
    fn test_tokenize_expires_after_a_day() {
        let (clock, store) = store();
        let token = store.tokenize("4111111111111111").unwrap();
        assert!(token.starts_with("tok_"));
        assert_eq!(store.detokenize(&token).unwrap().as_str(), "4111111111111111");

        clock.advance(chrono::Duration::hours(25));
        assert!(matches!(store.detokenize(&token), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_hashes() {
        let (_, store) = store();
        assert_eq!(
            store.hash_for_search("a@b.com").unwrap(),
            store.hash_for_search("a@b.com").unwrap()
        );

        let stored = store.hash("123-45-6789");
        assert!(store.verify_hash("123-45-6789", &stored));
        assert!(!store.verify_hash("123-45-6780", &stored));
        assert!(!store.verify_hash("123-45-6789", "no-separator"));
        assert_ne!(store.hash("123-45-6789"), stored);
    }
}

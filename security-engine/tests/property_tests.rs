//! Property-based tests for security engine invariants
//!
//! - Round-trip: decrypt(encrypt(p)) == p for every key algorithm
//! - Tamper evidence: any flipped ciphertext or tag bit is an integrity error
//! - Redaction: denylisted values never reach the audit sink

use proptest::prelude::*;
use security_engine::{
    audit::SearchCriteria,
    config::KeyConfig,
    crypto::MasterKey,
    keys::MemoryKeyStore,
    AuditEntry, AuditLedger, Error, KeyAlgorithm, KeyManager, ManualClock, MemoryCache, SecretCipher,
    SecretRecord, SecretStore,
};
use serde_json::json;
use std::sync::{Arc, OnceLock};

/// RSA key generation is slow, so one store serves every case
fn shared_store() -> &'static SecretStore {
    static STORE: OnceLock<SecretStore> = OnceLock::new();
    STORE.get_or_init(|| {
        let clock = ManualClock::starting_now();
        let master = MasterKey::from_secret("property-test-master-secret-0123456789abcdef").unwrap();
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
        keys.generate_key("documents", KeyAlgorithm::RsaHybrid).unwrap();
        SecretStore::new(keys, Arc::new(MemoryCache::with_clock(clock)))
    })
}

/// Strategy for key purposes backed by each algorithm
fn purpose_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("pii"), Just("payment"), Just("documents")]
}

/// Strategy for denylisted field names in mixed case
fn sensitive_field_strategy() -> impl Strategy<Value = String> {
    (
        prop_oneof![
            Just("password"),
            Just("api_key"),
            Just("token"),
            Just("secret"),
            Just("card_number"),
            Just("cvv"),
        ],
        any::<bool>(),
    )
        .prop_map(|(name, upper)| if upper { name.to_uppercase() } else { name.to_string() })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_bytes_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 0..600),
        purpose in purpose_strategy(),
    ) {
        let store = shared_store();
        let record = store.encrypt(&plaintext, purpose).unwrap();
        let decrypted = store.decrypt(&record).unwrap();
        prop_assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn prop_envelope_roundtrip(text in "\\PC{0,200}", purpose in purpose_strategy()) {
        let store = shared_store();
        let envelope = store.encrypt_string(&text, purpose).unwrap();
        prop_assert!(store.is_encrypted(&envelope));
        let decrypted = store.decrypt_string(&envelope).unwrap();
        prop_assert_eq!(decrypted.as_str(), text.as_str());
    }

    #[test]
    fn prop_tampered_record_is_integrity_error(
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        position in any::<usize>(),
        mask in 1u8..=255,
        flip_tag in any::<bool>(),
    ) {
        let store = shared_store();
        let mut record: SecretRecord = store.encrypt(&plaintext, "pii").unwrap();
        if flip_tag {
            let i = position % record.tag.len();
            record.tag[i] ^= mask;
        } else {
            let i = position % record.ciphertext.len();
            record.ciphertext[i] ^= mask;
        }
        prop_assert!(matches!(store.decrypt(&record), Err(Error::Integrity(_))));
    }

    #[test]
    fn prop_redacted_values_never_persist(
        field in sensitive_field_strategy(),
        value in "[A-Za-z0-9]{12,24}",
        nested in any::<bool>(),
    ) {
        let secret = format!("zz-secret-{}", value);
        let ledger = AuditLedger::in_memory(ManualClock::starting_now());

        let mut leaf = serde_json::Map::new();
        leaf.insert(field, json!(secret));
        let payload = if nested {
            json!({ "request": { "items": [leaf] } })
        } else {
            serde_json::Value::Object(leaf)
        };
        ledger.log(
            AuditEntry::new("profile_updated", "Profile updated")
                .with_actor_id("u1")
                .with_new_values(payload.clone())
                .with_metadata(payload),
        );

        let page = ledger.search(&SearchCriteria::new()).unwrap();
        prop_assert_eq!(page.total, 1);
        let raw = serde_json::to_string(&page.items).unwrap();
        prop_assert!(!raw.contains(&secret));
    }
}

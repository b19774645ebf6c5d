//! Field-level encryption
//!
//! Records are plain `field -> value` maps. Which fields are protected, and
//! under which key purpose, is declared up front in a [`FieldSchema`] rather
//! than discovered at runtime.

use crate::error::Result;
use crate::masking::{self, MaskKind};
use crate::secret_store::{SecretCipher, SecretRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sensitivity class of a field; selects the key purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldClassification {
    /// Cardholder and bank data
    Payment,
    /// Personally identifiable information
    Pii,
    /// Other confidential business data
    Sensitive,
}

impl FieldClassification {
    /// Key purpose used for fields of this class
    pub fn purpose(&self) -> &'static str {
        match self {
            FieldClassification::Payment => "payment",
            FieldClassification::Pii => "pii",
            FieldClassification::Sensitive => "sensitive",
        }
    }
}

/// Entity type -> ordered protected fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldSchema {
    entities: HashMap<String, Vec<(String, FieldClassification)>>,
}

impl FieldSchema {
    /// Empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the protected fields of an entity type
    pub fn entity(mut self, entity: &str, fields: &[(&str, FieldClassification)]) -> Self {
        self.entities.insert(
            entity.to_string(),
            fields.iter().map(|(f, c)| (f.to_string(), *c)).collect(),
        );
        self
    }

    /// Protected fields of an entity, in declaration order
    pub fn fields(&self, entity: &str) -> &[(String, FieldClassification)] {
        self.entities.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Marketplace entities with their customary protected fields
    pub fn marketplace() -> Self {
        use FieldClassification::*;
        Self::new()
            .entity(
                "buyers",
                &[
                    ("phone", Pii),
                    ("address", Pii),
                    ("business_license", Sensitive),
                    ("tax_id", Pii),
                    ("bank_details", Payment),
                ],
            )
            .entity(
                "vendors",
                &[
                    ("phone", Pii),
                    ("address", Pii),
                    ("abn", Sensitive),
                    ("bank_details", Payment),
                    ("tax_id", Pii),
                    ("business_license", Sensitive),
                ],
            )
            .entity(
                "payments",
                &[
                    ("card_number", Payment),
                    ("bank_account", Payment),
                    ("routing_number", Payment),
                    ("payment_token", Payment),
                ],
            )
            .entity(
                "orders",
                &[
                    ("delivery_address", Pii),
                    ("billing_address", Pii),
                    ("delivery_notes", Sensitive),
                ],
            )
            .entity(
                "invoices",
                &[
                    ("billing_address", Pii),
                    ("tax_details", Sensitive),
                    ("bank_details", Payment),
                ],
            )
    }
}

/// Mask kind for a field, by name first and class second
pub fn mask_kind_for(field: &str, classification: FieldClassification) -> MaskKind {
    let field = field.to_ascii_lowercase();
    if field.contains("email") {
        MaskKind::Email
    } else if field.contains("phone") {
        MaskKind::Phone
    } else if field.contains("address") {
        MaskKind::Address
    } else if field.contains("card") || classification == FieldClassification::Payment {
        MaskKind::Card
    } else {
        MaskKind::General
    }
}

/// Encrypts and decrypts records according to a schema
pub struct FieldEncryptor {
    cipher: Arc<dyn SecretCipher>,
    schema: FieldSchema,
}

impl FieldEncryptor {
    /// Create an encryptor
    pub fn new(cipher: Arc<dyn SecretCipher>, schema: FieldSchema) -> Self {
        Self { cipher, schema }
    }

    /// Schema in use
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Encrypt the protected fields of a record in place.
    ///
    /// Empty and already-encrypted values are left alone. Any encryption
    /// failure aborts and is returned. Returns the number of fields encrypted.
    pub fn encrypt_record(&self, entity: &str, record: &mut BTreeMap<String, String>) -> Result<usize> {
        let mut encrypted = 0;
        for (field, classification) in self.schema.fields(entity) {
            let Some(value) = record.get_mut(field) else {
                continue;
            };
            if value.is_empty() || SecretRecord::from_envelope(value).is_ok() {
                continue;
            }
            *value = self.cipher.encrypt_string(value, classification.purpose())?;
            encrypted += 1;
        }
        debug!(entity = %entity, fields = encrypted, "Record encrypted");
        Ok(encrypted)
    }

    /// Decrypt the protected fields of a record in place.
    ///
    /// Fields that fail to decrypt keep their stored value and are counted;
    /// the rest of the record is still processed.
    pub fn decrypt_record(&self, entity: &str, record: &mut BTreeMap<String, String>) -> usize {
        let mut failures = 0;
        for (field, _) in self.schema.fields(entity) {
            let Some(value) = record.get_mut(field) else {
                continue;
            };
            if SecretRecord::from_envelope(value).is_err() {
                continue;
            }
            match self.cipher.decrypt_string(value) {
                Ok(plain) => *value = plain.to_string(),
                Err(e) => {
                    warn!(entity = %entity, field = %field, error = %e, "Field decryption failed");
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Display copy of a decrypted record with protected fields masked
    pub fn masked_record(&self, entity: &str, record: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut masked = record.clone();
        for (field, classification) in self.schema.fields(entity) {
            if let Some(value) = masked.get_mut(field) {
                *value = masking::mask(value, mask_kind_for(field, *classification));
            }
        }
        masked
    }
}

impl std::fmt::Debug for FieldEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldEncryptor")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

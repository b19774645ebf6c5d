//! Security Engine
//!
//! Key custody, encrypted secrets, credential vault, tamper-evident audit
//! ledger, MFA, session tokens, role-based access control, data subject
//! rights and upload screening for the payment rail.
//!
//! # Architecture
//!
//! - **Envelope encryption**: per-purpose data keys, wrapped by a master key
//! - **Hash-chained audit**: every event carries the hash of its predecessor
//! - **Injected seams**: clock, cache, stores and sinks are traits
//! - **Single composition root**: [`SecurityEngine`] wires it all from [`Config`]
//!
//! # Invariants
//!
//! - At most one active key per purpose
//! - Plaintext secrets never reach logs or audit records
//! - Refresh tokens are single use
//! - Audit rows are appended, never updated

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fields;
pub mod gdpr;
pub mod incidents;
pub mod keys;
pub mod maintenance;
pub mod masking;
pub mod metrics;
pub mod mfa;
pub mod pci;
pub mod rbac;
pub mod secret_store;
pub mod tokens;
pub mod totp;
pub mod upload;
pub mod vault;

mod files;

// Re-exports
pub use audit::{AuditEntry, AuditEvent, AuditLedger, RequestContext, Severity};
pub use cache::{KeyValueCache, MemoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::SecurityEngine;
pub use error::{Error, Result};
pub use gdpr::GdprCompliance;
pub use incidents::IncidentManager;
pub use keys::{KeyAlgorithm, KeyManager};
pub use maintenance::{MaintenanceJobs, MaintenanceReport};
pub use metrics::SecurityMetrics;
pub use mfa::MfaEngine;
pub use pci::PciCompliance;
pub use rbac::AccessControl;
pub use secret_store::{SecretCipher, SecretRecord, SecretStore};
pub use tokens::TokenService;
pub use upload::UploadValidator;
pub use vault::CredentialVault;

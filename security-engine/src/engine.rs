//! Composition root
//!
//! Builds every component from a [`Config`] and wires the shared pieces:
//! one clock, one cache, one audit ledger feeding one metrics registry, and
//! one key manager behind the secret store.

use crate::audit::{AuditLedger, AuditPolicy, EventSink, JsonLinesEventSink, MemoryEventSink};
use crate::cache::{KeyValueCache, MemoryCache};
use crate::clock::{self, Clock};
use crate::config::Config;
use crate::crypto::{self, MasterKey};
use crate::error::{Error, Result};
use crate::fields::{FieldEncryptor, FieldSchema};
use crate::gdpr::{GdprCompliance, MemoryGdprStore, MemorySubjectData};
use crate::incidents::{IncidentManager, MemoryIncidentStore};
use crate::keys::{FileKeyStore, KeyManager, KeyStore, MemoryKeyStore};
use crate::maintenance::MaintenanceJobs;
use crate::metrics::SecurityMetrics;
use crate::mfa::{MemoryMfaStore, MfaEngine};
use crate::pci::{PciCompliance, PciPolicy};
use crate::rbac::{AccessControl, MemoryRbacStore};
use crate::secret_store::{SecretCipher, SecretStore};
use crate::tokens::TokenService;
use crate::upload::UploadValidator;
use crate::vault::CredentialVault;
use std::sync::Arc;
use tracing::info;

const TOKEN_KEY_CONTEXT: &[u8] = b"security-engine/token-signing/v1";

/// Every component, wired
pub struct SecurityEngine {
    config: Config,
    clock: Arc<dyn Clock>,
    cache: Arc<MemoryCache>,
    metrics: Arc<SecurityMetrics>,
    audit: Arc<AuditLedger>,
    keys: Arc<KeyManager>,
    secrets: Arc<SecretStore>,
    fields: Arc<FieldEncryptor>,
    vault: Arc<CredentialVault>,
    mfa: Arc<MfaEngine>,
    tokens: Arc<TokenService>,
    rbac: Arc<AccessControl>,
    pci: Arc<PciCompliance>,
    incidents: Arc<IncidentManager>,
    gdpr: Arc<GdprCompliance>,
    uploads: Arc<UploadValidator>,
}

impl SecurityEngine {
    /// Build from configuration, reading the master secret from the
    /// environment and using the system clock
    pub fn from_config(config: Config) -> Result<Self> {
        let secret = config.master_secret()?;
        Self::build(config, &secret, clock::system())
    }

    /// Build with an explicit master secret and clock
    pub fn build(config: Config, master_secret: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let master = MasterKey::from_secret(master_secret)?;

        let metrics = Arc::new(
            SecurityMetrics::new().map_err(|e| Error::Config(format!("Metrics registry: {}", e)))?,
        );

        let sink: Arc<dyn EventSink> = match &config.audit.log_path {
            Some(path) => Arc::new(JsonLinesEventSink::open(path)?),
            None => Arc::new(MemoryEventSink::new()),
        };
        let audit = Arc::new(
            AuditLedger::new(sink, AuditPolicy::default(), clock.clone())
                .with_config(config.audit.clone())
                .with_metrics(metrics.clone()),
        );

        let cache = Arc::new(MemoryCache::with_clock(clock.clone()));
        let shared_cache: Arc<dyn KeyValueCache> = cache.clone();

        let key_store: Arc<dyn KeyStore> = match &config.keys.store_path {
            Some(path) => Arc::new(FileKeyStore::open(path, master.clone())?),
            None => Arc::new(MemoryKeyStore::new()),
        };
        let keys = Arc::new(
            KeyManager::new(key_store, master.clone(), config.keys.clone(), clock.clone())
                .with_audit(audit.clone()),
        );

        let secrets = Arc::new(SecretStore::new(keys.clone(), shared_cache.clone()).with_audit(audit.clone()));
        let cipher: Arc<dyn SecretCipher> = secrets.clone();

        let fields = Arc::new(FieldEncryptor::new(cipher.clone(), FieldSchema::marketplace()));

        let vault = Arc::new(
            CredentialVault::new(
                cipher.clone(),
                master.checksum_secret(),
                config.vault.clone(),
                config.environment.clone(),
                clock.clone(),
            )?
            .with_audit(audit.clone()),
        );
        keys.register_reencryptor(vault.clone());

        let mfa = Arc::new(
            MfaEngine::new(
                Arc::new(MemoryMfaStore::new()),
                cipher.clone(),
                shared_cache.clone(),
                config.mfa.clone(),
                clock.clone(),
            )
            .with_audit(audit.clone()),
        );

        let signing_secret = crypto::sha256_hex_parts(&[TOKEN_KEY_CONTEXT, master.checksum_secret()]);
        let tokens = Arc::new(
            TokenService::new(
                signing_secret.as_bytes(),
                shared_cache.clone(),
                config.tokens.clone(),
                clock.clone(),
            )?
            .with_audit(audit.clone()),
        );

        let rbac = Arc::new(
            AccessControl::new(
                Arc::new(MemoryRbacStore::new()),
                shared_cache,
                config.rbac.clone(),
                clock.clone(),
            )
            .with_audit(audit.clone()),
        );

        let pci = Arc::new(
            PciCompliance::new(cipher.clone(), PciPolicy::default(), clock.clone()).with_audit(audit.clone()),
        );

        let incidents = Arc::new(
            IncidentManager::new(Arc::new(MemoryIncidentStore::new()), clock.clone()).with_audit(audit.clone()),
        );

        let gdpr = Arc::new(
            GdprCompliance::new(
                Arc::new(MemoryGdprStore::new()),
                Arc::new(MemorySubjectData::new()),
                cipher,
                config.gdpr.clone(),
                clock.clone(),
            )
            .with_audit(audit.clone())
            .with_incidents(incidents.clone()),
        );

        let uploads = Arc::new(UploadValidator::new(config.upload.clone())?.with_audit(audit.clone()));

        info!(environment = %config.environment, "Security engine initialized");
        Ok(Self {
            config,
            clock,
            cache,
            metrics,
            audit,
            keys,
            secrets,
            fields,
            vault,
            mfa,
            tokens,
            rbac,
            pci,
            incidents,
            gdpr,
            uploads,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Metrics registry
    pub fn metrics(&self) -> &Arc<SecurityMetrics> {
        &self.metrics
    }

    /// Audit ledger
    pub fn audit(&self) -> &Arc<AuditLedger> {
        &self.audit
    }

    /// Key manager
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Secret store
    pub fn secrets(&self) -> &Arc<SecretStore> {
        &self.secrets
    }

    /// Field encryptor over the marketplace schema
    pub fn fields(&self) -> &Arc<FieldEncryptor> {
        &self.fields
    }

    /// Credential vault
    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// MFA engine
    pub fn mfa(&self) -> &Arc<MfaEngine> {
        &self.mfa
    }

    /// Token service
    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// Access control
    pub fn rbac(&self) -> &Arc<AccessControl> {
        &self.rbac
    }

    /// PCI checks
    pub fn pci(&self) -> &Arc<PciCompliance> {
        &self.pci
    }

    /// Incident manager
    pub fn incidents(&self) -> &Arc<IncidentManager> {
        &self.incidents
    }

    /// Data subject rights and consent
    pub fn gdpr(&self) -> &Arc<GdprCompliance> {
        &self.gdpr
    }

    /// Upload screening
    pub fn uploads(&self) -> &Arc<UploadValidator> {
        &self.uploads
    }

    /// Maintenance jobs over this engine's components
    pub fn maintenance(&self) -> MaintenanceJobs {
        MaintenanceJobs::new(
            self.keys.clone(),
            self.audit.clone(),
            self.config.audit.retention_days,
            self.config.maintenance.clone(),
        )
        .with_cache(self.cache.clone())
        .with_incidents(self.incidents.clone())
    }
}

impl std::fmt::Debug for SecurityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEngine")
            .field("environment", &self.config.environment)
            .finish_non_exhaustive()
    }
}

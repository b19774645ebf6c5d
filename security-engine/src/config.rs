//! Configuration for the security engine

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Security engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment variable holding the master application secret
    pub master_secret_env: String,

    /// Deployment environment name stamped on credentials
    pub environment: String,

    /// Key management
    pub keys: KeyConfig,

    /// Credential vault
    pub vault: VaultConfig,

    /// Audit ledger
    pub audit: AuditConfig,

    /// Multi-factor authentication
    pub mfa: MfaConfig,

    /// Session tokens and API keys
    pub tokens: TokenConfig,

    /// Role-based access control
    pub rbac: RbacConfig,

    /// Scheduled maintenance
    pub maintenance: MaintenanceConfig,

    /// Data-subject rights and retention
    pub gdpr: GdprConfig,

    /// Upload screening
    pub upload: UploadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_secret_env: "SECURITY_MASTER_SECRET".to_string(),
            environment: "production".to_string(),
            keys: KeyConfig::default(),
            vault: VaultConfig::default(),
            audit: AuditConfig::default(),
            mfa: MfaConfig::default(),
            tokens: TokenConfig::default(),
            rbac: RbacConfig::default(),
            maintenance: MaintenanceConfig::default(),
            gdpr: GdprConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

/// Key management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Days until a freshly generated key is due for rotation
    pub rotation_days: i64,

    /// RSA modulus size for hybrid keys
    pub rsa_bits: usize,

    /// Encrypted key store file. In-memory store when unset.
    pub store_path: Option<PathBuf>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            rotation_days: 90,
            rsa_bits: 4096,
            store_path: None,
        }
    }
}

/// Credential vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding `credentials.encrypted`, backups and history
    pub storage_dir: PathBuf,

    /// Environment variable consulted when the stored credential is unusable
    pub fallback_env: String,

    /// Environment variable for the fallback backup credential
    pub fallback_backup_env: String,

    /// In-process cache lifetime for a verified credential (seconds)
    pub cache_ttl_secs: u64,

    /// Rotation history entries kept on disk
    pub history_limit: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data/credentials"),
            fallback_env: "REGISTRY_API_GUID".to_string(),
            fallback_backup_env: "REGISTRY_API_BACKUP_GUID".to_string(),
            cache_ttl_secs: 86_400, // 24 hours
            history_limit: 100,
        }
    }
}

/// Audit ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Retention window (days)
    pub retention_days: i64,

    /// Rows processed per cleanup batch
    pub cleanup_batch_size: usize,

    /// Cold-storage directory for archived high/critical events
    pub archive_dir: PathBuf,

    /// JSON-lines event log. In-memory sink when unset.
    pub log_path: Option<PathBuf>,

    /// Default page size for searches
    pub default_per_page: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 365,
            cleanup_batch_size: 500,
            archive_dir: PathBuf::from("./data/audit-archive"),
            log_path: None,
            default_per_page: 50,
        }
    }
}

/// MFA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MfaConfig {
    /// Issuer shown in authenticator apps
    pub issuer: String,

    /// Consecutive failures before lockout
    pub max_attempts: u32,

    /// Lockout window (minutes)
    pub lockout_minutes: i64,

    /// SMS/email code lifetime (seconds)
    pub code_ttl_secs: u64,

    /// Session-scoped "already verified" lifetime (seconds)
    pub session_ttl_secs: u64,

    /// Backup codes generated per batch
    pub backup_code_count: usize,

    /// TOTP time steps accepted either side of now
    pub totp_skew: i64,

    /// Argon2 memory cost for backup code hashes (KiB)
    pub backup_hash_memory_kib: u32,

    /// Argon2 iterations for backup code hashes
    pub backup_hash_iterations: u32,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            issuer: "Security Engine".to_string(),
            max_attempts: 5,
            lockout_minutes: 30,
            code_ttl_secs: 300,     // 5 minutes
            session_ttl_secs: 3600, // 1 hour
            backup_code_count: 10,
            totp_skew: 1,
            backup_hash_memory_kib: 19_456,
            backup_hash_iterations: 2,
        }
    }
}

/// Client binding policy for session tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingPolicy {
    /// Reject tokens presented from outside the issuing network
    pub enforce_ip: bool,

    /// IPv4 prefix treated as the same network
    pub ipv4_prefix_len: u8,

    /// IPv6 prefix treated as the same network
    pub ipv6_prefix_len: u8,

    /// Emit an audit event when the browser family changes
    pub log_user_agent_drift: bool,
}

impl Default for BindingPolicy {
    fn default() -> Self {
        Self {
            enforce_ip: true,
            ipv4_prefix_len: 24,
            ipv6_prefix_len: 64,
            log_user_agent_drift: true,
        }
    }
}

/// Token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// `iss` claim
    pub issuer: String,

    /// `aud` claim
    pub audience: String,

    /// Access token lifetime (seconds)
    pub access_ttl_secs: u64,

    /// Refresh token lifetime (seconds)
    pub refresh_ttl_secs: u64,

    /// Validations allowed per `jti`
    pub replay_ceiling: u64,

    /// API key lifetime (days)
    pub api_key_ttl_days: i64,

    /// Prefix for generated API keys
    pub api_key_prefix: String,

    /// Client binding rules
    pub binding: BindingPolicy,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "security-engine".to_string(),
            audience: "security-engine-clients".to_string(),
            access_ttl_secs: 3600,     // 1 hour
            refresh_ttl_secs: 604_800, // 7 days
            replay_ceiling: 100,
            api_key_ttl_days: 365,
            api_key_prefix: "sk_".to_string(),
            binding: BindingPolicy::default(),
        }
    }
}

/// RBAC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RbacConfig {
    /// Resolved role/permission cache lifetime (seconds)
    pub cache_ttl_secs: u64,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
        }
    }
}

/// Maintenance schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance runs
    pub interval_secs: u64,

    /// Rotate keys expiring within this many days
    pub rotate_within_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
            rotate_within_days: 7,
        }
    }
}

/// Retention windows (days) by data class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Per-user activity trail shown in exports
    pub activity_logs_days: i64,
    /// Audit ledger
    pub audit_logs_days: i64,
    /// Anonymized remains of erased subjects
    pub deleted_user_data_days: i64,
    /// Sealed export downloads
    pub export_files_days: i64,
    /// Sealed pre-erasure backups
    pub backup_files_days: i64,
    /// Session state
    pub session_data_days: i64,
    /// Scratch files
    pub temporary_files_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            activity_logs_days: 90,
            audit_logs_days: 365,
            deleted_user_data_days: 30,
            export_files_days: 7,
            backup_files_days: 90,
            session_data_days: 30,
            temporary_files_days: 1,
        }
    }
}

/// Data-subject rights configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GdprConfig {
    /// Retention windows
    pub retention: RetentionPolicy,
}

/// Upload screening configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Size ceiling for images (bytes)
    pub max_image_bytes: u64,

    /// Size ceiling for documents (bytes)
    pub max_document_bytes: u64,

    /// Size ceiling for archives (bytes)
    pub max_archive_bytes: u64,

    /// Size ceiling when no category applies (bytes)
    pub max_default_bytes: u64,

    /// Leading bytes inspected for embedded scripts
    pub content_scan_bytes: usize,

    /// clamd address (`host:port`). Scans are skipped and flagged when unset.
    pub clamd_addr: Option<String>,

    /// clamd connect and read timeout (seconds)
    pub scanner_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 5 * 1024 * 1024,
            max_document_bytes: 10 * 1024 * 1024,
            max_archive_bytes: 50 * 1024 * 1024,
            max_default_bytes: 2 * 1024 * 1024,
            content_scan_bytes: 8192,
            clamd_addr: None,
            scanner_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(env) = std::env::var("SECURITY_ENVIRONMENT") {
            config.environment = env;
        }

        if let Ok(path) = std::env::var("SECURITY_KEY_STORE") {
            config.keys.store_path = Some(PathBuf::from(path));
        }

        if let Ok(dir) = std::env::var("SECURITY_VAULT_DIR") {
            config.vault.storage_dir = PathBuf::from(dir);
        }

        if let Ok(path) = std::env::var("SECURITY_AUDIT_LOG") {
            config.audit.log_path = Some(PathBuf::from(path));
        }

        if let Ok(dir) = std::env::var("SECURITY_AUDIT_ARCHIVE_DIR") {
            config.audit.archive_dir = PathBuf::from(dir);
        }

        if let Ok(days) = std::env::var("SECURITY_AUDIT_RETENTION_DAYS") {
            config.audit.retention_days = days
                .parse()
                .map_err(|_| Error::Config(format!("Invalid retention days: {}", days)))?;
        }

        if let Ok(issuer) = std::env::var("SECURITY_TOKEN_ISSUER") {
            config.tokens.issuer = issuer;
        }

        if let Ok(addr) = std::env::var("SECURITY_CLAMD_ADDR") {
            config.upload.clamd_addr = Some(addr);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values no deployment should run with
    pub fn validate(&self) -> Result<()> {
        if self.keys.rotation_days <= 0 {
            return Err(Error::Config("keys.rotation_days must be positive".into()));
        }
        if self.keys.rsa_bits < 1024 {
            return Err(Error::Config("keys.rsa_bits must be at least 1024".into()));
        }
        if self.mfa.max_attempts == 0 {
            return Err(Error::Config("mfa.max_attempts must be positive".into()));
        }
        if self.mfa.code_ttl_secs == 0 || self.tokens.access_ttl_secs == 0 {
            return Err(Error::Config("TTLs must be positive".into()));
        }
        if self.tokens.refresh_ttl_secs < self.tokens.access_ttl_secs {
            return Err(Error::Config(
                "tokens.refresh_ttl_secs must not be shorter than access_ttl_secs".into(),
            ));
        }
        if self.tokens.binding.ipv4_prefix_len > 32 || self.tokens.binding.ipv6_prefix_len > 128 {
            return Err(Error::Config("binding prefix length out of range".into()));
        }
        if self.audit.default_per_page == 0 || self.audit.cleanup_batch_size == 0 {
            return Err(Error::Config("audit page and batch sizes must be positive".into()));
        }
        let retention = &self.gdpr.retention;
        if [
            retention.activity_logs_days,
            retention.export_files_days,
            retention.backup_files_days,
        ]
        .iter()
        .any(|days| *days <= 0)
        {
            return Err(Error::Config("gdpr retention windows must be positive".into()));
        }
        if self.upload.content_scan_bytes == 0 {
            return Err(Error::Config("upload.content_scan_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Read the master application secret from the environment
    pub fn master_secret(&self) -> Result<Zeroizing<String>> {
        let secret = std::env::var(&self.master_secret_env).map_err(|_| {
            Error::Config(format!("{} environment variable not set", self.master_secret_env))
        })?;
        if secret.len() < 32 {
            return Err(Error::Config(
                "Master secret must be at least 32 characters".into(),
            ));
        }
        Ok(Zeroizing::new(secret))
    }
}

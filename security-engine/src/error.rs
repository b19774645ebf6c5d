//! Error types for the security engine

use thiserror::Error;

/// Result type for security engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Security engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input (bad GUID format, missing required field)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Checksum or authentication tag mismatch
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// No key with the given identifier
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Key exists but has been revoked
    #[error("Key revoked: {0}")]
    KeyRevoked(String),

    /// Revocation requested for an already revoked key
    #[error("Key already revoked: {0}")]
    AlreadyRevoked(String),

    /// MFA lockout active
    #[error("Account locked for another {remaining_secs}s")]
    Locked {
        /// Seconds until the lockout window closes
        remaining_secs: i64,
    },

    /// Token failed signature, expiry, binding or server-side state checks
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token identifier is blacklisted
    #[error("Token blacklisted: {0}")]
    TokenBlacklisted(String),

    /// Per-token usage ceiling exceeded
    #[error("Replay limit exceeded for token {0}")]
    ReplayLimitExceeded(String),

    /// Token of the wrong type was presented (access token to refresh)
    #[error("Invalid token type: expected {expected}, got {actual}")]
    InvalidTokenType {
        /// Expected token type
        expected: String,
        /// Presented token type
        actual: String,
    },

    /// RBAC check failure
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// State conflict (duplicate assignment, illegal transition)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cryptographic primitive failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Persistence or cache failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Best-effort dependency could not be reached
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Message safe to return to an end user.
    ///
    /// Never echoes internal detail. MFA and token failures collapse to a
    /// single generic text so callers cannot learn why a credential failed.
    pub fn public_message(&self) -> &'static str {
        match self {
            Error::Validation(_) => "The request contains invalid input",
            Error::PermissionDenied(_) => "You do not have permission to perform this action",
            Error::Locked { .. } => "Too many failed attempts, try again later",
            Error::InvalidToken(_)
            | Error::TokenBlacklisted(_)
            | Error::ReplayLimitExceeded(_)
            | Error::InvalidTokenType { .. } => "Invalid credentials",
            Error::NotFound(_) => "The requested resource was not found",
            Error::Conflict(_) => "The request conflicts with the current state",
            _ => "An internal error occurred",
        }
    }

    /// Token failures are terminal: the client must re-authenticate.
    pub fn is_terminal_for_token(&self) -> bool {
        matches!(
            self,
            Error::InvalidToken(_)
                | Error::TokenBlacklisted(_)
                | Error::ReplayLimitExceeded(_)
                | Error::InvalidTokenType { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Storage(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Storage(msg.to_string())
    }
}

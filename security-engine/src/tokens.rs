//! Session tokens and API keys
//!
//! Access/refresh pairs are HS256 JWTs. Signature alone is not enough: an
//! access token is accepted only while server-side state for its `jti`
//! exists in the shared cache, its `jti` is not blacklisted, its subject is
//! not under a revocation marker, the client binding holds and its usage
//! count stays under the replay ceiling.
//!
//! Cache layout:
//!
//! - `jwt_token_data:{jti}` server-side state, TTL = access lifetime
//! - `jwt_blacklist:{jti}` TTL = refresh lifetime
//! - `jwt_usage:{jti}` counter, TTL = access lifetime
//! - `jwt_subject_revoked:{sub}` TTL = refresh lifetime
//! - `api_key:{sha256}` API key record, TTL = key lifetime

use crate::audit::{AuditEntry, AuditLedger, RequestContext};
use crate::cache::KeyValueCache;
use crate::clock::Clock;
use crate::config::{BindingPolicy, TokenConfig};
use crate::crypto;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};
use uuid::Uuid;

/// Token type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Short-lived bearer token
    Access,
    /// Single-use token exchanged for a new pair
    Refresh,
}

impl TokenType {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// JWT claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Subject
    pub sub: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Not before (unix seconds)
    pub nbf: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Token id
    pub jti: Uuid,
    /// Token type
    pub typ: TokenType,
    /// Granted scopes
    pub scopes: BTreeSet<String>,
    /// Paired access token (refresh tokens only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_jti: Option<Uuid>,
}

/// Server-side state for an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// Subject
    pub subject: String,
    /// Scopes
    pub scopes: BTreeSet<String>,
    /// Client IP at issuance
    pub ip: Option<IpAddr>,
    /// Client user agent at issuance
    pub user_agent: Option<String>,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

/// Issued pair
#[derive(Clone, Serialize)]
pub struct TokenPair {
    /// Access token
    pub access_token: String,
    /// Refresh token
    pub refresh_token: String,
    /// Always `Bearer`
    pub token_type: &'static str,
    /// Access lifetime in seconds
    pub expires_in: u64,
    /// Granted scopes
    pub scopes: BTreeSet<String>,
    /// Access token id
    pub access_jti: Uuid,
    /// Refresh token id
    pub refresh_jti: Uuid,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_jti", &self.access_jti)
            .field("refresh_jti", &self.refresh_jti)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Successful validation
#[derive(Debug, Clone)]
pub struct ValidatedToken {
    /// Verified claims
    pub claims: Claims,
    /// Server-side state
    pub state: TokenState,
    /// Uses so far, this one included
    pub usage_count: u64,
}

/// Inspection view of a token id
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    /// Server-side state, if still live
    pub state: Option<TokenState>,
    /// Blacklisted
    pub blacklisted: bool,
    /// Blacklist reason
    pub blacklist_reason: Option<String>,
    /// Uses so far
    pub usage_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlacklistEntry {
    reason: String,
    blacklisted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubjectRevocation {
    reason: String,
    revoked_at: DateTime<Utc>,
}

/// API key record; the key itself is never stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Owner
    pub subject: String,
    /// Label
    pub name: String,
    /// Granted scopes
    pub scopes: BTreeSet<String>,
    /// Prefix plus first characters, for display
    pub key_preview: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Last successful validation
    pub last_used_at: Option<DateTime<Utc>>,
    /// Client IP of the last validation
    pub last_used_ip: Option<IpAddr>,
}

/// Result of [`TokenService::generate_api_key`]
#[derive(Clone)]
pub struct GeneratedApiKey {
    /// Plaintext key, returned exactly once
    pub api_key: String,
    /// Stored record
    pub record: ApiKeyRecord,
}

impl fmt::Debug for GeneratedApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedApiKey")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// Token service
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    cache: Arc<dyn KeyValueCache>,
    config: TokenConfig,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLedger>>,
}

impl TokenService {
    /// Create a service signing with `signing_secret`
    pub fn new(
        signing_secret: &[u8],
        cache: Arc<dyn KeyValueCache>,
        config: TokenConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if signing_secret.len() < 32 {
            return Err(Error::Config("Token signing secret must be at least 32 bytes".into()));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(signing_secret),
            decoding: DecodingKey::from_secret(signing_secret),
            cache,
            config,
            clock,
            audit: None,
        })
    }

    /// Emit events to an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn access_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.config.access_ttl_secs)
    }

    fn refresh_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.config.refresh_ttl_secs)
    }

    fn state_key(jti: Uuid) -> String {
        format!("jwt_token_data:{}", jti)
    }

    fn blacklist_key(jti: Uuid) -> String {
        format!("jwt_blacklist:{}", jti)
    }

    fn usage_key(jti: Uuid) -> String {
        format!("jwt_usage:{}", jti)
    }

    fn subject_key(subject: &str) -> String {
        format!("jwt_subject_revoked:{}", subject)
    }

    fn api_key_key(hash: &str) -> String {
        format!("api_key:{}", hash)
    }

    fn audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            audit.log(entry);
        }
    }

    /// Log a rejection and hand the error back
    fn reject(&self, event_type: &str, error: Error, context: &RequestContext, metadata: serde_json::Value) -> Error {
        warn!(event = %event_type, error = %error, "Token rejected");
        self.audit(
            AuditEntry::new(event_type, format!("Token rejected: {}", error))
                .with_context(context)
                .with_metadata(metadata),
        );
        error
    }

    /// Issue an access/refresh pair bound to the client in `context`
    pub fn issue_tokens<I, S>(&self, subject: &str, scopes: I, context: &RequestContext) -> Result<TokenPair>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scopes: BTreeSet<String> = scopes.into_iter().map(Into::into).collect();
        let now = self.clock.now();
        let access_exp = now + Duration::seconds(self.config.access_ttl_secs as i64);
        let refresh_exp = now + Duration::seconds(self.config.refresh_ttl_secs as i64);
        let access_jti = Uuid::new_v4();
        let refresh_jti = Uuid::new_v4();

        let access = Claims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            sub: subject.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: access_exp.timestamp(),
            jti: access_jti,
            typ: TokenType::Access,
            scopes: scopes.clone(),
            access_jti: None,
        };
        let refresh = Claims {
            exp: refresh_exp.timestamp(),
            jti: refresh_jti,
            typ: TokenType::Refresh,
            access_jti: Some(access_jti),
            ..access.clone()
        };

        let header = Header::new(Algorithm::HS256);
        let access_token = encode(&header, &access, &self.encoding)
            .map_err(|e| Error::Crypto(format!("Token signing failed: {}", e)))?;
        let refresh_token = encode(&header, &refresh, &self.encoding)
            .map_err(|e| Error::Crypto(format!("Token signing failed: {}", e)))?;

        let state = TokenState {
            subject: subject.to_string(),
            scopes: scopes.clone(),
            ip: context.ip,
            user_agent: context.user_agent.clone(),
            issued_at: now,
            expires_at: access_exp,
        };
        self.cache
            .put_json(&Self::state_key(access_jti), &state, self.access_ttl())?;

        info!(subject = %subject, jti = %access_jti, "Token pair issued");
        self.audit(
            AuditEntry::new("jwt_tokens_generated", "Issued access and refresh tokens")
                .with_actor_id(subject)
                .with_context(context)
                .with_metadata(serde_json::json!({
                    "jti": access_jti,
                    "scopes": scopes,
                    "expires_in": self.config.access_ttl_secs,
                })),
        );

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.config.access_ttl_secs,
            scopes,
            access_jti,
            refresh_jti,
        })
    }

    /// Signature, issuer, audience and time checks
    fn decode_claims(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // expiry is checked against the injected clock below
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.required_spec_claims = ["exp", "sub", "iss", "aud"].iter().map(|c| c.to_string()).collect();

        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| Error::InvalidToken(format!("Token verification failed: {}", e)))?
            .claims;

        let now = self.clock.now().timestamp();
        if claims.exp <= now {
            return Err(Error::InvalidToken("Token has expired".into()));
        }
        if claims.nbf > now {
            return Err(Error::InvalidToken("Token is not yet valid".into()));
        }
        Ok(claims)
    }

    fn blacklist_entry(&self, jti: Uuid) -> Result<Option<BlacklistEntry>> {
        self.cache.get_json(&Self::blacklist_key(jti))
    }

    fn subject_revoked(&self, subject: &str) -> Result<bool> {
        self.cache.has(&Self::subject_key(subject))
    }

    /// Validate an access token presented by the client in `context`
    pub fn validate(&self, token: &str, context: &RequestContext) -> Result<ValidatedToken> {
        let claims = match self.decode_claims(token) {
            Ok(claims) => claims,
            Err(e) => {
                return Err(self.reject("jwt_validation_failed", e, context, serde_json::json!({})));
            }
        };
        let meta = serde_json::json!({ "jti": claims.jti, "subject": claims.sub });

        if claims.typ != TokenType::Access {
            let error = Error::InvalidTokenType {
                expected: TokenType::Access.as_str().to_string(),
                actual: claims.typ.as_str().to_string(),
            };
            return Err(self.reject("jwt_validation_failed", error, context, meta));
        }

        if self.blacklist_entry(claims.jti)?.is_some() {
            let error = Error::TokenBlacklisted(claims.jti.to_string());
            return Err(self.reject("jwt_blacklisted_token_used", error, context, meta));
        }

        if self.subject_revoked(&claims.sub)? {
            let error = Error::InvalidToken("All tokens for this subject are revoked".into());
            return Err(self.reject("jwt_subject_revoked", error, context, meta));
        }

        let Some(state) = self
            .cache
            .get_json::<TokenState>(&Self::state_key(claims.jti))?
        else {
            let error = Error::InvalidToken("No server-side state for token".into());
            return Err(self.reject("jwt_validation_failed", error, context, meta));
        };

        let policy = &self.config.binding;
        if policy.enforce_ip {
            if let Some(bound) = state.ip {
                let allowed = context
                    .ip
                    .map(|current| same_network(bound, current, policy))
                    .unwrap_or(false);
                if !allowed {
                    let error = Error::InvalidToken("Token IP address mismatch".into());
                    let meta = serde_json::json!({
                        "jti": claims.jti,
                        "subject": claims.sub,
                        "bound_ip": bound.to_string(),
                    });
                    return Err(self.reject("jwt_ip_mismatch", error, context, meta));
                }
            }
        }

        if policy.log_user_agent_drift {
            if let (Some(original), Some(current)) = (&state.user_agent, &context.user_agent) {
                if original != current && browser_family(original) != browser_family(current) {
                    warn!(jti = %claims.jti, "User agent changed for token");
                    self.audit(
                        AuditEntry::new("jwt_user_agent_change", "User agent changed for token")
                            .with_actor_id(claims.sub.clone())
                            .with_context(context)
                            .with_metadata(serde_json::json!({
                                "jti": claims.jti,
                                "original_user_agent": original,
                                "current_user_agent": current,
                            })),
                    );
                }
            }
        }

        let usage_count = self
            .cache
            .increment(&Self::usage_key(claims.jti), self.access_ttl())?;
        if usage_count > self.config.replay_ceiling {
            let error = Error::ReplayLimitExceeded(claims.jti.to_string());
            let meta = serde_json::json!({
                "jti": claims.jti,
                "subject": claims.sub,
                "usage_count": usage_count,
            });
            return Err(self.reject("jwt_replay_limit_exceeded", error, context, meta));
        }

        Ok(ValidatedToken {
            claims,
            state,
            usage_count,
        })
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// Single use: the refresh token and its paired access token are
    /// blacklisted atomically with the exchange, so a second call with the
    /// same refresh token fails with `TokenBlacklisted`.
    pub fn refresh(&self, refresh_token: &str, context: &RequestContext) -> Result<TokenPair> {
        let claims = match self.decode_claims(refresh_token) {
            Ok(claims) => claims,
            Err(e) => {
                return Err(self.reject("jwt_validation_failed", e, context, serde_json::json!({})));
            }
        };
        let meta = serde_json::json!({ "jti": claims.jti, "subject": claims.sub });

        if claims.typ != TokenType::Refresh {
            let error = Error::InvalidTokenType {
                expected: TokenType::Refresh.as_str().to_string(),
                actual: claims.typ.as_str().to_string(),
            };
            return Err(self.reject("jwt_validation_failed", error, context, meta));
        }

        if self.subject_revoked(&claims.sub)? {
            let error = Error::InvalidToken("All tokens for this subject are revoked".into());
            return Err(self.reject("jwt_subject_revoked", error, context, meta));
        }

        let entry = BlacklistEntry {
            reason: "refreshed".to_string(),
            blacklisted_at: self.clock.now(),
        };
        let claimed = self.cache.add(
            &Self::blacklist_key(claims.jti),
            serde_json::to_string(&entry)?,
            self.refresh_ttl(),
        )?;
        if !claimed {
            let error = Error::TokenBlacklisted(claims.jti.to_string());
            return Err(self.reject("jwt_blacklisted_token_used", error, context, meta));
        }

        if let Some(access_jti) = claims.access_jti {
            self.blacklist(access_jti, "refreshed")?;
            self.cache.forget(&Self::state_key(access_jti))?;
        }

        self.issue_tokens(&claims.sub, claims.scopes, context)
    }

    /// Blacklist a token id for the refresh lifetime
    pub fn blacklist(&self, jti: Uuid, reason: &str) -> Result<()> {
        let entry = BlacklistEntry {
            reason: reason.to_string(),
            blacklisted_at: self.clock.now(),
        };
        self.cache
            .put_json(&Self::blacklist_key(jti), &entry, self.refresh_ttl())?;

        info!(jti = %jti, reason = %reason, "Token blacklisted");
        self.audit(
            AuditEntry::new("jwt_token_blacklisted", format!("Token blacklisted: {}", reason))
                .with_metadata(serde_json::json!({ "jti": jti, "reason": reason })),
        );
        Ok(())
    }

    /// Reject every token of `subject` until the marker expires or is cleared
    pub fn revoke_all_for_subject(&self, subject: &str, reason: &str) -> Result<()> {
        let marker = SubjectRevocation {
            reason: reason.to_string(),
            revoked_at: self.clock.now(),
        };
        self.cache
            .put_json(&Self::subject_key(subject), &marker, self.refresh_ttl())?;

        warn!(subject = %subject, reason = %reason, "All tokens revoked for subject");
        self.audit(
            AuditEntry::new("jwt_all_tokens_revoked", format!("All tokens revoked: {}", reason))
                .with_actor_id(subject)
                .with_metadata(serde_json::json!({ "reason": reason })),
        );
        Ok(())
    }

    /// Clear a subject revocation marker. Returns `true` if one was active.
    pub fn reinstate_subject(&self, subject: &str) -> Result<bool> {
        let cleared = self.cache.forget(&Self::subject_key(subject))?;
        if cleared {
            info!(subject = %subject, "Subject token revocation cleared");
            self.audit(
                AuditEntry::new("jwt_subject_reinstated", "Subject token revocation cleared")
                    .with_actor_id(subject),
            );
        }
        Ok(cleared)
    }

    /// Inspect a token id
    pub fn token_info(&self, jti: Uuid) -> Result<TokenInfo> {
        let state = self.cache.get_json::<TokenState>(&Self::state_key(jti))?;
        let blacklist = self.blacklist_entry(jti)?;
        let usage_count = self
            .cache
            .get(&Self::usage_key(jti))?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(TokenInfo {
            state,
            blacklisted: blacklist.is_some(),
            blacklist_reason: blacklist.map(|b| b.reason),
            usage_count,
        })
    }

    /// Create a long-lived API key. The plaintext is returned once; only
    /// its SHA-256 is stored.
    pub fn generate_api_key<I, S>(&self, subject: &str, name: &str, scopes: I) -> Result<GeneratedApiKey>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let api_key = format!("{}{}", self.config.api_key_prefix, crypto::random_alphanumeric(40));
        let now = self.clock.now();
        let record = ApiKeyRecord {
            subject: subject.to_string(),
            name: name.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            key_preview: format!("{}...", &api_key[..self.config.api_key_prefix.len() + 6]),
            created_at: now,
            expires_at: now + Duration::days(self.config.api_key_ttl_days),
            last_used_at: None,
            last_used_ip: None,
        };
        self.store_api_key(&crypto::sha256_hex(api_key.as_bytes()), &record)?;

        info!(subject = %subject, name = %name, "API key generated");
        self.audit(
            AuditEntry::new("api_key_created", format!("API key created: {}", name))
                .with_actor_id(subject)
                .with_metadata(serde_json::json!({
                    "name": name,
                    "scopes": record.scopes,
                    "key_preview": record.key_preview,
                })),
        );
        Ok(GeneratedApiKey { api_key, record })
    }

    fn store_api_key(&self, hash: &str, record: &ApiKeyRecord) -> Result<()> {
        let remaining = (record.expires_at - self.clock.now())
            .to_std()
            .map_err(|_| Error::InvalidToken("API key has expired".into()))?;
        self.cache.put_json(&Self::api_key_key(hash), record, remaining)
    }

    /// Validate an API key and record its use
    pub fn validate_api_key(&self, api_key: &str, context: &RequestContext) -> Result<ApiKeyRecord> {
        let hash = crypto::sha256_hex(api_key.as_bytes());
        let Some(mut record) = self
            .cache
            .get_json::<ApiKeyRecord>(&Self::api_key_key(&hash))?
        else {
            return Err(self.reject(
                "jwt_validation_failed",
                Error::InvalidToken("Invalid API key".into()),
                context,
                serde_json::json!({ "credential": "api_key" }),
            ));
        };

        let now = self.clock.now();
        if record.expires_at <= now {
            return Err(Error::InvalidToken("API key has expired".into()));
        }
        record.last_used_at = Some(now);
        record.last_used_ip = context.ip;
        self.store_api_key(&hash, &record)?;
        Ok(record)
    }

    /// Revoke an API key. Returns `true` if it existed.
    pub fn revoke_api_key(&self, api_key: &str) -> Result<bool> {
        let hash = crypto::sha256_hex(api_key.as_bytes());
        let revoked = self.cache.forget(&Self::api_key_key(&hash))?;
        if revoked {
            self.audit(
                AuditEntry::new("api_key_revoked", "API key revoked")
                    .with_metadata(serde_json::json!({ "key_hash_prefix": &hash[..12] })),
            );
        }
        Ok(revoked)
    }
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Whether two addresses share the configured network prefix
pub fn same_network(a: IpAddr, b: IpAddr, policy: &BindingPolicy) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let prefix = u32::from(policy.ipv4_prefix_len.min(32));
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            (u32::from(a) & mask) == (u32::from(b) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let prefix = u32::from(policy.ipv6_prefix_len.min(128));
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            (u128::from(a) & mask) == (u128::from(b) & mask)
        }
        _ => a == b,
    }
}

/// Coarse browser family from a user agent string
pub fn browser_family(user_agent: &str) -> &'static str {
    const FAMILIES: [(&str, &str); 6] = [
        ("Edg/", "Edge"),
        ("Edge/", "Edge"),
        ("OPR/", "Opera"),
        ("Firefox/", "Firefox"),
        ("Chrome/", "Chrome"),
        ("Safari/", "Safari"),
    ];
    FAMILIES
        .iter()
        .find(|(marker, _)| user_agent.contains(marker))
        .map(|(_, family)| *family)
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SearchCriteria;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;

    const CHROME_120: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";
    const CHROME_121: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/121.0 Safari/537.36";
    const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

    struct Fixture {
        clock: Arc<ManualClock>,
        audit: Arc<AuditLedger>,
        tokens: TokenService,
    }

    fn fixture(config: TokenConfig) -> Fixture {
        let clock = ManualClock::starting_now();
        let cache = Arc::new(MemoryCache::with_clock(clock.clone()));
        let audit = Arc::new(AuditLedger::in_memory(clock.clone()));
        let tokens = TokenService::new(b"token-signing-secret-0123456789abcdef", cache, config, clock.clone())
            .unwrap()
            .with_audit(audit.clone());
        Fixture { clock, audit, tokens }
    }

    fn client(ip: &str, ua: &str) -> RequestContext {
        RequestContext::client(ip.parse().unwrap(), ua)
    }

    fn count(audit: &AuditLedger, event_type: &str) -> usize {
        audit
            .search(&SearchCriteria::new().event_type(event_type))
            .unwrap()
            .total
    }

    #[test]
    fn test_issue_and_validate() {
        let f = fixture(TokenConfig::default());
        let ctx = client("203.0.113.10", CHROME_120);
        let pair = f.tokens.issue_tokens("user-1", ["read", "write"], &ctx).unwrap();

        let validated = f.tokens.validate(&pair.access_token, &ctx).unwrap();
        assert_eq!(validated.claims.sub, "user-1");
        assert_eq!(validated.claims.jti, pair.access_jti);
        assert!(validated.claims.scopes.contains("write"));
        assert_eq!(validated.usage_count, 1);
    }

    #[test]
    fn test_expired_and_forged_tokens() {
        let f = fixture(TokenConfig::default());
        let ctx = client("203.0.113.10", CHROME_120);
        let pair = f.tokens.issue_tokens("user-1", ["read"], &ctx).unwrap();

        let mut forged = pair.access_token.clone();
        forged.push('x');
        assert!(matches!(f.tokens.validate(&forged, &ctx), Err(Error::InvalidToken(_))));

        f.clock.advance(Duration::seconds(3601));
        let err = f.tokens.validate(&pair.access_token, &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));
        assert!(err.is_terminal_for_token());
        assert_eq!(err.public_message(), "Invalid credentials");
        assert_eq!(count(&f.audit, "jwt_validation_failed"), 2);
    }

    #[test]
    fn test_missing_server_state_rejects_signed_token() {
        let f = fixture(TokenConfig::default());
        let other = TokenService::new(
            b"token-signing-secret-0123456789abcdef",
            Arc::new(MemoryCache::with_clock(f.clock.clone())),
            TokenConfig::default(),
            f.clock.clone(),
        )
        .unwrap();
        let ctx = client("203.0.113.10", CHROME_120);
        let pair = other.issue_tokens("user-1", ["read"], &ctx).unwrap();
        assert!(matches!(f.tokens.validate(&pair.access_token, &ctx), Err(Error::InvalidToken(_))));
    }

    #[test]
    fn test_refresh_is_single_use() {
        let f = fixture(TokenConfig::default());
        let ctx = client("203.0.113.10", CHROME_120);
        let pair = f.tokens.issue_tokens("user-1", ["read"], &ctx).unwrap();

        let next = f.tokens.refresh(&pair.refresh_token, &ctx).unwrap();
        assert_ne!(next.access_jti, pair.access_jti);
        assert!(next.scopes.contains("read"));

        assert!(matches!(
            f.tokens.refresh(&pair.refresh_token, &ctx),
            Err(Error::TokenBlacklisted(_))
        ));
        assert!(matches!(
            f.tokens.validate(&pair.access_token, &ctx),
            Err(Error::TokenBlacklisted(_))
        ));
        assert!(f.tokens.validate(&next.access_token, &ctx).is_ok());
    }

    #[test]
    fn test_refresh_rejects_access_token() {
        let f = fixture(TokenConfig::default());
        let ctx = client("203.0.113.10", CHROME_120);
        let pair = f.tokens.issue_tokens("user-1", ["read"], &ctx).unwrap();
        let err = f.tokens.refresh(&pair.access_token, &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidTokenType { ref expected, .. } if expected == "refresh"));

        let err = f.tokens.validate(&pair.refresh_token, &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidTokenType { .. }));
    }

    #[test]
    fn test_ip_binding_allows_same_subnet() {
        let f = fixture(TokenConfig::default());
        let pair = f
            .tokens
            .issue_tokens("user-1", ["read"], &client("203.0.113.10", CHROME_120))
            .unwrap();

        assert!(f
            .tokens
            .validate(&pair.access_token, &client("203.0.113.99", CHROME_120))
            .is_ok());
        assert!(matches!(
            f.tokens.validate(&pair.access_token, &client("198.51.100.10", CHROME_120)),
            Err(Error::InvalidToken(_))
        ));
        assert!(matches!(
            f.tokens.validate(&pair.access_token, &RequestContext::default()),
            Err(Error::InvalidToken(_))
        ));
        assert_eq!(count(&f.audit, "jwt_ip_mismatch"), 2);
    }

    #[test]
    fn test_ip_binding_can_be_disabled() {
        let mut config = TokenConfig::default();
        config.binding.enforce_ip = false;
        let f = fixture(config);
        let pair = f
            .tokens
            .issue_tokens("user-1", ["read"], &client("203.0.113.10", CHROME_120))
            .unwrap();
        assert!(f
            .tokens
            .validate(&pair.access_token, &client("198.51.100.10", CHROME_120))
            .is_ok());
    }

    #[test]
    fn test_user_agent_drift_is_logged_not_rejected() {
        let f = fixture(TokenConfig::default());
        let pair = f
            .tokens
            .issue_tokens("user-1", ["read"], &client("203.0.113.10", CHROME_120))
            .unwrap();

        f.tokens
            .validate(&pair.access_token, &client("203.0.113.10", CHROME_121))
            .unwrap();
        assert_eq!(count(&f.audit, "jwt_user_agent_change"), 0);

        f.tokens
            .validate(&pair.access_token, &client("203.0.113.10", FIREFOX))
            .unwrap();
        assert_eq!(count(&f.audit, "jwt_user_agent_change"), 1);
    }

    #[test]
    fn test_replay_ceiling() {
        let config = TokenConfig {
            replay_ceiling: 3,
            ..TokenConfig::default()
        };
        let f = fixture(config);
        let ctx = client("203.0.113.10", CHROME_120);
        let pair = f.tokens.issue_tokens("user-1", ["read"], &ctx).unwrap();

        for _ in 0..3 {
            f.tokens.validate(&pair.access_token, &ctx).unwrap();
        }
        assert!(matches!(
            f.tokens.validate(&pair.access_token, &ctx),
            Err(Error::ReplayLimitExceeded(_))
        ));
        assert_eq!(f.tokens.token_info(pair.access_jti).unwrap().usage_count, 4);
    }

    #[test]
    fn test_subject_revocation() {
        let f = fixture(TokenConfig::default());
        let ctx = client("203.0.113.10", CHROME_120);
        let pair = f.tokens.issue_tokens("user-1", ["read"], &ctx).unwrap();
        let other = f.tokens.issue_tokens("user-2", ["read"], &ctx).unwrap();

        f.tokens.revoke_all_for_subject("user-1", "password reset").unwrap();
        assert!(matches!(f.tokens.validate(&pair.access_token, &ctx), Err(Error::InvalidToken(_))));
        assert!(matches!(f.tokens.refresh(&pair.refresh_token, &ctx), Err(Error::InvalidToken(_))));
        assert!(f.tokens.validate(&other.access_token, &ctx).is_ok());

        assert!(f.tokens.reinstate_subject("user-1").unwrap());
        assert!(f.tokens.validate(&pair.access_token, &ctx).is_ok());
    }

    #[test]
    fn test_blacklist_and_info() {
        let f = fixture(TokenConfig::default());
        let ctx = client("203.0.113.10", CHROME_120);
        let pair = f.tokens.issue_tokens("user-1", ["read"], &ctx).unwrap();

        f.tokens.blacklist(pair.access_jti, "logout").unwrap();
        let info = f.tokens.token_info(pair.access_jti).unwrap();
        assert!(info.blacklisted);
        assert_eq!(info.blacklist_reason.as_deref(), Some("logout"));
        assert_eq!(info.state.unwrap().subject, "user-1");
    }

    #[test]
    fn test_api_keys() {
        let f = fixture(TokenConfig::default());
        let ctx = client("203.0.113.10", CHROME_120);
        let generated = f.tokens.generate_api_key("user-1", "ci", ["read"]).unwrap();
        assert!(generated.api_key.starts_with("sk_"));
        assert_eq!(generated.api_key.len(), 43);
        assert!(!format!("{:?}", generated).contains(&generated.api_key));

        let record = f.tokens.validate_api_key(&generated.api_key, &ctx).unwrap();
        assert_eq!(record.subject, "user-1");
        assert!(record.last_used_at.is_some());

        assert!(f.tokens.validate_api_key("sk_wrong", &ctx).is_err());
        assert!(f.tokens.revoke_api_key(&generated.api_key).unwrap());
        assert!(f.tokens.validate_api_key(&generated.api_key, &ctx).is_err());
    }

    #[test]
    fn test_same_network_v6() {
        let policy = BindingPolicy::default();
        let a: IpAddr = "2001:db8:1:2::1".parse().unwrap();
        let b: IpAddr = "2001:db8:1:2:ffff::9".parse().unwrap();
        let c: IpAddr = "2001:db8:1:3::1".parse().unwrap();
        assert!(same_network(a, b, &policy));
        assert!(!same_network(a, c, &policy));
        assert!(!same_network(a, "10.0.0.1".parse().unwrap(), &policy));
    }

    #[test]
    fn test_browser_family() {
        assert_eq!(browser_family(CHROME_120), "Chrome");
        assert_eq!(browser_family(FIREFOX), "Firefox");
        assert_eq!(browser_family("curl/8.0"), "unknown");
    }
}

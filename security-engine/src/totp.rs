//! RFC 6238 time-based one-time passwords (HMAC-SHA1, 30s step, 6 digits)

use crate::crypto;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Time step in seconds
pub const STEP_SECS: i64 = 30;

/// Code length
pub const DIGITS: u32 = 6;

/// Shared secret length in bytes (160 bits)
pub const SECRET_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

/// Random shared secret, base32 without padding
pub fn generate_secret() -> String {
    BASE32_NOPAD.encode(&crypto::random_bytes(SECRET_LEN))
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| Error::Validation("TOTP secret is not valid base32".into()))
}

/// HOTP value for a counter
fn hotp(key: &[u8], counter: u64) -> Result<u32> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("HMAC key rejected: {}", e)))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    Ok(binary % 10u32.pow(DIGITS))
}

fn counter_at(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(STEP_SECS)
}

/// Code for a given instant
pub fn code_at(secret: &str, at: DateTime<Utc>) -> Result<String> {
    let key = decode_secret(secret)?;
    let value = hotp(&key, counter_at(at).max(0) as u64)?;
    Ok(format!("{:0width$}", value, width = DIGITS as usize))
}

/// Check a code against the window `[t - skew, t + skew]` steps
pub fn verify(secret: &str, code: &str, at: DateTime<Utc>, skew: u32) -> Result<bool> {
    let code = code.trim();
    if code.len() != DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }
    let key = decode_secret(secret)?;
    let current = counter_at(at);

    let mut matched = false;
    for delta in -(skew as i64)..=(skew as i64) {
        let counter = current + delta;
        if counter < 0 {
            continue;
        }
        let expected = format!("{:0width$}", hotp(&key, counter as u64)?, width = DIGITS as usize);
        // every step is evaluated so timing does not reveal which one matched
        matched |= crypto::ct_eq(expected.as_bytes(), code.as_bytes());
    }
    Ok(matched)
}

/// `otpauth://` URI for authenticator apps
pub fn provisioning_uri(issuer: &str, account: &str, secret: &str) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
        percent_encode(issuer),
        percent_encode(account),
        secret,
        percent_encode(issuer),
        DIGITS,
        STEP_SECS
    )
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'@' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

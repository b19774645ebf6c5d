//! Display masking
//!
//! Partial redaction for showing sensitive values in UIs and reports. All
//! functions are pure, operate on characters (not bytes) and never panic.

use serde::{Deserialize, Serialize};

/// What kind of value is being masked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    /// `john@example.com` -> `jo**@e******.com`
    Email,
    /// Keep first and last three digits
    Phone,
    /// Keep last four digits
    Card,
    /// Keep first and last word
    Address,
    /// Keep first 8 and last 12 characters
    Guid,
    /// Keep two characters at each end
    General,
}

const MASK: char = '*';

fn stars(n: usize) -> String {
    std::iter::repeat(MASK).take(n).collect()
}

fn head(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn tail(s: &str, n: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(n)).collect()
}

/// Mask a value for display
pub fn mask(value: &str, kind: MaskKind) -> String {
    match kind {
        MaskKind::Email => mask_email(value),
        MaskKind::Phone => mask_phone(value),
        MaskKind::Card => mask_card(value),
        MaskKind::Address => mask_address(value),
        MaskKind::Guid => mask_guid(value),
        MaskKind::General => mask_general(value),
    }
}

fn mask_email(email: &str) -> String {
    let Some((user, domain)) = email.split_once('@') else {
        return "***@***.***".to_string();
    };
    let Some((domain_name, tld)) = domain.split_once('.') else {
        return "***@***.***".to_string();
    };
    if user.is_empty() || domain_name.is_empty() || tld.is_empty() || domain.contains('@') {
        return "***@***.***".to_string();
    }

    let user_len = user.chars().count();
    let domain_len = domain_name.chars().count();
    format!(
        "{}{}@{}{}.{}",
        head(user, 2),
        stars(user_len.saturating_sub(2)),
        head(domain_name, 1),
        stars(domain_len - 1),
        tld
    )
}

fn mask_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 6 {
        return stars(phone.chars().count());
    }
    format!(
        "{}{}{}",
        &digits[..3],
        stars(digits.len() - 6),
        &digits[digits.len() - 3..]
    )
}

fn mask_card(card: &str) -> String {
    let digits: String = card.chars().filter(|c| c.is_ascii_digit()).collect();
    let last_four = tail(&digits, 4);
    if digits.len() < 8 {
        return format!("{}{}", stars(12), last_four);
    }
    format!("{}{}", stars(digits.len() - 4), last_four)
}

fn mask_address(address: &str) -> String {
    let words: Vec<&str> = address.split_whitespace().collect();
    if words.len() <= 2 {
        return stars(address.chars().count());
    }
    format!("{} {} {}", words[0], stars(5), words[words.len() - 1])
}

fn mask_guid(guid: &str) -> String {
    if guid.chars().count() < 20 {
        return mask_general(guid);
    }
    format!("{}-****-****-****-{}", head(guid, 8), tail(guid, 12))
}

fn mask_general(value: &str) -> String {
    let len = value.chars().count();
    if len <= 4 {
        return stars(len);
    }
    format!("{}{}{}", head(value, 2), stars(len - 4), tail(value, 2))
}

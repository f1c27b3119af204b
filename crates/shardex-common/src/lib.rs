//! Common utilities for shardex
//!
//! Numeric conversions between RPC hex quantities and the decimal strings the
//! storage layer keeps, string normalisation for untrusted token metadata, the
//! shared retry policy and off-chain metadata resolution.

pub mod metadata;
pub mod retry;

use anyhow::{Context, Result};
use primitive_types::U256;

pub use metadata::{MetadataResolver, MetadataResolverConfig};
pub use retry::RetryPolicy;

// ===== Hex / decimal conversions =====

/// Strip an optional `0x`/`0X` prefix.
pub fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// Parse a hex quantity (`0x1a`, `1a`, `0x`) into a U256. Empty input is zero.
pub fn hex_to_u256(value: &str) -> Result<U256> {
    let digits = strip_hex_prefix(value.trim());
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16).with_context(|| format!("Invalid hex quantity: {value}"))
}

/// Parse a hex quantity into a u64.
pub fn hex_to_u64(value: &str) -> Result<u64> {
    let digits = strip_hex_prefix(value.trim());
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).with_context(|| format!("Invalid hex u64: {value}"))
}

/// Convert a hex quantity to its decimal string representation.
pub fn hex_to_decimal(value: &str) -> Result<String> {
    Ok(hex_to_u256(value)?.to_string())
}

/// Parse a decimal string back into a U256.
pub fn decimal_to_u256(value: &str) -> Result<U256> {
    U256::from_dec_str(value).with_context(|| format!("Invalid decimal amount: {value}"))
}

/// Convert a 32-byte big-endian word to a U256.
pub fn word_to_u256(word: &[u8]) -> U256 {
    let len = word.len().min(32);
    U256::from_big_endian(&word[word.len() - len..])
}

// ===== Strings =====

/// Remove NUL bytes, trim whitespace and cap the length (in characters).
///
/// Token names and symbols come from arbitrary contracts and off-chain
/// documents, so both go through this before validation.
pub fn normalize_string(value: &str, max_chars: usize) -> String {
    value
        .chars()
        .filter(|c| *c != '\0')
        .collect::<String>()
        .trim()
        .chars()
        .take(max_chars)
        .collect()
}

/// Check that a string's character count is within `[min, max]`.
pub fn length_within(value: &str, min: usize, max: usize) -> bool {
    let len = value.chars().count();
    len >= min && len <= max
}

//! Token address validation for analysis subjects.
//!
//! Input usually comes from a paste, so the first `0x` + 40 hex run is pulled
//! out of whatever surrounds it (explorer URLs, quotes, stray whitespace).

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Invalid format: must be 0x followed by 40 hex characters.")]
    InvalidFormat,
}

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[a-fA-F0-9]{40}").expect("static regex"))
}

/// Extract and normalize a 20-byte hex address. The result is lowercase.
///
/// Mixed-case input is accepted without EIP-55 checksum verification.
pub fn validate_and_normalize(raw: &str) -> Result<String, AddressError> {
    let printable: String = raw
        .trim()
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .collect();

    let found = address_re()
        .find(&printable)
        .ok_or(AddressError::InvalidFormat)?;

    // A longer hex run is a different kind of value (tx hash, key), not an address.
    let tail = &printable[found.end()..];
    if tail.starts_with(|c: char| c.is_ascii_hexdigit()) {
        return Err(AddressError::InvalidFormat);
    }

    Ok(found.as_str().to_ascii_lowercase())
}

//! EIP-55 address codec.
//!
//! Every address entering the gateway (from a request, a policy file, or an
//! allowlist) passes through [`normalize`]. The canonical form used for
//! lookups and storage is the lowercase hex rendering; [`checksum`] produces
//! the EIP-55 mixed-case form for display.

use alloy_primitives::Address;

/// Errors produced while admitting an address string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The input was empty after trimming.
    #[error("address is empty")]
    Empty,
    /// The input was not `0x` followed by 40 hex characters.
    #[error("address must be 0x followed by 40 hex characters")]
    BadLength,
    /// The input contained non-hexadecimal characters.
    #[error("address contains non-hex characters")]
    NonHex,
    /// The input was mixed-case and its EIP-55 checksum did not match.
    #[error("address failed EIP-55 checksum validation")]
    BadChecksum,
}

/// Parses and normalizes an address string.
///
/// Trims surrounding whitespace and requires the `0x` + 40 hex form. An
/// all-lowercase or all-uppercase body is accepted as unchecksummed; a
/// mixed-case body must carry a valid EIP-55 checksum.
pub fn normalize(input: &str) -> Result<Address, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    let body = trimmed.strip_prefix("0x").ok_or(AddressError::BadLength)?;
    if body.len() != 40 {
        return Err(AddressError::BadLength);
    }
    if !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressError::NonHex);
    }

    let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower {
        // Mixed case is a checksum claim; verify it rather than ignore it.
        Address::parse_checksummed(trimmed, None).map_err(|_| AddressError::BadChecksum)
    } else {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(body.to_ascii_lowercase(), &mut bytes)
            .map_err(|_| AddressError::NonHex)?;
        Ok(Address::from(bytes))
    }
}

/// Lowercase canonical rendering, the form used for storage and comparison.
pub fn canonical(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// EIP-55 mixed-case rendering for display.
pub fn checksum(address: &Address) -> String {
    address.to_checksum(None)
}

/// Compares two address strings under normalization.
///
/// Any normalization failure compares unequal.
pub fn equal(a: &str, b: &str) -> bool {
    match (normalize(a), normalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

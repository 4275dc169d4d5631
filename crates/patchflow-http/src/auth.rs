// crates/patchflow-http/src/auth.rs
// ============================================================================
// Module: Patchflow Webhook Authentication
// Description: HMAC-SHA-256 verification of host-delivered webhooks.
// Purpose: Authenticate webhook deliveries with constant-time comparison.
// Dependencies: hmac, sha2, subtle
// ============================================================================

//! ## Overview
//! Hosts sign webhook bodies with a per-tenant shared secret using
//! HMAC-SHA-256 and send the signature as `sha256=<hex>`. Verification
//! recomputes the tag over the raw body bytes and compares in constant time.
//! Any malformed header fails closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

// ============================================================================
// SECTION: Types
// ============================================================================

/// HMAC-SHA-256 instance type.
type HmacSha256 = Hmac<Sha256>;

/// Expected signature header prefix.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Webhook signature verification errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The header is missing the `sha256=` prefix or is not valid hex.
    #[error("malformed webhook signature header")]
    Malformed,
    /// The recomputed tag does not match the header.
    #[error("webhook signature mismatch")]
    Mismatch,
}

// ============================================================================
// SECTION: Verification
// ============================================================================

/// Verifies a webhook signature header against the raw body.
///
/// # Errors
///
/// Returns [`SignatureError::Malformed`] for unparseable headers and
/// [`SignatureError::Mismatch`] when the tag differs.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature_header: &str,
) -> Result<(), SignatureError> {
    let hex_tag = signature_header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::Malformed)?;
    let claimed = decode_hex(hex_tag).ok_or(SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Malformed)?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.ct_eq(claimed.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Computes the signature header value for a body; used by tests and
/// outbound tooling.
#[must_use]
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length; this branch is unreachable for
        // string secrets.
        Err(_) => return String::new(),
    };
    mac.update(body);
    let tag = mac.finalize().into_bytes();
    let mut header = String::with_capacity(SIGNATURE_PREFIX.len() + tag.len() * 2);
    header.push_str(SIGNATURE_PREFIX);
    for byte in tag {
        header.push(hex_digit(byte >> 4));
        header.push(hex_digit(byte & 0x0f));
    }
    header
}

// ============================================================================
// SECTION: Hex Helpers
// ============================================================================

/// Returns the lowercase hex digit for a nibble.
const fn hex_digit(nibble: u8) -> char {
    (match nibble {
        0..=9 => b'0' + nibble,
        _ => b'a' + (nibble - 10),
    }) as char
}

/// Decodes a lowercase or uppercase hex string.
fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let digits = hex.as_bytes();
    for pair in digits.chunks_exact(2) {
        let high = hex_value(pair[0])?;
        let low = hex_value(pair[1])?;
        bytes.push((high << 4) | low);
    }
    Some(bytes)
}

/// Returns the value of one hex digit.
const fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

//! Threadly Crypto Library
//!
//! Server-side primitives for Web Push:
//! - `ece`: aes128gcm content encoding of push payloads (RFC 8291)
//! - `vapid`: application server identification (RFC 8292)

pub mod ece;
pub mod vapid;

use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

/// Decode base64url, accepting input with or without `=` padding.
pub fn decode_b64url(input: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input.trim().trim_end_matches('='))
        .map_err(|e| anyhow!("Invalid base64url: {}", e))
}

pub fn encode_b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_and_unpadded_decode_alike() {
        let encoded = encode_b64url(b"ab");
        assert_eq!(encoded, "YWI");
        assert_eq!(decode_b64url("YWI=").unwrap(), b"ab");
        assert_eq!(decode_b64url("YWI").unwrap(), b"ab");
    }

    #[test]
    fn standard_alphabet_is_rejected() {
        assert!(decode_b64url("+/+/").is_err());
    }
}

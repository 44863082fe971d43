use crate::error::ValidationError;
use crate::parser::b64::{decode_any, encode_raw_url};
use crate::parser::sanitize::clean_token;

pub const PUBLIC_KEY_LEN: usize = 32;
const MAX_SHORT_ID_HEX: usize = 32;

/// Validates an X25519 public key and returns it as unpadded URL-safe
/// base64.
///
/// Whitespace inside the key is treated as a `+` that was mangled by form
/// decoding somewhere upstream.
pub fn normalize_public_key(input: &str) -> Result<String, ValidationError> {
    let mut key = clean_token(input);
    if key.is_empty() {
        return Err(ValidationError::InvalidRealityKey("empty".into()));
    }
    if key.chars().any(char::is_whitespace) {
        key = key
            .replace(' ', "+")
            .chars()
            .filter(|c| !matches!(c, '\t' | '\r' | '\n'))
            .collect();
    }
    let bytes = decode_any(&key)
        .ok_or_else(|| ValidationError::InvalidRealityKey(format!("{key}: not base64")))?;
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(ValidationError::InvalidRealityKey(format!(
            "{key}: decoded to {} bytes, want {PUBLIC_KEY_LEN}",
            bytes.len()
        )));
    }
    Ok(encode_raw_url(&bytes))
}

/// Validates a short ID. Empty input means "no short ID".
pub fn normalize_short_id(input: &str) -> Result<String, ValidationError> {
    let mut sid = clean_token(input).to_ascii_lowercase();
    if let Some(rest) = sid.strip_prefix("0x") {
        sid = rest.to_string();
    }
    if sid.is_empty() {
        return Ok(sid);
    }
    if sid.len() % 2 != 0 {
        return Err(ValidationError::InvalidShortId(format!("{sid}: odd length")));
    }
    if sid.len() > MAX_SHORT_ID_HEX {
        return Err(ValidationError::InvalidShortId(format!("{sid}: too long")));
    }
    if !sid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidShortId(format!("{sid}: not hex")));
    }
    Ok(sid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::b64::{RAW_STD, STD, URL};
    use base64::Engine;

    fn key_bytes() -> Vec<u8> {
        let mut bytes: Vec<u8> = (0..32u8).map(|i| i.wrapping_mul(37).wrapping_add(251)).collect();
        // Encodes to "++++" in the standard alphabet.
        bytes[3..6].copy_from_slice(&[0xFB, 0xEF, 0xBE]);
        bytes
    }

    #[test]
    fn test_public_key_variants() {
        let bytes = key_bytes();
        let want = encode_raw_url(&bytes);
        for encoded in [RAW_STD.encode(&bytes), STD.encode(&bytes), URL.encode(&bytes), want.clone()] {
            assert_eq!(normalize_public_key(&encoded).unwrap(), want);
        }
    }

    #[test]
    fn test_public_key_space_repair() {
        let bytes = key_bytes();
        let std = RAW_STD.encode(&bytes);
        assert!(std.contains('+'), "fixture should contain a plus: {std}");
        let mangled = std.replace('+', " ");
        assert_eq!(normalize_public_key(&mangled).unwrap(), encode_raw_url(&bytes));
    }

    #[test]
    fn test_public_key_wrong_length() {
        let short = RAW_STD.encode([1u8; 16]);
        assert!(matches!(
            normalize_public_key(&short),
            Err(ValidationError::InvalidRealityKey(_))
        ));
        assert!(normalize_public_key("").is_err());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(normalize_short_id("").unwrap(), "");
        assert_eq!(normalize_short_id("0xAB12").unwrap(), "ab12");
        assert!(normalize_short_id("abc").is_err());
        assert!(normalize_short_id("zz").is_err());
        assert!(normalize_short_id(&"ab".repeat(17)).is_err());
        assert_eq!(normalize_short_id(&"ab".repeat(16)).unwrap().len(), 32);
    }
}

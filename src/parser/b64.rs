use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};

const fn lenient(padded: bool) -> GeneralPurposeConfig {
    GeneralPurposeConfig::new()
        .with_encode_padding(padded)
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(if padded {
            DecodePaddingMode::RequireCanonical
        } else {
            DecodePaddingMode::RequireNone
        })
}

pub const RAW_STD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, lenient(false));
pub const STD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, lenient(true));
pub const RAW_URL: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, lenient(false));
pub const URL: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, lenient(true));

/// Tries raw standard, padded standard, raw URL-safe and padded URL-safe in
/// that order.
pub fn decode_any(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    [&RAW_STD, &STD, &RAW_URL, &URL]
        .into_iter()
        .find_map(|engine| engine.decode(input).ok())
}

/// Like [`decode_any`] but only accepts UTF-8 output.
pub fn decode_any_str(input: &str) -> Option<String> {
    decode_any(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

pub fn encode_std(bytes: &[u8], padded: bool) -> String {
    if padded {
        STD.encode(bytes)
    } else {
        RAW_STD.encode(bytes)
    }
}

pub fn encode_raw_url(bytes: &[u8]) -> String {
    RAW_URL.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_all_variants() {
        let bytes: Vec<u8> = (0u8..=250).step_by(7).collect();
        for encoded in [
            RAW_STD.encode(&bytes),
            STD.encode(&bytes),
            RAW_URL.encode(&bytes),
            URL.encode(&bytes),
        ] {
            assert_eq!(decode_any(&encoded).as_deref(), Some(bytes.as_slice()));
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_any("!!!").is_none());
        assert!(decode_any("   ").is_none());
    }
}

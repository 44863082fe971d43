use crate::error::ValidationError;
use crate::parser::query::path_unescape;
use crate::parser::sanitize::clean_token;

/// Canonicalizes a UUID to lowercase 8-4-4-4-12 form.
///
/// Accepts `{}` / `urn:uuid:` wrapping, up to two rounds of
/// percent-encoding, and the 32-digit compact form.
pub fn normalize_uuid(input: &str) -> Result<String, ValidationError> {
    let mut s = clean_token(input);
    for prefix in ["urn:uuid:", "uuid:"] {
        if s.get(..prefix.len()).is_some_and(|head| head.eq_ignore_ascii_case(prefix)) {
            s = s[prefix.len()..].to_string();
        }
    }
    s = s.trim_matches(|c| c == '{' || c == '}').to_string();

    for _ in 0..2 {
        if !s.contains('%') {
            break;
        }
        s = path_unescape(&s);
    }
    let s = s.trim().to_ascii_lowercase();

    if s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(format!(
            "{}-{}-{}-{}-{}",
            &s[0..8],
            &s[8..12],
            &s[12..16],
            &s[16..20],
            &s[20..32]
        ));
    }

    let canonical = s.len() == 36
        && s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        });
    if canonical {
        Ok(s)
    } else {
        Err(ValidationError::InvalidUuid(input.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    #[test]
    fn test_normalize_uuid_forms() {
        for input in [
            CANONICAL,
            "B831381D-6324-4D53-AD4F-8CDA48B30811",
            "b831381d63244d53ad4f8cda48b30811",
            "{b831381d-6324-4d53-ad4f-8cda48b30811}",
            "urn:uuid:b831381d-6324-4d53-ad4f-8cda48b30811",
            "b831381d%2D6324%2D4d53%2Dad4f%2D8cda48b30811",
            "b831381d%252D6324-4d53-ad4f-8cda48b30811",
            " \"b831381d-6324-4d53-ad4f-8cda48b30811\" ",
        ] {
            assert_eq!(normalize_uuid(input).unwrap(), CANONICAL, "input {input}");
        }
    }

    #[test]
    fn test_normalize_uuid_rejects() {
        for input in ["", "not-a-uuid", "b831381d-6324-4d53-ad4f-8cda48b3081", "g831381d63244d53ad4f8cda48b30811"] {
            assert!(matches!(
                normalize_uuid(input),
                Err(ValidationError::InvalidUuid(_))
            ));
        }
    }
}

//! Query-string handling with path-unescape semantics.
//!
//! Form decoding turns `+` into a space, which silently corrupts base64
//! values such as REALITY public keys. Values here are only percent-decoded.

use crate::model::Params;

/// Percent-decodes `s` once. Malformed input is returned unchanged.
pub fn path_unescape(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// Decodes repeatedly until the text stops changing.
pub fn fully_decode(s: &str) -> String {
    let mut current = s.to_string();
    for _ in 0..8 {
        if !current.contains('%') {
            break;
        }
        let next = path_unescape(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Splits on `&` and `;`, lowercases and trims keys, trims values. Empty
/// keys are skipped; a later duplicate key wins only if the earlier value
/// was blank.
pub fn parse_query_keep_plus(raw: &str) -> Params {
    let mut params = Params::new();
    for pair in raw.split(['&', ';']) {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = path_unescape(key).trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let value = path_unescape(value).trim().to_string();
        if params.get(&key).is_some_and(|v| !v.is_empty()) {
            continue;
        }
        params.insert(&key, value);
    }
    params
}

/// Escapes a value for use in a query string, keeping `+` readable as `%2B`.
pub fn query_escape(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Escapes a single path segment.
pub fn path_escape(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plus_survives() {
        let params = parse_query_keep_plus("pbk=ab+cd/ef%3D&SNI=example.com;fp=chrome");
        assert_eq!(params.get("pbk"), Some("ab+cd/ef="));
        assert_eq!(params.get("sni"), Some("example.com"));
        assert_eq!(params.get("fp"), Some("chrome"));
    }

    #[test]
    fn test_empty_keys_skipped() {
        let params = parse_query_keep_plus("=x&&flag&type=ws");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("flag"), Some(""));
        assert_eq!(params.get("type"), Some("ws"));
    }

    #[test]
    fn test_fully_decode_nested() {
        assert_eq!(fully_decode("%25E9%25A6%2599%25E6%25B8%25AF"), "香港");
        assert_eq!(fully_decode("plain"), "plain");
        assert_eq!(fully_decode("100%"), "100%");
    }
}

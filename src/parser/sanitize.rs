//! Character-level cleanup for untrusted subscription text.

use serde_yaml::Value;

use crate::model::{Node, Payload};

const ZERO_WIDTH: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

fn is_noncharacter(c: char) -> bool {
    let cp = c as u32;
    (0xFDD0..=0xFDEF).contains(&cp) || (cp & 0xFFFE) == 0xFFFE
}

/// Removes zero-width characters and replaces controls and noncharacters
/// with a space. NBSP becomes a plain space.
pub fn sanitize_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            c if ZERO_WIDTH.contains(&c) => {}
            // Lossy decoding leaves replacement characters behind.
            '\u{FFFD}' => {}
            '\u{00A0}' => out.push(' '),
            c if c.is_control() || is_noncharacter(c) => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Decodes bytes as UTF-8, dropping invalid sequences, then sanitizes.
pub fn sanitize_bytes(bytes: &[u8]) -> String {
    sanitize_string(&String::from_utf8_lossy(bytes))
}

/// Normalizes line endings and whitespace so that a YAML parser sees clean
/// input. Newlines survive; every other control becomes a space.
pub fn sanitize_text_for_yaml(s: &str) -> String {
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push('\n'),
            '\t' | '\u{00A0}' => out.push(' '),
            c if ZERO_WIDTH.contains(&c) => {}
            c if c.is_control() || is_noncharacter(c) => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

pub fn sanitize_line_text(s: &str) -> String {
    sanitize_string(s).trim().to_string()
}

/// Sanitized, trimmed, and stripped of surrounding quotes.
pub fn clean_token(s: &str) -> String {
    sanitize_string(s)
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

/// Strips everything that cannot be part of a base64 blob body.
pub fn strip_for_base64(s: &str) -> String {
    s.chars()
        .filter(|c| {
            !c.is_whitespace()
                && !ZERO_WIDTH.contains(c)
                && !c.is_control()
                && !is_noncharacter(*c)
        })
        .collect()
}

pub fn trim_bom(s: &str) -> &str {
    s.trim_start_matches('\u{FEFF}')
}

/// Sanitizes every string key and value of a YAML tree in place.
pub fn sanitize_yaml_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = sanitize_string(s),
        Value::Sequence(seq) => seq.iter_mut().for_each(sanitize_yaml_value),
        Value::Mapping(map) => {
            let taken = std::mem::take(map);
            *map = taken
                .into_iter()
                .map(|(mut k, mut v)| {
                    sanitize_yaml_value(&mut k);
                    sanitize_yaml_value(&mut v);
                    (k, v)
                })
                .collect();
        }
        Value::Tagged(tagged) => sanitize_yaml_value(&mut tagged.value),
        _ => {}
    }
}

fn sanitize_json_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = sanitize_string(s),
        serde_json::Value::Array(items) => items.iter_mut().for_each(sanitize_json_value),
        serde_json::Value::Object(map) => map.values_mut().for_each(sanitize_json_value),
        _ => {}
    }
}

/// Cleans every string field of a node. Returns `None` when the node has no
/// usable endpoint left.
pub fn sanitize_node(mut node: Node) -> Option<Node> {
    for field in [
        &mut node.raw,
        &mut node.scheme,
        &mut node.name,
        &mut node.original_name,
        &mut node.sni,
        &mut node.region,
    ] {
        *field = sanitize_string(field);
    }
    node.host = sanitize_string(&node.host).trim().to_string();
    node.scheme = node.scheme.trim().to_ascii_lowercase();
    node.params.map_values(sanitize_string);

    if let Some(uri) = node.uri.as_mut() {
        uri.userinfo = sanitize_string(&uri.userinfo);
        uri.path = sanitize_string(&uri.path);
        uri.query = sanitize_string(&uri.query);
    }

    match &mut node.payload {
        Payload::Vmess(vmess) => vmess.fields.values_mut().for_each(sanitize_json_value),
        Payload::Shadowsocks(ss) => {
            ss.method = sanitize_string(&ss.method);
            ss.password = sanitize_string(&ss.password);
            ss.plugin = sanitize_string(&ss.plugin);
        }
        Payload::Record(record) => {
            let mut value = std::mem::take(record).into_value();
            sanitize_yaml_value(&mut value);
            *record = crate::record::ProxyRecord::from_value(&value).unwrap_or_default();
        }
        Payload::None => {}
    }

    if node.host.is_empty() || node.port == 0 {
        return None;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_string_strips_invisible() {
        let s = "Node\u{200B}A\u{00A0}B\u{0007}C\u{FDD0}\u{FFFF}";
        assert_eq!(sanitize_string(s), "NodeA B C  ");
    }

    #[test]
    fn test_sanitize_text_for_yaml_keeps_lines() {
        let s = "proxies:\r\n\t- a\u{FEFF}\r- b";
        assert_eq!(sanitize_text_for_yaml(s), "proxies:\n - a\n- b");
    }

    #[test]
    fn test_clean_token_trims_quotes() {
        assert_eq!(clean_token("  \"abc\u{200D}\"  "), "abc");
        assert_eq!(clean_token("'x'"), "x");
    }

    #[test]
    fn test_sanitize_node_drops_empty_host() {
        let node = Node {
            host: "\u{200B} ".into(),
            port: 443,
            ..Default::default()
        };
        assert!(sanitize_node(node).is_none());

        let node = Node {
            host: "example.com".into(),
            port: 0,
            ..Default::default()
        };
        assert!(sanitize_node(node).is_none());
    }
}

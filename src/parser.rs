//! Subscription parsing.
//!
//! Input may be a Clash-style YAML document, a base64 blob wrapping either
//! form, or plain share URIs one per line. Individual failures become
//! warnings; only an input that yields no node at all is an error.

pub mod b64;
pub mod query;
pub mod reality;
pub mod sanitize;
pub mod uuid;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};
use url::Url;

use crate::error::ParseError;
use crate::model::{Node, Payload, Security, UriParts};
use crate::protocols::registry;
use crate::record::ProxyRecord;

use query::{fully_decode, parse_query_keep_plus};
use sanitize::{
    sanitize_line_text, sanitize_node, sanitize_text_for_yaml, strip_for_base64, trim_bom,
};

const MAX_PROVIDER_DEPTH: usize = 2;

/// A `proxy-providers` entry that still has to be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub name: String,
    pub url: String,
    /// `override.additional-prefix`, prepended to every fetched node name.
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedInput {
    pub nodes: Vec<Node>,
    pub warnings: Vec<String>,
    pub providers: Vec<ProviderSpec>,
}

/// Fetches the body of a remote proxy provider.
#[async_trait]
pub trait ProviderFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// Parses a subscription body without touching the network. Provider
/// entries are returned unresolved in [`ParsedInput::providers`].
pub fn parse_nodes_from_text(text: &str) -> Result<ParsedInput, ParseError> {
    let text = trim_bom(text).trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Some(doc) = parse_document(text) {
        return finish(doc);
    }

    if let Some(decoded) = try_decode_subscription(text) {
        match parse_nodes_from_text(&decoded) {
            Ok(out) => return Ok(out),
            Err(e) => debug!("decoded subscription yielded nothing: {}", e),
        }
    }

    finish(parse_lines(text))
}

/// Parses a subscription body and resolves `proxy-providers` through
/// `fetcher`.
pub async fn parse_nodes_with_providers(
    text: &str,
    fetcher: &dyn ProviderFetcher,
) -> Result<ParsedInput, ParseError> {
    let mut out = resolve(text, fetcher, 0).await?;
    reindex(&mut out.nodes);
    if out.nodes.is_empty() {
        return Err(ParseError::NoNodes(out.warnings));
    }
    Ok(out)
}

fn resolve<'a>(
    text: &'a str,
    fetcher: &'a dyn ProviderFetcher,
    depth: usize,
) -> BoxFuture<'a, Result<ParsedInput, ParseError>> {
    Box::pin(async move {
        let mut out = parse_nodes_from_text(text)?;
        for provider in std::mem::take(&mut out.providers) {
            let label = format!("proxy-provider {}", provider.name);
            if depth >= MAX_PROVIDER_DEPTH {
                out.warnings.push(format!("{label}: nested too deep"));
                continue;
            }
            debug!("Fetching {} from {}", label, provider.url);
            let body = match fetcher.fetch(&provider.url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("{}: fetch failed: {}", label, e);
                    out.warnings.push(format!("{label}: fetch failed: {e}"));
                    continue;
                }
            };
            let sub = match resolve(&body, fetcher, depth + 1).await {
                Ok(sub) => sub,
                Err(e) => {
                    out.warnings.push(format!("{label}: {e}"));
                    continue;
                }
            };
            if sub.nodes.is_empty() {
                out.warnings.push(format!("{label}: no nodes"));
            }
            out.warnings
                .extend(sub.warnings.into_iter().map(|w| format!("{label}: {w}")));
            for mut node in sub.nodes {
                if !provider.prefix.is_empty() {
                    node.name = format!("{}{}", provider.prefix, node.name);
                    node.original_name = format!("{}{}", provider.prefix, node.original_name);
                }
                out.nodes.push(node);
            }
        }
        Ok(out)
    })
}

fn finish(out: ParsedInput) -> Result<ParsedInput, ParseError> {
    if out.nodes.is_empty() && out.providers.is_empty() {
        return Err(ParseError::NoNodes(out.warnings));
    }
    Ok(out)
}

/// Assigns contiguous 1-based indices.
pub fn reindex(nodes: &mut [Node]) {
    for (i, node) in nodes.iter_mut().enumerate() {
        node.index = i + 1;
    }
}

fn parse_document(text: &str) -> Option<ParsedInput> {
    let value: Value = serde_yaml::from_str(&sanitize_text_for_yaml(text)).ok()?;
    let mut out = ParsedInput::default();
    match &value {
        Value::Mapping(root) => {
            let proxies = root.get("proxies").and_then(Value::as_sequence);
            let providers = root.get("proxy-providers").and_then(Value::as_mapping);
            if proxies.is_none() && providers.is_none() {
                return None;
            }
            if let Some(list) = proxies {
                parse_proxy_list(list, &mut out);
            }
            if let Some(providers) = providers {
                collect_providers(providers, &mut out);
            }
        }
        Value::Sequence(list) if list.iter().any(Value::is_mapping) => {
            parse_proxy_list(list, &mut out);
        }
        _ => return None,
    }
    Some(out)
}

fn parse_proxy_list(list: &[Value], out: &mut ParsedInput) {
    for (i, entry) in list.iter().enumerate() {
        match parse_node_from_record(entry) {
            Ok(node) => {
                if let Some(mut node) = sanitize_node(node) {
                    node.index = out.nodes.len() + 1;
                    out.nodes.push(node);
                }
            }
            Err(e) => {
                debug!("proxy {} rejected: {}", i + 1, e);
                out.warnings.push(format!("proxy {}: {}", i + 1, e));
            }
        }
    }
}

fn collect_providers(providers: &Mapping, out: &mut ParsedInput) {
    for (key, cfg) in providers {
        let name = crate::record::scalar_to_string(key).unwrap_or_default();
        let Some(cfg) = ProxyRecord::from_value(cfg) else {
            out.warnings
                .push(format!("proxy-provider {name}: entry is not a map"));
            continue;
        };
        let kind = cfg.record_type();
        if kind != "http" {
            out.warnings
                .push(format!("proxy-provider {name}: unsupported type '{kind}'"));
            continue;
        }
        let url = cfg.str("url").trim().to_string();
        if url.is_empty() {
            out.warnings.push(format!("proxy-provider {name}: missing url"));
            continue;
        }
        let prefix = cfg
            .sub_record("override")
            .map(|o| o.str("additional-prefix"))
            .unwrap_or_default();
        out.providers.push(ProviderSpec { name, url, prefix });
    }
}

/// Decodes a whole-body base64 subscription. Only accepted when the result
/// looks like a node list.
fn try_decode_subscription(text: &str) -> Option<String> {
    let compact = strip_for_base64(text);
    if compact.is_empty() || compact.contains("://") {
        return None;
    }
    let bytes = b64::decode_any(&compact)?;
    let decoded = String::from_utf8_lossy(&bytes).into_owned();
    (decoded.contains("://") || decoded.contains("proxies:")).then_some(decoded)
}

fn parse_lines(text: &str) -> ParsedInput {
    let mut out = ParsedInput::default();
    for (i, line) in text.lines().enumerate() {
        let line = sanitize_line_text(line);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_uri_unsanitized(&line) {
            Ok(node) => {
                if let Some(mut node) = sanitize_node(node) {
                    node.index = out.nodes.len() + 1;
                    out.nodes.push(node);
                }
            }
            Err(e) => {
                debug!("line {} rejected: {}", i + 1, e);
                out.warnings.push(format!("line {}: {}", i + 1, e));
            }
        }
    }
    out
}

/// Parses a single share URI into a sanitized node.
pub fn parse_node(line: &str) -> Result<Node, ParseError> {
    let node = parse_uri_unsanitized(line)?;
    sanitize_node(node).ok_or(ParseError::MissingHost)
}

fn parse_uri_unsanitized(line: &str) -> Result<Node, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    let (scheme, _) = line
        .split_once("://")
        .ok_or_else(|| ParseError::InvalidUri("missing scheme".into()))?;
    let protocol = registry()
        .resolve(scheme)
        .ok_or_else(|| ParseError::UnsupportedProtocol(scheme.to_ascii_lowercase()))?;
    protocol.parse_uri(line)
}

/// Decomposes `scheme://userinfo@host:port/path?query#fragment`. The node's
/// scheme is set to `tag`; the URI's own scheme is kept in [`UriParts`].
pub fn parse_generic_uri(raw: &str, tag: &str) -> Result<Node, ParseError> {
    let url = Url::parse(raw).map_err(|e| ParseError::InvalidUri(e.to_string()))?;
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::MissingHost)?;
    let port = url
        .port_or_known_default()
        .filter(|p| *p > 0)
        .ok_or(ParseError::InvalidPort)?;

    let mut userinfo = url.username().to_string();
    if let Some(password) = url.password() {
        userinfo.push(':');
        userinfo.push_str(password);
    }
    let query = url.query().unwrap_or_default().to_string();
    let params = parse_query_keep_plus(&query);
    let name = url.fragment().map(fully_decode).unwrap_or_default();
    let security = Security::from_param(params.first(&["security"]).unwrap_or_default());
    let sni = params
        .first(&["sni", "servername", "peer"])
        .map(str::to_string)
        .unwrap_or_else(|| host.clone());

    Ok(Node {
        raw: raw.to_string(),
        scheme: tag.to_string(),
        original_name: name.clone(),
        name,
        host,
        port,
        security,
        sni,
        uri: Some(UriParts {
            scheme: url.scheme().to_ascii_lowercase(),
            userinfo,
            path: url.path().to_string(),
            query,
        }),
        params,
        ..Default::default()
    })
}

/// Splits `host:port` or `[v6]:port`.
pub fn split_host_port(hostport: &str) -> Result<(String, u16), ParseError> {
    let hostport = hostport.trim();
    let (host, port) = match hostport.strip_prefix('[') {
        Some(rest) => {
            let (host, tail) = rest.split_once(']').ok_or(ParseError::MissingHost)?;
            (host, tail.strip_prefix(':').ok_or(ParseError::InvalidPort)?)
        }
        None => hostport.rsplit_once(':').ok_or(ParseError::InvalidPort)?,
    };
    if host.trim().is_empty() {
        return Err(ParseError::MissingHost);
    }
    let port = port
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or(ParseError::InvalidPort)?;
    Ok((host.trim().to_string(), port))
}

/// Builds a node from one structured document entry.
pub fn parse_node_from_record(value: &Value) -> Result<Node, ParseError> {
    let mut record = ProxyRecord::from_value(value)
        .ok_or_else(|| ParseError::Malformed("entry is not a map".into()))?;
    let kind = record.record_type();
    if kind.is_empty() {
        return Err(ParseError::Malformed("missing type".into()));
    }
    let protocol = registry()
        .resolve(&kind)
        .ok_or_else(|| ParseError::UnsupportedProtocol(kind.clone()))?;

    let host = record.str("server").trim().to_string();
    if host.is_empty() {
        return Err(ParseError::MissingHost);
    }
    let port = record
        .int("port")
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p > 0)
        .ok_or(ParseError::InvalidPort)?;

    let name = record.name();
    let mut node = Node {
        raw: serde_json::to_string(&record).unwrap_or_default(),
        scheme: protocol.tag().to_string(),
        original_name: name.clone(),
        name,
        host,
        port,
        ..Default::default()
    };
    if record.bool("tls") == Some(true) {
        node.security = Security::Tls;
    }
    if record
        .sub_record("reality-opts")
        .is_some_and(|r| !r.is_empty())
    {
        node.security = Security::Reality;
    }
    let sni = record.first_str(&["servername", "sni", "peer"]);
    node.sni = if sni.trim().is_empty() {
        node.host.clone()
    } else {
        sni
    };

    protocol.accept_entry(&mut record, &mut node)?;
    node.payload = Payload::Record(record);
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    #[test]
    fn test_parse_lines_with_warnings() {
        let text = format!(
            "\u{FEFF}# comment\nvless://{UUID}@a.example.com:443?security=tls#A\n\nbogus line\ntrojan://pw@b.example.com:443#B\n"
        );
        let out = parse_nodes_from_text(&text).unwrap();
        assert_eq!(out.nodes.len(), 2);
        assert_eq!(out.nodes[0].index, 1);
        assert_eq!(out.nodes[1].index, 2);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].starts_with("line 4:"), "{:?}", out.warnings);
    }

    #[test]
    fn test_parse_base64_subscription() {
        use ::base64::Engine;
        let plain = format!("vless://{UUID}@a.example.com:443#A\ntrojan://pw@b.example.com:443#B");
        let blob = b64::STD.encode(plain);
        let out = parse_nodes_from_text(&blob).unwrap();
        assert_eq!(out.nodes.len(), 2);
    }

    #[test]
    fn test_parse_document_entries() {
        let doc = r#"
proxies:
  - {name: ss1, type: shadowsocks, server: s.example.com, port: 8388, method: aes-128-gcm, password: pw}
  - {name: bad, type: ss, server: s.example.com, port: 8388}
  - {name: t1, type: trojan, server: t.example.com, port: "443", password: x, servername: sni.example.com}
  - {name: w, type: wireguard, server: w.example.com, port: 51820}
"#;
        let out = parse_nodes_from_text(doc).unwrap();
        assert_eq!(out.nodes.len(), 2);
        assert_eq!(out.nodes[0].scheme, "ss");
        assert_eq!(out.nodes[0].record().unwrap().str("cipher"), "aes-128-gcm");
        assert_eq!(out.nodes[1].security, Security::Tls);
        assert_eq!(out.nodes[1].sni, "sni.example.com");
        assert_eq!(out.warnings.len(), 2);
        assert!(out.warnings[0].starts_with("proxy 2:"));
        assert!(out.warnings[1].starts_with("proxy 4:"));
    }

    #[test]
    fn test_bare_sequence_document() {
        let doc = "- {name: s, type: socks, server: 10.0.0.1, port: 1080}\n";
        let out = parse_nodes_from_text(doc).unwrap();
        assert_eq!(out.nodes[0].scheme, "socks5");
    }

    #[test]
    fn test_sole_bad_line_is_run_error() {
        match parse_nodes_from_text("ss://not-base64-and-no-at@") {
            Err(ParseError::NoNodes(warnings)) => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].starts_with("line 1:"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse_nodes_from_text("  \n "), Err(ParseError::Empty));
    }

    #[test]
    fn test_generic_uri_ipv6_and_name() {
        let node = parse_node("trojan://pw@[2001:db8::1]:443?sni=x.example.com#%E9%A6%99%E6%B8%AF").unwrap();
        assert_eq!(node.host, "2001:db8::1");
        assert_eq!(node.name, "香港");
        assert_eq!(node.sni, "x.example.com");
        assert!(parse_node("vless://id@h.example.com#nop").is_err());
        assert!(matches!(
            parse_node("wireguard://h:1"),
            Err(ParseError::UnsupportedProtocol(_))
        ));
    }

    struct MapFetcher(HashMap<String, String>);

    #[async_trait]
    impl ProviderFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<String> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("404 for {url}"))
        }
    }

    #[tokio::test]
    async fn test_providers_are_merged_with_prefix() {
        let doc = r#"
proxies:
  - {name: local, type: socks5, server: 10.0.0.1, port: 1080}
proxy-providers:
  remote:
    type: http
    url: https://sub.example.com/a
    override:
      additional-prefix: "[R] "
  broken:
    type: http
    url: https://sub.example.com/missing
  file:
    type: file
    path: ./x.yaml
"#;
        let fetcher = MapFetcher(HashMap::from([(
            "https://sub.example.com/a".to_string(),
            "trojan://pw@r.example.com:443#Remote".to_string(),
        )]));
        let out = parse_nodes_with_providers(doc, &fetcher).await.unwrap();
        assert_eq!(out.nodes.len(), 2);
        assert_eq!(out.nodes[1].name, "[R] Remote");
        assert_eq!(out.nodes[1].original_name, "[R] Remote");
        assert_eq!(out.nodes[1].index, 2);
        assert!(out.warnings.iter().any(|w| w.starts_with("proxy-provider broken: fetch failed")));
        assert!(out.warnings.iter().any(|w| w.starts_with("proxy-provider file: unsupported type")));
    }
}

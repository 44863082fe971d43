//! Per-protocol behavior behind one trait.
//!
//! Each protocol knows how to read its share URI, accept a structured
//! document entry, synthesize an engine record from a node, and turn a
//! record back into a share URI. The registry resolves aliases such as
//! `shadowsocks` or `hy2` to the canonical tag.

mod http;
mod hysteria2;
mod shadowsocks;
mod socks5;
mod trojan;
mod tuic;
mod vless;
mod vmess;

pub use http::Http;
pub use hysteria2::Hysteria2;
pub use shadowsocks::Shadowsocks;
pub use socks5::Socks5;
pub use trojan::Trojan;
pub use tuic::Tuic;
pub use vless::Vless;
pub use vmess::Vmess;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use serde_yaml::Value;

use crate::error::{ParseError, ValidationError};
use crate::model::{Node, Params};
use crate::parser::query::{path_unescape, query_escape};
use crate::parser::reality::{normalize_public_key, normalize_short_id};
use crate::parser::uuid::normalize_uuid;
use crate::record::{ProxyRecord, parse_bool_str, split_csv};

pub trait Protocol: Send + Sync {
    /// Canonical lowercase tag, also used as the record `type`.
    fn tag(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn parse_uri(&self, raw: &str) -> Result<Node, ParseError> {
        crate::parser::parse_generic_uri(raw, self.tag())
    }

    /// Applies per-type rules to a structured document entry. `node` already
    /// carries the common endpoint fields.
    fn accept_entry(&self, _record: &mut ProxyRecord, _node: &mut Node) -> Result<(), ParseError> {
        Ok(())
    }

    /// Builds an engine record for a node that did not arrive as a record.
    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError>;

    /// Canonicalizes protocol-specific aliases in a record.
    fn normalize(&self, _record: &mut ProxyRecord) {}

    fn required_fields(&self) -> &'static [&'static str] {
        &["server", "port"]
    }

    /// Extra checks after the required-field pass. May rewrite fields into
    /// canonical form.
    fn validate(&self, _record: &mut ProxyRecord) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Share URI rebuilt from the node's own payload, if it has one.
    fn share_node(&self, node: &Node, name: &str) -> Option<String> {
        node.uri.as_ref().map(|uri| {
            let mut out = format!("{}://", uri.scheme);
            if !uri.userinfo.is_empty() {
                out.push_str(&uri.userinfo);
                out.push('@');
            }
            out.push_str(&join_host_port(&node.host, node.port));
            out.push_str(&uri.path);
            if !uri.query.is_empty() {
                out.push('?');
                out.push_str(&uri.query);
            }
            out.push('#');
            out.push_str(&query_escape(name));
            out
        })
    }

    /// Share URI synthesized from a validated record.
    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError>;
}

#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn Protocol>>,
    by_name: HashMap<String, usize>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_protocols() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Vmess));
        registry.register(Arc::new(Shadowsocks));
        registry.register(Arc::new(Vless));
        registry.register(Arc::new(Trojan));
        registry.register(Arc::new(Hysteria2));
        registry.register(Arc::new(Tuic));
        registry.register(Arc::new(Socks5));
        registry.register(Arc::new(Http));
        registry
    }

    pub fn register(&mut self, protocol: Arc<dyn Protocol>) {
        let slot = self.protocols.len();
        self.by_name.insert(protocol.tag().to_string(), slot);
        for alias in protocol.aliases() {
            self.by_name.insert(alias.to_string(), slot);
        }
        self.protocols.push(protocol);
    }

    /// Looks up a protocol by tag or alias, case-insensitively.
    pub fn resolve(&self, name: &str) -> Option<&dyn Protocol> {
        let key = name.trim().to_ascii_lowercase();
        self.by_name
            .get(&key)
            .map(|&slot| self.protocols[slot].as_ref())
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.protocols.iter().map(|p| p.tag())
    }
}

/// Process-wide registry with every built-in protocol.
pub fn registry() -> &'static ProtocolRegistry {
    static REGISTRY: LazyLock<ProtocolRegistry> =
        LazyLock::new(ProtocolRegistry::with_builtin_protocols);
    &REGISTRY
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// `name`, `type`, `server`, `port` in that order.
pub(crate) fn base_record(tag: &str, node: &Node, name: &str) -> ProxyRecord {
    let mut record = ProxyRecord::new();
    record.set("name", name);
    record.set("type", tag);
    record.set("server", node.host.as_str());
    record.set("port", node.port);
    record
}

pub(crate) fn require_uuid(raw: &str, tag: &str) -> Result<String, ValidationError> {
    normalize_uuid(raw).map_err(|e| match e {
        ValidationError::InvalidUuid(v) => ValidationError::InvalidUuid(format!("{tag}: {v}")),
        other => other,
    })
}

/// `client-fingerprint`, `alpn` and `skip-cert-verify` from URI params.
pub(crate) fn apply_tls_extras(record: &mut ProxyRecord, params: &Params) {
    if let Some(fp) = params.first(&["fp"]) {
        record.set("client-fingerprint", fp);
    }
    if let Some(alpn) = params.first(&["alpn"]) {
        record.set("alpn", split_csv(alpn));
    }
    if let Some(insecure) = params
        .first(&["allowinsecure", "insecure"])
        .and_then(parse_bool_str)
    {
        record.set("skip-cert-verify", insecure);
    }
}

/// Builds `reality-opts` from URI params. The public key is mandatory.
pub(crate) fn reality_opts(params: &Params) -> Result<ProxyRecord, ValidationError> {
    let pbk = params
        .first(&["pbk", "publickey", "public-key"])
        .unwrap_or_default();
    let mut opts = ProxyRecord::new();
    opts.set("public-key", normalize_public_key(pbk)?);
    if let Some(sid) = params.first(&["sid", "shortid", "short-id"]) {
        let sid = normalize_short_id(sid)?;
        if !sid.is_empty() {
            opts.set("short-id", sid);
        }
    }
    if let Some(spx) = params.first(&["spx", "spiderx", "spider-x"]) {
        opts.set("spider-x", spx);
    }
    Ok(opts)
}

/// Attaches `ws-opts` / `grpc-opts` when the transport matches.
pub(crate) fn apply_transport(
    record: &mut ProxyRecord,
    network: &str,
    params: &Params,
    uri_path: &str,
) {
    match network {
        "ws" => {
            let path = params
                .first(&["path"])
                .map(str::to_string)
                .or_else(|| Some(path_unescape(uri_path)).filter(|p| !p.is_empty()))
                .unwrap_or_else(|| "/".to_string());
            record.set("ws-opts", ws_opts(&path, params.first(&["host"]).unwrap_or_default()));
        }
        "grpc" => {
            if let Some(svc) = params.first(&["servicename", "service", "grpc-service-name"]) {
                let mut grpc = ProxyRecord::new();
                grpc.set("grpc-service-name", svc);
                record.set("grpc-opts", grpc);
            }
        }
        _ => {}
    }
}

pub(crate) fn ws_opts(path: &str, host: &str) -> ProxyRecord {
    let mut ws = ProxyRecord::new();
    ws.set("path", if path.is_empty() { "/" } else { path });
    if !host.is_empty() {
        let mut headers = ProxyRecord::new();
        headers.set("Host", host);
        ws.set("headers", headers);
    }
    ws
}

/// Incrementally assembled share URI.
#[derive(Debug, Default)]
pub(crate) struct ShareUri {
    scheme: String,
    userinfo: Option<String>,
    host: String,
    port: u16,
    query: Vec<(String, String)>,
    fragment: String,
}

impl ShareUri {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn user(mut self, user: &str) -> Self {
        if !user.is_empty() {
            self.userinfo = Some(query_escape(user));
        }
        self
    }

    pub fn user_password(mut self, user: &str, password: &str) -> Self {
        self.userinfo = Some(match password.is_empty() {
            true => query_escape(user),
            false => format!("{}:{}", query_escape(user), query_escape(password)),
        });
        self
    }

    /// Adds `key=value` unless the value is blank.
    pub fn param(mut self, key: &str, value: &str) -> Self {
        if !value.trim().is_empty() {
            self.query.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub fn fragment(mut self, name: &str) -> Self {
        self.fragment = name.to_string();
        self
    }

    /// Adds the transport, TLS and REALITY parameters found in a record.
    pub fn record_params(mut self, record: &ProxyRecord) -> Self {
        let network = record.str("network");
        if !network.is_empty() && network != "tcp" {
            self = self.param("type", &network);
        }
        match network.as_str() {
            "ws" => {
                if let Some(ws) = record.sub_record("ws-opts") {
                    self = self.param("path", &ws.str("path"));
                    if let Some(headers) = ws.sub_record("headers") {
                        self = self.param("host", &headers.str("Host"));
                    }
                }
            }
            "grpc" => {
                if let Some(grpc) = record.sub_record("grpc-opts") {
                    self = self.param("serviceName", &grpc.str("grpc-service-name"));
                }
            }
            _ => {}
        }
        let reality = record.sub_record("reality-opts").filter(|r| !r.is_empty());
        if let Some(reality) = &reality {
            self = self
                .param("security", "reality")
                .param("pbk", &reality.str("public-key"))
                .param("sid", &reality.str("short-id"))
                .param("spx", &reality.str("spider-x"));
        } else if record.bool("tls") == Some(true) {
            self = self.param("security", "tls");
        }
        self = self
            .param("sni", &record.first_str(&["sni", "servername"]))
            .param("fp", &record.str("client-fingerprint"))
            .param("flow", &record.str("flow"));
        if let Some(alpn) = record.str_list("alpn").filter(|a| !a.is_empty()) {
            self = self.param("alpn", &alpn.join(","));
        }
        if record.bool("skip-cert-verify") == Some(true) {
            self = self.param("insecure", "1");
        }
        self
    }

    pub fn build(self) -> String {
        let mut out = format!("{}://", self.scheme);
        if let Some(userinfo) = &self.userinfo {
            out.push_str(userinfo);
            out.push('@');
        }
        out.push_str(&join_host_port(&self.host, self.port));
        if !self.query.is_empty() {
            let query: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, query_escape(v)))
                .collect();
            out.push('?');
            out.push_str(&query.join("&"));
        }
        if !self.fragment.is_empty() {
            out.push('#');
            out.push_str(&query_escape(&self.fragment));
        }
        out
    }
}

/// Endpoint of a record, for share URI synthesis.
pub(crate) fn record_endpoint(record: &ProxyRecord) -> Result<(String, u16), ValidationError> {
    let server = record.str("server").trim().to_string();
    if server.is_empty() {
        return Err(ValidationError::MissingField("server"));
    }
    let port = record
        .int("port")
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p > 0)
        .ok_or(ValidationError::MissingField("port"))?;
    Ok((server, port))
}

/// Converts a string-or-list field into a list in place.
pub(crate) fn coerce_list(record: &mut ProxyRecord, key: &str) {
    if let Some(Value::String(_)) = record.get(key)
        && let Some(list) = record.str_list(key)
    {
        record.set(key, list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_aliases() {
        let reg = registry();
        assert_eq!(reg.resolve("shadowsocks").map(|p| p.tag()), Some("ss"));
        assert_eq!(reg.resolve("HY2").map(|p| p.tag()), Some("hysteria2"));
        assert_eq!(reg.resolve("hysteria").map(|p| p.tag()), Some("hysteria2"));
        assert_eq!(reg.resolve("socks").map(|p| p.tag()), Some("socks5"));
        assert_eq!(reg.resolve("https").map(|p| p.tag()), Some("http"));
        assert!(reg.resolve("wireguard").is_none());
        assert_eq!(reg.tags().count(), 8);
    }

    #[test]
    fn test_share_uri_builder_escapes() {
        let uri = ShareUri::new("trojan", "2001:db8::1", 443)
            .user("p@ss")
            .param("sni", "example.com")
            .param("empty", " ")
            .fragment("香港 01")
            .build();
        assert_eq!(
            uri,
            "trojan://p%40ss@[2001:db8::1]:443?sni=example.com#%E9%A6%99%E6%B8%AF%2001"
        );
    }

    #[test]
    fn test_transport_ws_defaults_path() {
        let mut record = ProxyRecord::new();
        let params = crate::parser::query::parse_query_keep_plus("type=ws&host=cdn.example.com");
        apply_transport(&mut record, "ws", &params, "");
        let ws = record.sub_record("ws-opts").unwrap();
        assert_eq!(ws.str("path"), "/");
        assert_eq!(ws.sub_record("headers").unwrap().str("Host"), "cdn.example.com");
    }
}

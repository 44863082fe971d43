use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::record::ProxyRecord;

/// Transport security advertised by a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn from_param(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "tls" => Security::Tls,
            "reality" => Security::Reality,
            _ => Security::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }

    /// True when a probe has to complete a TLS handshake.
    pub fn needs_handshake(&self) -> bool {
        matches!(self, Security::Tls | Security::Reality)
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query parameters with lowercased keys. Values keep literal `+`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .insert(key.trim().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// First non-blank value among `keys`, trimmed.
    pub fn first(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.get(k))
            .map(str::trim)
            .find(|v| !v.is_empty())
    }

    pub fn first_or_empty(&self, keys: &[&str]) -> String {
        self.first(keys).unwrap_or_default().to_string()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn map_values(&mut self, f: impl Fn(&str) -> String) {
        for v in self.0.values_mut() {
            *v = f(v);
        }
    }
}

/// Decoded vmess JSON payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmessConfig {
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// The base64 payload carried `=` padding.
    pub has_padding: bool,
}

impl VmessConfig {
    /// String view of a field; JSON numbers are stringified.
    pub fn str(&self, key: &str) -> String {
        match self.fields.get(key) {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    pub fn first_str(&self, keys: &[&str]) -> String {
        keys.iter()
            .map(|k| self.str(k))
            .find(|v| !v.is_empty())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsConfig {
    pub method: String,
    pub password: String,
    /// Raw plugin spec as it appeared after `?`.
    pub plugin: String,
}

/// Protocol-specific payload carried by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    None,
    Vmess(VmessConfig),
    Shadowsocks(SsConfig),
    Record(ProxyRecord),
}

/// Pieces of a generic `scheme://userinfo@host:port/path?query` URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriParts {
    /// Scheme as written in the source URI, lowercased.
    pub scheme: String,
    /// Still percent-encoded, without the trailing `@`.
    pub userinfo: String,
    pub path: String,
    /// Raw query string without `?`.
    pub query: String,
}

impl UriParts {
    pub fn username(&self) -> String {
        let user = self
            .userinfo
            .split_once(':')
            .map_or(self.userinfo.as_str(), |(u, _)| u);
        percent_decode(user)
    }

    pub fn password(&self) -> Option<String> {
        self.userinfo
            .split_once(':')
            .map(|(_, p)| percent_decode(p))
    }

    /// Password if present and non-empty, else the username.
    pub fn secret(&self) -> String {
        match self.password() {
            Some(p) if !p.is_empty() => p,
            _ => self.username(),
        }
    }
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// Exit-IP geolocation attached after a test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    pub ip: String,
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub org: String,
    pub asn: String,
    pub hosting: bool,
    pub proxy: bool,
    pub mobile: bool,
}

impl IpInfo {
    pub fn is_residential(&self) -> bool {
        !self.hosting && !self.proxy
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub index: usize,
    pub raw: String,
    pub scheme: String,
    pub name: String,
    pub original_name: String,
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub sni: String,
    pub region: String,
    pub uri: Option<UriParts>,
    pub params: Params,
    pub payload: Payload,
    pub ip_info: Option<IpInfo>,
}

impl Node {
    pub fn record(&self) -> Option<&ProxyRecord> {
        match &self.payload {
            Payload::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn vmess(&self) -> Option<&VmessConfig> {
        match &self.payload {
            Payload::Vmess(v) => Some(v),
            _ => None,
        }
    }

    pub fn shadowsocks(&self) -> Option<&SsConfig> {
        match &self.payload {
            Payload::Shadowsocks(s) => Some(s),
            _ => None,
        }
    }

    /// `scheme|host|port`, lowercased.
    pub fn endpoint_key(&self) -> String {
        format!("{}|{}|{}", self.scheme, self.host, self.port).to_ascii_lowercase()
    }

    /// SNI to present during a handshake, falling back to the host.
    pub fn server_name(&self) -> &str {
        if self.sni.trim().is_empty() {
            &self.host
        } else {
            &self.sni
        }
    }
}

/// Outcome of probing a single node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub done: bool,
    pub pass: bool,
    pub err: String,
    pub latency_ms: Vec<u64>,
    pub avg_ms: u64,
    pub max_ms: u64,
    pub attempts: u32,
    pub successful: u32,
}

impl TestResult {
    pub fn failed(err: impl Into<String>, attempts: u32) -> Self {
        Self {
            done: true,
            err: err.into(),
            attempts,
            ..Default::default()
        }
    }

    pub fn min_ms(&self) -> u64 {
        self.latency_ms.iter().copied().min().unwrap_or(0)
    }

    pub fn is_exportable(&self) -> bool {
        self.done && self.pass
    }
}

use crate::error::{ParseError, ValidationError};
use crate::model::{Node, Payload, SsConfig};
use crate::parser::b64::decode_any_str;
use crate::parser::query::{fully_decode, path_unescape, query_escape};
use crate::parser::split_host_port;
use crate::record::ProxyRecord;

use super::{Protocol, ShareUri, base_record, join_host_port, record_endpoint};

/// `ss://` in both the SIP002 and the fully base64-encoded form.
pub struct Shadowsocks;

impl Protocol for Shadowsocks {
    fn tag(&self) -> &'static str {
        "ss"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["shadowsocks"]
    }

    fn parse_uri(&self, raw: &str) -> Result<Node, ParseError> {
        let mut body = raw.get("ss://".len()..).ok_or(ParseError::Empty)?.trim();
        let mut name = String::new();
        if let Some((rest, fragment)) = body.split_once('#') {
            name = fully_decode(fragment);
            body = rest;
        }
        let mut plugin = String::new();
        if let Some((rest, query)) = body.split_once('?') {
            plugin = query.to_string();
            body = rest;
        }
        let body = body.trim_end_matches('/');
        if body.is_empty() {
            return Err(ParseError::Empty);
        }

        let decoded;
        let body = if body.contains('@') {
            body
        } else {
            decoded = decode_any_str(body).ok_or(ParseError::InvalidBase64)?;
            decoded.trim()
        };

        let (userinfo, hostport) = body
            .rsplit_once('@')
            .ok_or_else(|| ParseError::Malformed("ss: missing '@'".into()))?;
        let mut userinfo = path_unescape(userinfo);
        if !userinfo.contains(':')
            && let Some(decoded) = decode_any_str(&userinfo).filter(|d| d.contains(':'))
        {
            userinfo = decoded;
        }
        let (method, password) = userinfo
            .split_once(':')
            .ok_or_else(|| ParseError::Malformed("ss: invalid userinfo".into()))?;

        let (host, port) = split_host_port(hostport)?;
        Ok(Node {
            raw: raw.to_string(),
            scheme: self.tag().to_string(),
            original_name: name.clone(),
            name,
            sni: host.clone(),
            host,
            port,
            payload: Payload::Shadowsocks(SsConfig {
                method: method.trim().to_string(),
                password: password.to_string(),
                plugin,
            }),
            ..Default::default()
        })
    }

    fn accept_entry(&self, record: &mut ProxyRecord, _node: &mut Node) -> Result<(), ParseError> {
        let cipher = record.first_str(&["cipher", "method"]);
        if cipher.trim().is_empty() {
            return Err(ParseError::Malformed("ss: missing cipher".into()));
        }
        if record.str("password").trim().is_empty() {
            return Err(ParseError::Malformed("ss: missing password".into()));
        }
        record.set("cipher", cipher.trim());
        Ok(())
    }

    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
        let ss = node
            .shadowsocks()
            .ok_or_else(|| ValidationError::InvalidRecord("ss node without payload".into()))?;
        let mut record = base_record(self.tag(), node, name);
        record.set("cipher", ss.method.as_str());
        record.set("password", ss.password.as_str());
        record.set("udp", true);
        if let Some((plugin, opts)) = parse_plugin(&ss.plugin) {
            record.set("plugin", plugin);
            if !opts.is_empty() {
                record.set("plugin-opts", opts);
            }
        }
        Ok(record)
    }

    fn normalize(&self, record: &mut ProxyRecord) {
        if record.str("cipher").trim().is_empty() {
            let method = record.str("method");
            record.set_non_empty("cipher", method.trim());
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["cipher", "password", "server", "port"]
    }

    fn share_node(&self, node: &Node, name: &str) -> Option<String> {
        let ss = node.shadowsocks()?;
        let mut out = format!(
            "ss://{}:{}@{}",
            query_escape(&ss.method),
            query_escape(&ss.password),
            join_host_port(&node.host, node.port)
        );
        if !ss.plugin.is_empty() {
            out.push('?');
            out.push_str(&ss.plugin);
        }
        out.push('#');
        out.push_str(&query_escape(name));
        Some(out)
    }

    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError> {
        let (server, port) = record_endpoint(record)?;
        let cipher = record.first_str(&["cipher", "method"]);
        let password = record.str("password");
        if cipher.is_empty() {
            return Err(ValidationError::MissingField("cipher"));
        }
        if password.is_empty() {
            return Err(ValidationError::MissingField("password"));
        }
        let mut uri = ShareUri::new(self.tag(), &server, port).user_password(&cipher, &password);
        let plugin = record.str("plugin");
        if !plugin.is_empty() {
            let mut spec = vec![plugin];
            if let Some(opts) = record.sub_record("plugin-opts") {
                for (k, v) in opts.iter() {
                    match v {
                        serde_yaml::Value::Bool(true) => spec.push(k.to_string()),
                        other => {
                            if let Some(v) = crate::record::scalar_to_string(other) {
                                spec.push(format!("{k}={v}"));
                            }
                        }
                    }
                }
            }
            uri = uri.param("plugin", &spec.join(";"));
        }
        Ok(uri.fragment(name).build())
    }
}

/// Splits a plugin spec such as `obfs-local;obfs=http;tls` into its name and
/// option map. Accepts the spec either bare or as a `plugin=` query.
pub fn parse_plugin(raw: &str) -> Option<(String, ProxyRecord)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let spec = raw
        .split('&')
        .find_map(|pair| pair.strip_prefix("plugin="))
        .map(|v| path_unescape(&v.replace('+', " ")))
        .unwrap_or_else(|| raw.to_string());

    let mut parts = spec.split(';');
    let name = parts.next().unwrap_or_default().trim().to_string();
    if name.is_empty() {
        return None;
    }
    let mut opts = ProxyRecord::new();
    for part in parts.map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((k, v)) => opts.set(k, v),
            None => opts.set(part, true),
        }
    }
    Some((name, opts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::b64::{RAW_URL, STD};
    use base64::Engine;

    #[test]
    fn test_ss_sip002() {
        let userinfo = RAW_URL.encode("aes-256-gcm:pa:ss");
        let raw = format!("ss://{userinfo}@ss.example.com:8388/?plugin=obfs-local%3Bobfs%3Dhttp#Tokyo%2001");
        let node = Shadowsocks.parse_uri(&raw).unwrap();
        assert_eq!(node.name, "Tokyo 01");
        assert_eq!(node.host, "ss.example.com");
        assert_eq!(node.port, 8388);
        let ss = node.shadowsocks().unwrap();
        assert_eq!(ss.method, "aes-256-gcm");
        assert_eq!(ss.password, "pa:ss");
        assert_eq!(ss.plugin, "plugin=obfs-local%3Bobfs%3Dhttp");

        let record = Shadowsocks.synthesize(&node, "Tokyo").unwrap();
        assert_eq!(record.str("plugin"), "obfs-local");
        assert_eq!(record.sub_record("plugin-opts").unwrap().str("obfs"), "http");
    }

    #[test]
    fn test_ss_fully_encoded() {
        let body = STD.encode("chacha20-ietf-poly1305:secret@[2001:db8::2]:443");
        let node = Shadowsocks.parse_uri(&format!("ss://{body}#v6")).unwrap();
        assert_eq!(node.host, "2001:db8::2");
        assert_eq!(node.port, 443);
        assert_eq!(node.shadowsocks().unwrap().password, "secret");
    }

    #[test]
    fn test_ss_rejects_garbage() {
        assert!(Shadowsocks.parse_uri("ss://not-base64-and-no-at@").is_err());
        assert!(Shadowsocks.parse_uri("ss://").is_err());
    }

    #[test]
    fn test_plugin_flags() {
        let (name, opts) = parse_plugin("v2ray-plugin;tls;host=cdn.example.com").unwrap();
        assert_eq!(name, "v2ray-plugin");
        assert_eq!(opts.bool("tls"), Some(true));
        assert_eq!(opts.str("host"), "cdn.example.com");
        assert!(parse_plugin("  ").is_none());
    }
}

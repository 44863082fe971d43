use serde_json::Value as JsonValue;

use crate::error::{ParseError, ValidationError};
use crate::model::{Node, Payload, Security, VmessConfig};
use crate::parser::b64::{decode_any_str, encode_std};
use crate::parser::sanitize::strip_for_base64;
use crate::record::{ProxyRecord, parse_bool_str, parse_int_lenient, split_csv};

use super::{Protocol, base_record, record_endpoint, require_uuid, ws_opts};

/// `vmess://<base64 json>`
pub struct Vmess;

impl Protocol for Vmess {
    fn tag(&self) -> &'static str {
        "vmess"
    }

    fn parse_uri(&self, raw: &str) -> Result<Node, ParseError> {
        let payload = raw
            .get("vmess://".len()..)
            .ok_or(ParseError::InvalidBase64)?
            .trim();
        let has_padding = payload.contains('=');
        let decoded = decode_any_str(&strip_for_base64(payload)).ok_or(ParseError::InvalidBase64)?;
        let fields = match serde_json::from_str::<JsonValue>(&decoded) {
            Ok(JsonValue::Object(map)) => map,
            Ok(_) => return Err(ParseError::InvalidJson("not an object".into())),
            Err(e) => return Err(ParseError::InvalidJson(e.to_string())),
        };
        let mut vmess = VmessConfig {
            fields,
            has_padding,
        };

        let host = vmess.str("add");
        if host.is_empty() {
            return Err(ParseError::MissingHost);
        }
        let port = parse_int_lenient(&vmess.str("port"))
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .ok_or(ParseError::InvalidPort)?;

        let security = if vmess.str("tls").eq_ignore_ascii_case("tls") {
            Security::Tls
        } else {
            Security::None
        };
        let sni = vmess.str("sni");
        if vmess.first_str(&["scy", "cipher"]).is_empty() {
            vmess.fields.insert("scy".into(), JsonValue::String("auto".into()));
        }

        let name = vmess.str("ps");
        Ok(Node {
            raw: raw.to_string(),
            scheme: self.tag().to_string(),
            original_name: name.clone(),
            name,
            sni: if sni.is_empty() { host.clone() } else { sni },
            host,
            port,
            security,
            payload: Payload::Vmess(vmess),
            ..Default::default()
        })
    }

    fn accept_entry(&self, record: &mut ProxyRecord, _node: &mut Node) -> Result<(), ParseError> {
        if record.str("cipher").trim().is_empty() {
            record.set("cipher", "auto");
        }
        Ok(())
    }

    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
        let vmess = node
            .vmess()
            .ok_or_else(|| ValidationError::InvalidRecord("vmess node without payload".into()))?;
        let uuid = require_uuid(&vmess.str("id"), self.tag())?;
        let network = vmess.str("net").to_ascii_lowercase();

        let mut record = base_record(self.tag(), node, name);
        record.set("uuid", uuid);
        record.set("udp", true);
        let cipher = vmess.first_str(&["scy", "cipher"]);
        record.set("cipher", if cipher.is_empty() { "auto" } else { cipher.as_str() });
        if let Some(aid) = parse_int_lenient(&vmess.str("aid")) {
            record.set("alterId", aid);
        }
        if !network.is_empty() {
            record.set("network", network.as_str());
        }
        let tls = vmess.str("tls").to_ascii_lowercase();
        if !tls.is_empty() {
            record.set("tls", tls == "tls" || tls == "true");
        }
        record.set_non_empty("servername", &vmess.str("sni"));
        record.set_non_empty("client-fingerprint", &vmess.str("fp"));
        let alpn = vmess.str("alpn");
        if !alpn.is_empty() {
            record.set("alpn", split_csv(&alpn));
        }
        if let Some(insecure) = parse_bool_str(&vmess.first_str(&["allowInsecure", "allowinsecure"])) {
            record.set("skip-cert-verify", insecure);
        }
        match network.as_str() {
            "ws" => record.set("ws-opts", ws_opts(&vmess.str("path"), &vmess.str("host"))),
            "grpc" => {
                let svc = vmess.first_str(&["serviceName", "servicename", "path"]);
                if !svc.is_empty() {
                    let mut grpc = ProxyRecord::new();
                    grpc.set("grpc-service-name", svc);
                    record.set("grpc-opts", grpc);
                }
            }
            _ => {}
        }
        Ok(record)
    }

    fn normalize(&self, record: &mut ProxyRecord) {
        if record.str("cipher").trim().is_empty() {
            record.set("cipher", "auto");
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["uuid", "server", "port"]
    }

    fn validate(&self, record: &mut ProxyRecord) -> Result<(), ValidationError> {
        let uuid = require_uuid(&record.str("uuid"), self.tag())?;
        record.set("uuid", uuid);
        Ok(())
    }

    fn share_node(&self, node: &Node, name: &str) -> Option<String> {
        let vmess = node.vmess()?;
        let mut fields = vmess.fields.clone();
        fields.insert("ps".into(), JsonValue::String(name.to_string()));
        let json = serde_json::to_string(&JsonValue::Object(fields)).ok()?;
        Some(format!("vmess://{}", encode_std(json.as_bytes(), vmess.has_padding)))
    }

    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError> {
        let (server, port) = record_endpoint(record)?;
        let network = record.str("network");
        let mut fields = serde_json::Map::new();
        let mut put = |k: &str, v: JsonValue| {
            fields.insert(k.to_string(), v);
        };
        put("v", JsonValue::String("2".into()));
        put("ps", JsonValue::String(name.to_string()));
        put("add", JsonValue::String(server));
        put("port", JsonValue::from(port));
        put("id", JsonValue::String(record.str("uuid")));
        put("aid", JsonValue::from(record.int("alterId").unwrap_or(0)));
        put("scy", JsonValue::String(record.str("cipher")));
        put("net", JsonValue::String(if network.is_empty() { "tcp".into() } else { network.clone() }));
        put("type", JsonValue::String("none".into()));
        let tls = if record.bool("tls") == Some(true) { "tls" } else { "" };
        put("tls", JsonValue::String(tls.into()));
        put("sni", JsonValue::String(record.first_str(&["servername", "sni"])));

        let (mut path, mut host) = (String::new(), String::new());
        if network == "ws"
            && let Some(ws) = record.sub_record("ws-opts")
        {
            path = ws.str("path");
            host = ws.sub_record("headers").map(|h| h.str("Host")).unwrap_or_default();
        } else if network == "grpc"
            && let Some(grpc) = record.sub_record("grpc-opts")
        {
            path = grpc.str("grpc-service-name");
        }
        put("path", JsonValue::String(path));
        put("host", JsonValue::String(host));

        let json = serde_json::to_string(&JsonValue::Object(fields))
            .map_err(|e| ValidationError::InvalidRecord(e.to_string()))?;
        Ok(format!("vmess://{}", encode_std(json.as_bytes(), true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::b64::{RAW_STD, STD};
    use base64::Engine;

    fn link(json: &str, padded: bool) -> String {
        let body = if padded { STD.encode(json) } else { RAW_STD.encode(json) };
        format!("vmess://{body}")
    }

    const JSON: &str = r#"{"v":"2","ps":"HK 01","add":"v.example.com","port":"443","id":"b831381d63244d53ad4f8cda48b30811","aid":"0","net":"ws","path":"/ray","host":"cdn.example.com","tls":"tls"}"#;

    #[test]
    fn test_vmess_parse_defaults() {
        let node = Vmess.parse_uri(&link(JSON, true)).unwrap();
        assert_eq!(node.host, "v.example.com");
        assert_eq!(node.port, 443);
        assert_eq!(node.name, "HK 01");
        assert_eq!(node.security, Security::Tls);
        assert_eq!(node.sni, "v.example.com");
        let vmess = node.vmess().unwrap();
        assert_eq!(vmess.str("scy"), "auto");
    }

    #[test]
    fn test_vmess_padding_is_remembered() {
        // Both the fixture and the re-encoded payload need `==` padding.
        assert_eq!(JSON.len() % 3, 1);
        let padded = Vmess.parse_uri(&link(JSON, true)).unwrap();
        let raw = Vmess.parse_uri(&link(JSON, false)).unwrap();
        assert!(padded.vmess().unwrap().has_padding);
        assert!(!raw.vmess().unwrap().has_padding);

        let out = Vmess.share_node(&padded, "X").unwrap();
        assert!(out.ends_with('='));
        let out = Vmess.share_node(&raw, "X").unwrap();
        assert!(!out.ends_with('='));
    }

    #[test]
    fn test_vmess_synthesis() {
        let node = Vmess.parse_uri(&link(JSON, true)).unwrap();
        let record = Vmess.synthesize(&node, "HK").unwrap();
        assert_eq!(record.str("uuid"), "b831381d-6324-4d53-ad4f-8cda48b30811");
        assert_eq!(record.str("cipher"), "auto");
        assert_eq!(record.int("alterId"), Some(0));
        assert_eq!(record.bool("tls"), Some(true));
        let ws = record.sub_record("ws-opts").unwrap();
        assert_eq!(ws.str("path"), "/ray");
    }

    #[test]
    fn test_vmess_rejects_non_json() {
        let bad = format!("vmess://{}", STD.encode("not json"));
        assert!(matches!(Vmess.parse_uri(&bad), Err(ParseError::InvalidJson(_))));
    }
}

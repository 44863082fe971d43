use crate::error::{ParseError, ValidationError};
use crate::model::{Node, Security};
use crate::record::ProxyRecord;

use super::{
    Protocol, ShareUri, apply_tls_extras, apply_transport, base_record, reality_opts,
    record_endpoint,
};

/// `trojan://password@host:port?sni=...#name`. TLS is always on.
pub struct Trojan;

impl Protocol for Trojan {
    fn tag(&self) -> &'static str {
        "trojan"
    }

    fn parse_uri(&self, raw: &str) -> Result<Node, ParseError> {
        let mut node = crate::parser::parse_generic_uri(raw, self.tag())?;
        if node.params.first(&["security"]).is_none() {
            node.security = Security::Tls;
        }
        Ok(node)
    }

    fn accept_entry(&self, record: &mut ProxyRecord, node: &mut Node) -> Result<(), ParseError> {
        if record.str("password").trim().is_empty() {
            return Err(ParseError::Malformed("trojan: missing password".into()));
        }
        if node.security == Security::None {
            node.security = Security::Tls;
        }
        let sni = record.first_str(&["sni", "servername", "peer"]);
        node.sni = if sni.is_empty() { node.host.clone() } else { sni };
        Ok(())
    }

    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
        let uri = node
            .uri
            .as_ref()
            .ok_or_else(|| ValidationError::InvalidRecord("trojan node without uri".into()))?;
        let password = uri.secret();
        if password.trim().is_empty() {
            return Err(ValidationError::MissingField("password"));
        }
        let params = &node.params;
        let network = params
            .first(&["type"])
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "tcp".to_string());
        let security = params
            .first(&["security"])
            .unwrap_or(node.security.as_str())
            .to_ascii_lowercase();

        let mut record = base_record(self.tag(), node, name);
        record.set("password", password);
        record.set("udp", true);
        record.set("tls", true);

        let sni = params
            .first(&["sni", "peer", "servername"])
            .unwrap_or(node.sni.as_str());
        record.set_non_empty("sni", sni);
        apply_tls_extras(&mut record, params);

        if security == "reality" {
            record.set("reality-opts", reality_opts(params)?);
        }
        if network != "tcp" {
            record.set("network", network.as_str());
        }
        apply_transport(&mut record, &network, params, &uri.path);
        Ok(record)
    }

    fn normalize(&self, record: &mut ProxyRecord) {
        record.set("tls", true);
        if record.str("sni").trim().is_empty() {
            let servername = record.str("servername");
            record.set_non_empty("sni", servername.trim());
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["password", "server", "port"]
    }

    fn validate(&self, record: &mut ProxyRecord) -> Result<(), ValidationError> {
        record.set("tls", true);
        Ok(())
    }

    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError> {
        let (server, port) = record_endpoint(record)?;
        let password = record.str("password");
        if password.is_empty() {
            return Err(ValidationError::MissingField("password"));
        }
        Ok(ShareUri::new(self.tag(), &server, port)
            .user(&password)
            .record_params(record)
            .fragment(name)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_node;

    #[test]
    fn test_trojan_defaults_to_tls() {
        let node = parse_node("trojan://secret@t.example.com:443?peer=cdn.example.com#T").unwrap();
        assert_eq!(node.security, Security::Tls);
        assert_eq!(node.sni, "cdn.example.com");

        let record = Trojan.synthesize(&node, "T").unwrap();
        assert_eq!(record.str("password"), "secret");
        assert_eq!(record.bool("tls"), Some(true));
        assert_eq!(record.str("sni"), "cdn.example.com");
        assert!(!record.contains("network"));
    }

    #[test]
    fn test_trojan_ws_share_round() {
        let node =
            parse_node("trojan://pw@t.example.com:8443?type=ws&path=%2Fws&host=cdn.example.com#T")
                .unwrap();
        let record = Trojan.synthesize(&node, "T").unwrap();
        assert_eq!(record.str("network"), "ws");
        let uri = Trojan.share_uri(&record, "New").unwrap();
        assert!(uri.starts_with("trojan://pw@t.example.com:8443?type=ws&path=%2Fws&host=cdn.example.com"));
        assert!(uri.ends_with("#New"));
    }
}

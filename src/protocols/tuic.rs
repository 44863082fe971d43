use crate::error::{ParseError, ValidationError};
use crate::model::{Node, Security};
use crate::record::{ProxyRecord, split_csv};

use super::{Protocol, ShareUri, base_record, coerce_list, record_endpoint};

pub struct Tuic;

impl Protocol for Tuic {
    fn tag(&self) -> &'static str {
        "tuic"
    }

    fn accept_entry(&self, record: &mut ProxyRecord, _node: &mut Node) -> Result<(), ParseError> {
        if record.str("uuid").trim().is_empty() {
            let token = record.str("token");
            record.set_non_empty("uuid", token.trim());
        }
        coerce_list(record, "alpn");
        Ok(())
    }

    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
        let mut record = base_record(self.tag(), node, name);
        record.set("udp", true);
        if let Some(uri) = &node.uri {
            record.set_non_empty("uuid", &uri.username());
            if let Some(password) = uri.password() {
                record.set_non_empty("password", &password);
            }
        }
        let params = &node.params;
        record.set_non_empty("sni", params.first_or_empty(&["sni"]).as_str());
        record.set_non_empty(
            "congestion-controller",
            params
                .first_or_empty(&["congestion-controller", "congestion_control"])
                .as_str(),
        );
        if let Some(alpn) = params.first(&["alpn"]) {
            record.set("alpn", split_csv(alpn));
        }
        if node.security == Security::Tls {
            record.set("tls", true);
        }
        Ok(record)
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["uuid", "server", "port"]
    }

    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError> {
        let (server, port) = record_endpoint(record)?;
        let uuid = record.str("uuid");
        if uuid.is_empty() {
            return Err(ValidationError::MissingField("uuid"));
        }
        let password = record.first_str(&["password", "token"]);
        let mut uri = ShareUri::new(self.tag(), &server, port)
            .user_password(&uuid, &password)
            .param("sni", &record.str("sni"))
            .param("congestion-controller", &record.str("congestion-controller"));
        if let Some(alpn) = record.str_list("alpn") {
            uri = uri.param("alpn", &alpn.join(","));
        }
        if record.bool("skip-cert-verify") == Some(true) {
            uri = uri.param("insecure", "1");
        }
        Ok(uri.fragment(name).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuic_entry_aliases() {
        let value: serde_yaml::Value = serde_yaml::from_str(
            "{name: t, type: tuic, server: t.example.com, port: 443, token: abc, alpn: 'h3,h2'}",
        )
        .unwrap();
        let mut record = ProxyRecord::from_value(&value).unwrap();
        let mut node = Node::default();
        Tuic.accept_entry(&mut record, &mut node).unwrap();
        assert_eq!(record.str("uuid"), "abc");
        assert_eq!(
            record.str_list("alpn").unwrap(),
            vec!["h3".to_string(), "h2".to_string()]
        );
        assert!(matches!(record.get("alpn"), Some(serde_yaml::Value::Sequence(_))));
    }
}

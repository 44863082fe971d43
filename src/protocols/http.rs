use crate::error::{ParseError, ValidationError};
use crate::model::{Node, Security};
use crate::record::ProxyRecord;

use super::{Protocol, ShareUri, base_record, record_endpoint};

/// Plain HTTP proxies. `https` is folded into `http` with TLS on.
pub struct Http;

impl Protocol for Http {
    fn tag(&self) -> &'static str {
        "http"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["https"]
    }

    fn parse_uri(&self, raw: &str) -> Result<Node, ParseError> {
        let mut node = crate::parser::parse_generic_uri(raw, self.tag())?;
        if node.uri.as_ref().is_some_and(|u| u.scheme == "https") {
            node.security = Security::Tls;
        }
        Ok(node)
    }

    fn accept_entry(&self, record: &mut ProxyRecord, node: &mut Node) -> Result<(), ParseError> {
        if record.record_type() == "https" || record.bool("tls") == Some(true) {
            node.security = Security::Tls;
        }
        Ok(())
    }

    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
        let mut record = base_record(self.tag(), node, name);
        if let Some(uri) = &node.uri {
            record.set_non_empty("username", &uri.username());
            if let Some(password) = uri.password() {
                record.set_non_empty("password", &password);
            }
        }
        if node.security == Security::Tls {
            record.set("tls", true);
            if node.sni != node.host {
                record.set_non_empty("sni", &node.sni);
            }
        }
        Ok(record)
    }

    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError> {
        let (server, port) = record_endpoint(record)?;
        let scheme = if record.bool("tls") == Some(true) {
            "https"
        } else {
            "http"
        };
        let mut uri = ShareUri::new(scheme, &server, port);
        let username = record.str("username");
        if !username.is_empty() {
            uri = uri.user_password(&username, &record.str("password"));
        }
        Ok(uri.fragment(name).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_node;

    #[test]
    fn test_https_folds_into_http() {
        let node = parse_node("https://user:pw@proxy.example.com:8443#P").unwrap();
        assert_eq!(node.scheme, "http");
        assert_eq!(node.security, Security::Tls);
        let record = Http.synthesize(&node, "P").unwrap();
        assert_eq!(record.str("type"), "http");
        assert_eq!(record.bool("tls"), Some(true));
        assert_eq!(record.str("username"), "user");
        assert_eq!(
            Http.share_uri(&record, "P").unwrap(),
            "https://user:pw@proxy.example.com:8443#P"
        );
    }
}

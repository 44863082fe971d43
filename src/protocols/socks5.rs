use crate::error::ValidationError;
use crate::model::{Node, Security};
use crate::record::ProxyRecord;

use super::{Protocol, ShareUri, base_record, record_endpoint};

pub struct Socks5;

impl Protocol for Socks5 {
    fn tag(&self) -> &'static str {
        "socks5"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["socks"]
    }

    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
        let mut record = base_record(self.tag(), node, name);
        record.set("udp", true);
        if let Some(uri) = &node.uri {
            record.set_non_empty("username", &uri.username());
            if let Some(password) = uri.password() {
                record.set_non_empty("password", &password);
            }
        }
        if node.security == Security::Tls {
            record.set("tls", true);
        }
        Ok(record)
    }

    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError> {
        let (server, port) = record_endpoint(record)?;
        let mut uri = ShareUri::new(self.tag(), &server, port);
        let username = record.str("username");
        if !username.is_empty() {
            uri = uri.user_password(&username, &record.str("password"));
        }
        if record.bool("tls") == Some(true) {
            uri = uri.param("tls", "1");
        }
        Ok(uri.fragment(name).build())
    }
}

use crate::error::{ParseError, ValidationError};
use crate::model::{Node, Security};
use crate::record::ProxyRecord;

use super::{Protocol, ShareUri, base_record, record_endpoint};

pub struct Hysteria2;

impl Protocol for Hysteria2 {
    fn tag(&self) -> &'static str {
        "hysteria2"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["hysteria", "hy2"]
    }

    fn accept_entry(&self, record: &mut ProxyRecord, _node: &mut Node) -> Result<(), ParseError> {
        if record.str("password").trim().is_empty() {
            let auth = record.str("auth");
            record.set_non_empty("password", auth.trim());
        }
        Ok(())
    }

    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
        let mut record = base_record(self.tag(), node, name);
        if let Some(uri) = &node.uri
            && !uri.userinfo.is_empty()
        {
            record.set("password", uri.secret());
        }
        let params = &node.params;
        record.set_non_empty("sni", params.first_or_empty(&["sni", "peer"]).as_str());
        record.set_non_empty("obfs", params.first_or_empty(&["obfs"]).as_str());
        record.set_non_empty(
            "obfs-password",
            params.first_or_empty(&["obfs-password"]).as_str(),
        );
        if node.security == Security::Tls {
            record.set("tls", true);
        }
        Ok(record)
    }

    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError> {
        let (server, port) = record_endpoint(record)?;
        let mut uri = ShareUri::new(self.tag(), &server, port)
            .user(&record.first_str(&["password", "auth"]))
            .param("sni", &record.str("sni"))
            .param("obfs", &record.str("obfs"))
            .param("obfs-password", &record.str("obfs-password"));
        if record.bool("skip-cert-verify") == Some(true) {
            uri = uri.param("insecure", "1");
        }
        Ok(uri.fragment(name).build())
    }
}

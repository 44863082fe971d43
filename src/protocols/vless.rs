use crate::error::ValidationError;
use crate::model::Node;
use crate::record::ProxyRecord;

use super::{
    Protocol, ShareUri, apply_tls_extras, apply_transport, base_record, reality_opts,
    record_endpoint, require_uuid,
};

/// Maps the `encryption` parameter onto the two values engines accept.
pub fn normalize_encryption(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "auto" => "auto",
        _ => "none",
    }
}

/// `vless://uuid@host:port?type=ws&security=reality&pbk=...#name`
pub struct Vless;

impl Protocol for Vless {
    fn tag(&self) -> &'static str {
        "vless"
    }

    fn synthesize(&self, node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
        let uri = node
            .uri
            .as_ref()
            .ok_or_else(|| ValidationError::InvalidRecord("vless node without uri".into()))?;
        let uuid = require_uuid(&uri.username(), "vless")?;
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
        record.set("uuid", uuid);
        record.set("udp", true);
        record.set("tls", security == "tls" || security == "reality");
        record.set("network", network.as_str());
        record.set(
            "encryption",
            normalize_encryption(params.first(&["encryption"]).unwrap_or_default()),
        );

        let sni = params
            .first(&["sni", "servername", "peer"])
            .unwrap_or(node.sni.as_str());
        record.set_non_empty("servername", sni);
        apply_tls_extras(&mut record, params);
        if let Some(flow) = params.first(&["flow"]) {
            record.set("flow", flow);
        }

        if security == "reality" {
            record.set("reality-opts", reality_opts(params)?);
            record.set("tls", true);
        }
        apply_transport(&mut record, &network, params, &uri.path);
        Ok(record)
    }

    fn normalize(&self, record: &mut ProxyRecord) {
        let encryption = normalize_encryption(&record.str("encryption"));
        record.set("encryption", encryption);
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["uuid", "server", "port"]
    }

    fn validate(&self, record: &mut ProxyRecord) -> Result<(), ValidationError> {
        let uuid = require_uuid(&record.str("uuid"), self.tag())?;
        record.set("uuid", uuid);
        Ok(())
    }

    fn share_uri(&self, record: &ProxyRecord, name: &str) -> Result<String, ValidationError> {
        let (server, port) = record_endpoint(record)?;
        let uuid = record.str("uuid");
        if uuid.is_empty() {
            return Err(ValidationError::MissingField("uuid"));
        }
        let mut uri = ShareUri::new(self.tag(), &server, port).user(&uuid);
        let encryption = record.str("encryption");
        if !encryption.is_empty() {
            uri = uri.param("encryption", &encryption);
        }
        Ok(uri.record_params(record).fragment(name).build())
    }
}

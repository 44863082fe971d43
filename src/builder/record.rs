use crate::error::ValidationError;
use crate::model::Node;
use crate::parser::reality::{normalize_public_key, normalize_short_id};
use crate::parser::sanitize::sanitize_yaml_value;
use crate::protocols::registry;
use crate::record::ProxyRecord;

use super::validate::{PUBLIC_KEY_ALIASES, SHORT_ID_ALIASES, validate_record};

/// Synthesizes the engine record for `node` under `name` and runs it
/// through the validation gate.
///
/// Nodes that arrived as structured document entries keep their original
/// record; only `name` is replaced before normalization.
pub fn node_to_record(node: &Node, name: &str) -> Result<ProxyRecord, ValidationError> {
    let mut record = match node.record() {
        Some(original) => {
            let mut record = original.clone();
            record.set("name", name);
            normalize_record(record)
        }
        None => {
            let protocol = registry()
                .resolve(&node.scheme)
                .ok_or_else(|| ValidationError::UnsupportedProtocol(node.scheme.clone()))?;
            normalize_record(protocol.synthesize(node, name)?)
        }
    };
    validate_record(&mut record)?;
    Ok(record)
}

/// Sanitizes every string in the record, canonicalizes the `type` and
/// protocol aliases, and tidies `reality-opts`.
pub fn normalize_record(record: ProxyRecord) -> ProxyRecord {
    let mut value = record.into_value();
    sanitize_yaml_value(&mut value);
    let mut record = ProxyRecord::from_value(&value).unwrap_or_default();

    let declared = record.record_type();
    if let Some(protocol) = registry().resolve(&declared) {
        if declared == "https" {
            record.set("tls", true);
        }
        record.set("type", protocol.tag());
        protocol.normalize(&mut record);
    }
    canonicalize_reality(&mut record);
    record
}

/// Folds key aliases into `public-key` / `short-id`. A non-empty option
/// tree forces `tls`. Invalid values are left for the validation gate.
fn canonicalize_reality(record: &mut ProxyRecord) {
    let Some(mut opts) = record.sub_record("reality-opts") else {
        return;
    };
    if opts.is_empty() {
        return;
    }

    let public_key = opts.first_str(PUBLIC_KEY_ALIASES);
    let public_key = normalize_public_key(&public_key).unwrap_or(public_key);
    let short_id = opts.first_str(SHORT_ID_ALIASES);
    let short_id = normalize_short_id(&short_id).unwrap_or(short_id);
    for alias in PUBLIC_KEY_ALIASES.iter().chain(SHORT_ID_ALIASES) {
        opts.remove(alias);
    }
    opts.set_non_empty("public-key", &public_key);
    opts.set_non_empty("short-id", &short_id);

    record.set("reality-opts", opts);
    record.set("tls", true);
}

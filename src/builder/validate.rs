//! The validation gate every record passes before it reaches the engine or
//! an export document, plus the flow rejection policy.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::ValidationError;
use crate::model::Node;
use crate::parser::reality::{normalize_public_key, normalize_short_id};
use crate::protocols::registry;
use crate::record::ProxyRecord;

use super::naming::{display_name, unique_name};
use super::record::node_to_record;

pub(crate) const PUBLIC_KEY_ALIASES: &[&str] = &["public-key", "publicKey", "publickey", "pbk"];
pub(crate) const SHORT_ID_ALIASES: &[&str] = &["short-id", "shortId", "shortid", "sid"];

/// Legacy XTLS flows no current engine accepts.
pub const DEPRECATED_FLOWS: &[&str] = &["xtls-rprx-direct", "xtls-rprx-origin"];

/// Checks required fields, re-validates identities and enforces the REALITY
/// rules. The record may be rewritten into canonical form.
pub fn validate_record(record: &mut ProxyRecord) -> Result<(), ValidationError> {
    let kind = record.record_type();
    let protocol = registry()
        .resolve(&kind)
        .ok_or_else(|| ValidationError::UnsupportedProtocol(kind.clone()))?;

    for &field in protocol.required_fields() {
        let present = match field {
            "port" => record
                .int("port")
                .is_some_and(|p| (1..=i64::from(u16::MAX)).contains(&p)),
            _ => !record.str(field).trim().is_empty(),
        };
        if !present {
            return Err(ValidationError::MissingField(field));
        }
    }

    protocol.validate(record)?;
    validate_reality(record)
}

/// A non-empty `reality-opts` needs a 32-byte public key; the short ID is
/// optional but must be valid hex when present.
fn validate_reality(record: &mut ProxyRecord) -> Result<(), ValidationError> {
    let opts = match record.get("reality-opts") {
        None => return Ok(()),
        Some(value) => ProxyRecord::from_value(value),
    };
    let Some(mut opts) = opts else {
        return Err(ValidationError::InvalidRecord("reality-opts invalid".into()));
    };
    if opts.is_empty() {
        return Ok(());
    }

    let public_key = opts.first_str(PUBLIC_KEY_ALIASES);
    if public_key.trim().is_empty() {
        return Err(ValidationError::MissingField("reality-opts.public-key"));
    }
    opts.set("public-key", normalize_public_key(&public_key)?);

    let short_id = opts.first_str(SHORT_ID_ALIASES);
    if !short_id.trim().is_empty() {
        let short_id = normalize_short_id(&short_id)?;
        if short_id.is_empty() {
            opts.remove("short-id");
        } else {
            opts.set("short-id", short_id);
        }
    }

    record.set("reality-opts", opts);
    record.set("tls", true);
    Ok(())
}

/// Flow values the engine has rejected during the current run.
///
/// Starts with `xtls-rprx-splice`, which engines dropped alongside the other
/// legacy flows but report as a startup error rather than at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSkipSet(BTreeSet<String>);

impl Default for FlowSkipSet {
    fn default() -> Self {
        Self(BTreeSet::from(["xtls-rprx-splice".to_string()]))
    }
}

impl FlowSkipSet {
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// Returns false when the flow was already present.
    pub fn insert(&mut self, flow: &str) -> bool {
        let flow = flow.trim().to_ascii_lowercase();
        !flow.is_empty() && self.0.insert(flow)
    }

    pub fn contains(&self, flow: &str) -> bool {
        self.0.contains(&flow.trim().to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Rejects records whose `flow` is deprecated or was rejected earlier in the
/// run.
pub fn check_flow(record: &ProxyRecord, skip: &FlowSkipSet) -> Result<(), ValidationError> {
    let flow = record.str("flow").trim().to_ascii_lowercase();
    if flow.is_empty() {
        return Ok(());
    }
    if DEPRECATED_FLOWS.iter().any(|d| flow.contains(d)) {
        return Err(ValidationError::UnsupportedFlow(
            flow,
            "legacy XTLS is deprecated and unsupported by the engine",
        ));
    }
    if skip.contains(&flow) {
        return Err(ValidationError::UnsupportedFlow(flow, "unsupported by the engine"));
    }
    Ok(())
}

/// Engine records for one batch of nodes.
///
/// Per-node vectors are indexed like the input slice.
#[derive(Debug, Clone, Default)]
pub struct TestProxies {
    pub records: Vec<ProxyRecord>,
    pub names: Vec<String>,
    /// Node position for each entry in `records`.
    pub positions: Vec<usize>,
    pub name_by_index: Vec<Option<String>>,
    pub skip_reasons: Vec<Option<String>>,
    pub warnings: Vec<String>,
}

impl TestProxies {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Synthesizes and validates a record for every node, skipping those the
/// engine rejected earlier (`rejected`, keyed by position) and those whose
/// flow is unsupported. Every skipped node gets a reason.
pub fn build_test_proxies(
    nodes: &[Node],
    skip_flows: &FlowSkipSet,
    rejected: &HashMap<usize, String>,
) -> TestProxies {
    let mut out = TestProxies {
        name_by_index: vec![None; nodes.len()],
        skip_reasons: vec![None; nodes.len()],
        ..Default::default()
    };
    let mut name_counts = HashMap::new();

    for (i, node) in nodes.iter().enumerate() {
        let outcome = match rejected.get(&i) {
            Some(reason) if reason.trim().is_empty() => Err("rejected by engine".to_string()),
            Some(reason) => Err(reason.clone()),
            None => {
                let base = display_name(node).trim().to_string();
                let base = if base.is_empty() {
                    format!("node_{}", i + 1)
                } else {
                    base
                };
                let name = unique_name(&base, &mut name_counts);
                node_to_record(node, &name)
                    .and_then(|record| check_flow(&record, skip_flows).map(|()| record))
                    .map(|record| (name, record))
                    .map_err(|e| e.to_string())
            }
        };

        match outcome {
            Ok((name, record)) => {
                out.name_by_index[i] = Some(name.clone());
                out.names.push(name);
                out.records.push(record);
                out.positions.push(i);
            }
            Err(reason) => {
                debug!("skipping node {}: {}", i + 1, reason);
                out.warnings.push(format!("node {}: {}", i + 1, reason));
                out.skip_reasons[i] = Some(reason);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_node, parse_node_from_record};

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn record(yaml: &str) -> ProxyRecord {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        ProxyRecord::from_value(&value).unwrap()
    }

    #[test]
    fn test_required_fields() {
        let mut r = record("{type: ss, server: s.example.com, port: 8388, password: pw}");
        assert_eq!(validate_record(&mut r), Err(ValidationError::MissingField("cipher")));

        let mut r = record("{type: trojan, server: t.example.com, port: 0, password: pw}");
        assert_eq!(validate_record(&mut r), Err(ValidationError::MissingField("port")));

        let mut r = record("{type: trojan, server: t.example.com, port: '443', password: pw}");
        assert!(validate_record(&mut r).is_ok());
        assert_eq!(r.bool("tls"), Some(true));
    }

    #[test]
    fn test_uuid_revalidated() {
        let mut r = record("{type: vmess, server: v.example.com, port: 443, uuid: not-a-uuid}");
        assert!(matches!(
            validate_record(&mut r),
            Err(ValidationError::InvalidUuid(_))
        ));
    }

    #[test]
    fn test_reality_gate() {
        let mut r = record(&format!(
            "{{type: vless, server: r.example.com, port: 443, uuid: {UUID}, reality-opts: {{short-id: ab}}}}"
        ));
        assert_eq!(
            validate_record(&mut r),
            Err(ValidationError::MissingField("reality-opts.public-key"))
        );

        let mut r = record(&format!(
            "{{type: vless, server: r.example.com, port: 443, uuid: {UUID}, reality-opts: {{public-key: c2hvcnQ}}}}"
        ));
        assert!(matches!(
            validate_record(&mut r),
            Err(ValidationError::InvalidRealityKey(_))
        ));

        let mut r = record(&format!(
            "{{type: vless, server: r.example.com, port: 443, uuid: {UUID}, reality-opts: {{}}}}"
        ));
        assert!(validate_record(&mut r).is_ok());
    }

    #[test]
    fn test_flow_policy() {
        let mut skip = FlowSkipSet::default();
        let r = record("{flow: XTLS-RPRX-DIRECT}");
        assert!(matches!(
            check_flow(&r, &skip),
            Err(ValidationError::UnsupportedFlow(f, _)) if f == "xtls-rprx-direct"
        ));
        let r = record("{flow: xtls-rprx-splice}");
        assert!(check_flow(&r, &skip).is_err());
        let r = record("{flow: xtls-rprx-vision}");
        assert!(check_flow(&r, &skip).is_ok());
        assert!(skip.insert("xtls-rprx-vision"));
        assert!(!skip.insert("XTLS-RPRX-VISION"));
        assert!(check_flow(&r, &skip).is_err());
    }

    #[test]
    fn test_build_test_proxies_reports_every_skip() {
        let nodes = vec![
            parse_node(&format!("vless://{UUID}@a.example.com:443?flow=xtls-rprx-origin#A")).unwrap(),
            parse_node("trojan://pw@b.example.com:443#B").unwrap(),
            parse_node_from_record(
                &serde_yaml::from_str("{name: B, type: ss, server: c.example.com, port: 8388, cipher: aes-128-gcm, password: pw}")
                    .unwrap(),
            )
            .unwrap(),
            parse_node("trojan://pw@d.example.com:443#D").unwrap(),
        ];
        let rejected = HashMap::from([(3, String::new())]);
        let built = build_test_proxies(&nodes, &FlowSkipSet::default(), &rejected);

        assert_eq!(built.names, vec!["B".to_string(), "B_2".to_string()]);
        assert_eq!(built.positions, vec![1, 2]);
        assert!(built.skip_reasons[0].as_deref().unwrap().contains("xtls-rprx-origin"));
        assert_eq!(built.skip_reasons[3].as_deref(), Some("rejected by engine"));
        assert_eq!(built.name_by_index[2].as_deref(), Some("B_2"));
        assert_eq!(built.warnings.len(), 2);
    }
}

//! Export renderers: full engine document, flow-style proxy lines and share
//! URI lists.
//!
//! Every renderer takes the node list and the matching results. An empty
//! result slice means "no test was run" and exports every node; otherwise
//! only passing nodes are exported.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::ValidationError;
use crate::model::{Node, TestResult};
use crate::parser::query::fully_decode;
use crate::protocols::registry;
use crate::record::ProxyRecord;

use super::naming::{NamingOptions, abbreviate_region, build_output_name, unique_name};
use super::record::node_to_record;

pub const DEFAULT_GROUP: &str = "AUTO";

const DEFAULT_ROOT: &str = "\
port: 7890
socks-port: 7891
mixed-port: 7892
mode: rule
log-level: warning
allow-lan: true
external-ui: ''
dns:
  enable: false
proxy-groups:
  - name: AUTO
    type: select
    proxies: []
rules:
  - MATCH,AUTO
";

/// Preferred key order for flow-style lines; other keys follow in record
/// order.
const FLOW_KEY_ORDER: &[&str] = &[
    "name",
    "server",
    "port",
    "type",
    "uuid",
    "password",
    "method",
    "cipher",
    "tls",
    "sni",
    "servername",
    "skip-cert-verify",
    "network",
    "ws-opts",
    "grpc-opts",
    "reality-opts",
    "client-fingerprint",
    "alpn",
    "flow",
    "encryption",
    "alterId",
    "username",
    "obfs",
    "obfs-password",
    "udp",
    "congestion-controller",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Full engine configuration document
    #[default]
    Yaml,
    /// Inline `- { name: ..., ... }` proxy lines
    Flow,
    /// One share URI per line
    Uri,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportFormat::Yaml => "yaml",
            ExportFormat::Flow => "flow",
            ExportFormat::Uri => "uri",
        };
        f.write_str(s)
    }
}

fn exportable<'a>(
    nodes: &'a [Node],
    results: &'a [TestResult],
) -> impl Iterator<Item = (&'a Node, Option<&'a TestResult>)> {
    let tested = !results.is_empty();
    nodes.iter().enumerate().filter_map(move |(i, node)| {
        if !tested {
            return Some((node, None));
        }
        results
            .get(i)
            .filter(|r| r.is_exportable())
            .map(|r| (node, Some(r)))
    })
}

/// Validated records and their unique names for every exportable node.
/// `type_filter`, when non-empty, restricts the output to those schemes.
pub fn build_proxy_list(
    nodes: &[Node],
    results: &[TestResult],
    opts: &NamingOptions,
    type_filter: &[String],
) -> (Vec<ProxyRecord>, Vec<String>) {
    let type_filter: Vec<String> = type_filter
        .iter()
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let mut counts = Default::default();
    let mut records = Vec::new();
    let mut names = Vec::new();

    for (node, result) in exportable(nodes, results) {
        if !type_filter.is_empty() && !type_filter.contains(&node.scheme.to_ascii_lowercase()) {
            continue;
        }
        let base = abbreviate_region(&build_output_name(node, opts, result));
        let name = unique_name(&base, &mut counts);
        match node_to_record(node, &name) {
            Ok(record) => {
                records.push(record);
                names.push(name);
            }
            Err(e) => debug!("not exporting node {}: {}", node.index, e),
        }
    }
    (records, names)
}

/// Engine document with refreshed `proxies` and group membership.
#[derive(Debug, Clone)]
pub struct ExportDocument {
    pub root: Mapping,
    pub names: Vec<String>,
}

/// Builds the export document from `template` when it can be read, or from
/// the built-in default root otherwise. Names previously listed in the
/// template's `proxies` are replaced in every group that referenced them.
pub fn build_export_document(
    template: Option<&Path>,
    nodes: &[Node],
    results: &[TestResult],
    opts: &NamingOptions,
) -> Result<ExportDocument> {
    let template_text = template.and_then(|path| match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!("template {} unreadable, using default: {}", path.display(), e);
            None
        }
    });
    let from_template = template_text.is_some();
    let text = template_text.as_deref().unwrap_or(DEFAULT_ROOT);
    let mut root = match serde_yaml::from_str::<Value>(text).context("failed to parse template")? {
        Value::Mapping(map) => map,
        _ => return Err(anyhow!("template root is not a mapping")),
    };

    let old_names = extract_proxy_names(&root);
    let (records, names) = build_proxy_list(nodes, results, opts, &[]);
    if names.is_empty() {
        return Err(anyhow!("no nodes to export"));
    }
    root.insert(
        "proxies".into(),
        Value::Sequence(records.into_iter().map(Value::from).collect()),
    );
    if from_template {
        update_proxy_groups(&mut root, &old_names, &names);
    } else {
        set_group_proxies(&mut root, DEFAULT_GROUP, &names);
    }
    Ok(ExportDocument { root, names })
}

fn extract_proxy_names(root: &Mapping) -> Vec<String> {
    root.get("proxies")
        .and_then(Value::as_sequence)
        .map(|list| {
            list.iter()
                .filter_map(|p| p.get("name").and_then(Value::as_str))
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn group_list(root: &mut Mapping) -> Option<&mut Vec<Value>> {
    root.get_mut("proxy-groups").and_then(Value::as_sequence_mut)
}

fn string_list(names: &[String]) -> Value {
    Value::Sequence(names.iter().cloned().map(Value::String).collect())
}

/// Drops `old` names from every group that referenced one of them and
/// appends `new`.
pub fn update_proxy_groups(root: &mut Mapping, old: &[String], new: &[String]) {
    let Some(groups) = group_list(root) else {
        return;
    };
    for group in groups.iter_mut().filter_map(Value::as_mapping_mut) {
        let Some(members) = group.get("proxies").and_then(Value::as_sequence) else {
            continue;
        };
        let members: Vec<String> = members
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if !members.iter().any(|m| old.contains(m)) {
            continue;
        }
        let mut kept: Vec<String> = members.into_iter().filter(|m| !old.contains(m)).collect();
        kept.extend(new.iter().cloned());
        group.insert("proxies".into(), string_list(&kept));
    }
}

fn set_group_proxies(root: &mut Mapping, group_name: &str, names: &[String]) {
    let Some(groups) = group_list(root) else {
        return;
    };
    if let Some(group) = groups
        .iter_mut()
        .filter_map(Value::as_mapping_mut)
        .find(|g| g.get("name").and_then(Value::as_str) == Some(group_name))
    {
        group.insert("proxies".into(), string_list(names));
    }
}

/// Serializes the document with a short generated-by header.
pub fn render_document(doc: &ExportDocument) -> Result<String> {
    let body = serde_yaml::to_string(&Value::Mapping(doc.root.clone()))
        .context("failed to serialize export document")?;
    Ok(format!(
        "# generated by nodeprobe at {} ({} proxies)\n{}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        doc.names.len(),
        body
    ))
}

/// `{ name: ..., server: ..., ... }` with the preferred key order.
pub fn format_flow(record: &ProxyRecord) -> String {
    let preferred = FLOW_KEY_ORDER
        .iter()
        .filter_map(|k| record.get(k).map(|v| (*k, v)));
    let rest = record
        .iter()
        .filter(|(k, v)| !FLOW_KEY_ORDER.contains(k) && !v.is_null());
    let parts: Vec<String> = preferred
        .chain(rest)
        .map(|(k, v)| format!("{}: {}", flow_string(k), flow_value(v)))
        .collect();
    format!("{{ {} }}", parts.join(", "))
}

fn flow_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => flow_string(s),
        Value::Sequence(seq) => {
            let items: Vec<String> = seq.iter().map(flow_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Mapping(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", flow_value(k), flow_value(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        Value::Tagged(tagged) => flow_value(&tagged.value),
    }
}

/// Quotes a scalar when a YAML parser would read it as something else.
fn flow_string(s: &str) -> String {
    const SPECIAL: &[char] = &[
        ':', '{', '}', '[', ']', ',', '#', '&', '*', '!', '|', '>', '\'', '"', '%', '@', '`',
        '\\', '\n',
    ];
    let reserved = matches!(
        s.to_ascii_lowercase().as_str(),
        "true" | "false" | "null" | "~" | "yes" | "no" | "on" | "off"
    );
    let needs_quotes = s.is_empty()
        || s.starts_with([' ', '-', '?'])
        || s.ends_with(' ')
        || s.contains(SPECIAL)
        || s.parse::<f64>().is_ok()
        || reserved;
    if needs_quotes {
        format!("'{}'", s.replace('\'', "''"))
    } else {
        s.to_string()
    }
}

/// `  - { ... }` lines for every exportable node.
pub fn build_flow_lines(
    nodes: &[Node],
    results: &[TestResult],
    opts: &NamingOptions,
    type_filter: &[String],
) -> Vec<String> {
    let (records, _) = build_proxy_list(nodes, results, opts, type_filter);
    records
        .iter()
        .map(|r| format!("  - {}", format_flow(r)))
        .collect()
}

/// Share URI for `node` under a new display name: rebuilt from the node's
/// own URI payload when it has one, otherwise synthesized from its
/// validated record.
pub fn share_link(node: &Node, name: &str) -> Result<String, ValidationError> {
    let name = fully_decode(name);
    let protocol = registry()
        .resolve(&node.scheme)
        .ok_or_else(|| ValidationError::UnsupportedProtocol(node.scheme.clone()))?;
    if let Some(uri) = protocol.share_node(node, &name) {
        return Ok(uri);
    }
    let record = node_to_record(node, &name)?;
    protocol.share_uri(&record, &name)
}

/// One share URI per exportable node. Nodes whose URI cannot be rebuilt
/// fall back to their raw input text.
pub fn build_uri_list(nodes: &[Node], results: &[TestResult], opts: &NamingOptions) -> Vec<String> {
    exportable(nodes, results)
        .filter_map(|(node, result)| {
            let name = abbreviate_region(&build_output_name(node, opts, result));
            let uri = share_link(node, &name).unwrap_or_else(|e| {
                debug!("falling back to raw text for node {}: {}", node.index, e);
                node.raw.clone()
            });
            (!uri.trim().is_empty()).then_some(uri)
        })
        .collect()
}

/// Renders the requested export format as text.
pub fn render(
    format: ExportFormat,
    template: Option<&Path>,
    nodes: &[Node],
    results: &[TestResult],
    opts: &NamingOptions,
    type_filter: &[String],
) -> Result<String> {
    match format {
        ExportFormat::Yaml => {
            let doc = build_export_document(template, nodes, results, opts)?;
            render_document(&doc)
        }
        ExportFormat::Flow => {
            let lines = build_flow_lines(nodes, results, opts, type_filter);
            if lines.is_empty() {
                return Err(anyhow!("no nodes to export"));
            }
            Ok(format!("proxies:\n{}\n", lines.join("\n")))
        }
        ExportFormat::Uri => {
            let lines = build_uri_list(nodes, results, opts);
            if lines.is_empty() {
                return Err(anyhow!("no nodes to export"));
            }
            Ok(format!("{}\n", lines.join("\n")))
        }
    }
}

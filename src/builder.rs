//! Node to engine record synthesis, the validation gate, output naming and
//! export rendering.

pub mod export;
pub mod naming;
pub mod record;
pub mod validate;

pub use export::{ExportFormat, build_export_document, build_flow_lines, build_uri_list, render};
pub use naming::{NamingOptions, RegionRule, dedup_nodes, unique_name};
pub use record::{node_to_record, normalize_record};
pub use validate::{FlowSkipSet, TestProxies, build_test_proxies, validate_record};

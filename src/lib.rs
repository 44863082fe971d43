//! Proxy subscription parsing, engine config synthesis and latency testing.

pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod output;
pub mod parser;
pub mod probe_engine;
pub mod protocols;
pub mod record;
pub mod reporter;
pub mod subscription;

pub use error::{EngineStartupError, NetworkError, ParseError, ProbeError, ValidationError};
pub use model::{IpInfo, Node, TestResult};

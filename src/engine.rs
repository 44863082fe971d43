//! Latency testing: direct socket probes or probes through an external
//! Clash-compatible engine.

pub mod controller;
pub mod direct;
pub mod exit_ip;
pub mod policy;
pub mod pool;
pub mod process;
pub mod retry;
pub mod session;
pub mod tls;

use std::time::Duration;

use async_trait::async_trait;

use crate::builder::TestProxies;
use crate::error::{EngineStartupError, NetworkError};

pub use direct::{measure_once, run_direct};
pub use exit_ip::{parse_ip_info, query_exit_ips};
pub use policy::{judge, probe_node};
pub use process::{CoreLauncher, resolve_core_path};
pub use retry::{MAX_START_ATTEMPTS, parse_proxy_error, parse_unsupported_flow, start_with_exclusions};
pub use session::{CoreRun, run_core};

/// A running engine instance loaded with one set of proxies.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Delay reported by the engine for `proxy` against `test_url`.
    async fn delay(
        &self,
        proxy: &str,
        test_url: &str,
        timeout: Duration,
    ) -> Result<Duration, NetworkError>;

    /// Makes `proxy` the active member of the selection group.
    async fn select(&self, proxy: &str) -> Result<(), NetworkError>;

    /// GETs `url` through the engine's ingress port and returns the body.
    async fn fetch_through(&self, url: &str) -> Result<String, NetworkError>;

    /// Stops the engine and removes everything it left on disk.
    async fn shutdown(&mut self);
}

/// Starts engine instances. The real implementation spawns a subprocess;
/// tests substitute a simulated engine.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(
        &self,
        proxies: &TestProxies,
    ) -> Result<Box<dyn EngineHandle>, EngineStartupError>;
}

use crate::probe_engine::ProbeRun;
use anyhow::Result;
use async_trait::async_trait;

/// Receives the finished run once all nodes are probed.
#[async_trait]
pub trait ProbeReporter: Send + Sync {
    async fn report(&self, run: &ProbeRun) -> Result<()>;

    fn name(&self) -> &str;
}

use crate::builder::{dedup_nodes, naming::filter_by_keywords};
use crate::config::Settings;
use crate::error::{EngineStartupError, ProbeError};
use crate::engine::{CoreLauncher, EngineLauncher, query_exit_ips, run_core, run_direct};
use crate::model::{Node, TestResult};
use crate::reporter::ProbeReporter;
use anyhow::{Result, anyhow};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Nodes and their results after one test run. `results[i]` belongs to
/// `nodes[i]`.
#[derive(Debug, Clone, Default)]
pub struct ProbeRun {
    pub nodes: Vec<Node>,
    pub results: Vec<TestResult>,
    pub elapsed: Duration,
    /// Set when an engine batch never started; its nodes carry the
    /// diagnostic as their error.
    pub engine_error: Option<EngineStartupError>,
}

impl ProbeRun {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.is_exportable()).count()
    }
}

pub struct ProbeEngine {
    settings: Settings,
    launcher: Option<Arc<dyn EngineLauncher>>,
    reporters: Vec<Box<dyn ProbeReporter>>,
}

impl ProbeEngine {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            launcher: None,
            reporters: Vec::new(),
        }
    }

    /// Uses `launcher` instead of resolving an engine binary at run time.
    pub fn with_launcher(mut self, launcher: Arc<dyn EngineLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn register_reporter(&mut self, reporter: Box<dyn ProbeReporter>) -> &mut Self {
        self.reporters.push(reporter);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn run(&self, nodes: Vec<Node>, cancel: &CancellationToken) -> Result<ProbeRun> {
        if self.reporters.is_empty() {
            return Err(anyhow!("No reporters registered"));
        }
        let run = self.execute_probe(nodes, cancel).await?;
        self.notify_reporters(&run).await?;
        if let Some(e) = &run.engine_error {
            return Err(ProbeError::EngineStartup(e.clone()).into());
        }
        Ok(run)
    }

    /// Keyword exclusion, then deduplication when enabled.
    pub fn prepare(&self, nodes: Vec<Node>) -> Vec<Node> {
        let total = nodes.len();
        let nodes = filter_by_keywords(nodes, &self.settings.exclude_keywords);
        if nodes.len() < total {
            info!("Excluded {} nodes by keyword", total - nodes.len());
        }
        if !self.settings.dedup {
            return nodes;
        }
        let before = nodes.len();
        let nodes = dedup_nodes(nodes);
        if nodes.len() < before {
            info!("Removed {} duplicate nodes", before - nodes.len());
        }
        nodes
    }

    pub async fn execute_probe(
        &self,
        nodes: Vec<Node>,
        cancel: &CancellationToken,
    ) -> Result<ProbeRun> {
        let start_time = Instant::now();
        let mut nodes = self.prepare(nodes);
        if nodes.is_empty() {
            return Err(anyhow!("No nodes left to test"));
        }

        let log_result = |i: usize, result: &TestResult| {
            if result.pass {
                debug!("node {}: pass, avg {}ms", i + 1, result.avg_ms);
            } else {
                debug!("node {}: fail, {}", i + 1, result.err);
            }
        };

        let (results, engine_error) = if self.settings.use_core {
            let launcher = self.launcher()?;
            let core = run_core(launcher.as_ref(), &nodes, &self.settings, cancel, log_result).await;
            if self.settings.exit_ip && !cancel.is_cancelled() {
                self.attach_exit_ips(launcher.as_ref(), &mut nodes, &core.results, cancel)
                    .await;
            }
            (core.results, core.startup_error)
        } else {
            if self.settings.exit_ip {
                warn!("Exit IP lookup needs the engine; skipping");
            }
            (run_direct(&nodes, &self.settings, cancel, log_result).await?, None)
        };

        let run = ProbeRun {
            nodes,
            results,
            elapsed: start_time.elapsed(),
            engine_error,
        };
        info!(
            "Probe completed in {:.2}s - {}/{} nodes passed",
            run.elapsed.as_secs_f64(),
            run.passed(),
            run.results.len()
        );
        Ok(run)
    }

    async fn attach_exit_ips(
        &self,
        launcher: &dyn EngineLauncher,
        nodes: &mut [Node],
        results: &[TestResult],
        cancel: &CancellationToken,
    ) {
        let passing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_exportable())
            .map(|(i, _)| i)
            .collect();
        if passing.is_empty() {
            return;
        }
        let subset: Vec<Node> = passing.iter().map(|&i| nodes[i].clone()).collect();
        let found = query_exit_ips(launcher, &subset, &self.settings.ip_lookup_url, cancel).await;
        for (slot, info) in found {
            nodes[passing[slot]].ip_info = Some(info);
        }
    }

    fn launcher(&self) -> Result<Arc<dyn EngineLauncher>> {
        match &self.launcher {
            Some(launcher) => Ok(launcher.clone()),
            None => Ok(Arc::new(CoreLauncher::from_settings(&self.settings)?)),
        }
    }

    async fn notify_reporters(&self, run: &ProbeRun) -> Result<()> {
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(run).await {
                error!("Reporter '{}' failed: {}", reporter.name(), e);
            }
        }
        Ok(())
    }
}

//! Core mode: build, start, probe and tear down, once per batch.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::builder::{FlowSkipSet, build_test_proxies};
use crate::config::Settings;
use crate::error::{EngineStartupError, ProbeError};
use crate::model::{Node, TestResult};

use super::EngineLauncher;
use super::policy::probe_node;
use super::pool::run_pool;
use super::retry::start_with_exclusions;

struct Collector<C> {
    results: Vec<TestResult>,
    on_result: C,
}

impl<C: FnMut(usize, &TestResult)> Collector<C> {
    fn emit(&mut self, index: usize, result: TestResult) {
        (self.on_result)(index, &result);
        self.results[index] = result;
    }
}

/// Per-node results of a core-mode run.
#[derive(Debug, Default)]
pub struct CoreRun {
    /// `results[i]` belongs to `nodes[i]`.
    pub results: Vec<TestResult>,
    /// First batch whose engine never became ready. Its nodes are failed
    /// with the diagnostic; other batches still ran.
    pub startup_error: Option<EngineStartupError>,
}

/// Probes `nodes` through engine instances started by `launcher`.
///
/// Nodes that cannot be turned into engine records resolve immediately with
/// their rejection reason. The rest are split into batches of
/// `settings.batch_size` when batch mode is on (one batch otherwise); every
/// batch runs its own auto-exclusion loop, and flows the engine rejected
/// stay excluded for the batches that follow.
pub async fn run_core<C>(
    launcher: &dyn EngineLauncher,
    nodes: &[Node],
    settings: &Settings,
    cancel: &CancellationToken,
    on_result: C,
) -> CoreRun
where
    C: FnMut(usize, &TestResult),
{
    let mut out = Collector {
        results: vec![TestResult::default(); nodes.len()],
        on_result,
    };
    let mut skip_flows = FlowSkipSet::default();
    let mut startup_error = None;

    let initial = build_test_proxies(nodes, &skip_flows, &HashMap::new());
    for warning in &initial.warnings {
        warn!("Skipping {}", warning);
    }
    for (i, reason) in initial.skip_reasons.iter().enumerate() {
        if let Some(reason) = reason {
            out.emit(i, TestResult::failed(reason.clone(), 0));
        }
    }
    if initial.is_empty() {
        warn!("No testable nodes");
        return CoreRun {
            results: out.results,
            startup_error,
        };
    }

    let eligible = initial.positions;
    let batch_size = if settings.batch_mode {
        settings.batch_size.max(1)
    } else {
        eligible.len()
    };
    let batch_count = eligible.len().div_ceil(batch_size);
    if settings.batch_mode {
        info!(
            "Testing {} nodes in {} batches of up to {}",
            eligible.len(),
            batch_count,
            batch_size
        );
    } else {
        info!("Testing {} nodes through the engine", eligible.len());
    }

    for (batch_no, batch) in eligible.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            for &global in batch {
                out.emit(global, TestResult::failed(ProbeError::Cancelled.to_string(), 0));
            }
            continue;
        }

        let batch_nodes: Vec<Node> = batch.iter().map(|&i| nodes[i].clone()).collect();
        let mut rejected = HashMap::new();
        let started =
            start_with_exclusions(launcher, &batch_nodes, &mut skip_flows, &mut rejected).await;
        let proxies = started.proxies;

        for (local, reason) in proxies.skip_reasons.iter().enumerate() {
            if let Some(reason) = reason {
                out.emit(batch[local], TestResult::failed(reason.clone(), 0));
            }
        }

        let mut engine = match started.engine {
            Ok(engine) => engine,
            Err(EngineStartupError::NoProxies) => {
                warn!("Every node of batch {} was rejected by the engine", batch_no + 1);
                continue;
            }
            Err(e) => {
                error!("Engine startup failed: {}", e.diagnostic());
                let reason = format!("engine startup failed: {}", e.diagnostic());
                for &local in &proxies.positions {
                    out.emit(batch[local], TestResult::failed(reason.clone(), 0));
                }
                if startup_error.is_none() {
                    startup_error = Some(e);
                }
                continue;
            }
        };

        let workers = settings.workers_for(proxies.len());
        let handle = engine.as_ref();
        let finished = run_pool(
            (0..proxies.len()).collect(),
            workers,
            cancel,
            |slot| {
                let name = proxies.names[slot].as_str();
                async move {
                    probe_node(settings, cancel, |limit| {
                        handle.delay(name, &settings.core_test_url, limit)
                    })
                    .await
                }
            },
            |slot, result| (out.on_result)(batch[proxies.positions[slot]], result),
        )
        .await;
        for (slot, result) in finished {
            out.results[batch[proxies.positions[slot]]] = result;
        }

        engine.shutdown().await;
        if settings.batch_mode {
            info!("Batch {}/{} done", batch_no + 1, batch_count);
        }
    }

    CoreRun {
        results: out.results,
        startup_error,
    }
}

use std::future::Future;

use futures::future;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::model::TestResult;

/// Runs `probe` over `jobs` with at most `workers` in flight.
///
/// `on_result` fires as each job finishes, in completion order. Jobs not yet
/// dispatched when `cancel` fires resolve to a cancelled result without
/// being probed.
pub async fn run_pool<P, Fut, C>(
    jobs: Vec<usize>,
    workers: usize,
    cancel: &CancellationToken,
    probe: P,
    mut on_result: C,
) -> Vec<(usize, TestResult)>
where
    P: Fn(usize) -> Fut,
    Fut: Future<Output = TestResult>,
    C: FnMut(usize, &TestResult),
{
    let mut finished = Vec::with_capacity(jobs.len());
    stream::iter(jobs)
        .map(|job| {
            let pending = (!cancel.is_cancelled()).then(|| probe(job));
            async move {
                match pending {
                    Some(fut) => (job, fut.await),
                    None => (job, TestResult::failed(ProbeError::Cancelled.to_string(), 0)),
                }
            }
        })
        .buffer_unordered(workers.max(1))
        .for_each(|(job, result)| {
            on_result(job, &result);
            finished.push((job, result));
            future::ready(())
        })
        .await;
    finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut seen = Vec::new();

        let finished = run_pool(
            (0..20).collect(),
            4,
            &CancellationToken::new(),
            |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    TestResult {
                        done: true,
                        pass: true,
                        ..Default::default()
                    }
                }
            },
            |job, _| seen.push(job),
        )
        .await;

        assert_eq!(finished.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancelled_jobs_are_not_probed() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let probed = AtomicUsize::new(0);
        let finished = run_pool(
            vec![0, 1, 2],
            2,
            &cancel,
            |_| {
                probed.fetch_add(1, Ordering::SeqCst);
                async { TestResult::default() }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(probed.load(Ordering::SeqCst), 0);
        assert!(finished.iter().all(|(_, r)| r.err == "canceled" && r.done));
    }
}

//! Per-node attempt loop and the pass/fail decision shared by both modes.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{PassPolicy, Settings};
use crate::error::{NetworkError, ProbeError};
use crate::model::TestResult;

/// Runs up to `settings.attempts` sequential measurements and judges them.
///
/// Cancellation is observed before every attempt; an attempt already in
/// flight is never aborted.
pub async fn probe_node<F, Fut>(
    settings: &Settings,
    cancel: &CancellationToken,
    mut measure: F,
) -> TestResult
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<Duration, NetworkError>>,
{
    let attempts = settings.attempts.max(1);
    let mut samples = Vec::with_capacity(attempts as usize);
    let mut failures = 0u32;
    let mut last_err = String::new();
    let mut made = 0u32;

    for _ in 0..attempts {
        if cancel.is_cancelled() {
            let mut result = summarize(&samples, made);
            result.err = ProbeError::Cancelled.to_string();
            return result;
        }
        made += 1;
        match measure(settings.timeout).await {
            Ok(elapsed) => {
                let ms = duration_ms(elapsed);
                samples.push(ms);
                if elapsed > settings.threshold {
                    failures += 1;
                    last_err = format!(
                        "latency {}ms exceeds threshold {}ms",
                        ms,
                        duration_ms(settings.threshold)
                    );
                }
            }
            Err(e) => {
                failures += 1;
                last_err = e.to_string();
            }
        }
        if failures > 0 && settings.policy.stop_on_fail() {
            break;
        }
    }

    judge(
        &samples,
        failures,
        made,
        attempts,
        duration_ms(settings.threshold),
        settings.policy,
        last_err,
    )
}

/// Applies the pass policy to a finished attempt loop.
///
/// With `REQUIRE_ALL` every planned attempt must have produced a sample
/// within the threshold. Otherwise one sample within the threshold is
/// enough. Zero samples never pass.
pub fn judge(
    samples: &[u64],
    failures: u32,
    made: u32,
    planned: u32,
    threshold_ms: u64,
    policy: PassPolicy,
    last_err: String,
) -> TestResult {
    let mut result = summarize(samples, made);
    result.pass = if samples.is_empty() {
        false
    } else if policy.require_all() {
        failures == 0 && made == planned && samples.iter().all(|&ms| ms <= threshold_ms)
    } else {
        samples.iter().any(|&ms| ms <= threshold_ms)
    };
    if !result.pass {
        result.err = if last_err.is_empty() {
            "no successful attempts".to_string()
        } else {
            last_err
        };
    }
    result
}

fn summarize(samples: &[u64], made: u32) -> TestResult {
    let sum: u64 = samples.iter().sum();
    TestResult {
        done: true,
        pass: false,
        err: String::new(),
        latency_ms: samples.to_vec(),
        avg_ms: if samples.is_empty() {
            0
        } else {
            sum / samples.len() as u64
        },
        max_ms: samples.iter().copied().max().unwrap_or(0),
        attempts: made,
        successful: samples.len() as u32,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

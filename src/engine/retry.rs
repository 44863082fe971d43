//! Auto-exclusion around engine startup: when the engine names a flow or a
//! proxy it cannot load, drop it and start again.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::builder::{FlowSkipSet, TestProxies, build_test_proxies};
use crate::error::EngineStartupError;
use crate::model::Node;

use super::{EngineHandle, EngineLauncher};

/// Upper bound on engine starts for one node set.
pub const MAX_START_ATTEMPTS: usize = 32;

const FLOW_KEY: &str = "unsupported xtls flow type:";
const PROXY_KEY: &str = "parse config error: proxy ";

/// The flow value from an `unsupported xtls flow type: <flow>` message.
pub fn parse_unsupported_flow(message: &str) -> Option<String> {
    let start = message.find(FLOW_KEY)? + FLOW_KEY.len();
    let rest = message[start..].trim_start();
    let line = rest.split(['\r', '\n']).next().unwrap_or_default();
    let flow = line.trim().trim_matches(['"', '\'']).trim();
    (!flow.is_empty()).then(|| flow.to_string())
}

/// The proxy index and reason from a `parse config error: proxy <N>: <reason>`
/// line. The engine counts proxies from 0, in document order.
pub fn parse_proxy_error(message: &str) -> Option<(usize, String)> {
    message.lines().find_map(|line| {
        let line = line.trim();
        let pos = line.to_ascii_lowercase().find(PROXY_KEY)?;
        let rest = &line[pos + PROXY_KEY.len()..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let index: usize = rest[..digits].parse().ok()?;
        let reason = rest[digits..].trim();
        let reason = reason.strip_prefix(':').unwrap_or(reason);
        Some((index, reason.trim().trim_matches(['"', '\'']).trim().to_string()))
    })
}

/// Result of [`start_with_exclusions`]: the proxies of the final attempt and
/// either a ready engine or the error that ended the loop.
pub struct StartOutcome {
    pub proxies: TestProxies,
    pub engine: Result<Box<dyn EngineHandle>, EngineStartupError>,
}

/// Builds, starts and retries until the engine comes up, the failure names
/// nothing that can be excluded, or the attempt budget runs out.
///
/// `skip_flows` and `rejected` (keyed by position in `nodes`) are updated in
/// place so callers can carry them into later batches.
pub async fn start_with_exclusions(
    launcher: &dyn EngineLauncher,
    nodes: &[Node],
    skip_flows: &mut FlowSkipSet,
    rejected: &mut HashMap<usize, String>,
) -> StartOutcome {
    let mut proxies = build_test_proxies(nodes, skip_flows, rejected);
    let budget = MAX_START_ATTEMPTS.min(proxies.len() + 1);
    let mut attempt = 0;

    loop {
        if proxies.is_empty() {
            return StartOutcome {
                proxies,
                engine: Err(EngineStartupError::NoProxies),
            };
        }
        attempt += 1;
        info!(
            "Starting engine with {} proxies (attempt {}/{})",
            proxies.len(),
            attempt,
            budget
        );

        let err = match launcher.launch(&proxies).await {
            Ok(engine) => {
                return StartOutcome {
                    proxies,
                    engine: Ok(engine),
                };
            }
            Err(err) => err,
        };
        if attempt >= budget {
            warn!("Engine start budget of {} attempts exhausted", budget);
            return StartOutcome {
                proxies,
                engine: Err(err),
            };
        }

        let message = err.diagnostic();
        if let Some(flow) = parse_unsupported_flow(&message)
            && skip_flows.insert(&flow)
        {
            warn!("Engine rejected flow {}, excluding it and retrying", flow);
        } else if let Some((index, reason)) = parse_proxy_error(&message)
            && let Some(&position) = proxies.positions.get(index)
            && !rejected.contains_key(&position)
        {
            let reason = if reason.is_empty() {
                "engine config parse failed".to_string()
            } else {
                reason
            };
            warn!(
                "Engine rejected proxy {} ({}): {}, excluding it and retrying",
                index,
                proxies.names[index],
                reason
            );
            rejected.insert(position, format!("rejected by engine: {reason}"));
        } else {
            return StartOutcome {
                proxies,
                engine: Err(err),
            };
        }

        proxies = build_test_proxies(nodes, skip_flows, rejected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unsupported_flow() {
        assert_eq!(
            parse_unsupported_flow("engine exited: exit status: 1\nlog:\nfatal: unsupported xtls flow type: \"xtls-rprx-vision-udp443\"\nmore"),
            Some("xtls-rprx-vision-udp443".to_string())
        );
        assert_eq!(parse_unsupported_flow("unsupported xtls flow type:   \n"), None);
        assert_eq!(parse_unsupported_flow("something else"), None);
    }

    #[test]
    fn test_parse_proxy_error() {
        assert_eq!(
            parse_proxy_error("log:\ntime=x level=fatal msg=\"Parse config error: proxy 3: 'unsupported cipher'\""),
            Some((3, "unsupported cipher".to_string()))
        );
        assert_eq!(
            parse_proxy_error("parse config error: proxy 12"),
            Some((12, String::new()))
        );
        assert_eq!(
            parse_proxy_error("parse config error: proxy 0: x"),
            Some((0, "x".to_string()))
        );
        assert_eq!(parse_proxy_error("parse config error: proxy x: y"), None);
    }
}

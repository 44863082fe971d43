//! Exit-IP lookups routed through each passing proxy in turn.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::{FlowSkipSet, build_test_proxies};
use crate::config::DEFAULT_IP_LOOKUP_URL;
use crate::model::{IpInfo, Node};

use super::EngineLauncher;

pub const LOOKUP_CONCURRENCY: usize = 20;

/// The lookup URL with the `{ip}` placeholder removed, so the service
/// reports the caller's own address.
pub fn lookup_url(template: &str) -> String {
    let template = match template.trim() {
        "" => DEFAULT_IP_LOOKUP_URL,
        t => t,
    };
    template.replace("{ip}", "")
}

fn first_str(raw: &serde_json::Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| raw.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn flag(raw: &serde_json::Map<String, Value>, key: &str) -> bool {
    raw.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Reads an ip-api style reply. A non-success `status` or a reply without
/// an address yields `None`.
pub fn parse_ip_info(body: &str) -> Option<IpInfo> {
    let value: Value = serde_json::from_str(body).ok()?;
    let raw = value.as_object()?;
    if raw.get("delay").and_then(Value::as_i64).is_some_and(|d| d > 0) {
        return None;
    }
    match raw.get("status").and_then(Value::as_str) {
        None | Some("") | Some("success") => {}
        Some(_) => return None,
    }

    let info = IpInfo {
        ip: first_str(raw, &["query", "ip"]),
        country: first_str(raw, &["country", "country_name"]),
        country_code: first_str(raw, &["countryCode", "country_code"]),
        region: first_str(raw, &["regionName", "region"]),
        city: first_str(raw, &["city"]),
        isp: first_str(raw, &["isp"]),
        org: first_str(raw, &["org"]),
        asn: first_str(raw, &["as", "asn"]),
        hosting: flag(raw, "hosting"),
        proxy: flag(raw, "proxy"),
        mobile: flag(raw, "mobile"),
    };
    (!info.ip.is_empty()).then_some(info)
}

/// Starts one engine over `nodes` and looks up the exit address of each.
/// The returned map is keyed by position in `nodes`; nodes whose lookup
/// failed are absent.
pub async fn query_exit_ips(
    launcher: &dyn EngineLauncher,
    nodes: &[Node],
    lookup_template: &str,
    cancel: &CancellationToken,
) -> HashMap<usize, IpInfo> {
    let proxies = build_test_proxies(nodes, &FlowSkipSet::default(), &HashMap::new());
    if proxies.is_empty() {
        warn!("No nodes available for exit IP lookup");
        return HashMap::new();
    }
    info!("Looking up exit IPs for {} nodes", proxies.len());

    let mut engine = match launcher.launch(&proxies).await {
        Ok(engine) => engine,
        Err(e) => {
            warn!("Engine startup for exit IP lookup failed: {}", e.diagnostic());
            return HashMap::new();
        }
    };

    let url = lookup_url(lookup_template);
    // Switching the group and issuing the request must not interleave with
    // another lookup on the same engine.
    let switch = Mutex::new(());
    let handle = engine.as_ref();

    let found: HashMap<usize, IpInfo> = stream::iter(0..proxies.len())
        .map(|slot| {
            let name = proxies.names[slot].as_str();
            let url = url.as_str();
            let switch = &switch;
            let positions = &proxies.positions;
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let _guard = switch.lock().await;
                if let Err(e) = handle.select(name).await {
                    debug!("select {} failed: {}", name, e);
                    return None;
                }
                match handle.fetch_through(url).await {
                    Ok(body) => parse_ip_info(&body).map(|info| (positions[slot], info)),
                    Err(e) => {
                        debug!("exit IP lookup via {} failed: {}", name, e);
                        None
                    }
                }
            }
        })
        .buffer_unordered(LOOKUP_CONCURRENCY)
        .filter_map(|found| async move { found })
        .collect()
        .await;

    engine.shutdown().await;
    info!("Exit IP lookup finished: {}/{} resolved", found.len(), proxies.len());
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_url_strips_placeholder() {
        assert_eq!(
            lookup_url("http://ip-api.com/json/{ip}?fields=query"),
            "http://ip-api.com/json/?fields=query"
        );
        assert!(lookup_url("  ").starts_with("http://ip-api.com/json/?fields="));
    }

    #[test]
    fn test_parse_ip_info() {
        let info = parse_ip_info(
            r#"{"status":"success","country":"Japan","countryCode":"JP","regionName":"Tokyo","city":"Tokyo","isp":"Example ISP","org":"","as":"AS64500 Example","hosting":true,"proxy":false,"mobile":false,"query":"203.0.113.9"}"#,
        )
        .unwrap();
        assert_eq!(info.ip, "203.0.113.9");
        assert_eq!(info.country_code, "JP");
        assert_eq!(info.region, "Tokyo");
        assert_eq!(info.asn, "AS64500 Example");
        assert!(info.hosting);
        assert!(!info.is_residential());

        let alt = parse_ip_info(r#"{"ip":"198.51.100.1","country_name":"Canada","region":"Ontario"}"#).unwrap();
        assert_eq!(alt.country, "Canada");
        assert_eq!(alt.region, "Ontario");

        assert_eq!(parse_ip_info(r#"{"status":"fail","message":"private range"}"#), None);
        assert_eq!(parse_ip_info(r#"{"status":"success"}"#), None);
        assert_eq!(parse_ip_info(r#"{"delay":120}"#), None);
        assert_eq!(parse_ip_info("<html>"), None);
    }
}

//! Direct mode: TCP connect, plus a TLS handshake where the node speaks TLS.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Settings;
use crate::error::{NetworkError, ProbeError};
use crate::model::{Node, TestResult};

use super::policy::probe_node;
use super::pool::run_pool;
use super::tls::{insecure_connector, server_name};

/// Trojan always runs over TLS even when the URI does not say so.
pub fn needs_handshake(node: &Node) -> bool {
    node.security.needs_handshake() || node.scheme.eq_ignore_ascii_case("trojan")
}

/// One latency sample: wall time from dial start until the connection (and
/// handshake, when needed) completes.
pub async fn measure_once(
    node: &Node,
    limit: Duration,
    connector: &TlsConnector,
) -> Result<Duration, NetworkError> {
    let host = node.host.trim().trim_start_matches('[').trim_end_matches(']');
    let start = Instant::now();
    let attempt = async {
        let stream = TcpStream::connect((host, node.port))
            .await
            .map_err(|e| NetworkError::Dial(e.to_string()))?;
        if needs_handshake(node) {
            let name = server_name(node.server_name()).map_err(NetworkError::Tls)?;
            connector
                .connect(name, stream)
                .await
                .map_err(|e| NetworkError::Tls(e.to_string()))?;
        }
        Ok::<_, NetworkError>(start.elapsed())
    };
    timeout(limit, attempt)
        .await
        .map_err(|_| NetworkError::Timeout)?
}

/// Probes every node directly. Results are indexed like `nodes`.
pub async fn run_direct<C>(
    nodes: &[Node],
    settings: &Settings,
    cancel: &CancellationToken,
    on_result: C,
) -> Result<Vec<TestResult>, ProbeError>
where
    C: FnMut(usize, &TestResult),
{
    let connector = insecure_connector().map_err(|e| NetworkError::Tls(e.to_string()))?;
    let workers = settings.workers_for(nodes.len());
    debug!("Direct probing {} nodes with {} workers", nodes.len(), workers);

    let finished = run_pool(
        (0..nodes.len()).collect(),
        workers,
        cancel,
        |i| {
            let node = &nodes[i];
            let connector = &connector;
            async move {
                probe_node(settings, cancel, |limit| measure_once(node, limit, connector)).await
            }
        },
        on_result,
    )
    .await;

    let mut results = vec![TestResult::default(); nodes.len()];
    for (i, result) in finished {
        results[i] = result;
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassPolicy;
    use crate::model::Security;
    use tokio::net::TcpListener;

    fn node(host: &str, port: u16, scheme: &str) -> Node {
        Node {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn test_handshake_selection() {
        assert!(needs_handshake(&node("a", 1, "trojan")));
        assert!(!needs_handshake(&node("a", 1, "vmess")));
        let mut reality = node("a", 1, "vless");
        reality.security = Security::Reality;
        assert!(needs_handshake(&reality));
    }

    #[tokio::test]
    async fn test_measure_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        let connector = insecure_connector().unwrap();
        let elapsed = measure_once(&node("127.0.0.1", port, "ss"), Duration::from_secs(2), &connector)
            .await
            .unwrap();
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_run_direct_reports_every_node() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        let closed = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let nodes = vec![node("127.0.0.1", open, "ss"), node("127.0.0.1", closed, "ss")];
        let settings = Settings {
            attempts: 2,
            timeout: Duration::from_secs(1),
            threshold: Duration::from_secs(1),
            policy: PassPolicy::REQUIRE_ALL,
            ..Settings::default()
        };
        let mut callbacks = 0;
        let results = run_direct(&nodes, &settings, &CancellationToken::new(), |_, _| callbacks += 1)
            .await
            .unwrap();

        assert_eq!(callbacks, 2);
        assert!(results[0].pass);
        assert_eq!(results[0].attempts, 2);
        assert!(!results[1].pass);
        assert!(results[1].err.starts_with("dial:"));
    }
}

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use nodeprobe::builder::{FlowSkipSet, TestProxies};
use nodeprobe::config::{PassPolicy, Settings};
use nodeprobe::engine::{
    EngineHandle, EngineLauncher, MAX_START_ATTEMPTS, probe_node, run_core, start_with_exclusions,
};
use nodeprobe::model::Node;
use nodeprobe::parser::parse_nodes_from_text;
use nodeprobe::{EngineStartupError, NetworkError};

struct ReadyEngine;

#[async_trait]
impl EngineHandle for ReadyEngine {
    async fn delay(&self, _: &str, _: &str, _: Duration) -> Result<Duration, NetworkError> {
        Ok(Duration::from_millis(90))
    }

    async fn select(&self, _: &str) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn fetch_through(&self, _: &str) -> Result<String, NetworkError> {
        Err(NetworkError::Api("not simulated".into()))
    }

    async fn shutdown(&mut self) {}
}

/// Rejects any proxy set containing a proxy whose name starts with
/// `poison`, naming the first such proxy by its 0-based index as the engine
/// does, and any set
/// containing a `flow` listed in `bad_flows`.
#[derive(Default)]
struct PickyLauncher {
    bad_flows: Vec<&'static str>,
    launches: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl EngineLauncher for PickyLauncher {
    async fn launch(&self, proxies: &TestProxies) -> Result<Box<dyn EngineHandle>, EngineStartupError> {
        self.launches.lock().unwrap().push(proxies.names.clone());
        for record in &proxies.records {
            let flow = record.str("flow");
            if self.bad_flows.contains(&flow.as_str()) {
                return Err(EngineStartupError::Exited {
                    message: "exit status: 1".into(),
                    log_tail: Some(format!("level=fatal msg=\"unsupported xtls flow type: {flow}\"")),
                });
            }
        }
        if let Some(pos) = proxies.names.iter().position(|n| n.starts_with("poison")) {
            return Err(EngineStartupError::Exited {
                message: "exit status: 1".into(),
                log_tail: Some(format!("Parse config error: proxy {}: unsupported cipher", pos)),
            });
        }
        Ok(Box::new(ReadyEngine))
    }
}

/// Fails every start by blaming the first proxy.
#[derive(Default)]
struct HostileLauncher {
    launches: Mutex<usize>,
}

#[async_trait]
impl EngineLauncher for HostileLauncher {
    async fn launch(&self, _: &TestProxies) -> Result<Box<dyn EngineHandle>, EngineStartupError> {
        *self.launches.lock().unwrap() += 1;
        Err(EngineStartupError::Exited {
            message: "parse config error: proxy 0: nope".into(),
            log_tail: None,
        })
    }
}

fn nodes(text: &str) -> Vec<Node> {
    parse_nodes_from_text(text).unwrap().nodes
}

const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

#[tokio::test]
async fn test_rejected_proxy_is_excluded_and_engine_converges() {
    let nodes = nodes(
        "trojan://pw@a.example.com:443#alpha\n\
         trojan://pw@b.example.com:443#poison-bravo\n\
         trojan://pw@c.example.com:443#charlie\n\
         trojan://pw@d.example.com:443#delta",
    );
    let launcher = PickyLauncher::default();
    let results = run_core(&launcher, &nodes, &Settings::default(), &CancellationToken::new(), |_, _| {}).await.results;

    let launches = launcher.launches.lock().unwrap();
    assert_eq!(launches.len(), 2);
    assert!(launches.len() <= MAX_START_ATTEMPTS);
    assert_eq!(launches[1], vec!["alpha", "charlie", "delta"]);

    assert!(!results[1].pass);
    assert_eq!(results[1].err, "rejected by engine: unsupported cipher");
    for i in [0, 2, 3] {
        assert!(results[i].pass, "node {i}: {:?}", results[i]);
        assert_eq!(results[i].avg_ms, 90);
    }
}

#[tokio::test]
async fn test_first_proxy_rejected_by_engine_is_excluded() {
    let nodes = nodes(
        "trojan://pw@a.example.com:443#poison-alpha\n\
         trojan://pw@b.example.com:443#bravo\n\
         trojan://pw@c.example.com:443#charlie",
    );
    let launcher = PickyLauncher::default();
    let results = run_core(&launcher, &nodes, &Settings::default(), &CancellationToken::new(), |_, _| {}).await.results;

    let launches = launcher.launches.lock().unwrap();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1], vec!["bravo", "charlie"]);
    assert_eq!(results[0].err, "rejected by engine: unsupported cipher");
    assert!(results[1].pass && results[2].pass);
}

#[tokio::test]
async fn test_last_proxy_rejected_by_engine_keeps_its_neighbours() {
    let nodes = nodes(
        "trojan://pw@a.example.com:443#alpha\n\
         trojan://pw@b.example.com:443#bravo\n\
         trojan://pw@c.example.com:443#poison-charlie",
    );
    let launcher = PickyLauncher::default();
    let results = run_core(&launcher, &nodes, &Settings::default(), &CancellationToken::new(), |_, _| {}).await.results;

    assert_eq!(launcher.launches.lock().unwrap().len(), 2);
    assert!(results[0].pass && results[1].pass);
    assert_eq!(results[2].err, "rejected by engine: unsupported cipher");
}

#[tokio::test]
async fn test_unsupported_flow_is_skipped_for_later_batches() {
    let nodes = nodes(&format!(
        "vless://{UUID}@a.example.com:443?security=tls&flow=xtls-rprx-vision-udp443#v1\n\
         trojan://pw@b.example.com:443#t1\n\
         vless://{UUID}@c.example.com:443?security=tls&flow=xtls-rprx-vision-udp443#v2\n\
         trojan://pw@d.example.com:443#t2"
    ));
    let launcher = PickyLauncher {
        bad_flows: vec!["xtls-rprx-vision-udp443"],
        ..Default::default()
    };
    let settings = Settings {
        batch_mode: true,
        batch_size: 2,
        ..Settings::default()
    };
    let results = run_core(&launcher, &nodes, &settings, &CancellationToken::new(), |_, _| {}).await.results;

    // First batch needs a retry; the second batch already knows the flow.
    assert_eq!(launcher.launches.lock().unwrap().len(), 3);
    assert!(results[0].err.contains("xtls-rprx-vision-udp443"));
    assert!(results[2].err.contains("xtls-rprx-vision-udp443"));
    assert!(results[1].pass && results[3].pass);
}

#[tokio::test]
async fn test_retry_loop_terminates_under_hostile_engine() {
    let nodes = nodes(
        "trojan://pw@a.example.com:443#a\n\
         trojan://pw@b.example.com:443#b\n\
         trojan://pw@c.example.com:443#c",
    );
    let launcher = HostileLauncher::default();
    let mut skip = FlowSkipSet::default();
    let mut rejected = Default::default();
    let outcome = start_with_exclusions(&launcher, &nodes, &mut skip, &mut rejected).await;

    assert!(outcome.engine.is_err());
    let launches = *launcher.launches.lock().unwrap();
    assert!(launches <= nodes.len() + 1, "{launches} launches");
    assert!(rejected.len() >= 2);
}

#[tokio::test]
async fn test_startup_failure_fails_remaining_nodes_with_diagnostic() {
    struct Broken;

    #[async_trait]
    impl EngineLauncher for Broken {
        async fn launch(&self, _: &TestProxies) -> Result<Box<dyn EngineHandle>, EngineStartupError> {
            Err(EngineStartupError::Timeout {
                log_tail: Some("listen tcp 127.0.0.1:9090: bind: address already in use".into()),
            })
        }
    }

    let nodes = nodes("trojan://pw@a.example.com:443#a\ntrojan://pw@b.example.com:443#b");
    let run = run_core(&Broken, &nodes, &Settings::default(), &CancellationToken::new(), |_, _| {}).await;
    assert!(matches!(run.startup_error, Some(EngineStartupError::Timeout { .. })));
    for result in &run.results {
        assert!(result.done && !result.pass);
        assert!(result.err.starts_with("engine startup failed: engine startup timed out"));
        assert!(result.err.contains("address already in use"));
    }
}

#[tokio::test]
async fn test_pass_policy_boundary() {
    async fn judge(policy: PassPolicy) -> bool {
        let settings = Settings {
            attempts: 3,
            threshold: Duration::from_millis(300),
            policy,
            ..Settings::default()
        };
        let samples = [100u64, 100, 400];
        let mut next = 0;
        probe_node(&settings, &CancellationToken::new(), |_| {
            let ms = samples[next];
            next += 1;
            async move { Ok(Duration::from_millis(ms)) }
        })
        .await
        .pass
    }

    assert!(!judge(PassPolicy::REQUIRE_ALL).await);
    assert!(!judge(PassPolicy::REQUIRE_ALL | PassPolicy::STOP_ON_FAIL).await);
    assert!(judge(PassPolicy::empty()).await);
    assert!(judge(PassPolicy::STOP_ON_FAIL).await);
}

//! Engine subprocess lifecycle: binary lookup, generated config, readiness
//! polling and teardown.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use serde_yaml::{Mapping, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::TestProxies;
use crate::builder::export::DEFAULT_GROUP;
use crate::config::Settings;
use crate::error::{EngineStartupError, NetworkError};
use crate::record::ProxyRecord;

use super::controller::Controller;
use super::{EngineHandle, EngineLauncher};

pub const ENGINE_CANDIDATES: &[&str] = &["mihomo", "clash-meta", "clash"];

const CONFIG_FILE: &str = "config.yaml";
const LOG_FILE: &str = "core.log";
const READY_POLL: Duration = Duration::from_millis(200);
const EXIT_WAIT: Duration = Duration::from_secs(2);
const LOG_TAIL_LINES: usize = 120;
const LOG_TAIL_BYTES: usize = 64 * 1024;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_MARGIN: Duration = Duration::from_secs(2);
const LIFETIME_GRACE: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("nodeprobe/", env!("CARGO_PKG_VERSION"));

fn io_error(e: impl std::fmt::Display) -> EngineStartupError {
    EngineStartupError::Io(e.to_string())
}

fn binary_names(stem: &str) -> Vec<String> {
    if cfg!(windows) && !stem.ends_with(".exe") {
        vec![stem.to_string(), format!("{stem}.exe")]
    } else {
        vec![stem.to_string()]
    }
}

fn search_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .flat_map(|dir| binary_names(name).into_iter().map(move |n| dir.join(n)))
        .find(|candidate| candidate.is_file())
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

/// Locates the engine binary.
///
/// An explicit `input` is used as a file path when it names one (or has a
/// directory component) and looked up on `PATH` otherwise. Without input the
/// known engine names are searched next to the executable, then in the
/// working directory, then on `PATH`.
pub fn resolve_core_path(input: &str) -> Result<PathBuf, EngineStartupError> {
    let input = input.trim();
    if !input.is_empty() {
        let path = Path::new(input);
        let found = if path.is_file() {
            Some(path.to_path_buf())
        } else if path.components().count() > 1 {
            None
        } else {
            search_path(input)
        };
        return found
            .map(absolute)
            .ok_or_else(|| EngineStartupError::BinaryNotFound(input.to_string()));
    }

    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe()
        && let Some(dir) = exe.parent()
    {
        dirs.push(dir.to_path_buf());
    }
    if let Ok(cwd) = env::current_dir() {
        dirs.push(cwd);
    }

    for stem in ENGINE_CANDIDATES {
        for dir in &dirs {
            for name in binary_names(stem) {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(absolute(candidate));
                }
            }
        }
    }
    ENGINE_CANDIDATES
        .iter()
        .find_map(|stem| search_path(stem))
        .map(absolute)
        .ok_or_else(|| EngineStartupError::BinaryNotFound(ENGINE_CANDIDATES.join(", ")))
}

async fn free_port() -> Result<u16, EngineStartupError> {
    let listener = TcpListener::bind("127.0.0.1:0").await.map_err(io_error)?;
    Ok(listener.local_addr().map_err(io_error)?.port())
}

/// The document the engine is started with: every proxy in one `select`
/// group and a single catch-all rule.
pub fn engine_config(records: &[ProxyRecord], names: &[String], api_port: u16, mixed_port: u16) -> Mapping {
    let mut group = Mapping::new();
    group.insert("name".into(), DEFAULT_GROUP.into());
    group.insert("type".into(), "select".into());
    group.insert(
        "proxies".into(),
        Value::Sequence(names.iter().map(|n| Value::from(n.as_str())).collect()),
    );

    let mut doc = Mapping::new();
    doc.insert("mixed-port".into(), Value::from(mixed_port));
    doc.insert(
        "external-controller".into(),
        format!("127.0.0.1:{api_port}").into(),
    );
    doc.insert("mode".into(), "rule".into());
    doc.insert("log-level".into(), "error".into());
    doc.insert(
        "proxies".into(),
        Value::Sequence(records.iter().cloned().map(ProxyRecord::into_value).collect()),
    );
    doc.insert("proxy-groups".into(), Value::Sequence(vec![Value::Mapping(group)]));
    doc.insert(
        "rules".into(),
        Value::Sequence(vec![format!("MATCH,{DEFAULT_GROUP}").into()]),
    );
    doc
}

/// Last `max_lines` lines of the final 64 KiB of `data`.
pub fn log_tail(data: &[u8], max_lines: usize) -> Option<String> {
    let data = &data[data.len().saturating_sub(LOG_TAIL_BYTES)..];
    let text = String::from_utf8_lossy(data);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    Some(lines[start..].join("\n").trim().to_string())
}

async fn read_log_tail(path: &Path) -> Option<String> {
    let data = tokio::fs::read(path).await.ok()?;
    log_tail(&data, LOG_TAIL_LINES)
}

/// Upper bound on how long one engine instance may run: startup, then
/// either every probe round over `proxies` or one serialized exit-IP lookup
/// per proxy, whichever is longer, plus a grace period.
pub fn engine_lifetime(
    start_timeout: Duration,
    probe_timeout: Duration,
    attempts: u32,
    workers: usize,
    proxies: usize,
) -> Duration {
    let clamp = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
    let rounds = clamp(proxies.div_ceil(workers.max(1)));
    let probing = (probe_timeout + CONTROL_MARGIN)
        .saturating_mul(attempts.max(1))
        .saturating_mul(rounds);
    let lookups = LOOKUP_TIMEOUT.saturating_mul(clamp(proxies));
    start_timeout
        .saturating_add(probing.max(lookups))
        .saturating_add(LIFETIME_GRACE)
}

async fn stop_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("engine kill failed: {}", e);
    }
    if timeout(EXIT_WAIT, child.wait()).await.is_err() {
        debug!("engine did not exit within {:?}", EXIT_WAIT);
    }
}

/// Owns the child until the engine exits on its own, `lifetime` fires or
/// `max_lifetime` elapses.
async fn supervise(
    mut child: Child,
    lifetime: CancellationToken,
    max_lifetime: Duration,
    exited: oneshot::Sender<String>,
) {
    tokio::select! {
        status = child.wait() => {
            let message = match status {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            let _ = exited.send(message);
        }
        _ = lifetime.cancelled() => stop_child(&mut child).await,
        _ = sleep(max_lifetime) => {
            warn!("Engine still running after {:?}, stopping it", max_lifetime);
            lifetime.cancel();
            stop_child(&mut child).await;
        }
    }
}

async fn wait_for_core(
    api: &Controller,
    limit: Duration,
    exited: &mut oneshot::Receiver<String>,
) -> Result<(), EngineStartupError> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        match exited.try_recv() {
            Ok(message) => {
                return Err(EngineStartupError::Exited {
                    message,
                    log_tail: None,
                });
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                return Err(EngineStartupError::Exited {
                    message: "engine supervisor stopped".to_string(),
                    log_tail: None,
                });
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
        }
        if api.version().await.is_ok() {
            return Ok(());
        }
        sleep(READY_POLL).await;
    }
    Err(EngineStartupError::Timeout { log_tail: None })
}

/// A running engine subprocess.
///
/// The process lifetime is its own cancellation scope: a cancelled test run
/// does not reach it. Teardown, dropping the handle or the `max_lifetime`
/// deadline stops it.
pub struct EngineProcess {
    api: Controller,
    mixed_port: u16,
    lifetime: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    workdir: Option<TempDir>,
}

impl EngineProcess {
    pub async fn start(
        binary: &Path,
        proxies: &TestProxies,
        start_timeout: Duration,
        probe_timeout: Duration,
        max_lifetime: Duration,
    ) -> Result<Self, EngineStartupError> {
        if proxies.is_empty() {
            return Err(EngineStartupError::NoProxies);
        }

        let api_port = free_port().await?;
        let mixed_port = free_port().await?;
        let api = Controller::new(format!("http://127.0.0.1:{api_port}"), probe_timeout)?;
        let workdir = tempfile::Builder::new()
            .prefix("nodeprobe-")
            .tempdir()
            .map_err(io_error)?;
        let config_path = workdir.path().join(CONFIG_FILE);
        let log_path = workdir.path().join(LOG_FILE);

        let doc = engine_config(&proxies.records, &proxies.names, api_port, mixed_port);
        let text = serde_yaml::to_string(&Value::Mapping(doc)).map_err(io_error)?;
        tokio::fs::write(&config_path, text).await.map_err(io_error)?;

        let log = std::fs::File::create(&log_path).map_err(io_error)?;
        let log_err = log.try_clone().map_err(io_error)?;
        let child = Command::new(binary)
            .arg("-f")
            .arg(&config_path)
            .arg("-d")
            .arg(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_error(format!("{}: {}", binary.display(), e)))?;
        debug!(
            "Engine pid {:?} started, api port {}, mixed port {}",
            child.id(),
            api_port,
            mixed_port
        );

        let lifetime = CancellationToken::new();
        let (exited_tx, mut exited_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, lifetime.clone(), max_lifetime, exited_tx));

        let mut process = Self {
            api,
            mixed_port,
            lifetime,
            supervisor: Some(supervisor),
            workdir: Some(workdir),
        };

        if let Err(e) = wait_for_core(&process.api, start_timeout, &mut exited_rx).await {
            let tail = read_log_tail(&log_path).await;
            process.teardown().await;
            return Err(e.with_log_tail(tail));
        }
        info!("Engine ready with {} proxies", proxies.len());
        Ok(process)
    }

    pub fn api(&self) -> &Controller {
        &self.api
    }

    pub fn mixed_port(&self) -> u16 {
        self.mixed_port
    }

    /// Kills the engine, waits briefly for it to exit and removes the
    /// working directory. Safe to call more than once.
    pub async fn teardown(&mut self) {
        self.lifetime.cancel();
        if let Some(supervisor) = self.supervisor.take()
            && timeout(EXIT_WAIT + READY_POLL, supervisor).await.is_err()
        {
            debug!("engine supervisor did not finish in time");
        }
        if let Some(dir) = self.workdir.take()
            && let Err(e) = dir.close()
        {
            debug!("failed to remove engine directory: {}", e);
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

#[async_trait]
impl EngineHandle for EngineProcess {
    async fn delay(
        &self,
        proxy: &str,
        test_url: &str,
        timeout: Duration,
    ) -> Result<Duration, NetworkError> {
        self.api.delay(proxy, test_url, timeout).await
    }

    async fn select(&self, proxy: &str) -> Result<(), NetworkError> {
        self.api.select(DEFAULT_GROUP, proxy).await
    }

    async fn fetch_through(&self, url: &str) -> Result<String, NetworkError> {
        let proxy = Proxy::all(format!("http://127.0.0.1:{}", self.mixed_port))
            .map_err(|e| NetworkError::Api(e.to_string()))?;
        let client = Client::builder()
            .proxy(proxy)
            .timeout(LOOKUP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| NetworkError::Api(e.to_string()))?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| NetworkError::Api(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Api(format!("lookup returned {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| NetworkError::Api(e.to_string()))
    }

    async fn shutdown(&mut self) {
        self.teardown().await;
    }
}

/// Starts real engine subprocesses from a resolved binary.
#[derive(Debug, Clone)]
pub struct CoreLauncher {
    binary: PathBuf,
    start_timeout: Duration,
    probe_timeout: Duration,
    attempts: u32,
    workers: usize,
}

impl CoreLauncher {
    pub fn new(binary: PathBuf, start_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            binary,
            start_timeout,
            probe_timeout,
            attempts: 1,
            workers: 1,
        }
    }

    /// Attempts per node and worker count used to bound each engine's lifetime.
    pub fn with_probe_plan(mut self, attempts: u32, workers: usize) -> Self {
        self.attempts = attempts;
        self.workers = workers;
        self
    }

    /// Resolves the binary named in `settings` (or searches for one).
    pub fn from_settings(settings: &Settings) -> Result<Self, EngineStartupError> {
        let binary = resolve_core_path(&settings.core_path)?;
        info!("Using engine {}", binary.display());
        Ok(Self::new(binary, settings.core_start_timeout, settings.timeout)
            .with_probe_plan(settings.attempts, settings.concurrency))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl EngineLauncher for CoreLauncher {
    async fn launch(
        &self,
        proxies: &TestProxies,
    ) -> Result<Box<dyn EngineHandle>, EngineStartupError> {
        let max_lifetime = engine_lifetime(
            self.start_timeout,
            self.probe_timeout,
            self.attempts,
            self.workers,
            proxies.len(),
        );
        let process = EngineProcess::start(
            &self.binary,
            proxies,
            self.start_timeout,
            self.probe_timeout,
            max_lifetime,
        )
        .await?;
        Ok(Box::new(process))
    }
}

use anyhow::{Context, Result, anyhow};
use bitflags::bitflags;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::builder::ExportFormat;
use crate::builder::naming::{
    DEFAULT_IP_NAME_FMT, DEFAULT_LATENCY_FMT, DEFAULT_RENAME_FMT, NamingOptions, parse_keywords,
    parse_region_rules,
};

pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";
pub const DEFAULT_IP_LOOKUP_URL: &str = "http://ip-api.com/json/{ip}?fields=status,message,country,countryCode,regionName,city,isp,org,as,hosting,proxy,mobile,query";
pub const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub main: MainConfig,
    pub test: TestConfig,
    pub naming: NamingConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MainConfig {
    /// Subscription URL, `file://` URL or local path.
    pub input: String,
    /// Export destination; stdout when empty.
    pub output: String,
    pub format: ExportFormat,
    /// Engine document template for the `yaml` format.
    pub template: String,
    /// Schemes kept by the `flow` format; empty keeps all.
    pub type_filter: Vec<String>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TestConfig {
    pub attempts: u32,
    pub timeout_ms: u64,
    pub threshold_ms: u64,
    pub concurrency: usize,
    pub policy: PassPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NamingConfig {
    pub dedup: bool,
    /// Comma, semicolon or newline separated.
    pub exclude_keywords: String,
    pub rename: bool,
    pub rename_fmt: String,
    /// `pattern=REGION` lines.
    pub region_rules: String,
    pub latency_name: bool,
    pub latency_fmt: String,
    pub ip_rename: bool,
    pub ip_name_fmt: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub enabled: bool,
    /// Explicit engine binary; searched for when empty.
    pub binary: String,
    pub test_url: String,
    pub start_timeout_ms: u64,
    pub batch_mode: bool,
    pub batch_size: usize,
    pub exit_ip: bool,
    pub ip_lookup_url: String,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PassPolicy: u8 {
        const REQUIRE_ALL = 1;
        const STOP_ON_FAIL = 2;
    }
}

impl PassPolicy {
    pub fn require_all(&self) -> bool {
        self.contains(PassPolicy::REQUIRE_ALL)
    }

    pub fn stop_on_fail(&self) -> bool {
        self.contains(PassPolicy::STOP_ON_FAIL)
    }

    fn from_policy_name(name: &str) -> Option<Self> {
        match name {
            "RequireAll" => Some(PassPolicy::REQUIRE_ALL),
            "StopOnFail" => Some(PassPolicy::STOP_ON_FAIL),
            _ => None,
        }
    }
}

impl Default for PassPolicy {
    fn default() -> Self {
        PassPolicy::REQUIRE_ALL | PassPolicy::STOP_ON_FAIL
    }
}

impl Serialize for PassPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut flags = Vec::new();
        if self.contains(PassPolicy::REQUIRE_ALL) {
            flags.push("RequireAll");
        }
        if self.contains(PassPolicy::STOP_ON_FAIL) {
            flags.push("StopOnFail");
        }
        flags.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PassPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PassPolicyVisitor;

        const FLAGS: &[&str] = &["RequireAll", "StopOnFail"];

        impl<'de> Visitor<'de> for PassPolicyVisitor {
            type Value = PassPolicy;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a policy flag or an array of policy flags")
            }

            fn visit_str<E>(self, value: &str) -> Result<PassPolicy, E>
            where
                E: de::Error,
            {
                PassPolicy::from_policy_name(value).ok_or_else(|| de::Error::unknown_variant(value, FLAGS))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<PassPolicy, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut policy = PassPolicy::empty();
                while let Some(value) = seq.next_element::<String>()? {
                    match PassPolicy::from_policy_name(&value) {
                        Some(flag) => policy |= flag,
                        None => return Err(de::Error::unknown_variant(&value, FLAGS)),
                    }
                }
                Ok(policy)
            }
        }

        deserializer.deserialize_any(PassPolicyVisitor)
    }
}

/// Immutable snapshot of everything a run needs. Cloned into each run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub attempts: u32,
    pub timeout: Duration,
    pub threshold: Duration,
    pub concurrency: usize,
    pub policy: PassPolicy,
    pub dedup: bool,
    pub exclude_keywords: Vec<String>,
    pub naming: NamingOptions,
    pub use_core: bool,
    pub core_path: String,
    pub core_test_url: String,
    pub core_start_timeout: Duration,
    pub batch_mode: bool,
    pub batch_size: usize,
    pub exit_ip: bool,
    pub ip_lookup_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().settings()
    }
}

impl Settings {
    /// Worker count for `jobs` probes: the configured concurrency clamped to
    /// `[1, MAX_CONCURRENCY]` and to the job count.
    pub fn workers_for(&self, jobs: usize) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY).min(jobs.max(1))
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn generate_default_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default()).context("failed to serialize default config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.test.attempts == 0 {
            return Err(anyhow!("test.attempts must be at least 1"));
        }
        if self.test.timeout_ms == 0 {
            return Err(anyhow!("test.timeout_ms must be positive"));
        }
        if self.engine.batch_mode && self.engine.batch_size == 0 {
            return Err(anyhow!("engine.batch_size must be at least 1"));
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        Settings {
            attempts: self.test.attempts.max(1),
            timeout: Duration::from_millis(self.test.timeout_ms),
            threshold: Duration::from_millis(self.test.threshold_ms),
            concurrency: self.test.concurrency,
            policy: self.test.policy,
            dedup: self.naming.dedup,
            exclude_keywords: parse_keywords(&self.naming.exclude_keywords),
            naming: NamingOptions {
                rename: self.naming.rename,
                rename_fmt: self.naming.rename_fmt.clone(),
                region_rules: parse_region_rules(&self.naming.region_rules),
                latency_name: self.naming.latency_name,
                latency_fmt: self.naming.latency_fmt.clone(),
                ip_rename: self.naming.ip_rename,
                ip_name_fmt: self.naming.ip_name_fmt.clone(),
            },
            use_core: self.engine.enabled,
            core_path: self.engine.binary.trim().to_string(),
            core_test_url: match self.engine.test_url.trim() {
                "" => DEFAULT_TEST_URL.to_string(),
                url => url.to_string(),
            },
            core_start_timeout: Duration::from_millis(self.engine.start_timeout_ms),
            batch_mode: self.engine.batch_mode,
            batch_size: self.engine.batch_size.max(1),
            exit_ip: self.engine.exit_ip,
            ip_lookup_url: match self.engine.ip_lookup_url.trim() {
                "" => DEFAULT_IP_LOOKUP_URL.to_string(),
                url => url.to_string(),
            },
        }
    }
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            output: String::new(),
            format: ExportFormat::Yaml,
            template: String::new(),
            type_filter: Vec::new(),
            verbose: false,
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_ms: 1500,
            threshold_ms: 1500,
            concurrency: 32,
            policy: PassPolicy::default(),
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            dedup: true,
            exclude_keywords: String::new(),
            rename: false,
            rename_fmt: DEFAULT_RENAME_FMT.into(),
            region_rules: String::new(),
            latency_name: false,
            latency_fmt: DEFAULT_LATENCY_FMT.into(),
            ip_rename: false,
            ip_name_fmt: DEFAULT_IP_NAME_FMT.into(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: String::new(),
            test_url: DEFAULT_TEST_URL.into(),
            start_timeout_ms: 90_000,
            batch_mode: false,
            batch_size: 200,
            exit_ip: false,
            ip_lookup_url: DEFAULT_IP_LOOKUP_URL.into(),
        }
    }
}

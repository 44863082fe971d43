use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nodeprobe::builder::ExportFormat;
use nodeprobe::config::{Config, PassPolicy};
use nodeprobe::error::ParseError;
use nodeprobe::output::{ConsoleReporter, ExportReporter, display_nodes};
use nodeprobe::parser::parse_nodes_with_providers;
use nodeprobe::probe_engine::ProbeEngine;
use nodeprobe::subscription::SubscriptionFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Parse, test and report
    Test,
    /// Parse and list nodes only
    Parse,
    /// Parse and export every valid node without testing
    Export,
}

#[derive(Parser, Debug)]
#[command(name = "nodeprobe")]
#[command(about = "Parse proxy subscriptions, test node latency and export the nodes that pass")]
struct Args {
    /// Subscription URL, file:// URL or local file
    #[arg(short, long)]
    input: Option<String>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mode selector
    #[arg(short = 'm', long, value_enum, default_value = "test")]
    mode: Mode,

    /// Export format
    #[arg(short, long, value_enum)]
    format: Option<ExportFormat>,

    /// Export destination (stdout when omitted in export mode)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Engine config template for the yaml export
    #[arg(long)]
    template: Option<PathBuf>,

    /// Test through a Clash-compatible engine; optionally the binary to use
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    core: Option<String>,

    /// Attempts per node
    #[arg(short = 'a', long)]
    attempts: Option<u32>,

    /// Per-attempt timeout in milliseconds
    #[arg(short = 'T', long)]
    timeout: Option<u64>,

    /// Pass threshold in milliseconds
    #[arg(long)]
    threshold: Option<u64>,

    /// Number of concurrent probes
    #[arg(long)]
    concurrency: Option<usize>,

    /// Every attempt must pass
    #[arg(long, action = ArgAction::Set)]
    require_all: Option<bool>,

    /// Stop probing a node at its first failure
    #[arg(long, action = ArgAction::Set)]
    stop_on_fail: Option<bool>,

    /// Start one engine per batch of this many nodes
    #[arg(long)]
    batch: Option<usize>,

    /// Look up the exit IP of every passing node
    #[arg(long)]
    exit_ip: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print a default config file and exit
    #[arg(long)]
    print_default_config: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(input) = &self.input {
            config.main.input = input.clone();
        }
        if let Some(format) = self.format {
            config.main.format = format;
        }
        if let Some(output) = &self.output {
            config.main.output = output.display().to_string();
        }
        if let Some(template) = &self.template {
            config.main.template = template.display().to_string();
        }
        config.main.verbose |= self.verbose;

        if let Some(core) = &self.core {
            config.engine.enabled = true;
            if !core.is_empty() {
                config.engine.binary = core.clone();
            }
        }
        if let Some(size) = self.batch {
            config.engine.batch_mode = true;
            config.engine.batch_size = size;
        }
        config.engine.exit_ip |= self.exit_ip;

        if let Some(attempts) = self.attempts {
            config.test.attempts = attempts;
        }
        if let Some(timeout) = self.timeout {
            config.test.timeout_ms = timeout;
        }
        if let Some(threshold) = self.threshold {
            config.test.threshold_ms = threshold;
        }
        if let Some(concurrency) = self.concurrency {
            config.test.concurrency = concurrency;
        }
        if let Some(on) = self.require_all {
            config.test.policy.set(PassPolicy::REQUIRE_ALL, on);
        }
        if let Some(on) = self.stop_on_fail {
            config.test.policy.set(PassPolicy::STOP_ON_FAIL, on);
        }
    }
}

fn non_empty_path(s: &str) -> Option<PathBuf> {
    let s = s.trim();
    (!s.is_empty()).then(|| PathBuf::from(s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", Config::generate_default_toml()?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    // Initialize logging
    let level = if config.main.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("NodeProbe starting...");
    info!("Fetching subscription from: {}", config.main.input);

    let fetcher = SubscriptionFetcher::new()?;
    let body = fetcher.fetch_subscription(&config.main.input).await?;
    let parsed = match parse_nodes_with_providers(&body, &fetcher).await {
        Ok(parsed) => parsed,
        Err(ParseError::NoNodes(warnings)) => {
            for warning in &warnings {
                warn!("{}", warning);
            }
            error!("No valid nodes found in subscription");
            return Err(ParseError::NoNodes(warnings).into());
        }
        Err(e) => return Err(e.into()),
    };
    for warning in &parsed.warnings {
        warn!("{}", warning);
    }
    info!("Parsed {} nodes from subscription", parsed.nodes.len());

    let settings = config.settings();
    let template = non_empty_path(&config.main.template);
    let output = non_empty_path(&config.main.output);
    let exporter = ExportReporter::new(
        config.main.format,
        template,
        output.clone(),
        settings.naming.clone(),
        config.main.type_filter.clone(),
    );

    let mut engine = ProbeEngine::new(settings);
    match args.mode {
        Mode::Parse => {
            display_nodes(&engine.prepare(parsed.nodes));
        }
        Mode::Export => {
            let nodes = engine.prepare(parsed.nodes);
            exporter.write(&nodes, &[]).await?;
        }
        Mode::Test => {
            engine.register_reporter(Box::new(ConsoleReporter::new(config.main.verbose)));
            if output.is_some() {
                engine.register_reporter(Box::new(exporter));
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing probes already in flight");
                    on_interrupt.cancel();
                }
            });

            engine.run(parsed.nodes, &cancel).await?;
        }
    }

    Ok(())
}

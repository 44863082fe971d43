use crate::builder::{ExportFormat, NamingOptions, render};
use crate::model::{Node, TestResult};
use crate::probe_engine::ProbeRun;
use crate::reporter::ProbeReporter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// One table row per node, passing nodes first, then by average latency.
pub fn display_results(nodes: &[Node], results: &[TestResult], verbose: bool) {
    println!("\n=== NodeProbe Results ===");
    println!(
        "{:<25} {:<24} {:<6} {:<10} {:<7} {}",
        "Name", "Server", "Port", "Protocol", "Status", "Latency"
    );
    println!("{}", "=".repeat(90));

    let mut order: Vec<usize> = (0..nodes.len().min(results.len())).collect();
    order.sort_by(|&a, &b| {
        let (ra, rb) = (&results[a], &results[b]);
        rb.pass
            .cmp(&ra.pass)
            .then(ra.avg_ms.cmp(&rb.avg_ms))
            .then(a.cmp(&b))
    });

    let mut passed = 0;
    for i in order {
        let (node, result) = (&nodes[i], &results[i]);
        let status = if result.pass {
            passed += 1;
            "✓ PASS"
        } else {
            "✗ FAIL"
        };
        let latency = if result.latency_ms.is_empty() {
            "-".to_string()
        } else {
            format!("{}ms (max {}ms)", result.avg_ms, result.max_ms)
        };

        println!(
            "{:<25} {:<24} {:<6} {:<10} {:<7} {}",
            truncate(&node.name, 24),
            truncate(&node.host, 23),
            node.port,
            truncate(&node.scheme, 9),
            status,
            latency
        );

        if verbose && !result.err.is_empty() {
            println!("    Error: {}", result.err);
        }
    }

    let total = results.len();
    println!("\n=== Summary ===");
    println!("Total nodes: {}", total);
    println!("Passed: {}", passed);
    println!("Failed: {}", total - passed);
    if total > 0 {
        println!("Pass rate: {:.1}%", (passed as f64 / total as f64) * 100.0);
    }
}

/// Lists parsed nodes without testing them.
pub fn display_nodes(nodes: &[Node]) {
    println!("\n=== Parsed Nodes ===");
    println!("{:<5} {:<25} {:<24} {:<6} {:<10} {}", "#", "Name", "Server", "Port", "Protocol", "Security");
    println!("{}", "=".repeat(80));
    for node in nodes {
        println!(
            "{:<5} {:<25} {:<24} {:<6} {:<10} {}",
            node.index,
            truncate(&node.name, 24),
            truncate(&node.host, 23),
            node.port,
            truncate(&node.scheme, 9),
            node.security
        );
    }
    println!("\nTotal nodes: {}", nodes.len());
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl ProbeReporter for ConsoleReporter {
    async fn report(&self, run: &ProbeRun) -> Result<()> {
        display_results(&run.nodes, &run.results, self.verbose);
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Writes the passing nodes in one export format, to a file or stdout.
pub struct ExportReporter {
    format: ExportFormat,
    template: Option<PathBuf>,
    output: Option<PathBuf>,
    naming: NamingOptions,
    type_filter: Vec<String>,
}

impl ExportReporter {
    pub fn new(
        format: ExportFormat,
        template: Option<PathBuf>,
        output: Option<PathBuf>,
        naming: NamingOptions,
        type_filter: Vec<String>,
    ) -> Self {
        Self {
            format,
            template,
            output,
            naming,
            type_filter,
        }
    }

    pub async fn write(&self, nodes: &[Node], results: &[TestResult]) -> Result<()> {
        let text = render(
            self.format,
            self.template.as_deref(),
            nodes,
            results,
            &self.naming,
            &self.type_filter,
        )?;
        match &self.output {
            Some(path) => {
                tokio::fs::write(path, text)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!("Wrote {} export to {}", self.format, path.display());
            }
            None => print!("{}", text),
        }
        Ok(())
    }
}

#[async_trait]
impl ProbeReporter for ExportReporter {
    async fn report(&self, run: &ProbeRun) -> Result<()> {
        self.write(&run.nodes, &run.results).await
    }

    fn name(&self) -> &str {
        "export"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_nodes_from_text;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long node name", 10), "a very ...");
        assert_eq!(truncate("香港香港香港香港香港香港", 8), "香港香港香...");
    }

    #[tokio::test]
    async fn test_export_reporter_writes_passing_nodes() {
        let nodes = parse_nodes_from_text(
            "trojan://pw@a.example.com:443#keep\ntrojan://pw@b.example.com:443#drop",
        )
        .unwrap()
        .nodes;
        let results = vec![
            TestResult {
                done: true,
                pass: true,
                latency_ms: vec![50],
                avg_ms: 50,
                max_ms: 50,
                attempts: 1,
                successful: 1,
                ..Default::default()
            },
            TestResult::failed("timeout", 1),
        ];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let reporter = ExportReporter::new(
            ExportFormat::Uri,
            None,
            Some(path.clone()),
            NamingOptions::default(),
            Vec::new(),
        );
        reporter
            .report(&ProbeRun {
                nodes,
                results,
                ..Default::default()
            })
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("a.example.com") && text.contains("#keep"));
    }
}

pub mod checks;
pub mod core;
pub mod http;
pub mod template;
pub mod utils;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use crate::checks::{CheckContext, CheckRegistry, Observation, Thresholds};
pub use crate::core::catalog::{get_test_cases, CatalogError, FuzzTest, IssueRule, TestCatalog};
pub use crate::core::engine::{ScanEngine, ScanSummary, TemplateSource};
pub use crate::core::mutator::{FuzzTarget, FuzzVariant};
pub use crate::core::result_aggregator::{Issue, IssueAggregator};
pub use crate::core::signal::{Signal, SignalDiff, SignalHolder};
pub use crate::core::{FieldLocation, Rating};
pub use crate::http::{Body, HttpClient, HttpRequest, HttpResponse, Transport, TransportError};
pub use crate::template::{ExtensionRegistry, TemplateContext, TemplateError};
pub use crate::utils::payload_loader::PayloadLoader;
pub use crate::utils::read_lines;

/// Shared scan configuration, loadable from a JSON file and overridden by
/// CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanConfig {
    pub endpoint: String,
    pub templates: Vec<String>,
    pub payloads: String,
    /// Substrings of test names to run; empty runs all of them.
    pub tests: Vec<String>,
    pub threads: usize,
    pub timeout: u64,
    pub output: String,
    pub proxy: String,
    pub headers: String,
    pub verbose: bool,
    pub dry_run: bool,
    pub thresholds: Thresholds,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            templates: Vec::new(),
            payloads: String::new(),
            tests: Vec::new(),
            threads: 10,
            timeout: 10,
            output: "issues.jsonl".to_string(),
            proxy: String::new(),
            headers: String::new(),
            verbose: false,
            dry_run: false,
            thresholds: Thresholds::default(),
        }
    }
}

impl ScanConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn header_list(&self) -> Vec<String> {
        if self.headers.is_empty() {
            Vec::new()
        } else {
            self.headers
                .split(';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }
    }

    pub fn parsed_headers(&self) -> Vec<(String, String)> {
        parse_custom_headers(&self.header_list())
    }

    pub fn proxy_ref(&self) -> Option<&str> {
        if self.proxy.is_empty() { None } else { Some(&self.proxy) }
    }

    pub fn payloads_ref(&self) -> Option<&str> {
        if self.payloads.is_empty() { None } else { Some(&self.payloads) }
    }
}

/// `Name: value` strings to pairs. A missing colon means an empty value;
/// entries without a name are dropped.
pub fn parse_custom_headers(raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .map(|h| h.split_once(':').unwrap_or((h.as_str(), "")))
        .map(|(key, val)| (key.trim(), val.trim()))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, val)| (key.to_string(), val.to_string()))
        .collect()
}

/// Output abstraction for the scan pipeline.
pub trait ScanEventSink: Send + Sync {
    fn on_log(&self, level: &str, message: &str);
    fn on_issue(&self, issue: &Issue);
    fn on_progress(&self, phase: &str, current: usize, total: usize);
}

pub type SinkRef = Arc<dyn ScanEventSink>;

/// Terminal output sink.
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }

    /// Multi-line colored rendering of an issue.
    pub fn format_issue(issue: &Issue) -> String {
        use colored::*;
        let severity = match issue.severity {
            Rating::High => issue.severity.to_string().red().bold(),
            Rating::Medium => issue.severity.to_string().yellow().bold(),
            _ => issue.severity.to_string().normal(),
        };
        let fields = issue
            .impacted_fields
            .iter()
            .map(|f| format!("{}:{}", f.location, f.field))
            .collect::<Vec<_>>()
            .join(", ");
        let status = issue
            .response
            .status
            .map(|s| s.to_string())
            .or_else(|| issue.response.error.clone())
            .unwrap_or_else(|| "N/A".to_string());

        [
            format!(
                "\n{} {} [{} / confidence {}]",
                "[+]".green().bold(),
                issue.defect_type.red().bold(),
                severity,
                issue.confidence
            ),
            format!("    Target:  {}", issue.url.white()),
            format!("    Case:    {}", issue.case_name),
            format!("    Fields:  {}", fields.bright_yellow()),
            format!(
                "    Payload: {}",
                issue.payloads.first().map(String::as_str).unwrap_or("").bright_yellow()
            ),
            format!(
                "    Info:    Status [{}] | Time [{}ms] | Signals [{}]",
                status.cyan(),
                issue.response.elapsed_ms.to_string().dimmed(),
                issue.signals.join(", ").dimmed()
            ),
            format!("    curl:    {}", issue.to_curl().dimmed()),
            "──────────────────────────────────────────".dimmed().to_string(),
        ]
        .join("\r\n")
    }
}

impl ScanEventSink for ConsoleSink {
    fn on_log(&self, level: &str, message: &str) {
        use colored::*;
        use std::io::Write;
        let colored = match level {
            "success" => message.green().to_string(),
            "error"   => message.red().to_string(),
            "warn"    => message.yellow().to_string(),
            "phase"   => message.bright_cyan().bold().to_string(),
            _         => message.to_string(),
        };
        print!("{}\r\n", colored);
        std::io::stdout().flush().ok();
    }

    fn on_issue(&self, issue: &Issue) {
        use std::io::Write;
        print!("{}\r\n", Self::format_issue(issue));
        std::io::stdout().flush().ok();
    }

    fn on_progress(&self, phase: &str, current: usize, total: usize) {
        use colored::*;
        use std::io::Write;
        if total > 0 {
            print!("{}\r\n", format!("[*] {} ({}/{})", phase, current, total).bright_cyan());
        } else {
            print!("{}\r\n", format!("[*] {}", phase).bright_cyan());
        }
        std::io::stdout().flush().ok();
    }
}

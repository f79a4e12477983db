use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

use indexmap::IndexMap;
use log::{debug, error};
use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

use crate::checks::Observation;
use crate::core::mutator::FuzzTarget;
use crate::core::{FieldLocation, Rating};
use crate::http::{Body, HttpRequest};
use crate::utils::{lock_or_recover, truncate_chars};
use crate::SinkRef;

/// Payloads are cut to this many characters in reports.
pub const MAX_PAYLOAD_CHARS: usize = 128;

/// A field a fuzz finding was triggered through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactedField {
    pub location: FieldLocation,
    pub field: String,
    pub payload: String,
}

impl From<&FuzzTarget> for ImpactedField {
    fn from(target: &FuzzTarget) -> Self {
        Self {
            location: target.location,
            field: target.field.clone(),
            payload: truncate_chars(&target.payload, MAX_PAYLOAD_CHARS),
        }
    }
}

/// What came back for the request behind an issue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseSummary {
    pub status: Option<u16>,
    pub length: usize,
    pub elapsed_ms: u128,
    pub content_type: Option<String>,
    pub error: Option<String>,
}

impl From<&Observation> for ResponseSummary {
    fn from(observation: &Observation) -> Self {
        match &observation.outcome {
            Ok(response) => Self {
                status: Some(response.status),
                length: response.body.len(),
                elapsed_ms: response.elapsed.as_millis(),
                content_type: response.header("content-type").map(str::to_string),
                error: None,
            },
            Err(e) => Self {
                error: Some(e.to_string()),
                ..Self::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub defect_type: String,
    pub severity: Rating,
    pub confidence: Rating,
    pub description: String,
    pub test_name: String,
    pub case_name: String,
    pub url: String,
    pub request: HttpRequest,
    pub response: ResponseSummary,
    /// Slugs of the variant's signals when the issue was raised.
    pub signals: Vec<String>,
    pub payloads: Vec<String>,
    pub impacted_fields: Vec<ImpactedField>,
}

impl Issue {
    pub fn dedup_key(&self) -> String {
        build_dedup_key(&self.url, &self.defect_type)
    }

    /// Folds another finding of the same kind into this one. Returns
    /// whether anything new was added.
    pub fn absorb(&mut self, other: Issue) -> bool {
        let mut changed = false;
        for payload in other.payloads {
            if !self.payloads.contains(&payload) {
                self.payloads.push(payload);
                changed = true;
            }
        }
        for field in other.impacted_fields {
            if !self.impacted_fields.contains(&field) {
                self.impacted_fields.push(field);
                changed = true;
            }
        }
        changed
    }

    /// Builds a curl command that reproduces this finding.
    pub fn to_curl(&self) -> String {
        let mut parts = vec![format!(
            "curl -X {} '{}'",
            self.request.method,
            self.request.render_url()
        )];
        for (k, v) in &self.request.headers {
            parts.push(format!("-H '{}: {}'", k, v));
        }
        if !self.request.body.is_empty() {
            parts.push(format!("-d '{}'", self.request.body.render()));
        }
        if matches!(self.request.body, Body::Structured(_) | Body::Markup(_))
            && !self
                .request
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-type"))
        {
            parts.push(format!(
                "-H 'Content-Type: {}'",
                self.request.body.default_content_type()
            ));
        }
        parts.push("--insecure".to_string());
        parts.join(" ")
    }
}

/// `scheme://host/path|defect_type`. Query strings and slot values do not
/// split findings.
fn build_dedup_key(url: &str, defect_type: &str) -> String {
    let base_url = if let Ok(parsed) = Url::parse(url) {
        format!(
            "{}://{}{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or(""),
            parsed.path()
        )
    } else {
        url.to_string()
    };
    format!("{}|{}", base_url, defect_type)
}

/// Deduplicated issue store shared by every worker of a scan.
#[derive(Debug, Default)]
pub struct IssueAggregator {
    issues: Mutex<IndexMap<String, Issue>>,
    histogram: Mutex<BTreeMap<Rating, usize>>,
}

impl IssueAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `issue`. The first issue for a key is kept; later ones only
    /// contribute their payloads and fields. Returns true for a new key.
    pub fn add(&self, issue: Issue) -> bool {
        let key = issue.dedup_key();
        let mut issues = lock_or_recover(&self.issues, "issue map");
        match issues.get_mut(&key) {
            Some(existing) => {
                if existing.absorb(issue) {
                    debug!("Folded another payload into {}", key);
                }
                false
            }
            None => {
                *lock_or_recover(&self.histogram, "severity histogram")
                    .entry(issue.severity)
                    .or_insert(0) += 1;
                issues.insert(key, issue);
                true
            }
        }
    }

    pub fn issues(&self) -> Vec<Issue> {
        lock_or_recover(&self.issues, "issue map")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.issues, "issue map").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct issues per severity, every level present.
    pub fn severity_histogram(&self) -> BTreeMap<Rating, usize> {
        let counts = lock_or_recover(&self.histogram, "severity histogram");
        [Rating::Undefined, Rating::Low, Rating::Medium, Rating::High]
            .into_iter()
            .map(|rating| (rating, counts.get(&rating).copied().unwrap_or(0)))
            .collect()
    }

    /// Drains `receiver` until every sender is gone. New issues are reported
    /// to `sink` as they arrive. Once the channel closes, every merged issue
    /// is appended to `output_path` as one JSON line.
    pub async fn run(
        &self,
        mut receiver: mpsc::Receiver<Issue>,
        output_path: Option<&str>,
        sink: SinkRef,
    ) {
        let mut file = output_path.and_then(|path| {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => Some(f),
                Err(e) => {
                    error!("Failed to open output file '{}': {}", path, e);
                    sink.on_log("error", &format!("[!] Failed to open output file '{}': {}", path, e));
                    None
                }
            }
        });

        while let Some(issue) = receiver.recv().await {
            if self.add(issue.clone()) {
                sink.on_issue(&issue);
            }
        }

        if let Some(file) = file.as_mut() {
            for issue in self.issues() {
                match serde_json::to_string(&issue) {
                    Ok(line) => write_line(file, &line),
                    Err(e) => error!("Failed to serialize issue {}: {}", issue.dedup_key(), e),
                }
            }
        }
    }

    pub fn report_summary(&self, sink: &SinkRef) {
        let issues = self.issues();
        if issues.is_empty() {
            sink.on_log("success", "[+] No issues found.");
            return;
        }
        sink.on_log("warn", &format!("[+] {} issue(s) found:", issues.len()));
        for (i, issue) in issues.iter().enumerate() {
            sink.on_log(
                "error",
                &format!(
                    "  #{} [{}] {} -> {} ({} payload(s))",
                    i + 1,
                    issue.severity,
                    issue.defect_type,
                    issue.url,
                    issue.payloads.len()
                ),
            );
        }
        let histogram = self
            .severity_histogram()
            .iter()
            .rev()
            .map(|(rating, count)| format!("{}: {}", rating, count))
            .collect::<Vec<_>>()
            .join(" | ");
        sink.on_log("phase", &format!("[*] Severity  {}", histogram));
    }
}

fn write_line(file: &mut File, line: &str) {
    if let Err(e) = writeln!(file, "{}", line) {
        error!("Failed to write issue: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ScanEventSink, SinkRef};
    use reqwest::Method;
    use std::sync::Arc;

    fn issue(url: &str, defect: &str, payload: &str, field: &str) -> Issue {
        Issue {
            defect_type: defect.to_string(),
            severity: Rating::High,
            confidence: Rating::Medium,
            description: String::new(),
            test_name: "sqli_body".to_string(),
            case_name: "sqli_body_users_str1_model1".to_string(),
            url: url.to_string(),
            request: HttpRequest::new(Method::POST, url),
            response: ResponseSummary::default(),
            signals: vec!["FAILURE_KEYS_PRESENT".to_string()],
            payloads: vec![payload.to_string()],
            impacted_fields: vec![ImpactedField {
                location: FieldLocation::Body,
                field: field.to_string(),
                payload: payload.to_string(),
            }],
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        issues: Mutex<Vec<String>>,
    }

    impl ScanEventSink for RecordingSink {
        fn on_log(&self, _level: &str, _message: &str) {}
        fn on_issue(&self, issue: &Issue) {
            self.issues.lock().unwrap().push(issue.defect_type.clone());
        }
        fn on_progress(&self, _phase: &str, _current: usize, _total: usize) {}
    }

    #[test]
    fn test_dedup_key_ignores_query() {
        assert_eq!(
            build_dedup_key("https://example.com/api/users?id=1", "SQL_INJECTION"),
            "https://example.com/api/users|SQL_INJECTION"
        );
        assert_eq!(build_dedup_key("not a url", "X"), "not a url|X");
    }

    #[test]
    fn test_same_endpoint_and_type_folds() {
        let aggregator = IssueAggregator::new();
        assert!(aggregator.add(issue("http://t/a?x=1", "SQL_INJECTION", "'", "name")));
        assert!(!aggregator.add(issue("http://t/a?x=2", "SQL_INJECTION", "\"", "role")));
        assert!(!aggregator.add(issue("http://t/a", "SQL_INJECTION", "'", "name")));
        assert!(aggregator.add(issue("http://t/a", "REFLECTED_XSS", "<svg>", "name")));
        assert!(aggregator.add(issue("http://t/b", "SQL_INJECTION", "'", "name")));

        let issues = aggregator.issues();
        assert_eq!(issues.len(), 3);
        assert_eq!(issues[0].payloads, vec!["'", "\""]);
        assert_eq!(issues[0].impacted_fields.len(), 2);
        assert_eq!(issues[0].url, "http://t/a?x=1");
    }

    #[test]
    fn test_histogram_counts_distinct_issues() {
        let aggregator = IssueAggregator::new();
        aggregator.add(issue("http://t/a", "SQL_INJECTION", "'", "n"));
        aggregator.add(issue("http://t/a", "SQL_INJECTION", "''", "n"));
        let mut low = issue("http://t/a", "SERVER_ERROR", "x", "n");
        low.severity = Rating::Low;
        aggregator.add(low);

        let histogram = aggregator.severity_histogram();
        assert_eq!(histogram.len(), 4);
        assert_eq!(histogram[&Rating::High], 1);
        assert_eq!(histogram[&Rating::Low], 1);
        assert_eq!(histogram[&Rating::Undefined], 0);
    }

    #[test]
    fn test_impacted_field_truncates_payload() {
        let target = FuzzTarget {
            location: FieldLocation::Param,
            field: "q".to_string(),
            payload: "A".repeat(500),
        };
        assert_eq!(ImpactedField::from(&target).payload.len(), MAX_PAYLOAD_CHARS);
    }

    #[test]
    fn test_curl_includes_body_and_content_type() {
        let mut finding = issue("http://t/a", "X", "p", "f");
        finding.request.body = Body::Structured(serde_json::json!({"a": 1}));
        let curl = finding.to_curl();
        assert!(curl.starts_with("curl -X POST 'http://t/a'"));
        assert!(curl.contains(r#"-d '{"a":1}'"#));
        assert!(curl.contains("Content-Type: application/json"));
    }

    #[tokio::test]
    async fn test_run_reports_new_issues_and_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let recording = Arc::new(RecordingSink::default());
        let sink: SinkRef = recording.clone();
        let aggregator = IssueAggregator::new();

        let (tx, rx) = mpsc::channel(8);
        tx.send(issue("http://t/a", "SQL_INJECTION", "'", "n")).await.unwrap();
        tx.send(issue("http://t/a", "SQL_INJECTION", "\"", "n")).await.unwrap();
        tx.send(issue("http://t/a", "SERVER_ERROR", "x", "n")).await.unwrap();
        drop(tx);

        aggregator.run(rx, path.to_str(), sink).await;

        assert_eq!(
            *recording.issues.lock().unwrap(),
            vec!["SQL_INJECTION", "SERVER_ERROR"]
        );
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.lines().all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok()));
    }

    #[tokio::test]
    async fn test_output_lines_carry_folded_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let aggregator = IssueAggregator::new();

        let (tx, rx) = mpsc::channel(8);
        tx.send(issue("http://t/a?x=1", "SQL_INJECTION", "'", "name")).await.unwrap();
        tx.send(issue("http://t/a?x=2", "SQL_INJECTION", "\"", "role")).await.unwrap();
        drop(tx);

        aggregator.run(rx, path.to_str(), Arc::new(RecordingSink::default())).await;

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["payloads"], serde_json::json!(["'", "\""]));
        let fields: Vec<&str> = lines[0]["impacted_fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, vec!["name", "role"]);
        assert_eq!(
            serde_json::to_value(&aggregator.issues()[0]).unwrap()["payloads"],
            lines[0]["payloads"]
        );
    }
}

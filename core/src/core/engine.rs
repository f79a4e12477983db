use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{stream, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::checks::{CheckContext, CheckRegistry, Observation, Thresholds};
use crate::core::catalog::{get_test_cases, CatalogError, FuzzTest, IssueRule, TestCatalog};
use crate::core::mutator::{self, FuzzVariant};
use crate::core::result_aggregator::{ImpactedField, Issue, ResponseSummary, MAX_PAYLOAD_CHARS};
use crate::http::{HttpRequest, Transport};
use crate::template::{self, ExtensionRegistry, TemplateContext};
use crate::utils::truncate_chars;
use crate::SinkRef;

/// A named template file.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub name: String,
    pub text: String,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Reads a template; its name is the file stem.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, text })
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub templates: usize,
    pub templates_failed: usize,
    pub requests_sent: usize,
    pub transport_errors: usize,
    pub issues_raised: usize,
}

/// Drives templates through baseline, fuzz variants and checks, and hands
/// every raised issue to the aggregator channel.
///
/// For each template:
/// 1. Parses it with a fresh `TemplateContext` and sends the baseline
/// 2. Runs the checks on the baseline
/// 3. Generates the variants of every catalog test and sends them
///    concurrently
/// 4. Compares each variant's signals with the baseline's and applies the
///    test's issue rules
pub struct ScanEngine {
    transport: Arc<dyn Transport>,
    extensions: Arc<ExtensionRegistry>,
    checks: CheckRegistry,
    catalog: TestCatalog,
    thresholds: Thresholds,
    concurrency_limit: usize,
    sink: SinkRef,
}

impl ScanEngine {
    pub fn new(transport: Arc<dyn Transport>, catalog: TestCatalog, sink: SinkRef) -> Self {
        Self {
            transport,
            extensions: Arc::new(ExtensionRegistry::with_builtins()),
            checks: CheckRegistry::with_defaults(),
            catalog,
            thresholds: Thresholds::default(),
            concurrency_limit: 10,
            sink,
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn with_checks(mut self, checks: CheckRegistry) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_extensions(mut self, extensions: Arc<ExtensionRegistry>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Claims the case identities of every template up front, so name
    /// collisions fail before anything is sent.
    pub fn bind(&mut self, templates: &[TemplateSource]) -> Result<(), CatalogError> {
        for source in templates {
            self.catalog.bind_template(&source.name)?;
        }
        Ok(())
    }

    /// Case names every template would produce, without sending anything.
    pub fn list_cases(
        &mut self,
        templates: &[TemplateSource],
        endpoint: &str,
    ) -> Result<Vec<String>, CatalogError> {
        self.bind(templates)?;
        let tests: Vec<FuzzTest> = self.catalog.tests().cloned().collect();
        let mut names = Vec::new();
        for source in templates {
            let ctx = TemplateContext::new(Arc::clone(&self.extensions));
            match template::parse(&source.text, endpoint, &ctx) {
                Ok(baseline) => names.extend(
                    get_test_cases(&source.name, &baseline, &tests, ctx.marker()).map(|(name, _)| name),
                ),
                Err(e) => warn!("Skipping template {}: {}", source.name, e),
            }
        }
        Ok(names)
    }

    pub async fn run(
        mut self,
        templates: Vec<TemplateSource>,
        endpoint: &str,
        issue_tx: mpsc::Sender<Issue>,
    ) -> Result<ScanSummary, CatalogError> {
        self.bind(&templates)?;
        let tests: Vec<FuzzTest> = self.catalog.tests().cloned().collect();
        let mut summary = ScanSummary {
            templates: templates.len(),
            ..ScanSummary::default()
        };

        for (i, source) in templates.iter().enumerate() {
            self.sink.on_progress(
                &format!("Template {}", source.name),
                i + 1,
                templates.len(),
            );
            if let Err(e) = self
                .scan_template(source, endpoint, &tests, &issue_tx, &mut summary)
                .await
            {
                warn!("Skipping template {}: {}", source.name, e);
                self.sink
                    .on_log("error", &format!("[!] Template {}: {}", source.name, e));
                summary.templates_failed += 1;
            }
        }
        Ok(summary)
    }

    async fn scan_template(
        &self,
        source: &TemplateSource,
        endpoint: &str,
        tests: &[FuzzTest],
        issue_tx: &mpsc::Sender<Issue>,
        summary: &mut ScanSummary,
    ) -> Result<(), template::TemplateError> {
        let ctx = TemplateContext::new(Arc::clone(&self.extensions));
        let baseline = template::parse(&source.text, endpoint, &ctx)?;

        let sent = ctx.prepare(&baseline)?;
        let outcome = self.transport.send(&sent).await;
        summary.requests_sent += 1;
        if outcome.is_err() {
            summary.transport_errors += 1;
        }
        let mut init = Observation::new(sent, outcome);
        let all_keys: Vec<String> = tests.iter().flat_map(|t| t.failure_keys.clone()).collect();
        init.signals = self
            .checks
            .run(&CheckContext::new(&init, &self.thresholds).with_failure_keys(&all_keys));
        debug!(
            "Baseline {} -> [{}]",
            source.name,
            init.signals.slugs().collect::<Vec<_>>().join(", ")
        );

        let sent_count = AtomicUsize::new(0);
        let error_count = AtomicUsize::new(0);
        let issue_count = AtomicUsize::new(0);
        let total: usize = tests
            .iter()
            .map(|t| mutator::generate(&baseline, t.location, &t.payloads, ctx.marker(), "").len())
            .sum();

        for test in tests {
            let cases = get_test_cases(&source.name, &baseline, std::slice::from_ref(test), ctx.marker());
            let (ctx, init, sent_count, error_count, issue_count) =
                (&ctx, &init, &sent_count, &error_count, &issue_count);

            stream::iter(cases)
                .map(|(case_name, variant)| async move {
                    let request = match ctx.prepare(&variant.request) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!("Skipping {}: {}", case_name, e);
                            return;
                        }
                    };
                    let outcome = self.transport.send(&request).await;
                    let done = sent_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if outcome.is_err() {
                        error_count.fetch_add(1, Ordering::Relaxed);
                    }
                    self.sink.on_progress(&format!("Fuzzing {}", source.name), done, total);

                    let mut observed = Observation::new(request, outcome);
                    observed.signals = self.checks.run(
                        &CheckContext::new(init, &self.thresholds)
                            .with_variant(&observed, &variant.target.payload)
                            .with_failure_keys(&test.failure_keys),
                    );
                    let diff = init.signals.compare(&observed.signals);
                    debug!(
                        "{} -> [{}]",
                        case_name,
                        observed.signals.slugs().collect::<Vec<_>>().join(", ")
                    );

                    for rule in test.triggered(&observed.signals, &diff) {
                        let issue = build_issue(rule, test, &case_name, init, &observed, &variant);
                        issue_count.fetch_add(1, Ordering::Relaxed);
                        if issue_tx.send(issue).await.is_err() {
                            warn!("Issue channel closed; dropping finding from {}", case_name);
                        }
                    }
                })
                .buffer_unordered(self.concurrency_limit)
                .collect::<Vec<()>>()
                .await;
        }

        summary.requests_sent += sent_count.into_inner();
        summary.transport_errors += error_count.into_inner();
        summary.issues_raised += issue_count.into_inner();
        Ok(())
    }
}

fn build_issue(
    rule: &IssueRule,
    test: &FuzzTest,
    case_name: &str,
    init: &Observation,
    observed: &Observation,
    variant: &FuzzVariant,
) -> Issue {
    Issue {
        defect_type: rule.defect_type.clone(),
        severity: rule.severity,
        confidence: rule.confidence,
        description: rule.description.clone(),
        test_name: test.name.clone(),
        case_name: case_name.to_string(),
        url: baseline_url(&init.request),
        request: observed.request.clone(),
        response: ResponseSummary::from(observed),
        signals: observed.signals.slugs().map(str::to_string).collect(),
        payloads: vec![truncate_chars(&variant.target.payload, MAX_PAYLOAD_CHARS)],
        impacted_fields: vec![ImpactedField::from(&variant.target)],
    }
}

/// Issues are filed under the baseline url, so url variants of one
/// endpoint share a dedup key.
fn baseline_url(request: &HttpRequest) -> String {
    request.render_url()
}

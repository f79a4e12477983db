use clap::Parser;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::process;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use sigfuzz_core::{
    parse_custom_headers, ConsoleSink, HttpClient, Issue, IssueAggregator, PayloadLoader,
    ScanConfig, ScanEngine, ScanEventSink, SinkRef, TemplateSource, TestCatalog,
};

#[derive(Parser, Debug)]
#[command(
    name = "sigfuzz",
    version,
    about = "Black-box API fuzz-test generator",
    override_usage = "sigfuzz --endpoint <URL> <TEMPLATE>...  <options>",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Fuzz one template:              sigfuzz --endpoint http://api.local users.http
  List cases only:                sigfuzz --endpoint http://api.local users.http --dry-run
  Only SQL injection tests:       sigfuzz --endpoint http://api.local users.http --test sqli
  Custom corpus + threads:        sigfuzz --endpoint http://api.local users.http -p corpus.txt -t 20
  Through a proxy (Burp):         sigfuzz --endpoint http://api.local users.http --proxy http://127.0.0.1:8080
  From a config file:             sigfuzz -c scan.json"
)]
pub struct Args {
    /// Request template files.
    pub templates: Vec<String>,

    #[arg(short = 'e', long, help = "Base URL template paths are joined onto")]
    pub endpoint: Option<String>,

    #[arg(short = 'p', long, help = "Payload corpus file, one payload per line")]
    pub payloads: Option<String>,

    #[arg(long = "test", help = "Only run tests whose name contains this (repeatable)")]
    pub tests: Vec<String>,

    #[arg(short = 't', long, help = "Number of concurrent requests")]
    pub threads: Option<usize>,

    #[arg(long, help = "Request timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Proxy URL (e.g. http://127.0.0.1:8080)")]
    pub proxy: Option<String>,

    #[arg(short = 'H', long = "header", help = "Custom header (e.g. \"Authorization: Bearer TOKEN\")")]
    pub headers: Vec<String>,

    #[arg(short = 'o', long, help = "Output file for issues (JSON lines)")]
    pub output: Option<String>,

    #[arg(short = 'c', long, help = "JSON config file; flags override its values")]
    pub config: Option<String>,

    #[arg(short = 'v', long, default_value_t = false, help = "Debug logging")]
    pub verbose: bool,

    #[arg(long, help = "List generated test cases without sending requests")]
    pub dry_run: bool,
}

impl Args {
    /// Config file values with flags layered on top.
    fn into_config(self) -> anyhow::Result<(ScanConfig, Vec<String>)> {
        let mut config = match &self.config {
            Some(path) => ScanConfig::load(path)?,
            None => ScanConfig::default(),
        };
        if !self.templates.is_empty() {
            config.templates = self.templates;
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(payloads) = self.payloads {
            config.payloads = payloads;
        }
        if !self.tests.is_empty() {
            config.tests = self.tests;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(proxy) = self.proxy {
            config.proxy = proxy;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        config.verbose |= self.verbose;
        config.dry_run |= self.dry_run;

        let mut headers = config.header_list();
        headers.extend(self.headers);
        Ok((config, headers))
    }
}

/// Console sink that keeps a progress bar pinned under the output.
struct ProgressSink {
    console: ConsoleSink,
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressSink {
    fn new_ref() -> Arc<Self> {
        Arc::new(Self {
            console: ConsoleSink,
            bar: Mutex::new(None),
        })
    }

    fn finish(&self) {
        if let Ok(mut bar) = self.bar.lock() {
            if let Some(bar) = bar.take() {
                bar.finish_and_clear();
            }
        }
    }
}

impl ScanEventSink for ProgressSink {
    fn on_log(&self, level: &str, message: &str) {
        match self.bar.lock().ok().and_then(|b| b.clone()) {
            Some(bar) => bar.suspend(|| self.console.on_log(level, message)),
            None => self.console.on_log(level, message),
        }
    }

    fn on_issue(&self, issue: &Issue) {
        match self.bar.lock().ok().and_then(|b| b.clone()) {
            Some(bar) => bar.println(ConsoleSink::format_issue(issue)),
            None => self.console.on_issue(issue),
        }
    }

    fn on_progress(&self, phase: &str, current: usize, total: usize) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        if phase.starts_with("Template") {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
            self.console.on_progress(phase, current, total);
            return;
        }
        let bar = slot.get_or_insert_with(|| {
            let bar = ProgressBar::new(total as u64);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({eta})",
            ) {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        });
        bar.set_length(total as u64);
        bar.set_message(phase.to_string());
        bar.set_position(current as u64);
    }
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let args = Args::parse();
    let (config, headers) = match args.into_config() {
        Ok(parts) => parts,
        Err(e) => fail(&format!("{:#}", e)),
    };

    let default_filter = if config.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if config.templates.is_empty() {
        fail("No templates specified. Pass template files or set them in --config.");
    }
    if config.endpoint.is_empty() {
        fail("No endpoint specified. Use --endpoint <URL>.");
    }

    let mut templates = Vec::new();
    for path in &config.templates {
        match TemplateSource::from_path(path) {
            Ok(source) => templates.push(source),
            Err(e) => fail(&format!("Failed to read template '{}': {}", path, e)),
        }
    }

    let loader = match config.payloads_ref() {
        Some(path) => match PayloadLoader::from_file(path) {
            Ok(loader) => loader,
            Err(e) => fail(&format!("Failed to read payloads '{}': {}", path, e)),
        },
        None => PayloadLoader::new(),
    };
    let mut catalog = match TestCatalog::builtin(&loader) {
        Ok(catalog) => catalog,
        Err(e) => fail(&e.to_string()),
    };
    catalog.retain_matching(&config.tests);
    if catalog.is_empty() {
        fail("No tests match the --test filter.");
    }

    let custom_headers = parse_custom_headers(&headers);

    if config.dry_run {
        run_dry(&config, catalog, templates);
        return;
    }

    print_scan_config(&config, catalog.len(), custom_headers.len());

    let client = match HttpClient::new(config.timeout, config.proxy_ref(), &custom_headers) {
        Ok(client) => Arc::new(client),
        Err(e) => fail(&format!("Failed to build HTTP client: {}", e)),
    };

    let progress = ProgressSink::new_ref();
    let sink: SinkRef = progress.clone();
    let engine = ScanEngine::new(client, catalog, Arc::clone(&sink))
        .with_thresholds(config.thresholds.clone())
        .with_concurrency(config.threads);
    let aggregator = IssueAggregator::new();
    let (issue_tx, issue_rx) = mpsc::channel::<Issue>(100);

    let (summary, _) = tokio::join!(
        engine.run(templates, &config.endpoint, issue_tx),
        aggregator.run(issue_rx, Some(config.output.as_str()), Arc::clone(&sink))
    );
    progress.finish();

    match summary {
        Ok(summary) => {
            print!(
                "\r\n{}\r\n",
                format!(
                    "[*] {} template(s), {} failed | {} request(s), {} transport error(s)",
                    summary.templates,
                    summary.templates_failed,
                    summary.requests_sent,
                    summary.transport_errors
                )
                .bright_cyan()
            );
            std::io::stdout().flush().ok();
            aggregator.report_summary(&sink);
        }
        Err(e) => fail(&e.to_string()),
    }
}

fn run_dry(config: &ScanConfig, catalog: TestCatalog, templates: Vec<TemplateSource>) {
    let mut engine = match HttpClient::new(config.timeout, None, &[]) {
        Ok(client) => ScanEngine::new(Arc::new(client), catalog, ConsoleSink::new_ref()),
        Err(e) => fail(&format!("Failed to build HTTP client: {}", e)),
    };
    match engine.list_cases(&templates, &config.endpoint) {
        Ok(cases) => {
            for case in &cases {
                println!("[DRY RUN] {}", case);
            }
            println!("[DRY RUN] {} test case(s) across {} template(s)", cases.len(), templates.len());
        }
        Err(e) => fail(&e.to_string()),
    }
}

fn fail(message: &str) -> ! {
    eprint!("{}\r\n", format!("[!] {}", message).red());
    process::exit(1);
}

fn print_scan_config(config: &ScanConfig, tests: usize, headers: usize) {
    print!("{}\r\n", format!("[+] Endpoint:   {}", config.endpoint).green().bold());
    print!("{}\r\n", format!("[+] Templates:  {}", config.templates.len()).blue());
    print!("{}\r\n", format!("[+] Tests:      {}", tests).blue());
    print!("{}\r\n", format!("[+] Threads:    {}", config.threads).blue());
    print!("{}\r\n", format!("[+] Timeout:    {}s", config.timeout).blue());
    print!("{}\r\n", format!("[+] Output:     {}", config.output).blue());
    if let Some(proxy) = config.proxy_ref() {
        print!("{}\r\n", format!("[+] Proxy:      {}", proxy).yellow());
    }
    if headers > 0 {
        print!("{}\r\n", format!("[+] Headers:    {} custom", headers).yellow());
    }
    if let Some(payloads) = config.payloads_ref() {
        print!("{}\r\n", format!("[+] Payloads:   {}", payloads).yellow());
    }
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

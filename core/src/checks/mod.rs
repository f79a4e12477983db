//! Checks turn one observed request/response pair into at most one signal.
//!
//! A check sees both phases: the baseline observation and, while a fuzz
//! variant is being evaluated, the variant's observation. Checks are plain
//! functions looked up by name in a `CheckRegistry`.

pub mod content;
pub mod diff;
pub mod exception;
pub mod response;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::signal::{Signal, SignalHolder};
use crate::http::{HttpRequest, HttpResponse, TransportError};

pub const HTTP_STATUS_CODE: &str = "HTTP_STATUS_CODE";
pub const HEADER_CONTENT_TYPE: &str = "HEADER_CONTENT_TYPE";
pub const LENGTH_DIFF: &str = "LENGTH_DIFF";
pub const TIME_DIFF: &str = "TIME_DIFF";
pub const LENGTH_OVER_MAX: &str = "LENGTH_OVER_MAX";
pub const TIME_OVER_MAX: &str = "TIME_OVER_MAX";
pub const HAS_STRING: &str = "HAS_STRING";
pub const PAYLOAD_REFLECTED: &str = "PAYLOAD_REFLECTED";
pub const EXCEPTION_RAISED: &str = "EXCEPTION_RAISED";

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("malformed {header} header: {value:?}")]
    MalformedHeader { header: &'static str, value: String },
    #[error("{0}")]
    Failed(String),
}

/// Limits the diff and absolute checks compare against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thresholds {
    pub length_diff_percent: f64,
    pub time_diff_percent: f64,
    /// Bytes.
    pub max_length: usize,
    /// Seconds.
    pub max_time: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            length_diff_percent: 1000.0,
            time_diff_percent: 1000.0,
            max_length: 500_000,
            max_time: 10.0,
        }
    }
}

/// One request as sent, what came back, and the signals collected for it.
#[derive(Debug, Clone)]
pub struct Observation {
    pub request: HttpRequest,
    pub outcome: Result<HttpResponse, TransportError>,
    pub signals: SignalHolder,
}

impl Observation {
    pub fn new(request: HttpRequest, outcome: Result<HttpResponse, TransportError>) -> Self {
        Self {
            request,
            outcome,
            signals: SignalHolder::new(),
        }
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TransportError> {
        self.outcome.as_ref().err()
    }
}

/// Everything a check may look at.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    init: &'a Observation,
    test: Option<&'a Observation>,
    payload: Option<&'a str>,
    failure_keys: &'a [String],
    thresholds: &'a Thresholds,
}

impl<'a> CheckContext<'a> {
    /// Context for the baseline phase.
    pub fn new(init: &'a Observation, thresholds: &'a Thresholds) -> Self {
        Self {
            init,
            test: None,
            payload: None,
            failure_keys: &[],
            thresholds,
        }
    }

    /// Switches to the variant phase: `test` was produced by `payload`.
    pub fn with_variant(mut self, test: &'a Observation, payload: &'a str) -> Self {
        self.test = Some(test);
        self.payload = Some(payload);
        self
    }

    pub fn with_failure_keys(mut self, keys: &'a [String]) -> Self {
        self.failure_keys = keys;
        self
    }

    pub fn init_request(&self) -> &'a HttpRequest {
        &self.init.request
    }

    pub fn init_response(&self) -> Option<&'a HttpResponse> {
        self.init.response()
    }

    pub fn init_signals(&self) -> &'a SignalHolder {
        &self.init.signals
    }

    pub fn test_request(&self) -> Option<&'a HttpRequest> {
        self.test.map(|t| &t.request)
    }

    pub fn test_response(&self) -> Option<&'a HttpResponse> {
        self.test.and_then(Observation::response)
    }

    pub fn test_signals(&self) -> Option<&'a SignalHolder> {
        self.test.map(|t| &t.signals)
    }

    /// The response of the phase being checked: the variant's when one is
    /// set, the baseline's otherwise.
    pub fn response(&self) -> Option<&'a HttpResponse> {
        match self.test {
            Some(test) => test.response(),
            None => self.init.response(),
        }
    }

    /// Transport failure of the phase being checked.
    pub fn transport_error(&self) -> Option<&'a TransportError> {
        match self.test {
            Some(test) => test.error(),
            None => self.init.error(),
        }
    }

    pub fn is_variant(&self) -> bool {
        self.test.is_some()
    }

    pub fn payload(&self) -> Option<&'a str> {
        self.payload
    }

    pub fn failure_keys(&self) -> &'a [String] {
        self.failure_keys
    }

    pub fn thresholds(&self) -> &'a Thresholds {
        self.thresholds
    }
}

pub type CheckFn = Arc<dyn Fn(&CheckContext<'_>) -> Result<Option<Signal>, CheckError> + Send + Sync>;

/// Named checks, run in registration order.
#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: IndexMap<String, CheckFn>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in check.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(EXCEPTION_RAISED, exception::exception_raised)
            .register(HTTP_STATUS_CODE, response::status_code)
            .register(HEADER_CONTENT_TYPE, response::content_type)
            .register(LENGTH_DIFF, diff::length_diff)
            .register(TIME_DIFF, diff::time_diff)
            .register(LENGTH_OVER_MAX, diff::length_over_max)
            .register(TIME_OVER_MAX, diff::time_over_max)
            .register(HAS_STRING, content::has_string)
            .register(PAYLOAD_REFLECTED, content::payload_reflected);
        registry
    }

    /// Adds or replaces the check called `name`.
    pub fn register<F>(&mut self, name: &str, check: F) -> &mut Self
    where
        F: Fn(&CheckContext<'_>) -> Result<Option<Signal>, CheckError> + Send + Sync + 'static,
    {
        self.checks.insert(name.to_string(), Arc::new(check));
        self
    }

    /// Keeps only the named checks.
    pub fn retain(&mut self, names: &[&str]) -> &mut Self {
        self.checks.retain(|name, _| names.contains(&name.as_str()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&CheckFn> {
        self.checks.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs every check against `ctx`. A check that errors or panics is
    /// logged and skipped; the others still report.
    pub fn run(&self, ctx: &CheckContext<'_>) -> SignalHolder {
        let mut holder = SignalHolder::new();
        for (name, check) in &self.checks {
            match panic::catch_unwind(AssertUnwindSafe(|| check(ctx))) {
                Ok(Ok(Some(signal))) => {
                    debug!("{} -> {}", name, signal.slug);
                    holder.register(signal);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!("Check {} failed: {}", name, e),
                Err(cause) => warn!("Check {} panicked: {}", name, panic_message(cause.as_ref())),
            }
        }
        holder
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_response_prefers_variant_phase() {
        let thresholds = Thresholds::default();
        let init = observed(response(200, "base", 1));
        let test = observed(response(500, "boom", 1));

        let ctx = CheckContext::new(&init, &thresholds);
        assert_eq!(ctx.response().map(|r| r.status), Some(200));
        assert!(!ctx.is_variant());

        let ctx = ctx.with_variant(&test, "'");
        assert_eq!(ctx.response().map(|r| r.status), Some(500));
        assert_eq!(ctx.init_response().map(|r| r.status), Some(200));
        assert_eq!(ctx.payload(), Some("'"));
    }

    #[test]
    fn test_failing_check_does_not_hide_others() {
        let thresholds = Thresholds::default();
        let mut init = observed(response(503, "", 1));
        if let Ok(resp) = init.outcome.as_mut() {
            resp.headers.insert("Content-Type".to_string(), "garbage".to_string());
        }

        let signals = CheckRegistry::with_defaults().run(&CheckContext::new(&init, &thresholds));

        assert!(signals.ran_check(HTTP_STATUS_CODE));
        assert!(!signals.ran_check(HEADER_CONTENT_TYPE));
        assert!(signals.contains("SERVER_FAIL"));
    }

    #[test]
    fn test_panicking_check_does_not_hide_others() {
        let thresholds = Thresholds::default();
        let init = observed(response(500, "", 1));
        let defaults = CheckRegistry::with_defaults();
        let status = defaults.get(HTTP_STATUS_CODE).unwrap().clone();

        let mut registry = CheckRegistry::new();
        registry
            .register("EXPLODES", |_| panic!("check blew up"))
            .register(HTTP_STATUS_CODE, move |ctx| status(ctx));

        let signals = registry.run(&CheckContext::new(&init, &thresholds));

        assert_eq!(signals.len(), 1);
        assert!(signals.ran_check(HTTP_STATUS_CODE));
        assert!(!signals.ran_check("EXPLODES"));
        assert_eq!(panic_message(&String::from("owned")), "owned");
    }

    #[test]
    fn test_registry_order_and_retain() {
        let mut registry = CheckRegistry::with_defaults();
        assert_eq!(registry.names().next(), Some(EXCEPTION_RAISED));
        registry.retain(&[HTTP_STATUS_CODE, HAS_STRING]);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![HTTP_STATUS_CODE, HAS_STRING]);
    }

    #[test]
    fn test_custom_check_registration() {
        let thresholds = Thresholds::default();
        let init = observed(response(200, "", 1));
        let mut registry = CheckRegistry::new();
        registry.register("ALWAYS", |_| Ok(Some(Signal::new("ALWAYS", "ALWAYS_ON", "on"))));

        let signals = registry.run(&CheckContext::new(&init, &thresholds));
        assert_eq!(signals.len(), 1);
        assert!(registry.get("ALWAYS").is_some());
    }

    #[test]
    fn test_threshold_defaults() {
        let t = Thresholds::default();
        assert_eq!(t.max_length, 500_000);
        assert_eq!(t.length_diff_percent, 1000.0);

        let parsed: Thresholds = serde_json::from_str(r#"{"maxTime": 2.5}"#).unwrap();
        assert_eq!(parsed.max_time, 2.5);
        assert_eq!(parsed.time_diff_percent, 1000.0);
    }
}

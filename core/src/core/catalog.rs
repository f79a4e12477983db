//! Fuzz tests and the rules that turn their signals into issues.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use crate::checks::content::{DB_ERROR_KEYS, SENSITIVE_KEYS};
use crate::core::mutator::{self, FuzzVariant};
use crate::core::signal::{SignalDiff, SignalHolder};
use crate::core::{FieldLocation, Rating};
use crate::http::HttpRequest;
use crate::utils::payload_loader::PayloadLoader;

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("test {0:?} is already registered")]
    Duplicate(String),
}

/// What a rule looks for. Both forms match by substring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Probe {
    Slug(String),
    Tag(String),
}

impl Probe {
    fn matches(&self, holder: &SignalHolder) -> bool {
        match self {
            Probe::Slug(slug) => !holder.find(&[slug.as_str()], &[]).is_empty(),
            Probe::Tag(tag) => !holder.find(&[], &[tag.as_str()]).is_empty(),
        }
    }
}

/// Declares an issue when every probe matches the variant's signals.
#[derive(Debug, Clone, Serialize)]
pub struct IssueRule {
    pub probes: Vec<Probe>,
    /// Only look at signals the baseline did not have.
    pub only_new: bool,
    pub defect_type: String,
    pub severity: Rating,
    pub confidence: Rating,
    pub description: String,
}

impl IssueRule {
    pub fn new(defect_type: &str, severity: Rating, confidence: Rating, description: &str) -> Self {
        Self {
            probes: Vec::new(),
            only_new: false,
            defect_type: defect_type.to_string(),
            severity,
            confidence,
            description: description.to_string(),
        }
    }

    pub fn slug(mut self, slug: &str) -> Self {
        self.probes.push(Probe::Slug(slug.to_string()));
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.probes.push(Probe::Tag(tag.to_string()));
        self
    }

    pub fn only_new(mut self) -> Self {
        self.only_new = true;
        self
    }

    pub fn matches(&self, test_signals: &SignalHolder, diff: &SignalDiff) -> bool {
        let holder = if self.only_new {
            &diff.sh2_not_in_sh1
        } else {
            test_signals
        };
        !self.probes.is_empty() && self.probes.iter().all(|p| p.matches(holder))
    }
}

/// A payload corpus aimed at one request location, with the failure keys
/// the checks scan for and the rules that decide what counts as an issue.
#[derive(Debug, Clone, Serialize)]
pub struct FuzzTest {
    pub name: String,
    pub location: FieldLocation,
    pub payloads: Vec<String>,
    pub failure_keys: Vec<String>,
    pub rules: Vec<IssueRule>,
}

impl FuzzTest {
    pub fn new(name: impl Into<String>, location: FieldLocation, payloads: Vec<String>) -> Self {
        Self {
            name: name.into(),
            location,
            payloads,
            failure_keys: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn failure_keys(mut self, keys: &[&str]) -> Self {
        self.failure_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn rule(mut self, rule: IssueRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Rules triggered by one variant's signals.
    pub fn triggered<'a>(
        &'a self,
        test_signals: &'a SignalHolder,
        diff: &'a SignalDiff,
    ) -> impl Iterator<Item = &'a IssueRule> + 'a {
        self.rules
            .iter()
            .filter(move |rule| rule.matches(test_signals, diff))
    }
}

/// Registered tests plus the `<test>_<template>` identities handed out so
/// far. Both must stay unique.
#[derive(Debug, Clone, Default)]
pub struct TestCatalog {
    tests: IndexMap<String, FuzzTest>,
    cases: HashSet<String>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tests, fed from `loader`.
    pub fn builtin(loader: &PayloadLoader) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for test in builtin_tests(loader) {
            catalog.register(test)?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, test: FuzzTest) -> Result<(), CatalogError> {
        if self.tests.contains_key(&test.name) {
            return Err(CatalogError::Duplicate(test.name));
        }
        self.tests.insert(test.name.clone(), test);
        Ok(())
    }

    /// Claims the case identities of every test for `template`.
    pub fn bind_template(&mut self, template: &str) -> Result<Vec<String>, CatalogError> {
        let ids: Vec<String> = self
            .tests
            .keys()
            .map(|test| case_identity(test, template))
            .collect();
        if let Some(taken) = ids.iter().find(|id| self.cases.contains(*id)) {
            return Err(CatalogError::Duplicate(taken.clone()));
        }
        self.cases.extend(ids.iter().cloned());
        Ok(ids)
    }

    /// Keeps the tests whose name contains one of `filters`. An empty
    /// filter list keeps everything.
    pub fn retain_matching(&mut self, filters: &[String]) {
        if filters.is_empty() {
            return;
        }
        self.tests
            .retain(|name, _| filters.iter().any(|f| name.contains(f.as_str())));
    }

    pub fn get(&self, name: &str) -> Option<&FuzzTest> {
        self.tests.get(name)
    }

    pub fn tests(&self) -> impl Iterator<Item = &FuzzTest> {
        self.tests.values()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

pub fn case_identity(test: &str, template: &str) -> String {
    format!("{}_{}", test, template)
}

/// Every `(case_name, variant)` the given tests produce for one baseline.
///
/// Case names are `<test>_<template>_str<i>_model<j>`.
pub fn get_test_cases<'a>(
    template: &'a str,
    request: &'a HttpRequest,
    tests: &'a [FuzzTest],
    marker: &'a str,
) -> impl Iterator<Item = (String, FuzzVariant)> + 'a {
    tests.iter().flat_map(move |test| {
        let prefix = format!("{}_", case_identity(&test.name, template));
        mutator::generate(request, test.location, &test.payloads, marker, &prefix)
            .map(|variant| (variant.name.clone(), variant))
    })
}

fn builtin_tests(loader: &PayloadLoader) -> Vec<FuzzTest> {
    let mut tests = Vec::new();

    for location in FieldLocation::ALL {
        tests.push(
            FuzzTest::new(format!("sqli_{}", location), location, loader.sqli())
                .failure_keys(DB_ERROR_KEYS)
                .rule(
                    IssueRule::new(
                        "SQL_INJECTION",
                        Rating::High,
                        Rating::Medium,
                        "Database error text appeared after injecting SQL syntax",
                    )
                    .slug("FAILURE_KEYS_PRESENT"),
                ),
        );
    }

    for location in [FieldLocation::Body, FieldLocation::Param, FieldLocation::Url] {
        tests.push(
            FuzzTest::new(format!("xss_{}", location), location, loader.xss()).rule(
                IssueRule::new(
                    "REFLECTED_XSS",
                    Rating::Medium,
                    Rating::Medium,
                    "Script payload reflected unencoded in an HTML response",
                )
                .slug("PAYLOAD_REFLECTED")
                .slug("HEADER_CONTENT_TYPE_HTML"),
            ),
        );
    }

    for location in FieldLocation::ALL {
        tests.push(
            FuzzTest::new(
                format!("server_error_{}", location),
                location,
                loader.payloads_for_location(location),
            )
            .failure_keys(SENSITIVE_KEYS)
            .rule(
                IssueRule::new(
                    "SERVER_ERROR",
                    Rating::Medium,
                    Rating::Medium,
                    "Malformed input turned a working request into a server error",
                )
                .tag("SERVER_FAIL")
                .only_new(),
            )
            .rule(
                IssueRule::new(
                    "SENSITIVE_DATA_EXPOSURE",
                    Rating::High,
                    Rating::Medium,
                    "Response exposed secrets or system files",
                )
                .slug("FAILURE_KEYS_PRESENT")
                .only_new(),
            ),
        );
    }

    for location in [FieldLocation::Body, FieldLocation::Param] {
        tests.push(
            FuzzTest::new(format!("time_based_{}", location), location, loader.time_based())
                .rule(
                    IssueRule::new(
                        "TIME_BASED_INJECTION",
                        Rating::High,
                        Rating::Low,
                        "Delay payload slowed the response well past the baseline",
                    )
                    .slug("TIME_DIFF_OVER"),
                )
                .rule(
                    IssueRule::new(
                        "TIME_BASED_INJECTION",
                        Rating::High,
                        Rating::Low,
                        "Delay payload pushed the response over the time limit",
                    )
                    .slug("TIME_OVER_MAX")
                    .only_new(),
                ),
        );
    }

    tests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::Signal;
    use crate::http::Body;
    use reqwest::Method;
    use serde_json::json;

    fn sig(slug: &str, tag: Option<&str>) -> Signal {
        Signal::new("T", slug, "").with_tags(tag)
    }

    fn holder(signals: Vec<Signal>) -> SignalHolder {
        signals.into_iter().collect()
    }

    #[test]
    fn test_duplicate_test_name_rejected() {
        let mut catalog = TestCatalog::new();
        catalog
            .register(FuzzTest::new("a", FieldLocation::Body, vec![]))
            .unwrap();
        assert_eq!(
            catalog.register(FuzzTest::new("a", FieldLocation::Url, vec![])),
            Err(CatalogError::Duplicate("a".to_string()))
        );
    }

    #[test]
    fn test_template_collision_rejected() {
        let mut catalog = TestCatalog::new();
        catalog
            .register(FuzzTest::new("sqli", FieldLocation::Body, vec![]))
            .unwrap();
        assert_eq!(catalog.bind_template("users").unwrap(), vec!["sqli_users"]);
        assert_eq!(
            catalog.bind_template("users"),
            Err(CatalogError::Duplicate("sqli_users".to_string()))
        );
        assert!(catalog.bind_template("orders").is_ok());
    }

    #[test]
    fn test_builtin_catalog() {
        let catalog = TestCatalog::builtin(&PayloadLoader::new()).unwrap();
        assert_eq!(catalog.len(), 13);
        let sqli = catalog.get("sqli_body").unwrap();
        assert!(sqli.failure_keys.iter().any(|k| k == "SQL syntax"));
        assert!(catalog.get("xss_header").is_none());
    }

    #[test]
    fn test_retain_matching() {
        let mut catalog = TestCatalog::builtin(&PayloadLoader::new()).unwrap();
        catalog.retain_matching(&["sqli".to_string()]);
        assert_eq!(catalog.len(), 4);
        catalog.retain_matching(&[]);
        assert_eq!(catalog.len(), 4);
    }

    #[test]
    fn test_rule_requires_every_probe() {
        let rule = IssueRule::new("REFLECTED_XSS", Rating::Medium, Rating::Medium, "")
            .slug("PAYLOAD_REFLECTED")
            .slug("CONTENT_TYPE_HTML");
        let base = SignalHolder::new();

        let html = holder(vec![sig("PAYLOAD_REFLECTED", None), sig("HEADER_CONTENT_TYPE_HTML", None)]);
        assert!(rule.matches(&html, &base.compare(&html)));

        let json_only = holder(vec![sig("PAYLOAD_REFLECTED", None), sig("HEADER_CONTENT_TYPE_JSON", None)]);
        assert!(!rule.matches(&json_only, &base.compare(&json_only)));
    }

    #[test]
    fn test_only_new_ignores_baseline_signals() {
        let rule = IssueRule::new("SERVER_ERROR", Rating::Medium, Rating::Medium, "")
            .tag("SERVER_FAIL")
            .only_new();
        let base = holder(vec![sig("HTTP_STATUS_CODE_5XX_500", Some("SERVER_FAIL"))]);
        let test = holder(vec![sig("HTTP_STATUS_CODE_5XX_500", Some("SERVER_FAIL"))]);
        assert!(!rule.matches(&test, &base.compare(&test)));

        let ok = holder(vec![sig("HTTP_STATUS_CODE_2XX_200", None)]);
        assert!(rule.matches(&test, &ok.compare(&test)));
    }

    #[test]
    fn test_get_test_cases_names_and_counts() {
        let mut request = HttpRequest::new(Method::POST, "http://test.com/a");
        request.body = Body::Structured(json!({"a": 1, "b": "x"}));
        let tests = vec![
            FuzzTest::new("one", FieldLocation::Body, vec!["p".to_string(), "q".to_string()]),
            FuzzTest::new("two", FieldLocation::Header, vec!["p".to_string()]),
        ];

        let cases: Vec<(String, FuzzVariant)> =
            get_test_cases("users", &request, &tests, "MARK").collect();

        assert_eq!(cases.len(), 4);
        assert_eq!(cases[0].0, "one_users_str1_model1");
        assert_eq!(cases[3].0, "one_users_str2_model2");
    }
}

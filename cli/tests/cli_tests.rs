use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;
use tempfile::{Builder, NamedTempFile};

fn template_file(text: &str) -> NamedTempFile {
    let mut file = Builder::new().prefix("users").suffix(".http").tempfile().unwrap();
    write!(file, "{}", text).unwrap();
    file
}

fn stem(file: &NamedTempFile) -> String {
    file.path().file_stem().unwrap().to_str().unwrap().to_string()
}

/// --dry-run lists case names for the template and sends nothing.
#[test]
fn test_dry_run_lists_cases() {
    let file = template_file("GET /users?id=1 HTTP/1.1\nAccept: */*\n\n");
    let name = stem(&file);

    cargo_bin_cmd!("sigfuzz")
        .args(&["--endpoint", "http://127.0.0.1:9", "--test", "sqli_param", "--dry-run"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("[DRY RUN] sqli_param_{}_str1_model1", name)))
        .stdout(predicate::str::contains("across 1 template(s)"));
}

/// Values from a config file are used when flags are absent.
#[test]
fn test_dry_run_from_config_file() {
    let template = template_file("POST /users HTTP/1.1\nContent-Type: application/json\n\n{\"name\": \"bob\"}");
    let name = stem(&template);

    let mut config = NamedTempFile::new().unwrap();
    write!(
        config,
        r#"{{"endpoint": "http://127.0.0.1:9", "templates": [{:?}], "tests": ["xss_body"], "dryRun": true}}"#,
        template.path().to_str().unwrap()
    )
    .unwrap();

    cargo_bin_cmd!("sigfuzz")
        .args(&["-c", config.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("[DRY RUN] xss_body_{}_str1_model1", name)))
        .stdout(predicate::str::contains("sqli_").not());
}

/// Running with no arguments should fail (no templates, no endpoint).
#[test]
fn test_no_args_shows_error() {
    cargo_bin_cmd!("sigfuzz")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No templates specified"));
}

#[test]
fn test_missing_endpoint_fails() {
    let file = template_file("GET /users HTTP/1.1\n\n");
    cargo_bin_cmd!("sigfuzz")
        .arg(file.path())
        .arg("--dry-run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No endpoint specified"));
}

#[test]
fn test_bad_config_file_fails() {
    let mut config = NamedTempFile::new().unwrap();
    write!(config, "{{ not json").unwrap();

    cargo_bin_cmd!("sigfuzz")
        .args(&["-c", config.path().to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config"));
}

#[test]
fn test_unknown_test_filter_fails() {
    let file = template_file("GET /users HTTP/1.1\n\n");
    cargo_bin_cmd!("sigfuzz")
        .args(&["--endpoint", "http://127.0.0.1:9", "--test", "no_such_test", "--dry-run"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("No tests match"));
}

/// --help should show usage info.
#[test]
fn test_help_flag() {
    cargo_bin_cmd!("sigfuzz")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sigfuzz"))
        .stdout(predicate::str::contains("--endpoint"));
}

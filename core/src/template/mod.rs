//! Request templates: raw HTTP text with placeholders, parsed into an
//! `HttpRequest`.
//!
//! ```text
//! POST /v1/users/{user_id:42}?verbose HTTP/1.1
//! Content-Type: application/json
//! X-Request-Id: CALL_EXTERNAL|random_data:get_uuid:[]|
//!
//! {"name": "bob", "FUZZ_TARGETrole": "member"}
//! ```

pub mod context;
pub mod extensions;

pub use context::{TemplateContext, FUZZ_MARKER};
pub use extensions::{Extension, ExtensionError, ExtensionRegistry};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::http::{Body, Element, FieldMap, HttpRequest};

pub const ALLOWED_METHODS: &[&str] = &[
    "GET", "POST", "HEAD", "OPTIONS", "PUT", "DELETE", "TRACE", "CONNECT", "PATCH",
];

pub const ALLOWED_VERSIONS: &[&str] = &["HTTP/1.1", "HTTP/1.0", "HTTP/0.9"];

static FORM_BODY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+=[^&]*&?)+$").expect("form pattern is valid"));

static PATH_SLOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("slot pattern is valid"));

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template is empty")]
    Empty,
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),
    #[error("unsupported method {0:?}")]
    InvalidMethod(String),
    #[error("unsupported HTTP version {0:?}")]
    InvalidVersion(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("invalid endpoint {endpoint:?}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },
    #[error("cannot join {path:?} onto the endpoint: {source}")]
    InvalidPath {
        path: String,
        source: url::ParseError,
    },
    #[error("body is not JSON, XML or form data: {0:?}")]
    BodyFormat(String),
    #[error("no extension registered as {module}:{name}")]
    UnknownExtension { module: String, name: String },
    #[error("bad CALL_EXTERNAL directive: {0}")]
    BadDirective(String),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error("generator {0} has no values left")]
    GeneratorExhausted(String),
    #[error("no generator registered for token {0}")]
    UnknownToken(String),
}

/// Parses template text into a request rooted at `endpoint`.
///
/// Directives are resolved through `ctx`, and fuzz markers are swapped for
/// the context's marker token, before the text is split into request line,
/// headers and body.
pub fn parse(text: &str, endpoint: &str, ctx: &TemplateContext) -> Result<HttpRequest, TemplateError> {
    let text = ctx.resolve_directives(text)?;
    let text = text.replace(FUZZ_MARKER, ctx.marker());

    let mut lines = text.trim_start().lines();
    let request_line = lines.next().ok_or(TemplateError::Empty)?;
    let (method, target) = parse_request_line(request_line)?;

    let mut headers = FieldMap::new();
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TemplateError::MalformedHeader(line.to_string()))?;
        headers.insert(name.to_string(), value.trim_start().to_string());
    }

    let body_text = lines.collect::<Vec<_>>().join("\n");
    let body = parse_body(body_text.trim())?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    Ok(HttpRequest {
        method,
        url: join_endpoint(endpoint, path)?,
        headers,
        params: query.map(parse_query).unwrap_or_default(),
        body,
    })
}

fn parse_request_line(line: &str) -> Result<(Method, &str), TemplateError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let [method, target, version] = parts.as_slice() else {
        return Err(TemplateError::MalformedRequestLine(line.to_string()));
    };
    if !ALLOWED_METHODS.contains(method) {
        return Err(TemplateError::InvalidMethod(method.to_string()));
    }
    if !ALLOWED_VERSIONS.contains(version) {
        return Err(TemplateError::InvalidVersion(version.to_string()));
    }
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| TemplateError::InvalidMethod(method.to_string()))?;
    Ok((method, *target))
}

/// `a=1&b&c=x=y` → {a: "1", b: "", c: "x=y"}
fn parse_query(query: &str) -> FieldMap {
    let mut params = FieldMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key.to_string(), value.to_string());
    }
    params
}

/// Joins `path` onto `endpoint` like a browser resolves a relative link,
/// keeping `{...}` slots byte-for-byte.
fn join_endpoint(endpoint: &str, path: &str) -> Result<String, TemplateError> {
    let base = Url::parse(endpoint).map_err(|source| TemplateError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        source,
    })?;

    let mut slots = Vec::new();
    let masked = PATH_SLOT_RE.replace_all(path, |caps: &regex::Captures| {
        slots.push(caps[0].to_string());
        format!("zzslot{}zz", slots.len() - 1)
    });

    let joined = base
        .join(&masked)
        .map_err(|source| TemplateError::InvalidPath {
            path: path.to_string(),
            source,
        })?;

    let mut url = joined.to_string();
    for (i, slot) in slots.iter().enumerate() {
        url = url.replacen(&format!("zzslot{}zz", i), slot, 1);
    }
    Ok(url)
}

/// JSON first, then XML, then `key=value&...` kept raw.
fn parse_body(text: &str) -> Result<Body, TemplateError> {
    if text.is_empty() {
        return Ok(Body::Raw(String::new()));
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(Body::Structured(value));
    }
    if let Ok(element) = Element::parse(text) {
        return Ok(Body::Markup(element));
    }
    if FORM_BODY_RE.is_match(text) {
        return Ok(Body::Raw(text.to_string()));
    }
    Err(TemplateError::BodyFormat(text.chars().take(64).collect()))
}

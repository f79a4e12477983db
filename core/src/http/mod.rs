pub mod client;
pub mod markup;

pub use client::HttpClient;
pub use markup::Element;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use reqwest::Method;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Ordered, case-sensitive string mapping used for headers and query params.
/// Re-inserting an existing key overwrites the value in place.
pub type FieldMap = IndexMap<String, String>;

/// `{name:default}` (fuzzable) and `{name}` (left alone) slots in a url.
static SLOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}:/]+)(?::([^{}]*))?\}").expect("slot pattern is valid"));

const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Body of a request. The variant picked at parse time sticks for the
/// lifetime of the request and every clone of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum Body {
    /// JSON tree. Object keys keep their insertion order.
    Structured(Value),
    /// XML tree.
    Markup(Element),
    /// Anything else, sent as-is.
    Raw(String),
}

impl Body {
    /// Serializes the body the way it goes out on the wire.
    pub fn render(&self) -> String {
        match self {
            Body::Structured(value) => value.to_string(),
            Body::Markup(element) => element.render(),
            Body::Raw(raw) => raw.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Raw(raw) if raw.is_empty())
    }

    /// Content-Type used when the template didn't set one.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            Body::Structured(_) => "application/json",
            Body::Markup(_) => "application/xml",
            Body::Raw(_) => "application/x-www-form-urlencoded",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Body::Structured(_) => "structured",
            Body::Markup(_) => "markup",
            Body::Raw(_) => "raw",
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Raw(String::new())
    }
}

/// Represents an HTTP request with all its components.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpRequest {
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    /// Absolute url. May still hold `{name:default}` / `{name}` slots.
    pub url: String,
    pub headers: FieldMap,
    pub params: FieldMap,
    pub body: Body,
}

fn serialize_method<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: FieldMap::new(),
            params: FieldMap::new(),
            body: Body::default(),
        }
    }

    /// Url with every named slot rendered to its default and the query
    /// string appended.
    pub fn render_url(&self) -> String {
        let mut url = render_slots(&self.url, None);
        if !self.params.is_empty() {
            let query = self
                .params
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        utf8_percent_encode(k, QUERY_ENCODE),
                        utf8_percent_encode(v, QUERY_ENCODE)
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }
        url
    }

    /// Approximate size of the request on the wire: request line, headers
    /// and body.
    pub fn wire_length(&self) -> usize {
        let request_line = self.method.as_str().len() + self.render_url().len() + 2;
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len() + 4)
            .sum();
        request_line + headers + self.body.render().len()
    }

    /// Rebuilds the request with `f` applied to every piece of text it holds:
    /// url, header and param names and values, and every string inside the
    /// body (JSON keys and strings, XML tags, attributes and text).
    pub fn try_map_text<E, F>(&self, f: &mut F) -> Result<HttpRequest, E>
    where
        F: FnMut(&str) -> Result<String, E>,
    {
        let url = f(&self.url)?;
        let headers = map_field_map(&self.headers, f)?;
        let params = map_field_map(&self.params, f)?;
        let body = match &self.body {
            Body::Structured(value) => Body::Structured(map_json_text(value, f)?),
            Body::Markup(element) => Body::Markup(element.try_map_text(f)?),
            Body::Raw(raw) => Body::Raw(f(raw)?),
        };
        Ok(HttpRequest {
            method: self.method.clone(),
            url,
            headers,
            params,
            body,
        })
    }
}

fn map_field_map<E, F>(map: &FieldMap, f: &mut F) -> Result<FieldMap, E>
where
    F: FnMut(&str) -> Result<String, E>,
{
    let mut out = FieldMap::with_capacity(map.len());
    for (k, v) in map {
        out.insert(f(k)?, f(v)?);
    }
    Ok(out)
}

fn map_json_text<E, F>(value: &Value, f: &mut F) -> Result<Value, E>
where
    F: FnMut(&str) -> Result<String, E>,
{
    Ok(match value {
        Value::String(s) => Value::String(f(s)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| map_json_text(v, f))
                .collect::<Result<Vec<_>, E>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(f(k)?, map_json_text(v, f)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// A `{name:default}` or `{name}` slot found in a url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlSlot {
    pub name: String,
    pub default: Option<String>,
}

/// Lists the slots of `url` in order of appearance.
pub fn url_slots(url: &str) -> Vec<UrlSlot> {
    SLOT_RE
        .captures_iter(url)
        .map(|caps| UrlSlot {
            name: caps[1].to_string(),
            default: caps.get(2).map(|m| m.as_str().to_string()),
        })
        .collect()
}

/// Renders named slots to their default text. When `replace` is
/// `Some((n, payload))` the n-th named slot (0-based, counting only slots
/// with a default) gets `payload` instead. Unnamed `{name}` slots are kept.
pub fn render_slots(url: &str, replace: Option<(usize, &str)>) -> String {
    let mut index = 0;
    SLOT_RE
        .replace_all(url, |caps: &regex::Captures| match caps.get(2) {
            Some(default) => {
                let current = index;
                index += 1;
                match replace {
                    Some((n, payload)) if n == current => payload.to_string(),
                    _ => default.as_str().to_string(),
                }
            }
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// What came back from the target.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: FieldMap,
    pub body: String,
    pub elapsed: Duration,
    /// The exact request that was sent.
    pub request: HttpRequest,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Broad class of a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    /// The request could not be built (bad url, bad header, ...).
    InvalidRequest,
    /// Connection refused/reset, DNS or TLS failure.
    Connection,
    /// Anything else; carries the error's class name.
    Other(String),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "Timeout"),
            TransportErrorKind::InvalidRequest => write!(f, "InvalidRequest"),
            TransportErrorKind::Connection => write!(f, "ConnectionError"),
            TransportErrorKind::Other(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Sends prepared requests. A failure is a value, not a reason to stop.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

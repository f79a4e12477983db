use std::fmt;

use serde::Serialize;

use super::{CheckContext, CheckError, HEADER_CONTENT_TYPE, HTTP_STATUS_CODE};
use crate::core::signal::Signal;

/// Coarse family of a MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentFamily {
    Xml,
    Json,
    Javascript,
    Html,
    Plain,
    Unknown,
}

impl fmt::Display for ContentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentFamily::Xml => "XML",
            ContentFamily::Json => "JSON",
            ContentFamily::Javascript => "JAVASCRIPT",
            ContentFamily::Html => "HTML",
            ContentFamily::Plain => "PLAIN",
            ContentFamily::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

const KNOWN_SUBTYPES: &[(&str, ContentFamily)] = &[
    ("xml", ContentFamily::Xml),
    ("json", ContentFamily::Json),
    ("javascript", ContentFamily::Javascript),
    ("x-javascript", ContentFamily::Javascript),
    ("ecmascript", ContentFamily::Javascript),
    ("html", ContentFamily::Html),
    ("xhtml+xml", ContentFamily::Html),
    ("plain", ContentFamily::Plain),
];

const SUFFIXES: &[(&str, ContentFamily)] = &[
    ("xml", ContentFamily::Xml),
    ("json", ContentFamily::Json),
];

/// Maps a Content-Type value to its family: exact subtype first, then the
/// `+suffix` convention, then a substring search. A value without `/` is
/// an error; anything else unrecognised is `Unknown`.
pub fn classify_content_type(value: &str) -> Result<ContentFamily, CheckError> {
    let mime = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    let Some((_, subtype)) = mime.split_once('/') else {
        return Err(CheckError::MalformedHeader {
            header: "Content-Type",
            value: value.to_string(),
        });
    };

    if let Some((_, family)) = KNOWN_SUBTYPES.iter().find(|(known, _)| *known == subtype) {
        return Ok(*family);
    }
    if let Some((_, suffix)) = subtype.rsplit_once('+') {
        if let Some((_, family)) = SUFFIXES.iter().find(|(known, _)| *known == suffix) {
            return Ok(*family);
        }
    }
    Ok(KNOWN_SUBTYPES
        .iter()
        .find(|(known, _)| subtype.contains(known))
        .map(|(_, family)| *family)
        .unwrap_or(ContentFamily::Unknown))
}

/// `HTTP_STATUS_CODE_<bucket>_<code>`, tagged by the failure class.
pub fn status_code(ctx: &CheckContext<'_>) -> Result<Option<Signal>, CheckError> {
    let Some(response) = ctx.response() else {
        return Ok(None);
    };
    let code = response.status;
    let bucket = format!("{}XX", code / 100);
    let tag = match code {
        400..=499 => Some("CLIENT_FAIL"),
        500..=599 => Some("SERVER_FAIL"),
        304 => None,
        300..=399 => Some("SERVER_REDIRECT"),
        _ => None,
    };

    let signal = Signal::new(
        HTTP_STATUS_CODE,
        format!("{}_{}_{}", HTTP_STATUS_CODE, bucket, code),
        format!("Server responded with HTTP {}", code),
    )
    .with_tags(tag)
    .with_data("status_code", code);
    Ok(Some(signal))
}

/// `HEADER_CONTENT_TYPE_<FAMILY>`; no header means no signal.
pub fn content_type(ctx: &CheckContext<'_>) -> Result<Option<Signal>, CheckError> {
    let Some(value) = ctx.response().and_then(|r| r.header("content-type")) else {
        return Ok(None);
    };
    let family = classify_content_type(value)?;
    let signal = Signal::new(
        HEADER_CONTENT_TYPE,
        format!("{}_{}", HEADER_CONTENT_TYPE, family),
        format!("Response content type is {}", value),
    )
    .with_data("content_type", value)
    .with_data("family", family.to_string());
    Ok(Some(signal))
}

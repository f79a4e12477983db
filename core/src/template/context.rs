use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::Value;

use super::extensions::{Extension, ExtensionRegistry, ValueStream};
use super::TemplateError;
use crate::http::HttpRequest;
use crate::utils::lock_or_recover;

/// Sentinel an author writes into a template to mark a fuzz target.
pub const FUZZ_MARKER: &str = "FUZZ_TARGET";

const MARKER_PREFIX: &str = "FUZZMARK";
const GENERATOR_PREFIX: &str = "GENVAR";

static DIRECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"CALL_EXTERNAL\|([\w.]+):(\w+):(\[.*?\])\|").expect("directive pattern is valid")
});

static GENERATOR_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"GENVAR[0-9a-f]{16}").expect("token pattern is valid"));

fn mint_token(prefix: &str) -> String {
    format!("{}{:016x}", prefix, rand::rng().random::<u64>())
}

/// Evaluation state for one template: its baseline and every variant
/// generated from it share a single context.
///
/// Function results are computed once and reused. Each generator lives
/// behind its own lock so values come out strictly in call order even when
/// variants are sent concurrently.
pub struct TemplateContext {
    registry: Arc<ExtensionRegistry>,
    marker: String,
    functions: Mutex<HashMap<String, String>>,
    directive_tokens: Mutex<HashMap<String, String>>,
    generators: Mutex<HashMap<String, Arc<Mutex<ValueStream>>>>,
}

impl TemplateContext {
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self {
            registry,
            marker: mint_token(MARKER_PREFIX),
            functions: Mutex::new(HashMap::new()),
            directive_tokens: Mutex::new(HashMap::new()),
            generators: Mutex::new(HashMap::new()),
        }
    }

    /// Token that stands in for `FUZZ_MARKER` in this template instance.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Replaces every `CALL_EXTERNAL` directive in `text`.
    pub fn resolve_directives(&self, text: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in DIRECTIVE_RE.captures_iter(text) {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            out.push_str(&text[last..whole.start]);
            out.push_str(&self.resolve_directive(&caps[0], &caps[1], &caps[2], &caps[3])?);
            last = whole.end;
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    fn resolve_directive(
        &self,
        directive: &str,
        module: &str,
        name: &str,
        raw_args: &str,
    ) -> Result<String, TemplateError> {
        if let Some(value) = lock_or_recover(&self.functions, "function values").get(directive) {
            return Ok(value.clone());
        }
        if let Some(token) = lock_or_recover(&self.directive_tokens, "directive tokens").get(directive)
        {
            return Ok(token.clone());
        }

        let extension = self
            .registry
            .get(module, name)
            .ok_or_else(|| TemplateError::UnknownExtension {
                module: module.to_string(),
                name: name.to_string(),
            })?;
        let args: Vec<Value> = serde_json::from_str(raw_args)
            .map_err(|e| TemplateError::BadDirective(format!("{}: {}", directive, e)))?;

        match extension {
            Extension::Function(f) => {
                let value = f(&args)?;
                debug!("{}:{} -> {}", module, name, value);
                lock_or_recover(&self.functions, "function values")
                    .insert(directive.to_string(), value.clone());
                Ok(value)
            }
            Extension::Generator(g) => {
                let stream = g(&args)?;
                let token = mint_token(GENERATOR_PREFIX);
                debug!("{}:{} registered as {}", module, name, token);
                lock_or_recover(&self.generators, "generator table")
                    .insert(token.clone(), Arc::new(Mutex::new(stream)));
                lock_or_recover(&self.directive_tokens, "directive tokens")
                    .insert(directive.to_string(), token.clone());
                Ok(token)
            }
        }
    }

    /// Pulls the next value for a generator token.
    pub fn next_value(&self, token: &str) -> Result<String, TemplateError> {
        let stream = lock_or_recover(&self.generators, "generator table")
            .get(token)
            .cloned()
            .ok_or_else(|| TemplateError::UnknownToken(token.to_string()))?;
        let mut stream = lock_or_recover(&stream, token);
        stream
            .next()
            .ok_or_else(|| TemplateError::GeneratorExhausted(token.to_string()))
    }

    /// Turns a baseline or variant into the request that goes on the wire:
    /// generator tokens are replaced by their next value, in document order,
    /// and leftover fuzz markers are dropped.
    pub fn prepare(&self, request: &HttpRequest) -> Result<HttpRequest, TemplateError> {
        request.try_map_text(&mut |text: &str| self.resolve_text(text))
    }

    fn resolve_text(&self, text: &str) -> Result<String, TemplateError> {
        let text = text.replace(&self.marker, "");
        if !text.contains(GENERATOR_PREFIX) {
            return Ok(text);
        }
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for found in GENERATOR_TOKEN_RE.find_iter(&text) {
            out.push_str(&text[last..found.start()]);
            match self.next_value(found.as_str()) {
                Ok(value) => out.push_str(&value),
                // text that merely looks like a token is left alone
                Err(TemplateError::UnknownToken(_)) => out.push_str(found.as_str()),
                Err(e) => return Err(e),
            }
            last = found.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}

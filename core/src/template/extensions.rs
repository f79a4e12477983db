//! Functions and generators a template can call through `CALL_EXTERNAL`.
//!
//! Everything callable is registered up front under a `(module, name)` key.
//! Nothing is loaded or executed by path at runtime.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;

pub const RANDOM_DATA: &str = "random_data";
pub const SEQUENCES: &str = "sequences";

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("bad arguments for {name}: {reason}")]
    BadArguments { name: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

/// Values handed out one at a time by a generator.
pub type ValueStream = Box<dyn Iterator<Item = String> + Send>;

pub type FunctionFn = Arc<dyn Fn(&[Value]) -> Result<String, ExtensionError> + Send + Sync>;
pub type GeneratorFn = Arc<dyn Fn(&[Value]) -> Result<ValueStream, ExtensionError> + Send + Sync>;

#[derive(Clone)]
pub enum Extension {
    /// Called once per template; the result is pasted in as text.
    Function(FunctionFn),
    /// Builds an iterator; each reference to it pulls the next value.
    Generator(GeneratorFn),
}

#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    entries: HashMap<(String, String), Extension>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `random_data` and `sequences` modules.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_function(RANDOM_DATA, "get_uuid", |_| Ok(random_uuid()))
            .register_function(RANDOM_DATA, "random_port", |_| {
                Ok(rand::rng().random_range(1024..=65535u32).to_string())
            })
            .register_function(RANDOM_DATA, "random_ip", |_| {
                let octets: [u8; 4] = rand::rng().random();
                Ok(Ipv4Addr::from(octets).to_string())
            })
            .register_function(RANDOM_DATA, "random_mac", |_| {
                let bytes: [u8; 6] = rand::rng().random();
                Ok(bytes
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(":"))
            })
            .register_function(RANDOM_DATA, "random_string", |args| {
                let len = arg_u64(args, 0, 10, "random_string")? as usize;
                Ok(rand::rng()
                    .sample_iter(&Alphanumeric)
                    .take(len)
                    .map(char::from)
                    .collect())
            })
            .register_function(RANDOM_DATA, "random_integer", |args| {
                let low = arg_u64(args, 0, 0, "random_integer")?;
                let high = arg_u64(args, 1, 100_000, "random_integer")?;
                if low > high {
                    return Err(ExtensionError::BadArguments {
                        name: "random_integer".to_string(),
                        reason: format!("{} > {}", low, high),
                    });
                }
                Ok(rand::rng().random_range(low..=high).to_string())
            })
            .register_function(RANDOM_DATA, "unix_timestamp", |_| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs().to_string())
                    .map_err(|e| ExtensionError::Failed(e.to_string()))
            })
            .register_generator(SEQUENCES, "counter", |args| {
                let start = arg_u64(args, 0, 0, "counter")?;
                let step = arg_u64(args, 1, 1, "counter")?;
                // Ends instead of wrapping once the next value would overflow.
                Ok(Box::new(
                    std::iter::successors(Some(start), move |n| n.checked_add(step))
                        .map(|n| n.to_string()),
                ))
            })
            .register_generator(SEQUENCES, "cycle", |args| {
                let values: Vec<String> = args.iter().map(value_text).collect();
                if values.is_empty() {
                    return Err(ExtensionError::BadArguments {
                        name: "cycle".to_string(),
                        reason: "needs at least one value".to_string(),
                    });
                }
                Ok(Box::new(values.into_iter().cycle()))
            })
            .register_generator(SEQUENCES, "once_each", |args| {
                let values: Vec<String> = args.iter().map(value_text).collect();
                Ok(Box::new(values.into_iter()))
            });
        registry
    }

    pub fn register_function<F>(&mut self, module: &str, name: &str, f: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<String, ExtensionError> + Send + Sync + 'static,
    {
        self.entries.insert(
            (module.to_string(), name.to_string()),
            Extension::Function(Arc::new(f)),
        );
        self
    }

    pub fn register_generator<F>(&mut self, module: &str, name: &str, f: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<ValueStream, ExtensionError> + Send + Sync + 'static,
    {
        self.entries.insert(
            (module.to_string(), name.to_string()),
            Extension::Generator(Arc::new(f)),
        );
        self
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&Extension> {
        self.entries.get(&(module.to_string(), name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Text form of a JSON argument: strings unquoted, everything else as JSON.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn arg_u64(args: &[Value], index: usize, default: u64, name: &str) -> Result<u64, ExtensionError> {
    match args.get(index) {
        None => Ok(default),
        Some(value) => value.as_u64().ok_or_else(|| ExtensionError::BadArguments {
            name: name.to_string(),
            reason: format!("argument {} must be a non-negative integer, got {}", index, value),
        }),
    }
}

fn random_uuid() -> String {
    let mut bytes: [u8; 16] = rand::rng().random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub mod catalog;
pub mod engine;
pub mod mutator;
pub mod result_aggregator;
pub mod signal;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which part of a request a fuzz test mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldLocation {
    Body,
    Header,
    Param,
    Url,
}

impl FieldLocation {
    pub const ALL: [FieldLocation; 4] = [
        FieldLocation::Body,
        FieldLocation::Header,
        FieldLocation::Param,
        FieldLocation::Url,
    ];
}

impl fmt::Display for FieldLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldLocation::Body => write!(f, "body"),
            FieldLocation::Header => write!(f, "header"),
            FieldLocation::Param => write!(f, "param"),
            FieldLocation::Url => write!(f, "url"),
        }
    }
}

impl FromStr for FieldLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "body" => Ok(FieldLocation::Body),
            "header" | "headers" => Ok(FieldLocation::Header),
            "param" | "params" => Ok(FieldLocation::Param),
            "url" => Ok(FieldLocation::Url),
            other => Err(format!("unknown field location {:?}", other)),
        }
    }
}

/// Scale shared by issue severity and confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Rating {
    Undefined,
    Low,
    Medium,
    High,
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rating::Undefined => write!(f, "UNDEFINED"),
            Rating::Low => write!(f, "LOW"),
            Rating::Medium => write!(f, "MEDIUM"),
            Rating::High => write!(f, "HIGH"),
        }
    }
}

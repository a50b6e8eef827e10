//! Rule model and pattern-matching engine
//!
//! A rule is a named set of byte patterns evaluated over reassembled
//! half-streams. Mutations rebuild an immutable compiled database; scans in
//! flight keep the database version they started with.

pub mod database;
pub mod registry;
pub mod scanner;

pub use database::{RuleDatabase, ScanDirection};
pub use registry::RuleRegistry;
pub use scanner::{PatternMatch, StreamScanner};

use serde::{Deserialize, Serialize};

use crate::error::{CaronteError, Result};
use crate::models::RowId;

/// Which side of a flow a pattern applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternDirection {
    Client,
    Server,
    #[default]
    Both,
}

/// Matching flags of one pattern
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternFlags {
    #[serde(default)]
    pub caseless: bool,
    #[serde(default)]
    pub dot_all: bool,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub direction: PatternDirection,
}

/// One byte-regex pattern of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub regex: String,
    #[serde(default)]
    pub flags: PatternFlags,
}

impl Pattern {
    /// Regex source with the flag prefix applied, as handed to the engine.
    pub fn engine_source(&self) -> String {
        let mut source = String::with_capacity(self.regex.len() + 8);
        if self.flags.caseless {
            source.push_str("(?i)");
        }
        if self.flags.dot_all {
            source.push_str("(?s)");
        }
        source.push_str(&self.regex);
        source
    }

    /// Compile-check the pattern without building a database.
    pub fn validate(&self) -> Result<()> {
        regex::bytes::Regex::new(&self.engine_source())
            .map(|_| ())
            .map_err(|e| CaronteError::InvalidInput(format!("invalid pattern regex: {}", e)))
    }
}

/// A named set of patterns with display attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: RowId,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub notes: String,
    pub enabled: bool,
    pub patterns: Vec<Pattern>,
    /// Database version in which this pattern set was first materialized
    pub version: u64,
}

impl Rule {
    /// Validate name, color and every pattern.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CaronteError::InvalidInput("rule name is empty".into()));
        }
        if !is_valid_color(&self.color) {
            return Err(CaronteError::InvalidInput(format!(
                "invalid color: {}",
                self.color
            )));
        }
        if self.patterns.is_empty() {
            return Err(CaronteError::InvalidInput("rule has no patterns".into()));
        }
        for pattern in &self.patterns {
            pattern.validate()?;
        }
        Ok(())
    }
}

/// Mutable subset of a rule accepted by update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub notes: Option<String>,
    pub enabled: Option<bool>,
    pub patterns: Option<Vec<Pattern>>,
    /// Version the caller read; mutation fails if the rule moved on
    pub version: u64,
}

/// `#rgb` or `#rrggbb`
pub fn is_valid_color(color: &str) -> bool {
    let Some(hex) = color.strip_prefix('#') else {
        return false;
    };
    (hex.len() == 3 || hex.len() == 6) && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

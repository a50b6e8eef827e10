//! Compiled multi-pattern database
//!
//! An immutable artifact produced by the registry on every rule mutation.
//! Patterns are split into per-direction sub-databases so the scanner never
//! has to identify the owning rule inline, and a literal prefilter built with
//! Aho-Corasick skips regexes whose required literal is absent from the
//! scanned window.

use std::collections::HashMap;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

use crate::error::{CaronteError, Result};
use crate::models::RowId;

use super::{PatternDirection, Rule};

/// Scan direction, from the flow's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// client -> server bytes
    Client,
    /// server -> client bytes
    Server,
}

impl ScanDirection {
    pub fn from_client(from_client: bool) -> Self {
        if from_client {
            ScanDirection::Client
        } else {
            ScanDirection::Server
        }
    }
}

/// One compiled pattern within a database version
#[derive(Debug)]
pub struct CompiledPattern {
    pub pattern_id: u64,
    pub regex: regex::bytes::Regex,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    /// Index into the prefilter automaton, when the pattern has a
    /// required literal
    pub prefilter_index: Option<usize>,
}

/// Per-direction sub-database
#[derive(Debug, Default)]
pub struct SubDatabase {
    pub patterns: Vec<CompiledPattern>,
    /// Literal prefilter over the required fragments of `patterns`
    pub prefilter: Option<AhoCorasick>,
}

impl SubDatabase {
    /// Pattern ids that can possibly match `window`. Patterns without a
    /// prefilter literal are always candidates.
    pub fn candidates(&self, window: &[u8]) -> Vec<usize> {
        let mut seen = vec![false; self.patterns.len()];

        if let Some(prefilter) = &self.prefilter {
            let mut hit = vec![false; self.patterns.len()];
            for mat in prefilter.find_overlapping_iter(window) {
                let literal = mat.pattern().as_usize();
                for (i, p) in self.patterns.iter().enumerate() {
                    if p.prefilter_index == Some(literal) {
                        hit[i] = true;
                    }
                }
            }
            for (i, p) in self.patterns.iter().enumerate() {
                seen[i] = p.prefilter_index.is_none() || hit[i];
            }
        } else {
            seen.iter_mut().for_each(|s| *s = true);
        }

        seen.iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Immutable compiled rule database, tagged by version
#[derive(Debug)]
pub struct RuleDatabase {
    version: u64,
    client: SubDatabase,
    server: SubDatabase,
    /// pattern-id -> owning rule
    pattern_rules: HashMap<u64, RowId>,
    /// Longest bounded pattern span, used to size the scan window
    max_bounded_span: usize,
}

impl RuleDatabase {
    /// Compile every enabled pattern of the given rules.
    ///
    /// Either the whole set compiles or the build fails; a half-built
    /// database is never returned.
    pub fn compile(rules: &[Rule], version: u64) -> Result<Self> {
        let mut client = DirectionBuild::default();
        let mut server = DirectionBuild::default();
        let mut pattern_rules = HashMap::new();
        let mut max_bounded_span = 0usize;
        let mut pattern_id = 0u64;

        for rule in rules {
            if !rule.enabled {
                continue;
            }
            for pattern in &rule.patterns {
                let regex = regex::bytes::Regex::new(&pattern.engine_source()).map_err(|e| {
                    CaronteError::InvalidInput(format!(
                        "rule {}: pattern failed to compile: {}",
                        rule.name, e
                    ))
                })?;

                if let Some(max) = pattern.flags.max_length {
                    max_bounded_span = max_bounded_span.max(max);
                }

                let literal = required_literal(&pattern.regex, pattern.flags.caseless);
                let compiled = PendingPattern {
                    pattern_id,
                    regex,
                    min_length: pattern.flags.min_length,
                    max_length: pattern.flags.max_length,
                    literal,
                };

                match pattern.flags.direction {
                    PatternDirection::Client => client.push(compiled),
                    PatternDirection::Server => server.push(compiled),
                    PatternDirection::Both => {
                        client.push(compiled.clone_for_direction());
                        server.push(compiled);
                    }
                }

                pattern_rules.insert(pattern_id, rule.id);
                pattern_id += 1;
            }
        }

        Ok(Self {
            version,
            client: client.finish()?,
            server: server.finish()?,
            pattern_rules,
            max_bounded_span,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn sub_database(&self, direction: ScanDirection) -> &SubDatabase {
        match direction {
            ScanDirection::Client => &self.client,
            ScanDirection::Server => &self.server,
        }
    }

    /// Translate a scan's pattern-id back to the owning rule.
    pub fn rule_of_pattern(&self, pattern_id: u64) -> Option<RowId> {
        self.pattern_rules.get(&pattern_id).copied()
    }

    pub fn pattern_count(&self) -> usize {
        self.pattern_rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pattern_rules.is_empty()
    }

    /// Window the scanner must retain to catch matches at chunk seams.
    pub fn overlap_window(&self, floor: usize) -> usize {
        self.max_bounded_span.max(floor)
    }
}

/// Builder state for one direction
#[derive(Default)]
struct DirectionBuild {
    pending: Vec<PendingPattern>,
}

struct PendingPattern {
    pattern_id: u64,
    regex: regex::bytes::Regex,
    min_length: Option<usize>,
    max_length: Option<usize>,
    literal: Option<Vec<u8>>,
}

impl PendingPattern {
    fn clone_for_direction(&self) -> Self {
        Self {
            pattern_id: self.pattern_id,
            regex: self.regex.clone(),
            min_length: self.min_length,
            max_length: self.max_length,
            literal: self.literal.clone(),
        }
    }
}

impl DirectionBuild {
    fn push(&mut self, pattern: PendingPattern) {
        self.pending.push(pattern);
    }

    fn finish(self) -> Result<SubDatabase> {
        let mut literals: Vec<Vec<u8>> = Vec::new();
        let mut patterns = Vec::with_capacity(self.pending.len());

        for pending in self.pending {
            let prefilter_index = pending.literal.map(|lit| {
                if let Some(idx) = literals.iter().position(|l| *l == lit) {
                    idx
                } else {
                    literals.push(lit);
                    literals.len() - 1
                }
            });
            patterns.push(CompiledPattern {
                pattern_id: pending.pattern_id,
                regex: pending.regex,
                min_length: pending.min_length,
                max_length: pending.max_length,
                prefilter_index,
            });
        }

        let prefilter = if literals.is_empty() {
            None
        } else {
            Some(
                AhoCorasickBuilder::new()
                    .match_kind(MatchKind::Standard)
                    .ascii_case_insensitive(true)
                    .build(&literals)
                    .map_err(|e| {
                        CaronteError::InvalidInput(format!("prefilter build failed: {}", e))
                    })?,
            )
        };

        Ok(SubDatabase { patterns, prefilter })
    }
}

/// Extract a literal fragment the pattern cannot match without.
///
/// Conservative: gives up on any pattern containing alternation or groups,
/// and trims a trailing literal byte that is subject to a quantifier.
/// Returns fragments of at least two bytes; shorter ones prefilter nothing.
fn required_literal(source: &str, caseless: bool) -> Option<Vec<u8>> {
    if source.contains('|') || source.contains('(') {
        return None;
    }

    let bytes = source.as_bytes();
    let mut best: Vec<u8> = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\\' => {
                // An escaped metacharacter is a literal byte; any other
                // escape (class shorthand like \d) breaks the run.
                if i + 1 < bytes.len() && !bytes[i + 1].is_ascii_alphanumeric() {
                    current.push(bytes[i + 1]);
                    i += 2;
                    continue;
                }
                flush_run(&mut best, &mut current);
                i += 2;
            }
            b'[' => {
                flush_run(&mut best, &mut current);
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                i += 1;
            }
            b'*' | b'?' => {
                // The preceding byte is optional
                current.pop();
                flush_run(&mut best, &mut current);
                i += 1;
            }
            b'+' => {
                // At least one occurrence stays required
                flush_run(&mut best, &mut current);
                i += 1;
            }
            b'{' => {
                let optional = bytes.get(i + 1) == Some(&b'0');
                if optional {
                    current.pop();
                }
                flush_run(&mut best, &mut current);
                while i < bytes.len() && bytes[i] != b'}' {
                    i += 1;
                }
                i += 1;
            }
            b'.' | b'^' | b'$' => {
                flush_run(&mut best, &mut current);
                i += 1;
            }
            _ => {
                current.push(b);
                i += 1;
            }
        }
    }
    flush_run(&mut best, &mut current);

    if best.len() < 2 {
        return None;
    }
    if caseless {
        best.make_ascii_lowercase();
    }
    Some(best)
}

fn flush_run(best: &mut Vec<u8>, current: &mut Vec<u8>) {
    if current.len() > best.len() {
        std::mem::swap(best, current);
    }
    current.clear();
}

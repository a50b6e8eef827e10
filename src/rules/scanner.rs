//! Streaming pattern scanner
//!
//! Evaluates one direction sub-database over a half-stream fed in arbitrary
//! chunk sizes. Offsets are flow-global: relative to the first byte of the
//! scan, not to any chunk. Memory stays bounded by a sliding window whose
//! size is the database's longest bounded pattern span (with a configured
//! floor), so a match crossing a chunk seam is still seen whole.

use std::collections::HashMap;
use std::sync::Arc;

use super::database::{RuleDatabase, ScanDirection};
use crate::models::PatternSlice;

/// One pattern occurrence in flow-global offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern_id: u64,
    pub start: u64,
    pub end: u64,
}

/// Incremental scanner over one side of one flow
pub struct StreamScanner {
    db: Arc<RuleDatabase>,
    direction: ScanDirection,
    window: Vec<u8>,
    /// Global offset of `window[0]`
    window_start: u64,
    /// Total bytes pushed so far
    consumed: u64,
    overlap: usize,
    /// pattern-id -> occurrences, ascending, non-overlapping
    matches: HashMap<u64, Vec<PatternSlice>>,
}

impl StreamScanner {
    pub fn new(db: Arc<RuleDatabase>, direction: ScanDirection, overlap_floor: usize) -> Self {
        let overlap = db.overlap_window(overlap_floor);
        Self {
            db,
            direction,
            window: Vec::new(),
            window_start: 0,
            consumed: 0,
            overlap,
            matches: HashMap::new(),
        }
    }

    /// Database version this scan runs against
    pub fn version(&self) -> u64 {
        self.db.version()
    }

    /// Feed the next chunk of the half-stream.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let previously_scanned = self.consumed;
        self.window.extend_from_slice(chunk);
        self.consumed += chunk.len() as u64;

        let sub = self.db.sub_database(self.direction);
        if !sub.patterns.is_empty() {
            for index in sub.candidates(&self.window) {
                let pattern = &sub.patterns[index];
                let occurrences = self.matches.entry(pattern.pattern_id).or_default();

                for m in pattern.regex.find_iter(&self.window) {
                    let start = self.window_start + m.start() as u64;
                    let end = self.window_start + m.end() as u64;
                    let length = (end - start) as usize;

                    if pattern.min_length.is_some_and(|min| length < min)
                        || pattern.max_length.is_some_and(|max| length > max)
                    {
                        continue;
                    }
                    // A match entirely inside already-scanned bytes was
                    // reported by a previous push over the retained window.
                    if end <= previously_scanned {
                        continue;
                    }
                    // Keep occurrences non-overlapping per pattern-id when a
                    // longer match re-surfaces at the window seam.
                    if occurrences.last().is_some_and(|&(_, last_end)| start < last_end) {
                        continue;
                    }
                    occurrences.push((start, end));
                }
            }
        }

        if self.window.len() > self.overlap {
            let drop = self.window.len() - self.overlap;
            self.window.drain(..drop);
            self.window_start += drop as u64;
        }
    }

    /// Finish the scan and take the matches, empty vectors removed.
    pub fn finish(mut self) -> HashMap<u64, Vec<PatternSlice>> {
        self.matches.retain(|_, v| !v.is_empty());
        self.matches
    }
}

/// One-shot scan over a sequence of chunks.
pub fn scan<'a>(
    db: Arc<RuleDatabase>,
    direction: ScanDirection,
    chunks: impl IntoIterator<Item = &'a [u8]>,
    overlap_floor: usize,
) -> Vec<PatternMatch> {
    let mut scanner = StreamScanner::new(db, direction, overlap_floor);
    for chunk in chunks {
        scanner.push(chunk);
    }
    let mut out: Vec<PatternMatch> = scanner
        .finish()
        .into_iter()
        .flat_map(|(pattern_id, slices)| {
            slices
                .into_iter()
                .map(move |(start, end)| PatternMatch {
                    pattern_id,
                    start,
                    end,
                })
        })
        .collect();
    out.sort_by_key(|m| (m.start, m.end, m.pattern_id));
    out
}

//! Unified diff extraction
//!
//! Turns raw unified-diff text into bounded-context [`ChangedHunk`]s. The
//! strict grammar parser is authoritative; when it rejects the input (some
//! upstream systems generate diffs with inconsistent hunk counts) a lenient
//! line-oriented fallback reconstructs the same shape best-effort.

mod extractor;
mod fallback;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// Context lines retained on each side of a changed run
pub const DEFAULT_CONTEXT_WINDOW: usize = 3;

/// Lines admitted per raw hunk before truncation kicks in
pub const DEFAULT_MAX_HUNK_LINES: usize = 400;

/// Ceiling for a single item's cost estimate
pub const MAX_ITEM_COST: u32 = 1_000;

/// A contiguous run of changed lines with bounded surrounding context.
///
/// `old_start_line` / `new_start_line` are the 1-based positions of the
/// first changed line on the respective side; context lines sit immediately
/// before and after those positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedHunk {
    /// Path of the changed file (new side)
    pub file_path: String,
    /// Old-side line number of the first changed line
    pub old_start_line: u32,
    /// New-side line number of the first changed line
    pub new_start_line: u32,
    /// Up to the context window of unchanged lines before the run
    pub context_before: Vec<String>,
    /// Removed lines
    pub removed: Vec<String>,
    /// Added lines
    pub added: Vec<String>,
    /// Up to the context window of unchanged lines after the run
    pub context_after: Vec<String>,
}

impl ChangedHunk {
    /// Total number of lines carried by this hunk
    pub fn line_count(&self) -> usize {
        self.context_before.len() + self.removed.len() + self.added.len() + self.context_after.len()
    }

    /// A hunk is only worth emitting when it changes something
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// One classified line of a hunk body, shared between both parsers
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DiffLine {
    Context(String),
    Added(String),
    Removed(String),
}

/// A raw hunk as read off the wire, before run splitting
#[derive(Debug, Clone)]
pub(crate) struct RawHunk {
    pub file_path: String,
    pub old_start: u32,
    pub new_start: u32,
    pub lines: Vec<DiffLine>,
}

/// Extracts bounded-context changed hunks from unified diff text
#[derive(Debug, Clone)]
pub struct DiffExtractor {
    context_window: usize,
    max_hunk_lines: usize,
}

impl Default for DiffExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffExtractor {
    /// Create an extractor with the default context window and hunk cap
    pub fn new() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_hunk_lines: DEFAULT_MAX_HUNK_LINES,
        }
    }

    /// Override the context window
    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    /// Override the per-hunk line cap
    pub fn with_max_hunk_lines(mut self, cap: usize) -> Self {
        self.max_hunk_lines = cap;
        self
    }

    /// Parse diff text into changed hunks.
    ///
    /// Never fails: grammar violations fall back to the lenient scanner,
    /// and input neither parser can make sense of yields an empty set.
    pub fn parse(&self, diff_text: &str) -> Vec<ChangedHunk> {
        match extractor::parse_strict(diff_text) {
            Ok(raw) => self.finish(raw),
            Err(err) => {
                warn!(error = %err, "strict diff grammar rejected input, using lenient fallback");
                self.finish(fallback::parse_lenient(diff_text))
            }
        }
    }

    /// Strict-only parse, surfacing grammar violations to the caller
    pub fn parse_strict(&self, diff_text: &str) -> Result<Vec<ChangedHunk>> {
        extractor::parse_strict(diff_text).map(|raw| self.finish(raw))
    }

    /// Line-count cost estimate for strategy selection, clamped per item
    pub fn estimate_cost(hunks: &[ChangedHunk]) -> u32 {
        let total: usize = hunks.iter().map(ChangedHunk::line_count).sum();
        let cost = u32::try_from(total).unwrap_or(MAX_ITEM_COST);
        cost.min(MAX_ITEM_COST)
    }

    fn finish(&self, raw: Vec<RawHunk>) -> Vec<ChangedHunk> {
        let mut hunks = Vec::new();
        for mut hunk in raw {
            if hunk.lines.len() > self.max_hunk_lines {
                let dropped = hunk.lines.len() - self.max_hunk_lines;
                warn!(
                    file = %hunk.file_path,
                    dropped,
                    cap = self.max_hunk_lines,
                    "hunk exceeds line cap, truncating"
                );
                hunk.lines.truncate(self.max_hunk_lines);
            }
            hunks.extend(bucket_runs(&hunk, self.context_window));
        }
        debug!(hunks = hunks.len(), "extracted changed hunks");
        hunks
    }
}

/// Split a raw hunk into per-run [`ChangedHunk`]s with bounded context.
///
/// A run is a maximal stretch of added/removed lines; unchanged-only hunks
/// produce nothing.
pub(crate) fn bucket_runs(hunk: &RawHunk, window: usize) -> Vec<ChangedHunk> {
    let lines = &hunk.lines;
    let mut out = Vec::new();
    let mut idx = 0;

    // Line numbers of the *next* line on each side as we walk the body.
    let mut old_no = hunk.old_start;
    let mut new_no = hunk.new_start;

    while idx < lines.len() {
        match &lines[idx] {
            DiffLine::Context(_) => {
                old_no += 1;
                new_no += 1;
                idx += 1;
            }
            DiffLine::Added(_) | DiffLine::Removed(_) => {
                let run_old = old_no;
                let run_new = new_no;
                let run_start = idx;

                let mut removed = Vec::new();
                let mut added = Vec::new();
                while idx < lines.len() {
                    match &lines[idx] {
                        DiffLine::Added(text) => {
                            added.push(text.clone());
                            new_no += 1;
                        }
                        DiffLine::Removed(text) => {
                            removed.push(text.clone());
                            old_no += 1;
                        }
                        DiffLine::Context(_) => break,
                    }
                    idx += 1;
                }

                let context_before: Vec<String> = lines[..run_start]
                    .iter()
                    .rev()
                    .take_while(|l| matches!(l, DiffLine::Context(_)))
                    .take(window)
                    .filter_map(|l| match l {
                        DiffLine::Context(text) => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();

                let context_after: Vec<String> = lines[idx..]
                    .iter()
                    .take_while(|l| matches!(l, DiffLine::Context(_)))
                    .take(window)
                    .filter_map(|l| match l {
                        DiffLine::Context(text) => Some(text.clone()),
                        _ => None,
                    })
                    .collect();

                out.push(ChangedHunk {
                    file_path: hunk.file_path.clone(),
                    old_start_line: run_old,
                    new_start_line: run_new,
                    context_before,
                    removed,
                    added,
                    context_after,
                });
            }
        }
    }

    out
}

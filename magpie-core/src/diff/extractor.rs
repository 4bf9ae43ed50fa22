//! Strict unified-diff grammar parser
//!
//! Validates hunk bodies against the line counts declared in their
//! `@@ -a,b +c,d @@` headers. Any inconsistency is a grammar violation; the
//! caller decides whether to degrade to the lenient fallback.

use crate::{Error, Result};

use super::{DiffLine, RawHunk};

/// Parse diff text, rejecting anything that violates the grammar
pub(crate) fn parse_strict(diff_text: &str) -> Result<Vec<RawHunk>> {
    let mut hunks = Vec::new();
    let mut lines = diff_text.lines().peekable();

    // File paths from the most recent header group. The minus-side path is
    // kept for deletions, where the plus side is /dev/null.
    let mut minus_file: Option<String> = None;
    let mut current_file: Option<String> = None;

    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            current_file = parse_git_header(rest);
            minus_file = None;
            continue;
        }
        if let Some(rest) = line.strip_prefix("--- ") {
            minus_file = strip_prefix_marker(rest);
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            match strip_prefix_marker(rest) {
                Some(path) => current_file = Some(path),
                // Deleted file: the old-side path names it.
                None => current_file = minus_file.clone(),
            }
            continue;
        }
        if line.starts_with("@@ ") {
            let (old_start, old_count, new_start, new_count) = parse_hunk_header(line)?;
            let file_path = current_file
                .clone()
                .ok_or_else(|| Error::Validation("hunk header before any file header".to_string()))?;

            let mut body = Vec::new();
            let mut old_remaining = old_count;
            let mut new_remaining = new_count;

            while old_remaining > 0 || new_remaining > 0 {
                let Some(&next) = lines.peek() else {
                    return Err(Error::Validation(format!(
                        "hunk for '{}' ended early: {} old / {} new lines unaccounted",
                        file_path, old_remaining, new_remaining
                    )));
                };

                // "\ No newline at end of file" markers carry no counts.
                if next.starts_with('\\') {
                    lines.next();
                    continue;
                }

                let (classified, old_used, new_used) = classify_line(next)?;
                if (old_used > old_remaining) || (new_used > new_remaining) {
                    return Err(Error::Validation(format!(
                        "hunk for '{}' has more lines than its header declares",
                        file_path
                    )));
                }
                old_remaining -= old_used;
                new_remaining -= new_used;
                body.push(classified);
                lines.next();
            }

            hunks.push(RawHunk {
                file_path,
                old_start,
                new_start,
                lines: body,
            });
            continue;
        }
        // Anything else between hunks (index lines, mode changes, message
        // text) is ignored.
    }

    Ok(hunks)
}

/// Classify one hunk body line, returning how many lines it consumes on
/// each side
fn classify_line(line: &str) -> Result<(DiffLine, u32, u32)> {
    if let Some(text) = line.strip_prefix('+') {
        return Ok((DiffLine::Added(text.to_string()), 0, 1));
    }
    if let Some(text) = line.strip_prefix('-') {
        return Ok((DiffLine::Removed(text.to_string()), 1, 0));
    }
    if let Some(text) = line.strip_prefix(' ') {
        return Ok((DiffLine::Context(text.to_string()), 1, 1));
    }
    // Some mailers strip the single space off empty context lines.
    if line.is_empty() {
        return Ok((DiffLine::Context(String::new()), 1, 1));
    }
    Err(Error::Validation(format!(
        "unexpected line inside hunk body: {:?}",
        line
    )))
}

/// Parse `@@ -a,b +c,d @@`; the counts default to 1 when omitted
fn parse_hunk_header(line: &str) -> Result<(u32, u32, u32, u32)> {
    let invalid = || Error::Validation(format!("malformed hunk header: {:?}", line));

    let inner = line
        .strip_prefix("@@ ")
        .and_then(|rest| rest.find(" @@").map(|end| &rest[..end]))
        .ok_or_else(invalid)?;

    let mut parts = inner.split_whitespace();
    let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(invalid)?;
    let new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(invalid)?;

    let (old_start, old_count) = parse_range(old).ok_or_else(invalid)?;
    let (new_start, new_count) = parse_range(new).ok_or_else(invalid)?;
    Ok((old_start, old_count, new_start, new_count))
}

/// Parse `start[,count]` with the count defaulting to 1
fn parse_range(range: &str) -> Option<(u32, u32)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// Extract the b-side path from a `diff --git a/x b/y` header
fn parse_git_header(rest: &str) -> Option<String> {
    rest.split_whitespace()
        .last()
        .map(|p| p.strip_prefix("b/").unwrap_or(p).to_string())
}

/// Strip the `a/` or `b/` marker from a `---`/`+++` path; `/dev/null`
/// means the side does not exist
fn strip_prefix_marker(path: &str) -> Option<String> {
    let path = path.split('\t').next().unwrap_or(path).trim();
    if path == "/dev/null" {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

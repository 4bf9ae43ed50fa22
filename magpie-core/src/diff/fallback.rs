//! Lenient line-oriented diff scanner
//!
//! Used when the strict grammar parser rejects the input. Reconstructs file
//! boundaries from `diff --git`/`+++`/`@@` markers and buckets lines by
//! their prefix without validating hunk counts. Output is best-effort: line
//! numbers may be approximate on genuinely malformed input.

use tracing::debug;

use super::{DiffLine, RawHunk};

/// Scan diff text without grammar validation
pub(crate) fn parse_lenient(diff_text: &str) -> Vec<RawHunk> {
    let mut hunks: Vec<RawHunk> = Vec::new();
    let mut minus_file: Option<String> = None;
    let mut current_file: Option<String> = None;
    let mut open: Option<RawHunk> = None;

    for line in diff_text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            flush(&mut hunks, open.take());
            current_file = rest
                .split_whitespace()
                .last()
                .map(|p| p.strip_prefix("b/").unwrap_or(p).to_string());
            minus_file = None;
            continue;
        }
        if let Some(rest) = line.strip_prefix("--- ") {
            minus_file = lenient_path(rest);
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            flush(&mut hunks, open.take());
            current_file = lenient_path(rest).or_else(|| minus_file.clone());
            continue;
        }
        if line.starts_with("@@") {
            flush(&mut hunks, open.take());
            if let Some(file) = &current_file {
                let (old_start, new_start) = lenient_hunk_starts(line);
                open = Some(RawHunk {
                    file_path: file.clone(),
                    old_start,
                    new_start,
                    lines: Vec::new(),
                });
            }
            continue;
        }

        let Some(file) = &current_file else { continue };

        // Change lines seen without any @@ header open an implicit hunk at
        // the top of the file; plain text outside a hunk stays ignored.
        if open.is_none() {
            if line.starts_with('+') || line.starts_with('-') {
                open = Some(RawHunk {
                    file_path: file.clone(),
                    old_start: 1,
                    new_start: 1,
                    lines: Vec::new(),
                });
            } else {
                continue;
            }
        }

        if let Some(hunk) = open.as_mut() {
            if let Some(text) = line.strip_prefix('+') {
                hunk.lines.push(DiffLine::Added(text.to_string()));
            } else if let Some(text) = line.strip_prefix('-') {
                hunk.lines.push(DiffLine::Removed(text.to_string()));
            } else if line.starts_with('\\') {
                // "\ No newline at end of file"
            } else {
                let text = line.strip_prefix(' ').unwrap_or(line);
                hunk.lines.push(DiffLine::Context(text.to_string()));
            }
        }
    }

    flush(&mut hunks, open.take());
    debug!(hunks = hunks.len(), "lenient scan complete");
    hunks
}

fn flush(hunks: &mut Vec<RawHunk>, open: Option<RawHunk>) {
    if let Some(hunk) = open {
        if !hunk.lines.is_empty() {
            hunks.push(hunk);
        }
    }
}

/// Best-effort start lines from an `@@` header; defaults to 1 on failure
fn lenient_hunk_starts(line: &str) -> (u32, u32) {
    let mut old_start = 1;
    let mut new_start = 1;
    for part in line.split_whitespace() {
        if let Some(range) = part.strip_prefix('-') {
            if let Some(start) = leading_number(range) {
                old_start = start;
            }
        } else if let Some(range) = part.strip_prefix('+') {
            if let Some(start) = leading_number(range) {
                new_start = start;
            }
        }
    }
    (old_start, new_start)
}

fn leading_number(text: &str) -> Option<u32> {
    let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn lenient_path(rest: &str) -> Option<String> {
    let path = rest.split('\t').next().unwrap_or(rest).trim();
    if path.is_empty() || path == "/dev/null" {
        return None;
    }
    Some(
        path.strip_prefix("a/")
            .or_else(|| path.strip_prefix("b/"))
            .unwrap_or(path)
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_from_bad_counts() {
        let diff = "\
diff --git a/f b/f
--- a/f
+++ b/f
@@ -1,999 +1,999 @@
 ctx
-old
+new
 tail
";
        let hunks = parse_lenient(diff);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].file_path, "f");
        assert_eq!(hunks[0].old_start, 1);
        assert_eq!(
            hunks[0].lines,
            vec![
                DiffLine::Context("ctx".to_string()),
                DiffLine::Removed("old".to_string()),
                DiffLine::Added("new".to_string()),
                DiffLine::Context("tail".to_string()),
            ]
        );
    }

    #[test]
    fn test_implicit_hunk_without_header() {
        let diff = "\
+++ b/generated.rs
+fn added() {}
-fn removed() {}
";
        let hunks = parse_lenient(diff);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].file_path, "generated.rs");
        assert_eq!(hunks[0].new_start, 1);
        assert_eq!(hunks[0].lines.len(), 2);
    }

    #[test]
    fn test_mangled_header_defaults_to_line_one() {
        let diff = "\
+++ b/f
@@ -x,y +z @@
-old
+new
";
        let hunks = parse_lenient(diff);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].old_start, 1);
        assert_eq!(hunks[0].new_start, 1);
    }

    #[test]
    fn test_lines_without_file_are_dropped() {
        let diff = "+orphan added line\n-orphan removed line\n";
        assert!(parse_lenient(diff).is_empty());
    }

    #[test]
    fn test_multiple_files_and_hunks() {
        let diff = "\
diff --git a/one.rs b/one.rs
--- a/one.rs
+++ b/one.rs
@@ -2,2 +2,2 @@
-a
+b
@@ -9,2 +9,2 @@
-c
+d
diff --git a/two.rs b/two.rs
--- a/two.rs
+++ b/two.rs
@@ -1,1 +1,1 @@
-e
+f
";
        let hunks = parse_lenient(diff);
        assert_eq!(hunks.len(), 3);
        assert_eq!(hunks[0].old_start, 2);
        assert_eq!(hunks[1].old_start, 9);
        assert_eq!(hunks[2].file_path, "two.rs");
    }
}

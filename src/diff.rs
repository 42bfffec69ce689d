//! SEARCH/REPLACE patch application.
//!
//! A patch holds one or more sections:
//!
//! ```text
//! <<<<<<< SEARCH
//! original lines
//! =======
//! new lines
//! >>>>>>> REPLACE
//! ```
//!
//! Each SEARCH part must match the file exactly once. When it matches
//! nothing, whitespace-tolerant variants are tried; a tolerant match must be
//! unique too. A call is all-or-nothing: one failing section discards every
//! other section of the same call.
//!
//! Failures are counted per file. The remediation attached to a failure
//! grows with that count, and any successful application resets it.

use crate::error::{preview, ErrorKind};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
const DIVIDER: &str = "=======";
const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

/// Inline file previews above this many chars are cut to head and tail
const PREVIEW_LIMIT: usize = 2000;
const PREVIEW_EDGE: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("no SEARCH/REPLACE section found; expected {SEARCH_MARKER} ... {DIVIDER} ... {REPLACE_MARKER}")]
    Empty,
    #[error("section {section} is not terminated: missing `{missing}`")]
    Unterminated {
        section: usize,
        missing: &'static str,
    },
    #[error("section {0} has an empty SEARCH part")]
    EmptySearch(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReplace {
    pub search: String,
    pub replace: String,
}

enum Section {
    Outside,
    Search(Vec<String>),
    Replace(Vec<String>, Vec<String>),
}

pub fn parse_patch(spec: &str) -> Result<Vec<SearchReplace>, PatchError> {
    let mut pairs = Vec::new();
    let mut state = Section::Outside;

    for raw in spec.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let marker = line.trim_end();
        state = match state {
            Section::Outside if marker == SEARCH_MARKER => Section::Search(Vec::new()),
            Section::Outside => Section::Outside,
            Section::Search(search) if marker == DIVIDER => Section::Replace(search, Vec::new()),
            Section::Search(mut search) => {
                search.push(line.to_string());
                Section::Search(search)
            }
            Section::Replace(search, replace) if marker == REPLACE_MARKER => {
                let section = pairs.len() + 1;
                let search = search.join("\n");
                if search.trim().is_empty() {
                    return Err(PatchError::EmptySearch(section));
                }
                pairs.push(SearchReplace {
                    search,
                    replace: replace.join("\n"),
                });
                Section::Outside
            }
            Section::Replace(search, mut replace) => {
                replace.push(line.to_string());
                Section::Replace(search, replace)
            }
        };
    }

    let section = pairs.len() + 1;
    match state {
        Section::Search(_) => Err(PatchError::Unterminated {
            section,
            missing: DIVIDER,
        }),
        Section::Replace(..) => Err(PatchError::Unterminated {
            section,
            missing: REPLACE_MARKER,
        }),
        Section::Outside if pairs.is_empty() => Err(PatchError::Empty),
        Section::Outside => Ok(pairs),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Miss {
    NotFound,
    Ambiguous { count: usize, tolerant: bool },
}

/// Span of `search` in `content`, and whether it took a tolerant match
fn locate(content: &str, search: &str) -> Result<(Range<usize>, bool), Miss> {
    let mut exact = content.match_indices(search);
    match (exact.next(), exact.next()) {
        (Some((start, _)), None) => return Ok((start..start + search.len(), false)),
        (Some(_), Some(_)) => {
            return Err(Miss::Ambiguous {
                count: 2 + exact.count(),
                tolerant: false,
            })
        }
        _ => {}
    }

    let normalized = NormalizedText::new(content);
    let trimmed = trim_blank_lines(search);
    let variants = [
        trimmed.to_string(),
        rstrip_lines(search),
        rstrip_lines(trimmed),
    ];

    for (i, variant) in variants.iter().enumerate() {
        if variant.is_empty() || variants[..i].contains(variant) {
            continue;
        }
        for against_normalized in [true, false] {
            let haystack = if against_normalized {
                normalized.text.as_str()
            } else {
                content
            };
            let hits: Vec<usize> = haystack.match_indices(variant.as_str()).map(|(i, _)| i).collect();
            match hits.as_slice() {
                [] => continue,
                [start] => {
                    let span = *start..*start + variant.len();
                    let span = if against_normalized {
                        normalized.to_original(span)
                    } else {
                        span
                    };
                    return Ok((span, true));
                }
                many => {
                    return Err(Miss::Ambiguous {
                        count: many.len(),
                        tolerant: true,
                    })
                }
            }
        }
    }

    // Raw search against normalized content catches trailing spaces in the file
    let hits: Vec<usize> = normalized.text.match_indices(search).map(|(i, _)| i).collect();
    match hits.as_slice() {
        [] => Err(Miss::NotFound),
        [start] => Ok((normalized.to_original(*start..*start + search.len()), true)),
        many => Err(Miss::Ambiguous {
            count: many.len(),
            tolerant: true,
        }),
    }
}

fn trim_blank_lines(text: &str) -> &str {
    let lines: Vec<&str> = text.split('\n').collect();
    let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) else {
        return "";
    };
    let last = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .unwrap_or(first);
    let start: usize = lines[..first].iter().map(|l| l.len() + 1).sum();
    let end: usize = start + lines[first..=last].iter().map(|l| l.len() + 1).sum::<usize>() - 1;
    &text[start..end]
}

fn rstrip_lines(text: &str) -> String {
    text.split('\n')
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Content with trailing whitespace stripped from every line, plus the
/// line table needed to map offsets back to the original.
struct NormalizedText {
    text: String,
    /// (original start, original len, normalized start, normalized len)
    lines: Vec<(usize, usize, usize, usize)>,
}

impl NormalizedText {
    fn new(content: &str) -> Self {
        let mut text = String::with_capacity(content.len());
        let mut lines = Vec::new();
        let mut orig = 0;
        for (i, line) in content.split('\n').enumerate() {
            if i > 0 {
                text.push('\n');
            }
            let stripped = line.trim_end();
            lines.push((orig, line.len(), text.len(), stripped.len()));
            text.push_str(stripped);
            orig += line.len() + 1;
        }
        Self { text, lines }
    }

    fn to_original(&self, span: Range<usize>) -> Range<usize> {
        self.map_offset(span.start, false)..self.map_offset(span.end, true)
    }

    /// An offset at the end of a stripped line maps past the original's
    /// trailing whitespace when it ends a span.
    fn map_offset(&self, offset: usize, is_end: bool) -> usize {
        for &(orig_start, orig_len, norm_start, norm_len) in &self.lines {
            if offset >= norm_start && offset <= norm_start + norm_len {
                if is_end && offset == norm_start + norm_len {
                    return orig_start + orig_len;
                }
                return orig_start + (offset - norm_start);
            }
        }
        self.lines
            .last()
            .map(|&(start, len, _, _)| start + len)
            .unwrap_or(0)
    }
}

/// A patch that applied cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub content: String,
    pub sections: usize,
    /// Sections that needed whitespace-tolerant matching
    pub tolerant: usize,
}

/// A rejected patch; nothing was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub kind: ErrorKind,
    pub message: String,
    /// Consecutive failures for this file, this one included
    pub failures: u32,
}

/// Apply every section of `patch` to `current`, all or nothing.
///
/// On failure the section errors are collected, the file's failure counter
/// grows by one, and the message carries remediation matching the new count.
pub fn apply(
    counts: &mut HashMap<String, u32>,
    path: &str,
    current: &str,
    patch: &str,
) -> Result<Applied, Rejected> {
    let pairs = match parse_patch(patch) {
        Ok(pairs) => pairs,
        Err(e) => {
            return Err(reject(
                counts,
                path,
                current,
                ErrorKind::DiffInvalid,
                format!("Invalid patch for {}: {}", path, e),
            ))
        }
    };

    let mut content = current.to_string();
    let mut errors = Vec::new();
    let mut matched = 0;
    let mut tolerant = 0;
    let mut ambiguous = false;

    for (i, pair) in pairs.iter().enumerate() {
        match locate(&content, &pair.search) {
            Ok((span, was_tolerant)) => {
                content.replace_range(span, &pair.replace);
                matched += 1;
                if was_tolerant {
                    tolerant += 1;
                }
            }
            Err(Miss::Ambiguous { count, tolerant }) => {
                ambiguous = true;
                errors.push(format!(
                    "Section {}: found {} matches{}; widen the SEARCH context so it is unique:\n```\n{}\n```",
                    i + 1,
                    count,
                    if tolerant { " after whitespace normalization" } else { "" },
                    preview(&pair.search, 80)
                ));
            }
            Err(Miss::NotFound) => {
                errors.push(format!(
                    "Section {}: no match, even ignoring whitespace differences. The SEARCH part must equal the file content:\n```\n{}\n```",
                    i + 1,
                    preview(&pair.search, 100)
                ));
            }
        }
    }

    if errors.is_empty() {
        counts.remove(path);
        return Ok(Applied {
            content,
            sections: matched,
            tolerant,
        });
    }

    let kind = if ambiguous {
        ErrorKind::DiffInvalid
    } else {
        ErrorKind::DiffNotFound
    };
    let message = format!(
        "Patch for {} failed ({} failed, {} matched; no changes written):\n\n{}",
        path,
        errors.len(),
        matched,
        errors.join("\n\n")
    );
    Err(reject(counts, path, current, kind, message))
}

fn reject(
    counts: &mut HashMap<String, u32>,
    path: &str,
    current: &str,
    kind: ErrorKind,
    message: String,
) -> Rejected {
    let failures = counts.entry(path.to_string()).or_insert(0);
    *failures += 1;
    let failures = *failures;
    Rejected {
        kind,
        message: format!("{}\n\n{}", message, remediation(path, current, failures)),
        failures,
    }
}

/// Remediation for the `failures`-th consecutive failure on `path`
pub fn remediation(path: &str, current: &str, failures: u32) -> String {
    match failures {
        0 | 1 => format!(
            "Hint: if the SEARCH text is hard to pin down, read the latest content with @@READ paths=\"{}\"",
            path
        ),
        2 => format!(
            "Second failure in a row. Current content of {}:\n```\n{}\n```\nRebuild the SEARCH sections against it.",
            path,
            head_tail(current)
        ),
        n => format!(
            "{} consecutive failures on {}. Stop patching this file and rewrite it whole with <<<FILE: {}>>> ... <<<END_FILE>>>.",
            n, path, path
        ),
    }
}

fn head_tail(content: &str) -> String {
    let total = content.chars().count();
    if total <= PREVIEW_LIMIT {
        return content.to_string();
    }
    let head: String = content.chars().take(PREVIEW_EDGE).collect();
    let tail: String = content.chars().skip(total - PREVIEW_EDGE).collect();
    format!("{}\n\n... [middle omitted] ...\n\n{}", head, tail)
}

/// Lines added and removed going from `old` to `new`
pub fn line_delta(old: &str, new: &str) -> (usize, usize) {
    let patch = diffy::create_patch(old, new);
    patch
        .hunks()
        .iter()
        .flat_map(|hunk| hunk.lines())
        .fold((0, 0), |(added, removed), line| match line {
            diffy::Line::Insert(_) => (added + 1, removed),
            diffy::Line::Delete(_) => (added, removed + 1),
            diffy::Line::Context(_) => (added, removed),
        })
}

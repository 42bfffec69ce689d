//! Incremental command stream parser.
//!
//! Turns a chunked model response into [`DecodedCommand`]s as soon as each
//! one is fully delimited:
//!
//! - block commands: `<<<TAG: arg>>>` ... `<<<END_TAG>>>`
//! - line commands: a line starting with `@@NAME key="value" ...`
//!
//! Markers may be split across any chunk boundary. The parser keeps back
//! every suffix of the buffer that could still become a marker, so feeding a
//! text in pieces yields the same commands as feeding it whole.

use crate::protocol::registry::BlockRegistry;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const BLOCK_OPEN: &str = "<<<";
const LINE_PREFIX: &str = "@@";

static LINE_CMD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@(\w+)(?:[ \t]+(.*))?$").unwrap_or_else(|e| panic!("line pattern: {e}"))
});

static ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .unwrap_or_else(|e| panic!("arg pattern: {e}"))
});

/// Shorthand line command names and the tool they stand for
const ALIASES: &[(&str, &str)] = &[("read", "read_files")];

/// A fully delimited protocol command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodedCommand {
    Line {
        name: String,
        args: BTreeMap<String, String>,
    },
    Block {
        tag: String,
        arg: String,
        content: String,
        /// False only for a block flushed at end of stream without its end marker
        complete: bool,
    },
}

impl DecodedCommand {
    pub fn label(&self) -> String {
        match self {
            DecodedCommand::Line { name, .. } => format!("@@{}", name),
            DecodedCommand::Block { tag, arg, .. } => format!("{}({})", tag, arg),
        }
    }
}

#[derive(Debug)]
struct OpenBlock {
    tag: String,
    arg: String,
    end_marker: String,
    content: String,
}

enum LineScan {
    /// Command plus the buffer offset just past its line
    Complete(DecodedCommand, usize),
    /// Tail line that may still become a command
    Pending,
}

enum Next {
    Line(DecodedCommand, usize),
    Block { end: usize, tag: String, arg: String },
    Pending(usize),
    Nothing,
}

pub struct CommandStreamParser {
    names: Vec<String>,
    start_pattern: Option<Regex>,
    end_markers: BTreeMap<String, String>,
    buffer: String,
    /// Whether `buffer[0]` sits at the start of a line
    line_start: bool,
    open: Option<OpenBlock>,
}

impl CommandStreamParser {
    pub fn new(registry: &BlockRegistry) -> Self {
        let names = registry.names().map(|n| n.to_string()).collect::<Vec<_>>();
        let end_markers = names
            .iter()
            .filter_map(|n| registry.get(n).map(|s| (n.clone(), s.end_marker())))
            .collect();
        Self {
            names,
            start_pattern: registry.start_pattern(),
            end_markers,
            buffer: String::new(),
            line_start: true,
            open: None,
        }
    }

    /// Feed the next text increment; returns the commands it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<DecodedCommand> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        self.drain(false, &mut out);
        out
    }

    /// End of stream. Resolves a trailing line command without newline and
    /// emits a still-open block as incomplete. The parser is reset afterwards.
    pub fn flush(&mut self) -> Vec<DecodedCommand> {
        let mut out = Vec::new();
        self.drain(true, &mut out);

        if let Some(mut open) = self.open.take() {
            open.content.push_str(&self.buffer);
            let content = clean_content(&open.content);
            if content.is_empty() {
                debug!(tag = %open.tag, arg = %open.arg, "dropping empty unterminated block");
            } else {
                warn!(tag = %open.tag, arg = %open.arg, "block not terminated at end of stream");
                out.push(DecodedCommand::Block {
                    tag: open.tag,
                    arg: open.arg,
                    content,
                    complete: false,
                });
            }
        }

        self.reset();
        out
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.line_start = true;
        self.open = None;
    }

    pub fn in_block(&self) -> bool {
        self.open.is_some()
    }

    /// Tag and argument of the block currently being accumulated
    pub fn current_block(&self) -> Option<(&str, &str)> {
        self.open.as_ref().map(|b| (b.tag.as_str(), b.arg.as_str()))
    }

    fn drain(&mut self, eof: bool, out: &mut Vec<DecodedCommand>) {
        loop {
            if self.open.is_some() {
                if self.close_block(out) {
                    continue;
                }
                return;
            }

            match self.next_event(eof) {
                Next::Line(cmd, consumed) => {
                    debug!(command = %cmd.label(), "line command");
                    out.push(cmd);
                    self.discard(consumed);
                }
                Next::Block { end, tag, arg } => {
                    debug!(tag = %tag, arg = %arg, "block start");
                    let end_marker = self
                        .end_markers
                        .get(&tag)
                        .cloned()
                        .unwrap_or_else(|| format!("<<<END_{}>>>", tag));
                    self.buffer.drain(..end);
                    self.line_start = false;
                    self.open = Some(OpenBlock {
                        tag,
                        arg,
                        end_marker,
                        content: String::new(),
                    });
                }
                Next::Pending(pos) => {
                    self.discard(pos);
                    return;
                }
                Next::Nothing => {
                    self.discard(self.buffer.len());
                    return;
                }
            }
        }
    }

    /// Drop `buffer[..upto]` as consumed text or prose
    fn discard(&mut self, upto: usize) {
        if upto == 0 {
            return;
        }
        self.line_start = self.buffer.as_bytes()[upto - 1] == b'\n';
        self.buffer.drain(..upto);
    }

    /// Look for the open block's end marker. Returns true when the block closed.
    fn close_block(&mut self, out: &mut Vec<DecodedCommand>) -> bool {
        let Some(open) = self.open.as_mut() else {
            return false;
        };

        if let Some(idx) = self.buffer.find(&open.end_marker) {
            open.content.push_str(&self.buffer[..idx]);
            let consumed = idx + open.end_marker.len();
            self.buffer.drain(..consumed);
            self.line_start = false;

            if let Some(open) = self.open.take() {
                let content = clean_content(&open.content);
                debug!(tag = %open.tag, arg = %open.arg, bytes = content.len(), "block complete");
                out.push(DecodedCommand::Block {
                    tag: open.tag,
                    arg: open.arg,
                    content,
                    complete: true,
                });
            }
            return true;
        }

        // Hold back the longest suffix that could begin the end marker
        let held = (1..open.end_marker.len())
            .rev()
            .find(|&k| self.buffer.ends_with(&open.end_marker[..k]))
            .unwrap_or(0);
        let keep_from = self.buffer.len() - held;
        open.content.push_str(&self.buffer[..keep_from]);
        self.buffer.drain(..keep_from);
        false
    }

    /// Earliest command, complete or still pending, in the prose buffer
    fn next_event(&self, eof: bool) -> Next {
        let line = self.scan_lines(eof);
        let block = self.start_pattern.as_ref().and_then(|re| {
            re.captures(&self.buffer).and_then(|caps| {
                let whole = caps.get(0)?;
                Some((
                    whole.start(),
                    whole.end(),
                    caps[1].to_string(),
                    caps[2].trim().to_string(),
                ))
            })
        });

        let line_pos = line.as_ref().map(|(pos, _)| *pos);
        let block_pos = block.as_ref().map(|(start, ..)| *start);
        let limit = [line_pos, block_pos]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(self.buffer.len());

        if !eof {
            if let Some(pos) = self.partial_start_before(limit) {
                return Next::Pending(pos);
            }
        }

        let line_first = match (line_pos, block_pos) {
            (Some(l), Some(b)) => l < b,
            (Some(_), None) => true,
            _ => false,
        };

        if line_first {
            if let Some((pos, scan)) = line {
                return match scan {
                    LineScan::Complete(cmd, consumed) => Next::Line(cmd, consumed),
                    LineScan::Pending => Next::Pending(pos),
                };
            }
        }

        match block {
            Some((_, end, tag, arg)) => Next::Block { end, tag, arg },
            None => Next::Nothing,
        }
    }

    /// First line-start position holding a line command, or a tail line that
    /// could still turn into one.
    fn scan_lines(&self, eof: bool) -> Option<(usize, LineScan)> {
        let buf = &self.buffer;
        let mut start = if self.line_start {
            Some(0)
        } else {
            buf.find('\n').map(|i| i + 1)
        };

        while let Some(j) = start {
            let rest = &buf[j..];
            match rest.find('\n') {
                Some(nl) => {
                    if let Some(cmd) = parse_line_command(&rest[..nl]) {
                        return Some((j, LineScan::Complete(cmd, j + nl + 1)));
                    }
                    start = Some(j + nl + 1);
                }
                None if eof => {
                    return parse_line_command(rest)
                        .map(|cmd| (j, LineScan::Complete(cmd, buf.len())));
                }
                None => {
                    if LINE_PREFIX.starts_with(rest) || rest.starts_with(LINE_PREFIX) {
                        return Some((j, LineScan::Pending));
                    }
                    return None;
                }
            }
        }
        None
    }

    /// Earliest position before `limit` where an incomplete block start
    /// marker may be arriving. Only the last line can hold one.
    fn partial_start_before(&self, limit: usize) -> Option<usize> {
        let from = self.buffer.rfind('\n').map(|i| i + 1).unwrap_or(0);
        if from >= limit {
            return None;
        }
        self.buffer[from..limit]
            .match_indices('<')
            .map(|(i, _)| from + i)
            .find(|&p| self.could_start_block(&self.buffer[p..]))
    }

    fn could_start_block(&self, tail: &str) -> bool {
        if tail.len() <= BLOCK_OPEN.len() {
            return BLOCK_OPEN.starts_with(tail);
        }
        let Some(rest) = tail.strip_prefix(BLOCK_OPEN) else {
            return false;
        };
        self.names.iter().any(|name| {
            if name.starts_with(rest) {
                return true;
            }
            let Some(after) = rest
                .strip_prefix(name.as_str())
                .and_then(|r| r.strip_prefix(':'))
            else {
                return false;
            };
            let body = after.trim_end_matches('>');
            let closing = after.len() - body.len();
            // `>>>` needs at least one argument character before it
            closing < 3
                && !body.contains('>')
                && !body.contains('\n')
                && (closing == 0 || !body.is_empty())
        })
    }
}

fn parse_line_command(line: &str) -> Option<DecodedCommand> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let caps = LINE_CMD.captures(line)?;
    let raw = caps[1].to_lowercase();
    let name = ALIASES
        .iter()
        .find(|(alias, _)| *alias == raw)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(raw);
    let args = caps
        .get(2)
        .map(|m| parse_args(m.as_str()))
        .unwrap_or_default();
    Some(DecodedCommand::Line { name, args })
}

/// `key="value"` / `key='value'` pairs; anything else on the line is ignored
pub fn parse_args(text: &str) -> BTreeMap<String, String> {
    ARG.captures_iter(text)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            (caps[1].to_string(), value)
        })
        .collect()
}

/// Trim blank leading and trailing lines, keep interior whitespace
pub fn clean_content(content: &str) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> CommandStreamParser {
        CommandStreamParser::new(&BlockRegistry::builtin())
    }

    fn parse_chunks<'a>(chunks: impl IntoIterator<Item = &'a str>) -> Vec<DecodedCommand> {
        let mut p = parser();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(p.feed(chunk));
        }
        out.extend(p.flush());
        out
    }

    fn line(name: &str, args: &[(&str, &str)]) -> DecodedCommand {
        DecodedCommand::Line {
            name: name.to_string(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn block(tag: &str, arg: &str, content: &str, complete: bool) -> DecodedCommand {
        DecodedCommand::Block {
            tag: tag.to_string(),
            arg: arg.to_string(),
            content: content.to_string(),
            complete,
        }
    }

    /// Feeding whole, split at every boundary, and char by char all agree
    fn assert_chunk_invariant(text: &str) -> Vec<DecodedCommand> {
        let whole = parse_chunks([text]);
        for i in 0..=text.len() {
            if !text.is_char_boundary(i) {
                continue;
            }
            let split = parse_chunks([&text[..i], &text[i..]]);
            assert_eq!(split, whole, "split at {} of {:?}", i, text);
        }
        let chars: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        let by_char = parse_chunks(chars.iter().map(|s| s.as_str()));
        assert_eq!(by_char, whole, "char by char: {:?}", text);
        whole
    }

    const MIXED: &str = "Intro prose @@ not a command\n\
        @@READ paths=\"src/a.ts\"\n\
        Some text <<<FILE: src/a.ts>>>\n\
        line1\n  <<<END_FIL nested? \n<<<DIFF: x>>>inner\n\
        <<<END_FILE>>>\n\
        <<<DIFF: b.ts>>>\n<<<<<<< SEARCH\nfoo\n=======\nbar\n>>>>>>> REPLACE\n<<<END_DIFF>>>\n\
        @@COMPILE\n\
        @@DONE summary='ok' title=\"T\"";

    #[test]
    fn test_scenario_a() {
        let cmds = assert_chunk_invariant(
            "<<<FILE: a.txt>>>hello<<<END_FILE>>>\n@@DONE summary=\"x\"\n",
        );
        assert_eq!(
            cmds,
            vec![
                block("FILE", "a.txt", "hello", true),
                line("done", &[("summary", "x")]),
            ]
        );
    }

    #[test]
    fn test_mixed_stream_chunk_invariance() {
        let cmds = assert_chunk_invariant(MIXED);
        assert_eq!(
            cmds,
            vec![
                line("read_files", &[("paths", "src/a.ts")]),
                block(
                    "FILE",
                    "src/a.ts",
                    "line1\n  <<<END_FIL nested? \n<<<DIFF: x>>>inner",
                    true
                ),
                block(
                    "DIFF",
                    "b.ts",
                    "<<<<<<< SEARCH\nfoo\n=======\nbar\n>>>>>>> REPLACE",
                    true
                ),
                line("compile", &[]),
                line("done", &[("summary", "ok"), ("title", "T")]),
            ]
        );
    }

    #[test]
    fn test_truncated_block_flushed_incomplete() {
        let cmds = assert_chunk_invariant("<<<FILE: t.txt>>>\npartial content\nmore");
        assert_eq!(cmds, vec![block("FILE", "t.txt", "partial content\nmore", false)]);
    }

    #[test]
    fn test_split_inside_start_marker() {
        let cmds = parse_chunks(["<<<FIL", "E: a.txt>>>x<<<END_", "FILE>>>"]);
        assert_eq!(cmds, vec![block("FILE", "a.txt", "x", true)]);
    }

    #[test]
    fn test_extra_angle_bracket_before_marker() {
        let cmds = assert_chunk_invariant("<<<<FILE: a>>>x<<<END_FILE>>>");
        assert_eq!(cmds, vec![block("FILE", "a", "x", true)]);
    }

    #[test]
    fn test_crlf_line_command() {
        let cmds = assert_chunk_invariant("@@ABORT reason=\"cannot\"\r\nbye");
        assert_eq!(cmds, vec![line("abort", &[("reason", "cannot")])]);
    }

    #[test]
    fn test_line_command_requires_line_start() {
        let cmds = assert_chunk_invariant("say @@DONE summary=\"x\"\n");
        assert!(cmds.is_empty());
    }

    #[test]
    fn test_line_command_after_block_on_same_line_is_prose() {
        let cmds = assert_chunk_invariant("<<<FILE: a>>>x<<<END_FILE>>> @@DONE\n@@COMPILE\n");
        assert_eq!(cmds, vec![block("FILE", "a", "x", true), line("compile", &[])]);
    }

    #[test]
    fn test_line_command_waits_for_newline() {
        let mut p = parser();
        assert!(p.feed("@@DONE summary=\"x\"").is_empty());
        assert_eq!(p.feed("\n"), vec![line("done", &[("summary", "x")])]);
    }

    #[test]
    fn test_trailing_line_command_resolved_by_flush() {
        let mut p = parser();
        assert!(p.feed("text\n@@COMPILE").is_empty());
        assert_eq!(p.flush(), vec![line("compile", &[])]);
    }

    #[test]
    fn test_partial_start_marker_dropped_at_eof() {
        assert!(assert_chunk_invariant("prose <<<FILE: a.t").is_empty());
    }

    #[test]
    fn test_empty_unterminated_block_not_emitted() {
        assert!(assert_chunk_invariant("<<<FILE: a.txt>>>\n\n  \n").is_empty());
    }

    #[test]
    fn test_unknown_tag_is_prose() {
        assert!(assert_chunk_invariant("<<<PATCH: a>>>x<<<END_PATCH>>>").is_empty());
    }

    #[test]
    fn test_content_cleaning_keeps_indentation() {
        let cmds = parse_chunks(["<<<FILE: a.py>>>\n\n    indented\n\n  x\n\n<<<END_FILE>>>"]);
        assert_eq!(cmds, vec![block("FILE", "a.py", "    indented\n\n  x", true)]);
    }

    #[test]
    fn test_single_quoted_and_spaced_args() {
        let args = parse_args("a = 'one two' b=\"three\" junk c='x'");
        assert_eq!(args.get("a").map(String::as_str), Some("one two"));
        assert_eq!(args.get("b").map(String::as_str), Some("three"));
        assert_eq!(args.get("c").map(String::as_str), Some("x"));
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_in_block_state() {
        let mut p = parser();
        p.feed("<<<DIFF: src/x.ts>>>\n<<<<<<< SEARCH\n");
        assert!(p.in_block());
        assert_eq!(p.current_block(), Some(("DIFF", "src/x.ts")));
        p.feed("a\n=======\nb\n>>>>>>> REPLACE\n<<<END_DIFF>>>");
        assert!(!p.in_block());
    }

    #[test]
    fn test_synthetic_registry() {
        use crate::protocol::registry::BlockSpec;
        let mut registry = BlockRegistry::new();
        registry.register(BlockSpec::direct("NOTE", "scratch"));
        let mut p = CommandStreamParser::new(&registry);
        let mut cmds = p.feed("<<<NOTE: n.md>>>hi<<<END_NOTE>>><<<FILE: a>>>x<<<END_FILE>>>");
        cmds.extend(p.flush());
        assert_eq!(cmds, vec![block("NOTE", "n.md", "hi", true)]);
    }

    #[test]
    fn test_clean_content() {
        assert_eq!(clean_content("\n \nabc\n  def\n\t\n"), "abc\n  def");
        assert_eq!(clean_content(" \n\n"), "");
    }
}

//! Structured tool failures.
//!
//! Every tool invocation produces a [`ToolResult`]. Failures carry an
//! [`ErrorKind`] so the model gets a targeted recovery hint, and a
//! `recoverable` flag that decides whether the stream processor keeps
//! executing or cancels the running iteration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Failure classes a tool can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Syntax, type or module resolution errors from the compiler oracle
    Compile,
    FileNotFound,
    FileRead,
    /// A SEARCH section matched nothing, even tolerantly
    DiffNotFound,
    /// Malformed patch, or a SEARCH section that matched more than once
    DiffInvalid,
    ToolNotFound,
    ToolInvalidArgs,
    /// Internal failure; never recoverable
    Internal,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Compile => "compile",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::FileRead => "file_read",
            ErrorKind::DiffNotFound => "diff_not_found",
            ErrorKind::DiffInvalid => "diff_invalid",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::ToolInvalidArgs => "tool_invalid_args",
            ErrorKind::Internal => "internal",
            ErrorKind::Timeout => "timeout",
        }
    }

    /// Default recoverability for this kind
    pub fn recoverable(&self) -> bool {
        !matches!(self, ErrorKind::Internal)
    }

    /// Short hint telling the model how to fix this class of failure
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorKind::Compile => "Fix the code based on the error message and compile again.",
            ErrorKind::FileNotFound => "Create the missing file with a <<<FILE: path>>> block.",
            ErrorKind::FileRead => "Check the path and try reading the file again.",
            ErrorKind::DiffNotFound => {
                "Read the current file content with @@READ, then retry with an exact SEARCH section."
            }
            ErrorKind::DiffInvalid => {
                "Check the patch format: <<<<<<< SEARCH ... ======= ... >>>>>>> REPLACE, and make each SEARCH section unique."
            }
            ErrorKind::ToolNotFound => {
                "Use one of the documented commands: @@READ, @@LIST_FILES, @@COMPILE, @@TYPE_CHECK, @@DONE, @@ABORT."
            }
            ErrorKind::ToolInvalidArgs => "Check the command arguments: key=\"value\" pairs on one line.",
            ErrorKind::Internal => "An internal error occurred. Consider aborting.",
            ErrorKind::Timeout => "The operation timed out. Try a simpler approach.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    /// Result text on success, error description on failure
    pub message: String,
    #[serde(default)]
    pub kind: Option<ErrorKind>,
    pub recoverable: bool,
    /// Query tools surface their result to the model; action tools stay silent on success
    pub should_surface: bool,
    /// Extra context rendered into the failure feedback
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ToolResult {
    /// Silent success (action tools)
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            kind: None,
            recoverable: true,
            should_surface: false,
            context: BTreeMap::new(),
        }
    }

    /// Successful query whose result goes back to the model
    pub fn query(message: impl Into<String>) -> Self {
        Self {
            should_surface: true,
            ..Self::ok(message)
        }
    }

    /// Failure with the kind's default recoverability
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            kind: Some(kind),
            recoverable: kind.recoverable(),
            should_surface: false,
            context: BTreeMap::new(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::Internal, message)
    }

    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Render for the model. Successes are one line, failures are structured.
    pub fn to_feedback(&self, tool_name: &str) -> String {
        if self.success {
            return format!("[{}] {}", tool_name, self.message);
        }

        let mut lines = vec![
            format!("[{}] FAILED", tool_name),
            format!(
                "Error Type: {}",
                self.kind.map(|k| k.as_str()).unwrap_or("unknown")
            ),
            format!("Message: {}", self.message),
        ];

        if !self.context.is_empty() {
            lines.push("Context:".to_string());
            for (key, value) in &self.context {
                lines.push(format!("  {}: {}", key, value));
            }
        }

        if let Some(kind) = self.kind {
            lines.push(format!("Hint: {}", kind.recovery_hint()));
        }

        if !self.recoverable {
            lines.push("This error is NOT recoverable. The task may need to abort.".to_string());
        }

        lines.join("\n")
    }
}

/// Truncate to at most `max` chars, appending "..." when cut
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_internal_is_unrecoverable() {
        assert!(!ErrorKind::Internal.recoverable());
        assert!(ErrorKind::Compile.recoverable());
        assert!(ErrorKind::DiffInvalid.recoverable());
        assert!(ErrorKind::Timeout.recoverable());
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::DiffNotFound).unwrap();
        assert_eq!(json, "\"diff_not_found\"");
        assert_eq!(ErrorKind::ToolInvalidArgs.to_string(), "tool_invalid_args");
    }

    #[test]
    fn test_query_surfaces() {
        let r = ToolResult::query("contents");
        assert!(r.success);
        assert!(r.should_surface);
        assert!(!ToolResult::ok("written").should_surface);
    }

    #[test]
    fn test_failure_feedback() {
        let r = ToolResult::error(ErrorKind::DiffNotFound, "no match")
            .with_context("file", "src/App.tsx");
        let text = r.to_feedback("apply_diff");
        assert!(text.starts_with("[apply_diff] FAILED"));
        assert!(text.contains("Error Type: diff_not_found"));
        assert!(text.contains("  file: src/App.tsx"));
        assert!(text.contains("Hint: Read the current file"));
        assert!(!text.contains("NOT recoverable"));

        let fatal = ToolResult::fatal("boom").to_feedback("compile");
        assert!(fatal.contains("NOT recoverable"));
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
        assert_eq!(preview("héllo", 2), "hé...");
    }
}

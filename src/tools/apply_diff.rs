//! `apply_diff`: SEARCH/REPLACE patches against workspace files.

use crate::diff;
use crate::error::{ErrorKind, ToolResult};
use crate::events::Event;
use crate::tools::{required_arg, Tool, ToolArgs, ToolContext};
use crate::workspace::normalize_path;
use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

pub struct ApplyDiff;

#[async_trait]
impl Tool for ApplyDiff {
    fn name(&self) -> &'static str {
        "apply_diff"
    }

    fn usage(&self) -> &'static str {
        "<<<DIFF: path>>> SEARCH/REPLACE sections <<<END_DIFF>>>"
    }

    fn description(&self) -> &'static str {
        "Patch an existing file. Each SEARCH part must match the file exactly once."
    }

    async fn call(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<ToolResult> {
        let path = match required_arg(args, self.name(), "path") {
            Ok(v) => v,
            Err(failure) => return Ok(failure),
        };
        let patch = match required_arg(args, self.name(), "diff") {
            Ok(v) => v,
            Err(failure) => return Ok(failure),
        };

        let current = match ctx.workspace.read_file(path).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                return Ok(ToolResult::error(
                    ErrorKind::FileNotFound,
                    format!("File does not exist: {}", path),
                )
                .with_context("file", path))
            }
            Err(e) => {
                return Ok(ToolResult::error(ErrorKind::FileRead, e.to_string())
                    .with_context("file", path))
            }
        };

        // Counters follow the file, not the spelling of its path
        let key = normalize_path(path).unwrap_or_else(|_| path.to_string());
        let outcome = {
            let mut state = ctx.state.lock();
            diff::apply(&mut state.diff_fail_counts, &key, &current, patch)
        };

        match outcome {
            Ok(applied) => {
                if let Err(e) = ctx.workspace.write_file(path, &applied.content).await {
                    warn!(path, error = %e, "patched content could not be written");
                    return Ok(ToolResult::error(
                        ErrorKind::Internal,
                        format!("Patch applied but writing {} failed: {}", path, e),
                    )
                    .with_recoverable(true)
                    .with_context("file", path));
                }
                let (added, removed) = diff::line_delta(&current, &applied.content);
                info!(path, sections = applied.sections, tolerant = applied.tolerant, "patch applied");
                let mut message = format!(
                    "Applied {} edit(s) to {} (+{} -{} lines)",
                    applied.sections, path, added, removed
                );
                if applied.tolerant > 0 {
                    message.push_str(&format!(
                        ", {} via whitespace-tolerant matching",
                        applied.tolerant
                    ));
                }
                Ok(ToolResult::ok(message))
            }
            Err(rejected) => {
                warn!(path, failures = rejected.failures, kind = %rejected.kind, "patch rejected");
                ctx.events
                    .emit(Event::diff_failed(path, rejected.failures, rejected.kind.as_str()));
                Ok(ToolResult::error(rejected.kind, rejected.message)
                    .with_context("file", path)
                    .with_context("consecutive_failures", rejected.failures.to_string()))
            }
        }
    }
}

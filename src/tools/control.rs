//! Completion and abandonment signals.

use crate::error::ToolResult;
use crate::tools::compile::run_compiler;
use crate::tools::{flag_arg, required_arg, Tool, ToolArgs, ToolContext};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Tool name whose success completes the task
pub const COMPLETION_TOOL: &str = "done";

/// Tool name whose success abandons the task
pub const ABORT_TOOL: &str = "abort";

/// `@@DONE`: compile, then mark the task complete.
pub struct Done;

#[async_trait]
impl Tool for Done {
    fn name(&self) -> &'static str {
        COMPLETION_TOOL
    }

    fn usage(&self) -> &'static str {
        "@@DONE summary=\"what was built\" title=\"Short title\" skip_check=\"false\""
    }

    fn description(&self) -> &'static str {
        "Finish the task. The project is compiled first; the task only completes if it is non-empty and compiles."
    }

    async fn call(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<ToolResult> {
        let summary = match required_arg(args, self.name(), "summary") {
            Ok(v) => v.to_string(),
            Err(failure) => return Ok(failure),
        };
        if let Err(failure) = run_compiler(ctx, flag_arg(args, "skip_check")).await? {
            return Ok(failure.with_context("phase", "completion check"));
        }

        let title = args
            .get("title")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        info!(title = title.as_deref().unwrap_or(""), "task completed");

        let mut state = ctx.state.lock();
        state.completed = true;
        state.summary = Some(summary.clone());
        state.title = title;
        Ok(ToolResult::ok(summary))
    }
}

/// `@@ABORT`: give up with a reason.
pub struct Abort;

#[async_trait]
impl Tool for Abort {
    fn name(&self) -> &'static str {
        ABORT_TOOL
    }

    fn usage(&self) -> &'static str {
        "@@ABORT reason=\"why the task cannot be done\""
    }

    fn description(&self) -> &'static str {
        "Give up on the task when it cannot be completed."
    }

    async fn call(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<ToolResult> {
        let reason = match required_arg(args, self.name(), "reason") {
            Ok(v) => v.to_string(),
            Err(failure) => return Ok(failure),
        };
        warn!(reason = %reason, "task abandoned by model");

        let mut state = ctx.state.lock();
        state.abandoned = Some(reason.clone());
        state.last_error = Some(reason.clone());
        Ok(ToolResult::ok(format!("Aborted: {}", reason)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tools::test_support::*;
    use crate::workspace::MemoryWorkspace;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_done_records_completion() {
        let ctx = context(&[("a.txt", "hello")]);
        let result = Done
            .call(&ctx, &args(&[("summary", "x"), ("title", " Hello ")]))
            .await
            .unwrap();
        assert!(result.success);
        let state = ctx.state.snapshot();
        assert!(state.completed);
        assert_eq!(state.summary.as_deref(), Some("x"));
        assert_eq!(state.title.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_done_requires_compiling_project() {
        let compiler = Arc::new(StubCompiler::failing("syntax error"));
        let ctx = context_with(MemoryWorkspace::with_files([("a.ts", "x")]), compiler.clone());
        let result = Done
            .call(&ctx, &args(&[("summary", "x"), ("skip_check", "yes")]))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.recoverable);
        assert_eq!(result.kind, Some(ErrorKind::Compile));
        assert!(!ctx.state.snapshot().completed);
        assert_eq!(*compiler.calls.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_done_rejects_empty_project() {
        let ctx = context(&[]);
        let result = Done
            .call(&ctx, &args(&[("summary", "x")]))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.recoverable);
        assert_eq!(result.kind, Some(ErrorKind::Compile));
        assert!(result.message.contains("project is empty"));
        let state = ctx.state.snapshot();
        assert!(!state.completed);
        assert!(state.summary.is_none());
    }

    #[tokio::test]
    async fn test_done_requires_summary() {
        let ctx = context(&[]);
        let result = Done.call(&ctx, &args(&[])).await.unwrap();
        assert_eq!(result.kind, Some(ErrorKind::ToolInvalidArgs));
    }

    #[tokio::test]
    async fn test_abort_records_reason() {
        let ctx = context(&[]);
        let result = Abort
            .call(&ctx, &args(&[("reason", "needs a database")]))
            .await
            .unwrap();
        assert!(result.success);
        let state = ctx.state.snapshot();
        assert_eq!(state.abandoned.as_deref(), Some("needs a database"));
        assert!(!state.completed);
    }
}

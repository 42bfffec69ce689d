//! `compile` and `type_check`: ask the compiler oracle for a verdict on the
//! current files.

use crate::compiler::CompileReport;
use crate::error::{preview, ErrorKind, ToolResult};
use crate::events::{Event, EventType};
use crate::tools::{flag_arg, Tool, ToolArgs, ToolContext};
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Instant;
use tracing::{info, warn};

/// Diagnostic excerpt kept in `AgentState::last_error`
const LAST_ERROR_CHARS: usize = 500;

pub(crate) const EMPTY_PROJECT: &str = "The project is empty; write the files first";

/// Bundler and resolver messages that name an import with no file behind it
static MISSING_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:File not found|Could not resolve|Cannot find module)[:\s]*['"]?([^'"\s]+)['"]?"#)
        .unwrap_or_else(|e| panic!("missing-import pattern: {e}"))
});

pub struct Compile;

#[async_trait]
impl Tool for Compile {
    fn name(&self) -> &'static str {
        "compile"
    }

    fn usage(&self) -> &'static str {
        "@@COMPILE"
    }

    fn description(&self) -> &'static str {
        "Build the project and report errors. Optional skip_check=\"true\" skips type checking."
    }

    async fn call(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<ToolResult> {
        let report = match run_compiler(ctx, flag_arg(args, "skip_check")).await? {
            Ok(report) => report,
            Err(failure) => return Ok(failure),
        };
        Ok(ToolResult::query(format!(
            "Compilation succeeded.\n{}",
            report.output
        )))
    }
}

/// Type checking only, without a full build
pub struct TypeCheck;

#[async_trait]
impl Tool for TypeCheck {
    fn name(&self) -> &'static str {
        "type_check"
    }

    fn usage(&self) -> &'static str {
        "@@TYPE_CHECK"
    }

    fn description(&self) -> &'static str {
        "Run the type checker without building."
    }

    async fn call(&self, ctx: &ToolContext, _args: &ToolArgs) -> Result<ToolResult> {
        let report = match run_pass(ctx, Pass::TypeCheck).await? {
            Ok(report) => report,
            Err(failure) => return Ok(failure),
        };
        Ok(ToolResult::query(format!(
            "Type check passed.\n{}",
            report.output
        )))
    }
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    Build { skip_type_check: bool },
    TypeCheck,
}

/// Snapshot the workspace and compile it. The inner `Err` is the failure to
/// hand back to the model: an empty project, a timeout, or compile errors
/// with the file list.
pub(crate) async fn run_compiler(
    ctx: &ToolContext,
    skip_type_check: bool,
) -> Result<std::result::Result<CompileReport, ToolResult>> {
    run_pass(ctx, Pass::Build { skip_type_check }).await
}

async fn run_pass(
    ctx: &ToolContext,
    pass: Pass,
) -> Result<std::result::Result<CompileReport, ToolResult>> {
    let files = match ctx.workspace.snapshot().await {
        Ok(files) => files,
        Err(e) => return Ok(Err(ToolResult::error(ErrorKind::FileRead, e.to_string()))),
    };
    if files.is_empty() {
        warn!(?pass, "nothing to compile");
        return Ok(Err(ToolResult::error(ErrorKind::Compile, EMPTY_PROJECT)));
    }

    let started = Instant::now();
    let report = match pass {
        Pass::Build { skip_type_check } => ctx.compiler.compile(&files, skip_type_check).await?,
        Pass::TypeCheck => ctx.compiler.type_check(&files).await?,
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    ctx.events.emit(Event::new(EventType::CompileFinished {
        success: report.success,
        duration_ms,
    }));
    ctx.state.lock().compile_success = Some(report.success);

    if report.success {
        info!(?pass, files = files.len(), duration_ms, "compile passed");
        return Ok(Ok(report));
    }

    warn!(?pass, files = files.len(), duration_ms, timed_out = report.timed_out, "compile failed");
    ctx.state.lock().last_error = Some(preview(&report.output, LAST_ERROR_CHARS));

    if report.timed_out {
        return Ok(Err(ToolResult::error(ErrorKind::Timeout, "Compilation timed out")
            .with_context("output", report.output)));
    }

    let listing = files.keys().cloned().collect::<Vec<_>>().join(", ");
    let hint = missing_file_hint(&report.output, |path| files.contains_key(path));
    let mut failure =
        ToolResult::error(ErrorKind::Compile, report.output).with_context("files", listing);
    if let Some(hint) = hint {
        failure = failure.with_context("hint", hint);
    }
    Ok(Err(failure))
}

/// Point at the first unresolved import that has no file in the project
fn missing_file_hint(output: &str, exists: impl Fn(&str) -> bool) -> Option<String> {
    let caps = MISSING_IMPORT.captures(output)?;
    let import = caps.get(1)?.as_str();
    let path = import.strip_prefix("./").unwrap_or(import);
    if exists(path) {
        return None;
    }
    Some(format!(
        "Missing file: {}. Create it with a <<<FILE: path>>> block or fix the import.",
        path
    ))
}

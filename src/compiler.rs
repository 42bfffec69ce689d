//! Compiler oracle.
//!
//! The loop never interprets compilation itself: it asks a [`Compiler`] for
//! a verdict plus diagnostic text and feeds that back to the model.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info};
use wait_timeout::ChildExt;

/// Diagnostics beyond this many chars are cut before reaching the model
const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    pub success: bool,
    /// Combined diagnostic output
    pub output: String,
    pub timed_out: bool,
}

impl CompileReport {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            timed_out: false,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            timed_out: false,
        }
    }
}

#[async_trait]
pub trait Compiler: Send + Sync {
    /// Build the project. `files` is the current workspace snapshot;
    /// `skip_type_check` asks for the build step only.
    async fn compile(
        &self,
        files: &BTreeMap<String, String>,
        skip_type_check: bool,
    ) -> Result<CompileReport>;

    /// Run only the type-check step. Compilers without one accept everything.
    async fn type_check(&self, files: &BTreeMap<String, String>) -> Result<CompileReport> {
        Ok(CompileReport::passed(format!(
            "No type checker configured; {} files accepted",
            files.len()
        )))
    }
}

/// Accepts everything. Used when no compile command is configured.
#[derive(Debug, Default, Clone)]
pub struct NoopCompiler;

#[async_trait]
impl Compiler for NoopCompiler {
    async fn compile(
        &self,
        files: &BTreeMap<String, String>,
        _skip_type_check: bool,
    ) -> Result<CompileReport> {
        Ok(CompileReport::passed(format!(
            "No compile command configured; {} files accepted",
            files.len()
        )))
    }
}

/// Runs shell-style command lines inside the project directory
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    dir: PathBuf,
    build: Vec<String>,
    check: Option<Vec<String>>,
    timeout: Duration,
}

impl CommandCompiler {
    pub fn new(dir: impl Into<PathBuf>, build: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            dir: dir.into(),
            build: split_command(build)?,
            check: None,
            timeout,
        })
    }

    /// Type-check command run before the build unless skipped
    pub fn with_check(mut self, check: &str) -> Result<Self> {
        self.check = Some(split_command(check)?);
        Ok(self)
    }
}

fn split_command(line: &str) -> Result<Vec<String>> {
    let argv = shell_words::split(line).with_context(|| format!("Invalid command: {}", line))?;
    if argv.is_empty() {
        return Err(anyhow!("Empty compile command"));
    }
    Ok(argv)
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn compile(
        &self,
        files: &BTreeMap<String, String>,
        skip_type_check: bool,
    ) -> Result<CompileReport> {
        let mut steps = Vec::new();
        if let (Some(check), false) = (&self.check, skip_type_check) {
            steps.push(check.clone());
        }
        steps.push(self.build.clone());

        info!(files = files.len(), steps = steps.len(), "compiling");
        self.run_steps(steps).await
    }

    async fn type_check(&self, files: &BTreeMap<String, String>) -> Result<CompileReport> {
        let Some(check) = &self.check else {
            return Ok(CompileReport::passed("No type-check command configured"));
        };
        info!(files = files.len(), "type checking");
        self.run_steps(vec![check.clone()]).await
    }
}

impl CommandCompiler {
    /// Run steps in order, stopping at the first failure
    async fn run_steps(&self, steps: Vec<Vec<String>>) -> Result<CompileReport> {
        let dir = self.dir.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let mut output = String::new();
            for argv in &steps {
                let report = run_step(argv, &dir, timeout)?;
                output.push_str(&report.output);
                if !report.success {
                    return Ok(CompileReport {
                        output: tail(&output),
                        ..report
                    });
                }
            }
            Ok(CompileReport::passed(tail(&output)))
        })
        .await
        .context("compile task panicked")?
    }
}

fn run_step(argv: &[String], dir: &Path, timeout: Duration) -> Result<CompileReport> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("Empty compile command"))?;
    debug!(program = %program, "running compile step");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = std::thread::spawn(move || drain(stdout));
    let err_reader = std::thread::spawn(move || drain(stderr));

    let status = child
        .wait_timeout(timeout)
        .with_context(|| format!("Failed to wait for {}", program))?;

    let Some(status) = status else {
        let _ = child.kill();
        let _ = child.wait();
        return Ok(CompileReport {
            success: false,
            output: format!("{} timed out after {}ms", program, timeout.as_millis()),
            timed_out: true,
        });
    };

    let mut output = out_reader.join().unwrap_or_default();
    let errors = err_reader.join().unwrap_or_default();
    if !errors.is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&errors);
    }

    Ok(CompileReport {
        success: status.success(),
        output,
        timed_out: false,
    })
}

fn drain<R: Read>(reader: Option<R>) -> String {
    let mut text = String::new();
    if let Some(mut r) = reader {
        let mut bytes = Vec::new();
        if r.read_to_end(&mut bytes).is_ok() {
            text = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    text
}

/// Compilers put the useful part of long output at the end
fn tail(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let kept: String = output.chars().skip(total - MAX_OUTPUT_CHARS).collect();
    format!("...\n{}", kept)
}

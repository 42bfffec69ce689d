//! Read, list and delete tools.

use crate::error::{ErrorKind, ToolResult};
use crate::tools::{required_arg, Tool, ToolArgs, ToolContext};
use anyhow::Result;
use async_trait::async_trait;

/// Files returned by one read call
pub const MAX_READ_FILES: usize = 6;

pub struct ReadFiles;

#[async_trait]
impl Tool for ReadFiles {
    fn name(&self) -> &'static str {
        "read_files"
    }

    fn usage(&self) -> &'static str {
        "@@READ paths=\"src/a.ts,src/b.ts\""
    }

    fn description(&self) -> &'static str {
        "Read up to 6 files. Stop writing after this command and wait for the content."
    }

    async fn call(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<ToolResult> {
        let raw = match required_arg(args, self.name(), "paths") {
            Ok(v) => v,
            Err(failure) => return Ok(failure),
        };
        let mut paths: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let remaining = if paths.len() > MAX_READ_FILES {
            paths.split_off(MAX_READ_FILES)
        } else {
            Vec::new()
        };

        let mut sections = Vec::new();
        let mut found = 0;
        for path in &paths {
            match ctx.workspace.read_file(path).await {
                Ok(Some(content)) => {
                    found += 1;
                    sections.push(format!(
                        "=== {} ({} chars) ===\n{}",
                        path,
                        content.chars().count(),
                        content
                    ));
                }
                Ok(None) => sections.push(format!("=== {} ===\n[file does not exist]", path)),
                Err(e) => sections.push(format!("=== {} ===\n[unreadable: {}]", path, e)),
            }
        }

        let mut text = format!(
            "Read {}/{} files:\n{}",
            found,
            paths.len(),
            sections.join("\n\n")
        );
        if !remaining.is_empty() {
            let rest = remaining.join(",");
            text.push_str(&format!(
                "\n\n{} more files were not read: {}\nRequest them with @@READ paths=\"{}\"",
                remaining.len(),
                rest,
                rest
            ));
        }
        Ok(ToolResult::query(text))
    }
}

pub struct ListFiles;

#[async_trait]
impl Tool for ListFiles {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn usage(&self) -> &'static str {
        "@@LIST_FILES"
    }

    fn description(&self) -> &'static str {
        "List every project file with its size."
    }

    async fn call(&self, ctx: &ToolContext, _args: &ToolArgs) -> Result<ToolResult> {
        let entries = match ctx.workspace.list_files().await {
            Ok(entries) => entries,
            Err(e) => return Ok(ToolResult::error(ErrorKind::FileRead, e.to_string())),
        };
        if entries.is_empty() {
            return Ok(ToolResult::query("The project is empty."));
        }
        let mut lines = vec![format!("Project files ({}):", entries.len())];
        lines.extend(
            entries
                .iter()
                .map(|e| format!("  - {} ({} bytes)", e.path, e.size)),
        );
        Ok(ToolResult::query(lines.join("\n")))
    }
}

pub struct DeleteFile;

#[async_trait]
impl Tool for DeleteFile {
    fn name(&self) -> &'static str {
        "delete_file"
    }

    fn usage(&self) -> &'static str {
        "@@DELETE_FILE path=\"src/old.ts\""
    }

    fn description(&self) -> &'static str {
        "Delete a file."
    }

    async fn call(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<ToolResult> {
        let path = match required_arg(args, self.name(), "path") {
            Ok(v) => v,
            Err(failure) => return Ok(failure),
        };
        match ctx.workspace.delete_file(path).await {
            Ok(true) => Ok(ToolResult::ok(format!("Deleted {}", path))),
            Ok(false) => Ok(ToolResult::error(
                ErrorKind::FileNotFound,
                format!("File does not exist: {}", path),
            )),
            Err(e) => Ok(ToolResult::error(ErrorKind::FileRead, e.to_string())
                .with_context("file", path)),
        }
    }
}

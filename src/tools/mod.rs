//! Tool table.
//!
//! Tools are plain values registered by name in a [`ToolRegistry`] built at
//! startup. The stream processor reaches them through the [`ToolExecutor`]
//! seam so tests can substitute their own executor.

pub mod apply_diff;
pub mod compile;
pub mod control;
pub mod file_ops;

use crate::agent::state::SharedState;
use crate::compiler::Compiler;
use crate::error::{ErrorKind, ToolResult};
use crate::events::EventBus;
use crate::workspace::Workspace;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub type ToolArgs = BTreeMap<String, String>;

/// What a tool may touch
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Arc<dyn Workspace>,
    pub compiler: Arc<dyn Compiler>,
    pub state: SharedState,
    pub events: Arc<EventBus>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-line protocol usage shown to the model, e.g. `@@READ paths="a,b"`
    fn usage(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// `Err` is reserved for internal faults; user-level failures come back
    /// as an unsuccessful [`ToolResult`].
    async fn call(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<ToolResult>;
}

/// Tool-execution collaborator of the stream processor
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolResult>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(file_ops::ReadFiles));
        registry.register(Arc::new(file_ops::ListFiles));
        registry.register(Arc::new(file_ops::DeleteFile));
        registry.register(Arc::new(apply_diff::ApplyDiff));
        registry.register(Arc::new(compile::Compile));
        registry.register(Arc::new(compile::TypeCheck));
        registry.register(Arc::new(control::Done));
        registry.register(Arc::new(control::Abort));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Sorted by name
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// `(usage, description)` for every tool, sorted by name
    pub fn documentation(&self) -> Vec<(&'static str, &'static str)> {
        self.names()
            .into_iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| (t.usage(), t.description()))
            .collect()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolResult> {
        let Some(tool) = self.tools.get(name) else {
            return Ok(ToolResult::error(
                ErrorKind::ToolNotFound,
                format!("Unknown command @@{}", name.to_uppercase()),
            )
            .with_context("available", self.names().join(", ")));
        };
        debug!(tool = name, args = args.len(), "dispatching tool");
        tool.call(ctx, args).await
    }
}

/// Named argument, or a `ToolInvalidArgs` failure naming it
pub fn required_arg<'a>(
    args: &'a ToolArgs,
    tool: &str,
    key: &str,
) -> std::result::Result<&'a str, ToolResult> {
    match args.get(key).map(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ToolResult::error(
            ErrorKind::ToolInvalidArgs,
            format!("{} requires a non-empty `{}` argument", tool, key),
        )),
    }
}

/// `"true"`, `"1"`, `"yes"` (any case) are true
pub fn flag_arg(args: &ToolArgs, key: &str) -> bool {
    args.get(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_builtin_tool_names() {
        let registry = ToolRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec![
                "abort",
                "apply_diff",
                "compile",
                "delete_file",
                "done",
                "list_files",
                "read_files",
                "type_check"
            ]
        );
        assert_eq!(registry.documentation().len(), 8);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let ctx = context(&[]);
        let result = ToolRegistry::builtin()
            .execute("deploy", &ToolArgs::new(), &ctx)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::ToolNotFound));
        assert!(result.recoverable);
    }

    #[test]
    fn test_arg_helpers() {
        let a = args(&[("path", "a.ts"), ("skip_check", "True"), ("empty", " ")]);
        assert_eq!(required_arg(&a, "t", "path").unwrap(), "a.ts");
        assert!(required_arg(&a, "t", "empty").is_err());
        assert!(required_arg(&a, "t", "missing").is_err());
        assert!(flag_arg(&a, "skip_check"));
        assert!(!flag_arg(&a, "path"));
    }
}

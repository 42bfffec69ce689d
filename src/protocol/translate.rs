//! Decoded command → executable unit.

use crate::protocol::parser::DecodedCommand;
use crate::protocol::registry::{BlockRegistry, WriteMode};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    FileWrite {
        path: String,
        content: String,
    },
    ToolCall {
        name: String,
        args: BTreeMap<String, String>,
    },
    /// Producer's last message on the queue
    EndOfStream,
}

/// A runnable unit plus the record of its execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutableUnit {
    #[serde(flatten)]
    pub kind: UnitKind,
    /// False when the source block was cut off at end of stream
    pub complete: bool,
    pub executed: bool,
    pub success: bool,
    pub result: Option<String>,
    /// Whether the result goes back to the model
    pub surface: bool,
}

impl ExecutableUnit {
    pub fn new(kind: UnitKind) -> Self {
        Self {
            kind,
            complete: true,
            executed: false,
            success: false,
            result: None,
            surface: false,
        }
    }

    pub fn file_write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(UnitKind::FileWrite {
            path: path.into(),
            content: content.into(),
        })
    }

    pub fn tool_call(name: impl Into<String>, args: BTreeMap<String, String>) -> Self {
        Self::new(UnitKind::ToolCall {
            name: name.into(),
            args,
        })
    }

    pub fn end_of_stream() -> Self {
        Self::new(UnitKind::EndOfStream)
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, UnitKind::EndOfStream)
    }

    /// Short human label: `write src/a.ts`, `apply_diff(path=a.ts)`
    pub fn describe(&self) -> String {
        match &self.kind {
            UnitKind::FileWrite { path, .. } => format!("write {}", path),
            UnitKind::ToolCall { name, args } => {
                let shown = args
                    .iter()
                    .filter(|(_, v)| v.len() <= 80 && !v.contains('\n'))
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}({})", name, shown)
            }
            UnitKind::EndOfStream => "end of stream".to_string(),
        }
    }

    pub fn record(&mut self, success: bool, result: impl Into<String>, surface: bool) {
        self.executed = true;
        self.success = success;
        self.result = Some(result.into());
        self.surface = surface;
    }
}

/// Map a decoded command onto the unit that executes it. Block tags missing
/// from the registry fall back to a direct file write.
pub fn translate(registry: &BlockRegistry, cmd: DecodedCommand) -> ExecutableUnit {
    match cmd {
        DecodedCommand::Line { name, args } => ExecutableUnit::tool_call(name, args),
        DecodedCommand::Block {
            tag,
            arg,
            content,
            complete,
        } => {
            let mut unit = match registry.get(&tag).map(|spec| &spec.mode) {
                Some(WriteMode::Direct) => ExecutableUnit::file_write(arg, content),
                Some(WriteMode::Translate {
                    tool,
                    path_arg,
                    content_arg,
                }) => {
                    let mut args = BTreeMap::new();
                    args.insert(path_arg.clone(), arg);
                    args.insert(content_arg.clone(), content);
                    ExecutableUnit::tool_call(tool.clone(), args)
                }
                None => {
                    warn!(tag = %tag, path = %arg, "unknown block tag, writing content as a file");
                    ExecutableUnit::file_write(arg, content)
                }
            };
            unit.complete = complete;
            unit
        }
    }
}

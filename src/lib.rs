//! Text-to-tool bridge for streamed model output.
//!
//! A model writes files and commands in a small markup protocol
//! (`<<<FILE: path>>>` blocks, `@@COMMAND key="value"` lines). This crate
//! parses that text while it streams, executes each command as soon as it
//! is complete, and runs the surrounding agent loop that feeds results back
//! to the model until it declares the task done.

pub mod agent;
pub mod compiler;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod tools;
pub mod workspace;

pub use agent::{AgentLoop, AgentLoopConfig, TaskOutcome};
pub use error::{ErrorKind, ToolResult};
pub use protocol::{BlockRegistry, CommandStreamParser, DecodedCommand, ExecutableUnit};

//! Agent loop and execution components.
//!
//! - `core` - the iteration state machine ([`AgentLoop`])
//! - `processor` - one streamed iteration ([`StreamProcessor`])
//! - `feedback` - feedback turns and real-time injection
//! - `prompts` - protocol documentation and canned turns
//! - `state` - state shared between the loop and the tools

pub mod core;
pub mod feedback;
pub mod processor;
pub mod prompts;
pub mod state;

pub use core::{
    AgentHooks, AgentLoop, AgentLoopConfig, SilentHooks, TaskOutcome, DEFAULT_MAX_ITERATIONS,
};
pub use feedback::FeedbackSlot;
pub use processor::{IterationResult, StreamProcessor};
pub use state::{AgentState, SharedState};

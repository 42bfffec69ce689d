//! Core agent loop implementation.
//!
//! [`AgentLoop::run`] drives repeated [`StreamProcessor`] runs until the
//! model signals completion, gives up, stays silent for too long or uses up
//! the iteration ceiling. It owns the conversation history and only touches
//! it between iterations. Presentation is customised through [`AgentHooks`].

use crate::agent::feedback::{build_feedback, interruption_turn, FeedbackSlot};
use crate::agent::processor::{IterationResult, StreamProcessor};
use crate::agent::prompts;
use crate::agent::state::{AgentState, SharedState};
use crate::compiler::Compiler;
use crate::error::preview;
use crate::events::{Event, EventBus, EventType};
use crate::llm::{ChatMessage, ModelClient};
use crate::protocol::{BlockRegistry, ExecutableUnit};
use crate::tools::{ToolContext, ToolRegistry};
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default maximum iterations per task
pub const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Consecutive iterations without any executed unit before giving up
pub const DEFAULT_EMPTY_RESPONSE_LIMIT: u32 = 3;

/// Last-error excerpt carried into a failure message
const ERROR_EXCERPT_CHARS: usize = 300;

/// Configuration for the agent loop
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// Maximum iterations before stopping
    pub max_iterations: usize,
    pub empty_response_limit: u32,
    /// Whether to place the example exchange before the task
    pub warmup: bool,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            empty_response_limit: DEFAULT_EMPTY_RESPONSE_LIMIT,
            warmup: true,
        }
    }
}

impl AgentLoopConfig {
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    pub fn with_empty_response_limit(mut self, n: u32) -> Self {
        self.empty_response_limit = n.max(1);
        self
    }

    pub fn without_warmup(mut self) -> Self {
        self.warmup = false;
        self
    }
}

/// Hooks for customizing how the loop presents its progress.
///
/// Every method has a silent default; the CLI overrides them to print.
pub trait AgentHooks: Send + Sync {
    /// Called for every text increment as it arrives from the model.
    fn on_stream_content(&self, _content: &str) {}

    /// Called after each unit has run.
    fn on_unit_executed(&self, _unit: &ExecutableUnit) {}

    /// Called once per iteration, before its result is folded into history.
    fn on_iteration_finished(&self, _iteration: usize, _result: &IterationResult) {}
}

/// Hooks that do nothing
pub struct SilentHooks;

impl AgentHooks for SilentHooks {}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub message: String,
    pub title: Option<String>,
    pub iterations: usize,
}

pub struct AgentLoop {
    processor: StreamProcessor,
    ctx: ToolContext,
    config: AgentLoopConfig,
    system_prompt: String,
    feedback: Arc<FeedbackSlot>,
    hooks: Arc<dyn AgentHooks>,
    history: Vec<ChatMessage>,
}

impl AgentLoop {
    /// Loop over the built-in block tags and tools
    pub fn new(
        model: Arc<dyn ModelClient>,
        workspace: Arc<dyn Workspace>,
        compiler: Arc<dyn Compiler>,
        events: Arc<EventBus>,
        config: AgentLoopConfig,
    ) -> Self {
        Self::with_registries(
            model,
            BlockRegistry::builtin(),
            ToolRegistry::builtin(),
            ToolContext {
                workspace,
                compiler,
                state: SharedState::new(AgentState::new(config.max_iterations)),
                events,
            },
            config,
        )
    }

    pub fn with_registries(
        model: Arc<dyn ModelClient>,
        blocks: BlockRegistry,
        tools: ToolRegistry,
        ctx: ToolContext,
        config: AgentLoopConfig,
    ) -> Self {
        let system_prompt = prompts::system_prompt(&blocks, &tools);
        Self {
            processor: StreamProcessor::new(model, Arc::new(tools), Arc::new(blocks)),
            ctx,
            config,
            system_prompt,
            feedback: FeedbackSlot::new(),
            hooks: Arc::new(SilentHooks),
            history: Vec::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Handle for injecting real-time feedback from another task
    pub fn feedback_slot(&self) -> Arc<FeedbackSlot> {
        Arc::clone(&self.feedback)
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn state(&self) -> AgentState {
        self.ctx.state.snapshot()
    }

    fn emit(&self, event: Event) {
        self.ctx.events.emit(event);
    }

    /// Run one task to completion or failure.
    ///
    /// `Err` only when the task cannot even start; everything that goes
    /// wrong during iterations is fed back to the model or ends in a failed
    /// [`TaskOutcome`].
    pub async fn run(&mut self, task: &str) -> Result<TaskOutcome> {
        let task_id = Uuid::new_v4().to_string();
        *self.ctx.state.lock() = AgentState::new(self.config.max_iterations);

        let existing = self
            .ctx
            .workspace
            .list_files()
            .await
            .context("Failed to list existing project files")?;
        self.history = vec![ChatMessage::system(self.system_prompt.clone())];
        if self.config.warmup {
            self.history.extend(prompts::warmup());
        }
        self.history
            .push(ChatMessage::user(prompts::task_message(task, &existing)));

        info!(task_id = %task_id, existing = existing.len(), "task started");
        self.emit(Event::new(EventType::RunStarted {
            task_id: task_id.clone(),
            max_iterations: self.config.max_iterations,
        }));

        let outcome = self.iterate().await;

        info!(
            task_id = %task_id,
            success = outcome.success,
            iterations = outcome.iterations,
            "task finished"
        );
        self.emit(Event::new(EventType::RunFinished {
            task_id,
            success: outcome.success,
            iterations: outcome.iterations,
            message: outcome.message.clone(),
        }));
        Ok(outcome)
    }

    async fn iterate(&mut self) -> TaskOutcome {
        let mut empty_responses: u32 = 0;

        for iteration in 1..=self.config.max_iterations {
            self.ctx.state.lock().iteration = iteration;
            debug!(iteration, messages = self.history.len(), "starting iteration");
            self.emit(Event::new(EventType::IterationStarted { iteration }).in_iteration(iteration));

            let token = CancellationToken::new();
            self.feedback.attach(token.clone());
            let result = self
                .processor
                .run(&self.history, &self.ctx, &token, self.hooks.as_ref())
                .await;
            self.feedback.detach();

            self.hooks.on_iteration_finished(iteration, &result);
            self.emit(
                Event::new(EventType::IterationFinished {
                    iteration,
                    executed: result.executed_units.len(),
                    discarded: result.discarded_units.len(),
                    completed: result.completed,
                })
                .in_iteration(iteration),
            );

            // Real-time feedback supersedes whatever this iteration produced
            if let Some(feedback) = self.feedback.take() {
                info!(iteration, discarded = result.discarded_units.len(), "feedback injected");
                if !result.assistant_text.trim().is_empty() {
                    self.history
                        .push(ChatMessage::assistant(result.assistant_text.clone()));
                }
                self.history
                    .push(ChatMessage::user(interruption_turn(&feedback, &result)));
                self.emit(
                    Event::new(EventType::FeedbackInjected {
                        iteration,
                        discarded: result.discarded_units.len(),
                    })
                    .in_iteration(iteration),
                );
                empty_responses = 0;
                continue;
            }

            if !result.assistant_text.is_empty() {
                self.history
                    .push(ChatMessage::assistant(result.assistant_text.clone()));
            }

            if result.completed {
                let state = self.ctx.state.snapshot();
                return TaskOutcome {
                    success: true,
                    message: state
                        .summary
                        .unwrap_or_else(|| "Task completed".to_string()),
                    title: state.title,
                    iterations: iteration,
                };
            }

            if let Some(reason) = &result.abandoned {
                warn!(iteration, reason = %reason, "task abandoned");
                return self.failure(format!("Task abandoned by the model: {}", reason), iteration);
            }

            if let Some(error) = &result.error {
                self.ctx.state.lock().last_error = Some(preview(error, ERROR_EXCERPT_CHARS));
            }
            if let Some(feedback) = build_feedback(&result) {
                self.history.push(ChatMessage::user(feedback));
            }

            if result.executed_units.is_empty() && result.error.is_none() {
                empty_responses += 1;
                warn!(
                    iteration,
                    count = empty_responses,
                    limit = self.config.empty_response_limit,
                    "response executed nothing"
                );
                self.emit(
                    Event::new(EventType::EmptyResponse {
                        count: empty_responses,
                        limit: self.config.empty_response_limit,
                    })
                    .in_iteration(iteration),
                );
                if empty_responses >= self.config.empty_response_limit {
                    return self.failure(
                        format!(
                            "Model produced {} consecutive responses without any command",
                            empty_responses
                        ),
                        iteration,
                    );
                }
                self.history.push(ChatMessage::user(prompts::empty_nudge(
                    empty_responses,
                    self.config.empty_response_limit,
                )));
            } else {
                empty_responses = 0;
            }
        }

        self.failure(
            format!(
                "Reached the iteration limit ({}) without completing the task",
                self.config.max_iterations
            ),
            self.config.max_iterations,
        )
    }

    fn failure(&self, phase: String, iterations: usize) -> TaskOutcome {
        let state = self.ctx.state.snapshot();
        let mut message = phase;
        if let Some(error) = &state.last_error {
            if !message.contains(error.as_str()) {
                message.push_str(&format!(
                    "\nLast error: {}",
                    preview(error, ERROR_EXCERPT_CHARS)
                ));
            }
        }
        TaskOutcome {
            success: false,
            message,
            title: state.title,
            iterations,
        }
    }
}

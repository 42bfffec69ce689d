//! One iteration: stream the model's response, parse it as it arrives and
//! execute each command as soon as it is complete.
//!
//! The producer pulls text increments from the model, feeds the
//! [`CommandStreamParser`] and queues translated units. The consumer executes
//! queued units strictly in order. Both run concurrently on the calling task
//! and share a [`CancellationToken`]; the consumer trips it on completion,
//! abandonment or a non-recoverable failure, and the feedback slot trips the
//! parent token when real-time feedback arrives.

use crate::agent::core::AgentHooks;
use crate::events::{Event, EventType};
use crate::llm::{ChatMessage, ModelClient};
use crate::protocol::{
    translate, BlockRegistry, CommandStreamParser, DecodedCommand, ExecutableUnit, UnitKind,
};
use crate::tools::control::{ABORT_TOOL, COMPLETION_TOOL};
use crate::tools::{ToolContext, ToolExecutor};
use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything one iteration produced
#[derive(Debug, Clone, Default)]
pub struct IterationResult {
    /// In execution order, which is the order the commands completed in the text
    pub executed_units: Vec<ExecutableUnit>,
    /// Produced but never executed because the run was cancelled first
    pub discarded_units: Vec<ExecutableUnit>,
    /// Raw model output of this iteration
    pub assistant_text: String,
    pub error: Option<String>,
    pub completed: bool,
    /// Reason given with `@@ABORT`
    pub abandoned: Option<String>,
    /// A block was still open when the stream ended
    pub truncated: bool,
}

impl IterationResult {
    pub fn failed_units(&self) -> impl Iterator<Item = &ExecutableUnit> {
        self.executed_units.iter().filter(|u| !u.success)
    }
}

#[derive(Default)]
struct Produced {
    text: String,
    error: Option<String>,
    truncated: bool,
}

#[derive(Default)]
struct Consumed {
    executed: Vec<ExecutableUnit>,
    discarded: Vec<ExecutableUnit>,
    error: Option<String>,
    completed: bool,
    abandoned: Option<String>,
}

pub struct StreamProcessor {
    model: Arc<dyn ModelClient>,
    executor: Arc<dyn ToolExecutor>,
    blocks: Arc<BlockRegistry>,
}

impl StreamProcessor {
    pub fn new(
        model: Arc<dyn ModelClient>,
        executor: Arc<dyn ToolExecutor>,
        blocks: Arc<BlockRegistry>,
    ) -> Self {
        Self {
            model,
            executor,
            blocks,
        }
    }

    /// Run one iteration over `history`. Never fails: stream and execution
    /// errors end up in [`IterationResult::error`].
    pub async fn run(
        &self,
        history: &[ChatMessage],
        ctx: &ToolContext,
        cancel: &CancellationToken,
        hooks: &dyn AgentHooks,
    ) -> IterationResult {
        let token = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let iteration = ctx.state.lock().iteration;

        let (produced, mut consumed) = tokio::join!(
            self.produce(history, tx, &token, ctx, hooks),
            self.consume(&mut rx, &token, ctx, hooks, iteration),
        );

        // Whatever is still queued was cancelled before it could run
        rx.close();
        while let Ok(unit) = rx.try_recv() {
            if !unit.is_end() {
                consumed.discarded.push(unit);
            }
        }
        if !consumed.discarded.is_empty() {
            info!(
                iteration,
                count = consumed.discarded.len(),
                "discarding units after cancellation"
            );
            ctx.events.emit(
                Event::new(EventType::UnitsDiscarded {
                    count: consumed.discarded.len(),
                })
                .in_iteration(iteration),
            );
        }

        IterationResult {
            executed_units: consumed.executed,
            discarded_units: consumed.discarded,
            assistant_text: produced.text,
            error: consumed.error.or(produced.error),
            completed: consumed.completed,
            abandoned: consumed.abandoned,
            truncated: produced.truncated,
        }
    }

    async fn produce(
        &self,
        history: &[ChatMessage],
        tx: UnboundedSender<ExecutableUnit>,
        cancel: &CancellationToken,
        ctx: &ToolContext,
        hooks: &dyn AgentHooks,
    ) -> Produced {
        let mut produced = Produced::default();
        if let Err(e) = self.pump(history, &tx, cancel, ctx, hooks, &mut produced).await {
            warn!(model = self.model.name(), error = %e, "model stream failed");
            ctx.events.emit(Event::new(EventType::ModelError {
                model: self.model.name().to_string(),
                message: e.to_string(),
            }));
            produced.error = Some(format!("Model stream failed: {:#}", e));
        }
        // The consumer relies on seeing this exactly once, on every path
        let _ = tx.send(ExecutableUnit::end_of_stream());
        produced
    }

    async fn pump(
        &self,
        history: &[ChatMessage],
        tx: &UnboundedSender<ExecutableUnit>,
        cancel: &CancellationToken,
        ctx: &ToolContext,
        hooks: &dyn AgentHooks,
        produced: &mut Produced,
    ) -> Result<()> {
        let mut parser = CommandStreamParser::new(&self.blocks);
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            stream = self.model.stream(history) => stream?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(chars = produced.text.len(), "stream cancelled");
                    return Ok(());
                }
                next = stream.next() => next,
            };
            let commands = match next {
                Some(Ok(chunk)) => {
                    ctx.events.emit(Event::new(EventType::ModelChunk {
                        chars: chunk.chars().count(),
                    }));
                    hooks.on_stream_content(&chunk);
                    produced.text.push_str(&chunk);
                    parser.feed(&chunk)
                }
                Some(Err(e)) => return Err(e),
                None => {
                    let trailing = parser.flush();
                    self.enqueue(tx, trailing, produced);
                    return Ok(());
                }
            };
            self.enqueue(tx, commands, produced);
        }
    }

    fn enqueue(
        &self,
        tx: &UnboundedSender<ExecutableUnit>,
        commands: Vec<DecodedCommand>,
        produced: &mut Produced,
    ) {
        for command in commands {
            let unit = translate(&self.blocks, command);
            if !unit.complete {
                produced.truncated = true;
            }
            debug!(unit = %unit.describe(), "queued");
            if tx.send(unit).is_err() {
                return;
            }
        }
    }

    async fn consume(
        &self,
        rx: &mut UnboundedReceiver<ExecutableUnit>,
        cancel: &CancellationToken,
        ctx: &ToolContext,
        hooks: &dyn AgentHooks,
        iteration: usize,
    ) -> Consumed {
        let mut consumed = Consumed::default();
        while let Some(mut unit) = rx.recv().await {
            if unit.is_end() {
                break;
            }
            if cancel.is_cancelled() {
                consumed.discarded.push(unit);
                break;
            }

            let label = match &unit.kind {
                UnitKind::FileWrite { .. } => "file_write".to_string(),
                UnitKind::ToolCall { name, .. } => name.clone(),
                UnitKind::EndOfStream => continue,
            };
            let stop = self.execute(&mut unit, ctx, &mut consumed).await;

            ctx.events
                .emit(Event::unit_executed(&label, unit.success, unit.complete).in_iteration(iteration));
            hooks.on_unit_executed(&unit);
            consumed.executed.push(unit);

            if stop {
                cancel.cancel();
                break;
            }
        }
        consumed
    }

    /// Execute one unit and record the outcome on it. Returns true when the
    /// run must stop.
    async fn execute(
        &self,
        unit: &mut ExecutableUnit,
        ctx: &ToolContext,
        consumed: &mut Consumed,
    ) -> bool {
        if let UnitKind::FileWrite { path, content } = &unit.kind {
            let (success, message) = match ctx.workspace.write_file(path, content).await {
                Ok(()) => (
                    true,
                    format!("Wrote {} ({} chars)", path, content.chars().count()),
                ),
                Err(e) => {
                    warn!(path = %path, error = %e, "file write failed");
                    (false, format!("Failed to write {}: {}", path, e))
                }
            };
            unit.record(success, message, false);
            return false;
        }
        let (name, args) = match &unit.kind {
            UnitKind::ToolCall { name, args } => (name.clone(), args.clone()),
            _ => return false,
        };

        match self.executor.execute(&name, &args, ctx).await {
            Ok(result) => {
                let text = if result.success {
                    result.message.clone()
                } else {
                    result.to_feedback(&name)
                };
                unit.record(result.success, text, result.should_surface);

                if result.success && name == COMPLETION_TOOL {
                    info!("completion signal accepted");
                    consumed.completed = true;
                    return true;
                }
                if result.success && name == ABORT_TOOL {
                    let reason = ctx
                        .state
                        .lock()
                        .abandoned
                        .clone()
                        .or_else(|| args.get("reason").cloned())
                        .unwrap_or_else(|| "no reason given".to_string());
                    consumed.abandoned = Some(reason);
                    return true;
                }
                if !result.success && !result.recoverable {
                    warn!(tool = %name, "non-recoverable failure, cancelling run");
                    consumed.error = Some(result.to_feedback(&name));
                    return true;
                }
                false
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "tool execution raised");
                unit.record(false, format!("{:#}", e), false);
                consumed.error = Some(format!("Tool {} failed internally: {:#}", name, e));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::core::SilentHooks;
    use crate::error::ToolResult;
    use crate::llm::{Reply, ScriptedModel};
    use crate::tools::test_support::context;
    use crate::tools::{ToolArgs, ToolRegistry};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records calls; `fail` names a tool that fails without recovery
    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        fail: Option<&'static str>,
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn execute(&self, name: &str, _args: &ToolArgs, _ctx: &ToolContext) -> Result<ToolResult> {
            self.calls.lock().unwrap().push(name.to_string());
            if Some(name) == self.fail {
                return Ok(ToolResult::fatal("disk on fire"));
            }
            Ok(ToolResult::ok(format!("{} ok", name)))
        }
    }

    fn processor(model: ScriptedModel, executor: Arc<dyn ToolExecutor>) -> StreamProcessor {
        StreamProcessor::new(
            Arc::new(model),
            executor,
            Arc::new(BlockRegistry::builtin()),
        )
    }

    async fn run_once(p: &StreamProcessor, ctx: &ToolContext) -> IterationResult {
        p.run(&[ChatMessage::user("go")], ctx, &CancellationToken::new(), &SilentHooks)
            .await
    }

    #[tokio::test]
    async fn test_scenario_a_completes() {
        let text = "<<<FILE: a.txt>>>hello<<<END_FILE>>>\n@@DONE summary=\"x\"\n";
        let ctx = context(&[]);
        let p = processor(
            ScriptedModel::new([text]).with_chunk_chars(5),
            Arc::new(ToolRegistry::builtin()),
        );
        let result = run_once(&p, &ctx).await;

        assert!(result.completed);
        assert!(result.error.is_none());
        assert_eq!(result.assistant_text, text);
        assert_eq!(result.executed_units.len(), 2);
        assert_eq!(
            result.executed_units[0].kind,
            UnitKind::FileWrite {
                path: "a.txt".into(),
                content: "hello".into()
            }
        );
        match &result.executed_units[1].kind {
            UnitKind::ToolCall { name, args } => {
                assert_eq!(name, "done");
                assert_eq!(args.get("summary").map(String::as_str), Some("x"));
            }
            other => panic!("unexpected unit {:?}", other),
        }
        assert!(result.executed_units.iter().all(|u| u.executed && u.success));
        assert_eq!(
            ctx.workspace.read_file("a.txt").await.unwrap().as_deref(),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn test_units_execute_in_text_order() {
        let text = "@@LIST_FILES\n<<<FILE: b.txt>>>\nb\n<<<END_FILE>>>\n@@COMPILE\n<<<FILE: a.txt>>>\na\n<<<END_FILE>>>\n";
        let executor = Arc::new(RecordingExecutor::default());
        let p = processor(ScriptedModel::new([text]).with_chunk_chars(3), executor.clone());
        let result = run_once(&p, &context(&[])).await;

        let order: Vec<String> = result.executed_units.iter().map(|u| u.describe()).collect();
        assert_eq!(
            order,
            vec!["list_files()", "write b.txt", "compile()", "write a.txt"]
        );
        assert_eq!(*executor.calls.lock().unwrap(), vec!["list_files", "compile"]);
        assert!(!result.completed);
        assert!(result.discarded_units.is_empty());
    }

    #[tokio::test]
    async fn test_nothing_runs_after_fatal_failure() {
        // Whole response arrives in one chunk so every unit is queued before
        // the failing one executes
        let text = "<<<FILE: a.txt>>>\na\n<<<END_FILE>>>\n@@COMPILE\n<<<FILE: b.txt>>>\nb\n<<<END_FILE>>>\n@@LIST_FILES\n";
        let executor = Arc::new(RecordingExecutor {
            fail: Some("compile"),
            ..Default::default()
        });
        let ctx = context(&[]);
        let p = processor(ScriptedModel::new([text]).with_chunk_chars(10_000), executor.clone());
        let result = run_once(&p, &ctx).await;

        assert_eq!(result.executed_units.len(), 2);
        assert!(!result.executed_units[1].success);
        assert!(result.error.as_deref().unwrap_or("").contains("disk on fire"));
        assert_eq!(result.discarded_units.len(), 2);
        assert!(result.discarded_units.iter().all(|u| !u.executed));
        assert_eq!(*executor.calls.lock().unwrap(), vec!["compile"]);
        assert_eq!(ctx.workspace.read_file("b.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recoverable_failures_do_not_stop_the_run() {
        let text = "@@DELETE_FILE path=\"nope.ts\"\n<<<FILE: a.txt>>>\na\n<<<END_FILE>>>\n";
        let p = processor(ScriptedModel::new([text]), Arc::new(ToolRegistry::builtin()));
        let result = run_once(&p, &context(&[])).await;

        assert_eq!(result.executed_units.len(), 2);
        assert!(!result.executed_units[0].success);
        let feedback = result.executed_units[0].result.as_deref().unwrap_or("");
        assert!(feedback.contains("Error Type: file_not_found"));
        assert!(result.executed_units[1].success);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_abort_cancels_and_records_reason() {
        let text = "@@ABORT reason=\"cannot\"\n<<<FILE: a.txt>>>\na\n<<<END_FILE>>>\n";
        let p = processor(
            ScriptedModel::new([text]).with_chunk_chars(10_000),
            Arc::new(ToolRegistry::builtin()),
        );
        let result = run_once(&p, &context(&[])).await;

        assert_eq!(result.abandoned.as_deref(), Some("cannot"));
        assert!(!result.completed);
        assert_eq!(result.executed_units.len(), 1);
        assert_eq!(result.discarded_units.len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_block_is_executed_and_flagged() {
        let text = "<<<FILE: a.txt>>>\nline one\nline two";
        let ctx = context(&[]);
        let p = processor(ScriptedModel::new([text]), Arc::new(ToolRegistry::builtin()));
        let result = run_once(&p, &ctx).await;

        assert!(result.truncated);
        assert_eq!(result.executed_units.len(), 1);
        assert!(!result.executed_units[0].complete);
        assert_eq!(
            ctx.workspace.read_file("a.txt").await.unwrap().as_deref(),
            Some("line one\nline two")
        );
    }

    #[tokio::test]
    async fn test_stream_error_keeps_executed_units() {
        let reply = Reply::Interrupted(
            "<<<FILE: a.txt>>>\na\n<<<END_FILE>>>\n<<<FILE: b.txt>>>\npartial".to_string(),
            "connection reset".to_string(),
        );
        let ctx = context(&[]);
        let p = processor(ScriptedModel::new([reply]), Arc::new(ToolRegistry::builtin()));
        let result = run_once(&p, &ctx).await;

        assert!(result.error.as_deref().unwrap_or("").contains("connection reset"));
        assert_eq!(result.executed_units.len(), 1);
        assert!(result.executed_units[0].success);
        assert!(!result.truncated);
        assert_eq!(ctx.workspace.read_file("b.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refused_request_is_an_error() {
        let p = processor(
            ScriptedModel::new([Reply::Refused("401 unauthorized".to_string())]),
            Arc::new(ToolRegistry::builtin()),
        );
        let result = run_once(&p, &context(&[])).await;
        assert!(result.error.as_deref().unwrap_or("").contains("401"));
        assert!(result.executed_units.is_empty());
        assert_eq!(result.assistant_text, "");
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_stream() {
        let text = "<<<FILE: a.txt>>>\na\n<<<END_FILE>>>\n".repeat(20);
        let ctx = context(&[]);
        let p = processor(
            ScriptedModel::new([text.as_str()])
                .with_chunk_chars(8)
                .with_delay(Duration::from_millis(5)),
            Arc::new(ToolRegistry::builtin()),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            trigger.cancel();
        });

        let result = p
            .run(&[ChatMessage::user("go")], &ctx, &cancel, &SilentHooks)
            .await;
        assert!(result.assistant_text.len() < text.len());
        assert!(result.error.is_none());
        assert!(!result.completed);
    }

    #[tokio::test]
    async fn test_internal_error_is_fatal() {
        struct Broken;

        #[async_trait]
        impl ToolExecutor for Broken {
            async fn execute(&self, _: &str, _: &ToolArgs, _: &ToolContext) -> Result<ToolResult> {
                Err(anyhow::anyhow!("executor crashed"))
            }
        }

        let text = "@@COMPILE\n@@LIST_FILES\n";
        let p = processor(ScriptedModel::new([text]).with_chunk_chars(10_000), Arc::new(Broken));
        let result = run_once(&p, &context(&[])).await;
        assert_eq!(result.executed_units.len(), 1);
        assert_eq!(result.discarded_units.len(), 1);
        assert!(result.error.as_deref().unwrap_or("").contains("executor crashed"));
        assert_eq!(
            result.executed_units[0].result.as_deref(),
            Some("executor crashed")
        );
    }
}

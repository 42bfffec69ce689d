//! Feedback turns for the model.
//!
//! [`build_feedback`] turns an iteration's results into the next user turn.
//! [`FeedbackSlot`] lets something outside the loop (a UI, a supervisor)
//! drop in a message while the model is still streaming; the running
//! iteration is cancelled and the message becomes the next user turn.

use crate::agent::processor::IterationResult;
use crate::protocol::{ExecutableUnit, UnitKind};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
struct Slot {
    pending: Option<String>,
    running: Option<CancellationToken>,
}

/// Externally settable feedback, checked by the loop after every iteration
#[derive(Default)]
pub struct FeedbackSlot {
    inner: Mutex<Slot>,
}

impl FeedbackSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store feedback and interrupt the running iteration, if any. Feedback
    /// injected twice before the loop picks it up is concatenated.
    pub fn inject(&self, feedback: impl Into<String>) {
        let feedback = feedback.into();
        let mut slot = self.slot();
        slot.pending = Some(match slot.pending.take() {
            Some(earlier) => format!("{}\n\n{}", earlier, feedback),
            None => feedback,
        });
        if let Some(token) = &slot.running {
            info!("real-time feedback received, interrupting iteration");
            token.cancel();
        }
    }

    /// Register the token of the iteration about to run. Feedback that is
    /// already waiting cancels it straight away.
    pub fn attach(&self, token: CancellationToken) {
        let mut slot = self.slot();
        if slot.pending.is_some() {
            token.cancel();
        }
        slot.running = Some(token);
    }

    pub fn detach(&self) {
        self.slot().running = None;
    }

    pub fn take(&self) -> Option<String> {
        self.slot().pending.take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot().pending.is_some()
    }
}

fn unit_label(unit: &ExecutableUnit) -> String {
    match &unit.kind {
        UnitKind::ToolCall { name, .. } => name.clone(),
        _ => unit.describe(),
    }
}

/// Next user turn built from an iteration, or `None` when there is nothing
/// to say.
pub fn build_feedback(result: &IterationResult) -> Option<String> {
    let mut parts = Vec::new();

    for unit in result.executed_units.iter().filter(|u| u.success && u.surface) {
        if let Some(text) = &unit.result {
            parts.push(format!("[{}]\n{}", unit_label(unit), text));
        }
    }

    let failures: Vec<String> = result
        .failed_units()
        .map(|u| {
            format!(
                "- {}\n{}",
                u.describe(),
                u.result.as_deref().unwrap_or("failed")
            )
        })
        .collect();
    if !failures.is_empty() {
        parts.push(format!(
            "{} operation(s) failed:\n{}",
            failures.len(),
            failures.join("\n\n")
        ));
    }

    if let Some(error) = &result.error {
        parts.push(format!("Error during the last response: {}", error));
        if !result.discarded_units.is_empty() {
            parts.push(format!(
                "{} pending operation(s) after the error were NOT executed: {}",
                result.discarded_units.len(),
                describe_all(&result.discarded_units)
            ));
        }
    }

    if result.truncated {
        parts.push(
            "Your response ended inside an unterminated block. Its partial content was applied as-is. \
             Check the affected file and rewrite it completely if it is incomplete."
                .to_string(),
        );
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// User turn for feedback that interrupted the previous response
pub fn interruption_turn(feedback: &str, result: &IterationResult) -> String {
    let mut text = String::from(
        "[Real-time feedback] Your previous response was interrupted by this message.",
    );
    if !result.discarded_units.is_empty() {
        text.push_str(&format!(
            " {} pending operation(s) were dropped and did not run: {}.",
            result.discarded_units.len(),
            describe_all(&result.discarded_units)
        ));
    }
    text.push_str("\n\n");
    text.push_str(feedback);
    text
}

fn describe_all(units: &[ExecutableUnit]) -> String {
    units
        .iter()
        .map(|u| u.describe())
        .collect::<Vec<_>>()
        .join(", ")
}

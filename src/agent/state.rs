//! State carried across iterations of one task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub iteration: usize,
    pub max_iterations: usize,
    pub completed: bool,
    /// Reason given by the model when it gave up
    pub abandoned: Option<String>,
    pub last_error: Option<String>,
    /// Consecutive failed patch applications per file
    pub diff_fail_counts: HashMap<String, u32>,
    pub summary: Option<String>,
    pub title: Option<String>,
    pub compile_success: Option<bool>,
}

impl AgentState {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..Self::default()
        }
    }
}

/// Shared handle; tools mutate it while the loop reads it between iterations
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<Mutex<AgentState>>);

impl SharedState {
    pub fn new(state: AgentState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    /// A poisoned lock still holds usable state; recover it
    pub fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> AgentState {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state_is_shared() {
        let state = SharedState::new(AgentState::new(5));
        let other = state.clone();
        other.lock().diff_fail_counts.insert("a.ts".to_string(), 2);
        assert_eq!(state.snapshot().diff_fail_counts.get("a.ts"), Some(&2));
        assert_eq!(state.snapshot().max_iterations, 5);
    }
}

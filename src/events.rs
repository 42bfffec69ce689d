//! Typed event stream for observability.
//!
//! Components that do interesting work (the agent loop, the stream
//! processor, tools) emit structured [`Event`]s on an [`EventBus`] they were
//! handed at construction. Subscribers such as [`crate::metrics::LoopMetrics`]
//! or the CLI's progress printer react to them.
//!
//! ## Event Categories
//!
//! - **Run**: task and iteration lifecycle, feedback injection
//! - **Model**: stream chunks and stream failures
//! - **Unit**: executed and discarded units
//! - **Diff**: patch failures
//! - **Compile**: compiler oracle verdicts
//!
//! ## Usage
//!
//! ```ignore
//! use textbridge::events::{Event, EventBus, EventType};
//!
//! let bus = EventBus::new();
//! bus.subscribe(|event| println!("[{}] {:?}", event.subsystem, event.event_type));
//! bus.emit(Event::new(EventType::IterationStarted { iteration: 1 }));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Subsystem identifiers for event categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Task and iteration lifecycle
    Run,
    /// Model stream
    Model,
    /// Unit execution
    Unit,
    /// Patch application
    Diff,
    /// Compiler oracle
    Compile,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Subsystem::Run => "run",
            Subsystem::Model => "model",
            Subsystem::Unit => "unit",
            Subsystem::Diff => "diff",
            Subsystem::Compile => "compile",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run events
    RunStarted {
        task_id: String,
        max_iterations: usize,
    },
    IterationStarted {
        iteration: usize,
    },
    IterationFinished {
        iteration: usize,
        executed: usize,
        discarded: usize,
        completed: bool,
    },
    FeedbackInjected {
        iteration: usize,
        discarded: usize,
    },
    EmptyResponse {
        count: u32,
        limit: u32,
    },
    RunFinished {
        task_id: String,
        success: bool,
        iterations: usize,
        message: String,
    },

    // Model events
    ModelChunk {
        chars: usize,
    },
    ModelError {
        model: String,
        message: String,
    },

    // Unit events
    UnitExecuted {
        /// `file_write` or the tool name
        unit: String,
        success: bool,
        complete: bool,
    },
    UnitsDiscarded {
        count: usize,
    },

    // Diff events
    DiffFailed {
        path: String,
        failures: u32,
        kind: String,
    },

    // Compile events
    CompileFinished {
        success: bool,
        duration_ms: u64,
    },
}

impl EventType {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            EventType::RunStarted { .. }
            | EventType::IterationStarted { .. }
            | EventType::IterationFinished { .. }
            | EventType::FeedbackInjected { .. }
            | EventType::EmptyResponse { .. }
            | EventType::RunFinished { .. } => Subsystem::Run,
            EventType::ModelChunk { .. } | EventType::ModelError { .. } => Subsystem::Model,
            EventType::UnitExecuted { .. } | EventType::UnitsDiscarded { .. } => Subsystem::Unit,
            EventType::DiffFailed { .. } => Subsystem::Diff,
            EventType::CompileFinished { .. } => Subsystem::Compile,
        }
    }
}

/// A single event with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-bus sequence number, assigned at emit time
    pub seq: u64,
    /// Timestamp in milliseconds since epoch
    pub timestamp_ms: u64,
    pub subsystem: Subsystem,
    #[serde(flatten)]
    pub event_type: EventType,
    /// Iteration the event belongs to, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            seq: 0,
            timestamp_ms: timestamp_ms(),
            subsystem: event_type.subsystem(),
            event_type,
            iteration: None,
        }
    }

    pub fn in_iteration(mut self, iteration: usize) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn unit_executed(unit: &str, success: bool, complete: bool) -> Self {
        Self::new(EventType::UnitExecuted {
            unit: unit.to_string(),
            success,
            complete,
        })
    }

    pub fn diff_failed(path: &str, failures: u32, kind: &str) -> Self {
        Self::new(EventType::DiffFailed {
            path: path.to_string(),
            failures,
            kind: kind.to_string(),
        })
    }
}

pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Event bus for pub/sub event distribution
pub struct EventBus {
    listeners: RwLock<Vec<EventListener>>,
    /// Filter by subsystem (absent = all)
    subsystem_filters: RwLock<HashMap<usize, Vec<Subsystem>>>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to all events
    pub fn subscribe<F>(&self, listener: F) -> usize
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let id = listeners.len();
        listeners.push(Arc::new(listener));
        id
    }

    /// Subscribe to specific subsystems only
    pub fn subscribe_filtered<F>(&self, subsystems: Vec<Subsystem>, listener: F) -> usize
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.subscribe(listener);
        let mut filters = self
            .subsystem_filters
            .write()
            .unwrap_or_else(|e| e.into_inner());
        filters.insert(id, subsystems);
        id
    }

    /// Deliver to every matching subscriber on the calling thread.
    /// A panicking listener is isolated from the others and from the caller.
    pub fn emit(&self, mut event: Event) {
        event.seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        let filters = self
            .subsystem_filters
            .read()
            .unwrap_or_else(|e| e.into_inner());

        for (id, listener) in listeners.iter().enumerate() {
            if let Some(allowed) = filters.get(&id) {
                if !allowed.contains(&event.subsystem) {
                    continue;
                }
            }
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&event);
            }));
        }
    }

    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            subsystem_filters: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_event_sequence_per_bus() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(move |e| seen_clone.lock().unwrap().push(e.seq));

        bus.emit(Event::new(EventType::IterationStarted { iteration: 1 }));
        bus.emit(Event::new(EventType::IterationStarted { iteration: 2 }));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);

        let other = EventBus::new();
        assert_eq!(other.emitted(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::diff_failed("src/a.ts", 2, "diff_not_found").in_iteration(3);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"diff_failed\""));
        assert!(json.contains("\"subsystem\":\"diff\""));
        assert!(json.contains("\"iteration\":3"));
    }

    #[test]
    fn test_subsystem_filter() {
        let bus = EventBus::new();
        let unit_counter = Arc::new(AtomicUsize::new(0));
        let model_counter = Arc::new(AtomicUsize::new(0));

        let uc = Arc::clone(&unit_counter);
        bus.subscribe_filtered(vec![Subsystem::Unit], move |_| {
            uc.fetch_add(1, Ordering::SeqCst);
        });

        let mc = Arc::clone(&model_counter);
        bus.subscribe_filtered(vec![Subsystem::Model], move |_| {
            mc.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::unit_executed("done", true, true));
        bus.emit(Event::new(EventType::ModelChunk { chars: 12 }));
        bus.emit(Event::new(EventType::ModelChunk { chars: 3 }));

        assert_eq!(unit_counter.load(Ordering::SeqCst), 1);
        assert_eq!(model_counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| panic!("listener bug"));
        let c = Arc::clone(&counter);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::new(EventType::UnitsDiscarded { count: 2 }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

//! Prometheus metrics for the agent loop.
//!
//! [`LoopMetrics`] owns a private registry and is fed from an
//! [`EventBus`] subscription:
//! - iterations and finished runs by outcome
//! - executed units by kind and status, discarded units
//! - patch failures by error kind
//! - model stream chunks and characters
//! - compile durations

use crate::events::{Event, EventBus, EventType};
use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

const KIND_LABEL: &str = "kind";
const STATUS_LABEL: &str = "status";

#[derive(Clone)]
pub struct LoopMetrics {
    registry: Registry,

    /// Finished runs by status (success/failure)
    runs_total: CounterVec,

    iterations_total: Counter,

    /// Executed units by kind (file_write or tool name) and status
    units_total: CounterVec,

    discarded_units_total: Counter,

    /// Failed patch applications by error kind
    diff_failures_total: CounterVec,

    model_chunks_total: Counter,

    model_chars_total: Counter,

    /// Compile duration in milliseconds, by status
    compile_duration_ms: HistogramVec,

    /// JSON export data (accumulated)
    json_data: Arc<RwLock<MetricsSnapshot>>,
}

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

impl LoopMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_total = CounterVec::new(
            Opts::new("textbridge_runs_total", "Finished tasks"),
            &[STATUS_LABEL],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let iterations_total = Counter::with_opts(Opts::new(
            "textbridge_iterations_total",
            "Stream processor runs",
        ))?;
        registry.register(Box::new(iterations_total.clone()))?;

        let units_total = CounterVec::new(
            Opts::new("textbridge_units_total", "Executed units"),
            &[KIND_LABEL, STATUS_LABEL],
        )?;
        registry.register(Box::new(units_total.clone()))?;

        let discarded_units_total = Counter::with_opts(Opts::new(
            "textbridge_discarded_units_total",
            "Units dropped after cancellation",
        ))?;
        registry.register(Box::new(discarded_units_total.clone()))?;

        let diff_failures_total = CounterVec::new(
            Opts::new("textbridge_diff_failures_total", "Rejected patches"),
            &[KIND_LABEL],
        )?;
        registry.register(Box::new(diff_failures_total.clone()))?;

        let model_chunks_total = Counter::with_opts(Opts::new(
            "textbridge_model_chunks_total",
            "Text increments received from the model",
        ))?;
        registry.register(Box::new(model_chunks_total.clone()))?;

        let model_chars_total = Counter::with_opts(Opts::new(
            "textbridge_model_chars_total",
            "Characters received from the model",
        ))?;
        registry.register(Box::new(model_chars_total.clone()))?;

        let compile_duration_ms = HistogramVec::new(
            HistogramOpts::new(
                "textbridge_compile_duration_ms",
                "Compile duration in milliseconds",
            )
            .buckets(vec![
                100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
            ]),
            &[STATUS_LABEL],
        )?;
        registry.register(Box::new(compile_duration_ms.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            iterations_total,
            units_total,
            discarded_units_total,
            diff_failures_total,
            model_chunks_total,
            model_chars_total,
            compile_duration_ms,
            json_data: Arc::new(RwLock::new(MetricsSnapshot::default())),
        })
    }

    /// Count every event the bus carries from now on
    pub fn attach(&self, bus: &EventBus) {
        let metrics = self.clone();
        bus.subscribe(move |event| metrics.record(event));
    }

    pub fn record(&self, event: &Event) {
        let mut data = self.json_data.write().unwrap_or_else(|e| e.into_inner());
        match &event.event_type {
            EventType::IterationStarted { .. } => {
                self.iterations_total.inc();
                data.iterations += 1;
            }
            EventType::RunFinished { success, .. } => {
                self.runs_total.with_label_values(&[status(*success)]).inc();
                data.runs += 1;
            }
            EventType::UnitExecuted { unit, success, .. } => {
                self.units_total
                    .with_label_values(&[unit.as_str(), status(*success)])
                    .inc();
                data.units_executed += 1;
                if !success {
                    data.units_failed += 1;
                }
            }
            EventType::UnitsDiscarded { count } => {
                self.discarded_units_total.inc_by(*count as f64);
                data.units_discarded += *count as u64;
            }
            EventType::DiffFailed { kind, .. } => {
                self.diff_failures_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                data.diff_failures += 1;
            }
            EventType::ModelChunk { chars } => {
                self.model_chunks_total.inc();
                self.model_chars_total.inc_by(*chars as f64);
                data.model_chars += *chars as u64;
            }
            EventType::CompileFinished {
                success,
                duration_ms,
            } => {
                self.compile_duration_ms
                    .with_label_values(&[status(*success)])
                    .observe(*duration_ms as f64);
                data.compiles += 1;
            }
            _ => {}
        }
    }

    /// Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics are not valid UTF-8")
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.json_data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Snapshot of metrics for JSON export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub runs: u64,
    pub iterations: u64,
    pub units_executed: u64,
    pub units_failed: u64,
    pub units_discarded: u64,
    pub diff_failures: u64,
    pub model_chars: u64,
    pub compiles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_from_bus() {
        let bus = EventBus::new();
        let metrics = LoopMetrics::new().unwrap();
        metrics.attach(&bus);

        bus.emit(Event::new(EventType::IterationStarted { iteration: 1 }));
        bus.emit(Event::new(EventType::ModelChunk { chars: 10 }));
        bus.emit(Event::new(EventType::ModelChunk { chars: 5 }));
        bus.emit(Event::unit_executed("file_write", true, true));
        bus.emit(Event::unit_executed("apply_diff", false, true));
        bus.emit(Event::new(EventType::UnitsDiscarded { count: 3 }));
        bus.emit(Event::diff_failed("a.ts", 1, "diff_not_found"));
        bus.emit(Event::new(EventType::CompileFinished {
            success: true,
            duration_ms: 420,
        }));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.iterations, 1);
        assert_eq!(snapshot.model_chars, 15);
        assert_eq!(snapshot.units_executed, 2);
        assert_eq!(snapshot.units_failed, 1);
        assert_eq!(snapshot.units_discarded, 3);
        assert_eq!(snapshot.diff_failures, 1);
        assert_eq!(snapshot.compiles, 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("textbridge_units_total"));
        assert!(text.contains("kind=\"apply_diff\""));
        assert!(text.contains("textbridge_discarded_units_total 3"));
    }
}

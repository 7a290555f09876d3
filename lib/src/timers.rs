//! Provider Compute Timers: a sink for subtask compute start/finish events.
//! RTM never reads these back; they exist purely for observability.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use prometheus::{HistogramVec, Registry};
use tracing::debug;

use crate::id::SubtaskId;

pub trait ProviderComputeTimers: Send + Sync {
    fn start(&self, subtask_id: &SubtaskId);
    fn finish(&self, subtask_id: &SubtaskId);
}

/// Records elapsed subtask compute duration into a dedicated prometheus
/// registry (not the process-global default one, so tests and multiple
/// instances don't collide) and emits a tracing event on completion.
pub struct PrometheusComputeTimers {
    started: Mutex<HashMap<SubtaskId, Instant>>,
    duration_seconds: HistogramVec,
    registry: Registry,
}

impl PrometheusComputeTimers {
    pub fn new() -> Self {
        let registry = Registry::new();
        let duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "rtm_subtask_compute_duration_seconds",
                "wall-clock time between a subtask being handed to a provider and its verification outcome",
            ),
            &[],
        )
        .expect("valid histogram opts");
        registry
            .register(Box::new(duration_seconds.clone()))
            .expect("single registration");

        Self {
            started: Mutex::new(HashMap::new()),
            duration_seconds,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for PrometheusComputeTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderComputeTimers for PrometheusComputeTimers {
    fn start(&self, subtask_id: &SubtaskId) {
        self.started
            .lock()
            .unwrap()
            .insert(subtask_id.clone(), Instant::now());
        debug!(subtask_id, "provider compute started");
    }

    fn finish(&self, subtask_id: &SubtaskId) {
        let started_at = self.started.lock().unwrap().remove(subtask_id);
        if let Some(started_at) = started_at {
            let elapsed = started_at.elapsed().as_secs_f64();
            self.duration_seconds.with_label_values(&[]).observe(elapsed);
            debug!(subtask_id, elapsed, "provider compute finished");
        } else {
            debug!(subtask_id, "provider compute finished without a matching start");
        }
    }
}

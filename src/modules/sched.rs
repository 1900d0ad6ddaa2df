//! Reference module: scheduling plugin.
//!
//! Reads another module's [`MonitoringModule::get_current_metric_value`]
//! (spec §4.G "modules can read each other's published metric") on every
//! tick and turns it into a scheduling hint, the kind of policy a real
//! QoS-aware scheduler would consult. No virtual counters or PMCs of its
//! own: `module_counter_usage` is the default, so it never conflicts with
//! the module it observes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::module_mgr::{CounterUsage, MonitoringModule};
use crate::ThreadId;

/// Coarse scheduling classification derived from a source module's metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedHint {
    /// Metric at or above the threshold: favor this thread.
    Boost,
    /// Metric below the threshold: no change.
    Normal,
}

/// Watches one upstream module's published metric and classifies threads
/// against a threshold.
pub struct SchedulingPlugin {
    source: Arc<dyn MonitoringModule>,
    threshold: f64,
    hints: Mutex<HashMap<ThreadId, SchedHint>>,
}

impl SchedulingPlugin {
    pub fn new(source: Arc<dyn MonitoringModule>, threshold: f64) -> Self {
        SchedulingPlugin {
            source,
            threshold,
            hints: Mutex::new(HashMap::new()),
        }
    }

    pub fn hint_for(&self, thread: ThreadId) -> Option<SchedHint> {
        self.hints.lock().get(&thread).copied()
    }
}

impl MonitoringModule for SchedulingPlugin {
    fn name(&self) -> &str {
        "sched"
    }

    fn module_counter_usage(&self) -> CounterUsage {
        CounterUsage::default()
    }

    fn on_tick(&self, thread: ThreadId) {
        let Some(metric) = self.source.get_current_metric_value(thread) else {
            return;
        };
        let hint = if metric >= self.threshold {
            SchedHint::Boost
        } else {
            SchedHint::Normal
        };
        self.hints.lock().insert(thread, hint);
    }

    fn on_exit(&self, thread: ThreadId) {
        self.hints.lock().remove(&thread);
    }
}

//! Per-thread monitoring state (spec §3).

use std::collections::HashMap;
use std::sync::Arc;

use crate::counter::ExperimentSet;
use crate::module_mgr::ModulePrivateData;
use crate::pmu::CoreTypeId;
use crate::sample::RingBuffer;
use crate::ThreadId;

/// The sampling discipline driving a thread's counters (spec §4.D).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingMode {
    /// Sampling interval counted in scheduler ticks.
    TbsScheduler,
    /// Sampling interval counted in wall-clock jiffies, additionally
    /// sampling on context-switch-out when the window has closed.
    TbsUser,
    /// Hardware-overflow-driven sampling; forbids multiplexing.
    Ebs,
    /// Not currently monitored.
    None,
}

/// Per-thread monitoring state (spec §3). Created on fork, mutated by tick
/// and context-switch callbacks under the caller CPU's context, destroyed
/// on task teardown.
pub struct ThreadMonitoringState {
    pub thread_id: ThreadId,
    /// One experiment set per core type the thread has been scheduled on;
    /// filled in lazily from the thread's (or its process's) configuration.
    pub sets: HashMap<CoreTypeId, ExperimentSet>,
    pub mode: SamplingMode,
    /// The mode to restore when `enable` toggles back on (spec §4.E
    /// "`ON`/`OFF` on the enable entry toggle the profiling bit"); `mode`
    /// itself goes to `SamplingMode::None` while disabled so the engine's
    /// hooks short-circuit without losing the thread's configuration.
    pub configured_mode: SamplingMode,
    /// TBS-scheduler: ticks since the last sample.
    pub ticks_since_sample: u32,
    /// TBS-scheduler: sample every `nticks` ticks.
    pub nticks: u32,
    /// TBS-user: milliseconds since the last sample.
    pub ms_since_sample: u64,
    /// TBS-user: sample every `timeout_ms` milliseconds (0 = use the
    /// process-global default applied by the caller).
    pub timeout_ms: u64,
    /// Accumulated counts per logical counter since the last sample
    /// (TBS-sched ctx-switch-out bookkeeping, spec §4.D).
    pub accumulated: Vec<u64>,
    /// Saved architectural counter state across an EBS ctx-switch-out,
    /// restored verbatim on ctx-switch-in.
    pub ebs_saved: Option<Vec<u64>>,
    /// Last CPU this thread was observed executing on, for migration
    /// detection.
    pub last_cpu: Option<u32>,
    pub virtual_mask: u32,
    pub ring: Arc<RingBuffer>,
    pub module_data: Option<ModulePrivateData>,
    /// Set once an exit sample has been pushed; guards against double
    /// teardown.
    pub exiting: bool,
}

impl ThreadMonitoringState {
    pub fn new(thread_id: ThreadId, ring: Arc<RingBuffer>) -> Self {
        ThreadMonitoringState {
            thread_id,
            sets: HashMap::new(),
            mode: SamplingMode::None,
            configured_mode: SamplingMode::None,
            ticks_since_sample: 0,
            nticks: 1,
            ms_since_sample: 0,
            timeout_ms: 0,
            accumulated: Vec::new(),
            ebs_saved: None,
            last_cpu: None,
            virtual_mask: 0,
            ring,
            module_data: None,
            exiting: false,
        }
    }

    /// Inherits ring buffer and virtual-counter mask from a thread's
    /// parent, for plain thread creation (`pid_monitor`-style inheritance,
    /// spec §3 "Lifecycle").
    pub fn inherit(thread_id: ThreadId, parent: &ThreadMonitoringState) -> Self {
        let mut state = ThreadMonitoringState::new(thread_id, Arc::clone(&parent.ring));
        state.virtual_mask = parent.virtual_mask;
        state.mode = parent.mode;
        state.configured_mode = parent.configured_mode;
        state.nticks = parent.nticks;
        state.timeout_ms = parent.timeout_ms;
        state
    }
}

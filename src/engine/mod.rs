//! Component D: the monitoring engine (spec §4.D) — the hardest part of
//! the core. Drives per-thread sampling state machines (TBS-scheduler,
//! TBS-user, EBS) against the counter-set model (`crate::counter`) and the
//! sample ring buffer (`crate::sample`), and dispatches every produced
//! sample to the active monitoring module (`crate::module_mgr`).

mod thread_state;

pub use thread_state::{SamplingMode, ThreadMonitoringState};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::counter::ExperimentSet;
use crate::error::PmcResult;
use crate::module_mgr::{ModuleManager, ModulePrivateData};
use crate::pmu::{CoreTypeId, PmuRegistry};
use crate::sample::{RingBuffer, SampleKind, SampleRecord};
use crate::ThreadId;

/// The external collaborator that actually programs hardware counters
/// (spec §4.B "Start/restart/stop" and §4.D). Vendor register encodings
/// are out of scope (spec §1); this is the seam a platform backend
/// implements.
pub trait HwCounters: Send + Sync {
    /// Writes selector then counter then unmasks every event in
    /// `experiment`, clearing its overflow counters.
    fn restart(&self, cpu: u32, experiment: &crate::counter::Experiment);

    /// Writes the inhibit bit (or disables the counter index on ARM) for
    /// every event in `experiment`.
    fn stop(&self, cpu: u32, experiment: &crate::counter::Experiment);

    /// Resets both selector and counter registers to zero.
    fn clear(&self, cpu: u32, experiment: &crate::counter::Experiment);

    /// Reads the raw hardware value of every logical counter in
    /// `experiment`, in logical-index order.
    fn read_counts(&self, cpu: u32, experiment: &crate::counter::Experiment) -> Vec<u64>;

    /// Snapshots architectural counter state ahead of an EBS
    /// context-switch-out.
    fn save_state(&self, cpu: u32, experiment: &crate::counter::Experiment) -> Vec<u64>;

    /// Restores a snapshot taken by `save_state` on EBS context-switch-in.
    fn restore_state(&self, cpu: u32, experiment: &crate::counter::Experiment, saved: &[u64]);
}

/// Per-thread registry plus the collaborators the engine drives against
/// (spec §4.D). Shared by reference from the monitor-process bridge
/// (`crate::bridge`) and system-wide mode (`crate::syswide`).
pub struct Engine<H: HwCounters> {
    hw: H,
    pmu: Arc<PmuRegistry>,
    modules: Arc<ModuleManager>,
    threads: Mutex<HashMap<ThreadId, ThreadMonitoringState>>,
}

impl<H: HwCounters> Engine<H> {
    pub fn new(hw: H, pmu: Arc<PmuRegistry>, modules: Arc<ModuleManager>) -> Self {
        Engine {
            hw,
            pmu,
            modules,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a newly forked thread. `parent` inherits only the ring
    /// buffer when `Some` and this is a thread creation (spec §3
    /// Lifecycle); a fresh process passes `None`.
    pub fn on_fork(
        &self,
        thread: ThreadId,
        ring: Arc<RingBuffer>,
        sets: HashMap<CoreTypeId, ExperimentSet>,
        mode: SamplingMode,
        nticks: u32,
        timeout_ms: u64,
    ) {
        let mut state = ThreadMonitoringState::new(thread, ring);
        state.sets = sets;
        state.mode = mode;
        state.nticks = nticks.max(1);
        state.timeout_ms = timeout_ms;
        if let Some(module) = self.modules.active_module() {
            module.on_fork(thread);
        }
        self.threads.lock().insert(thread, state);
    }

    fn core_type_of(&self, cpu: u32) -> Option<CoreTypeId> {
        self.pmu.core_type_of_cpu(cpu)
    }

    /// Reads hardware, builds a sample of `kind`, dispatches it to the
    /// active module, and pushes it to the thread's ring buffer. Returns
    /// the raw per-logical-counter values read, for callers that need to
    /// fold them into `accumulated`.
    fn emit_sample(
        &self,
        state: &mut ThreadMonitoringState,
        cpu: u32,
        core_type: CoreTypeId,
        kind: SampleKind,
        raw_counts: Vec<u64>,
    ) {
        let experiment = state
            .sets
            .get(&core_type)
            .map(|set| set.current())
            .expect("core type must have an experiment set once sampling starts");

        let width_mask = self
            .pmu
            .pmu_descriptor(core_type)
            .map(|d| d.width_mask)
            .unwrap_or(u64::MAX);

        let mut values = Vec::with_capacity(raw_counts.len());
        for (logical, raw) in raw_counts.iter().enumerate() {
            let real = experiment.real_count(logical as u8, *raw, width_mask);
            let combined = real + state.accumulated.get(logical).copied().unwrap_or(0);
            values.push(combined);
        }

        let mut sample = SampleRecord::new(kind, core_type.0, state.thread_id).with_pmcs(
            experiment.index_in_set() as u8,
            experiment.used_mask(),
            &values,
        );

        if let Some(module) = self.modules.active_module() {
            module.on_new_sample(&mut sample);
        }

        state.ring.push(sample);
        state.accumulated.clear();
    }

    /// Scheduler-tick hook (spec §4.D). Counted per thread; TBS-scheduler
    /// samples every `nticks` ticks and rotates the multiplexing cursor
    /// afterwards. TBS-user additionally honors wall-clock `timeout_ms`
    /// via [`Engine::on_tick_elapsed`]. EBS ignores ticks.
    pub fn on_tick(&self, thread: ThreadId, cpu: u32) {
        let core_type = match self.core_type_of(cpu) {
            Some(ct) => ct,
            None => {
                warn!(cpu, "tick on a cpu with no known core type");
                return;
            }
        };
        let mut threads = self.threads.lock();
        let state = match threads.get_mut(&thread) {
            Some(s) => s,
            None => return,
        };

        self.handle_migration_if_needed(state, cpu, core_type);

        match state.mode {
            SamplingMode::TbsScheduler => {
                state.ticks_since_sample += 1;
                if state.ticks_since_sample >= state.nticks {
                    state.ticks_since_sample = 0;
                    let raw = self.read_current(state, cpu, core_type);
                    self.emit_sample(state, cpu, core_type, SampleKind::Tick, raw);
                    if let Some(set) = state.sets.get_mut(&core_type) {
                        if set.is_multiplexed() {
                            set.rotate();
                        }
                    }
                }
            }
            SamplingMode::TbsUser | SamplingMode::Ebs | SamplingMode::None => {}
        }
    }

    /// Wall-clock tick for TBS-user threads; `elapsed_ms` is the time
    /// since the previous call. Samples and resets the window once
    /// `timeout_ms` has elapsed (spec §4.D).
    pub fn on_tick_elapsed(&self, thread: ThreadId, cpu: u32, elapsed_ms: u64) {
        let core_type = match self.core_type_of(cpu) {
            Some(ct) => ct,
            None => return,
        };
        let mut threads = self.threads.lock();
        let state = match threads.get_mut(&thread) {
            Some(s) => s,
            None => return,
        };
        if state.mode != SamplingMode::TbsUser {
            return;
        }
        self.handle_migration_if_needed(state, cpu, core_type);
        state.ms_since_sample += elapsed_ms;
        if state.ms_since_sample >= state.timeout_ms.max(1) {
            state.ms_since_sample = 0;
            let raw = self.read_current(state, cpu, core_type);
            self.emit_sample(state, cpu, core_type, SampleKind::Tick, raw);
            if let Some(set) = state.sets.get_mut(&core_type) {
                if set.is_multiplexed() {
                    set.rotate();
                }
            }
        }
    }

    fn read_current(
        &self,
        state: &ThreadMonitoringState,
        cpu: u32,
        core_type: CoreTypeId,
    ) -> Vec<u64> {
        let experiment = state
            .sets
            .get(&core_type)
            .map(|set| set.current())
            .expect("experiment set must exist for this core type");
        self.hw.read_counts(cpu, experiment)
    }

    fn handle_migration_if_needed(
        &self,
        state: &mut ThreadMonitoringState,
        cpu: u32,
        core_type: CoreTypeId,
    ) {
        let migrated = match state.last_cpu.and_then(|c| self.core_type_of(c)) {
            Some(previous_ct) if previous_ct != core_type => true,
            _ => false,
        };
        if migrated && matches!(state.mode, SamplingMode::TbsScheduler | SamplingMode::TbsUser) {
            if let Some(previous_ct) = state.last_cpu.and_then(|c| self.core_type_of(c)) {
                if state.sets.contains_key(&previous_ct) {
                    let raw = self.read_current(state, cpu, previous_ct);
                    self.emit_sample(state, cpu, previous_ct, SampleKind::Migration, raw);
                }
            }
            if let Some(set) = state.sets.get_mut(&core_type) {
                set.rewind();
            }
            if let Some(set) = state.sets.get(&core_type) {
                self.hw.restart(cpu, set.current());
            }
        }
        state.last_cpu = Some(cpu);
    }

    /// Context-switch-out hook (spec §4.D). `syswide_active_here` is the
    /// global "system-wide mode owns this CPU" flag (spec §4.F); when set
    /// and this thread is not the system-wide monitor, the hook is a no-op
    /// (per-thread monitoring is dormant on that CPU).
    pub fn on_ctx_switch_out(&self, thread: ThreadId, cpu: u32, syswide_active_here: bool) {
        if syswide_active_here {
            return;
        }
        let mut threads = self.threads.lock();
        let state = match threads.get_mut(&thread) {
            Some(s) => s,
            None => return,
        };
        let core_type = match self.core_type_of(cpu) {
            Some(ct) => ct,
            None => return,
        };
        let experiment = match state.sets.get(&core_type).map(|s| s.current()) {
            Some(e) => e.clone(),
            None => return,
        };

        match state.mode {
            SamplingMode::TbsScheduler => {
                let raw = self.hw.read_counts(cpu, &experiment);
                for (logical, v) in raw.into_iter().enumerate() {
                    let width_mask = self
                        .pmu
                        .pmu_descriptor(core_type)
                        .map(|d| d.width_mask)
                        .unwrap_or(u64::MAX);
                    let real = experiment.real_count(logical as u8, v, width_mask);
                    while state.accumulated.len() <= logical {
                        state.accumulated.push(0);
                    }
                    state.accumulated[logical] += real;
                }
                self.hw.stop(cpu, &experiment);
            }
            SamplingMode::TbsUser => {
                // Same shape as a tick: sample now if the window has
                // closed, emitting a `save` flag to modules via the usual
                // `on_new_sample` path, then stop counters.
                if state.ms_since_sample >= state.timeout_ms.max(1) {
                    state.ms_since_sample = 0;
                    let raw = self.hw.read_counts(cpu, &experiment);
                    self.emit_sample(state, cpu, core_type, SampleKind::Tick, raw);
                }
                self.hw.stop(cpu, &experiment);
            }
            SamplingMode::Ebs => {
                let saved = self.hw.save_state(cpu, &experiment);
                state.ebs_saved = Some(saved);
                self.hw.stop(cpu, &experiment);
            }
            SamplingMode::None => {}
        }
    }

    /// Context-switch-in hook (spec §4.D). Symmetric with ctx-switch-out.
    pub fn on_ctx_switch_in(&self, thread: ThreadId, cpu: u32) {
        let core_type = match self.core_type_of(cpu) {
            Some(ct) => ct,
            None => return,
        };
        let mut threads = self.threads.lock();
        let state = match threads.get_mut(&thread) {
            Some(s) => s,
            None => return,
        };

        match state.mode {
            SamplingMode::Ebs => {
                if let Some(set) = state.sets.get(&core_type) {
                    let experiment = set.current();
                    if let Some(saved) = state.ebs_saved.take() {
                        self.hw.restore_state(cpu, experiment, &saved);
                    } else {
                        self.hw.restart(cpu, experiment);
                    }
                }
                state.last_cpu = Some(cpu);
            }
            SamplingMode::TbsScheduler | SamplingMode::TbsUser => {
                self.handle_migration_if_needed(state, cpu, core_type);
                if let Some(set) = state.sets.get(&core_type) {
                    self.hw.restart(cpu, set.current());
                }
            }
            SamplingMode::None => {
                state.last_cpu = Some(cpu);
            }
        }
    }

    /// Overflow-ISR entry (spec §4.D "Overflow handling"). `overflow_mask`
    /// is the bitmask of physical counters the hardware reports as
    /// overflowed. Never propagates an error to the caller (spec §7):
    /// failures are logged and the thread's counters are stopped, to be
    /// reprogrammed on the next context-switch-in.
    pub fn on_overflow(&self, thread: ThreadId, cpu: u32, overflow_mask: u32) {
        let core_type = match self.core_type_of(cpu) {
            Some(ct) => ct,
            None => {
                error!(cpu, "overflow on cpu with no known core type");
                return;
            }
        };
        let mut threads = self.threads.lock();
        let state = match threads.get_mut(&thread) {
            Some(s) => s,
            None => return,
        };
        if state.mode != SamplingMode::Ebs {
            return;
        }
        let (ebs_fired, ebs_logical) = {
            let set = match state.sets.get_mut(&core_type) {
                Some(s) => s,
                None => return,
            };
            let experiment = set.current_mut();
            let mut ebs_fired = false;
            let mut ebs_logical = None;
            for logical in 0..experiment.len() as u8 {
                let phys = match experiment.logical_to_physical(logical) {
                    Some(p) => p,
                    None => continue,
                };
                if overflow_mask & (1 << phys) == 0 {
                    continue;
                }
                if Some(logical) == experiment.ebs_logical_index() {
                    ebs_fired = true;
                    ebs_logical = Some(logical);
                } else {
                    experiment.record_overflow(logical);
                }
            }
            (ebs_fired, ebs_logical)
        };

        if !ebs_fired {
            return;
        }
        let _ = ebs_logical;

        let experiment = state.sets.get(&core_type).map(|s| s.current()).cloned();
        let experiment = match experiment {
            Some(e) => e,
            None => return,
        };

        let mut raw = self.hw.read_counts(cpu, &experiment);
        // The hardware loaded the reset value into the EBS counter, not
        // zero; add it back so the sample reflects the real window count
        // (spec §4.D).
        if let Some(ebs_idx) = experiment.ebs_logical_index() {
            if let Some(v) = raw.get_mut(ebs_idx as usize) {
                *v = v.wrapping_add(experiment.events()[ebs_idx as usize].reset_value());
            }
        }

        trace!(thread, cpu, "EBS sample produced");
        self.emit_sample(state, cpu, core_type, SampleKind::Ebs, raw);
    }

    /// Task teardown (spec §4.D "On exit"). Emits a final sample (for
    /// TBS modes) or simply marks the thread exiting and lets the ring
    /// buffer's `Arc` drop wake a blocked reader (spec §4.D EBS row "mark
    /// exiting, wake reader" — the reader's poll loop observes the
    /// refcount drop within its wait timeout).
    pub fn on_exit(&self, thread: ThreadId, cpu: u32) -> Option<ModulePrivateData> {
        let core_type = self.core_type_of(cpu);
        let mut threads = self.threads.lock();
        let mut state = match threads.remove(&thread) {
            Some(s) => s,
            None => return None,
        };
        if let Some(module) = self.modules.active_module() {
            module.on_exit(thread);
        }
        if let (Some(core_type), false) = (core_type, state.exiting) {
            if state.sets.contains_key(&core_type) && state.mode != SamplingMode::None {
                let raw = self.read_current(&state, cpu, core_type);
                state.exiting = true;
                self.emit_sample(&mut state, cpu, core_type, SampleKind::Exit, raw);
            }
        }
        state.module_data
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn with_thread_state<R>(&self, thread: ThreadId, f: impl FnOnce(&ThreadMonitoringState) -> R) -> Option<R> {
        self.threads.lock().get(&thread).map(f)
    }

    pub fn is_monitored(&self, thread: ThreadId) -> bool {
        self.threads.lock().contains_key(&thread)
    }

    /// Returns the ring buffer shared by `thread`, `Clone`d so the caller
    /// (the monitor-process bridge) can attach, bumping its reference
    /// count (spec §4.E "Attachment increments the buffer's ref count").
    pub fn ring_of(&self, thread: ThreadId) -> Option<Arc<RingBuffer>> {
        self.threads.lock().get(&thread).map(|s| Arc::clone(&s.ring))
    }

    /// Snapshots `thread`'s experiment sets, for `pid_attach` inheriting
    /// counter configuration alongside the ring buffer (spec §4.E).
    pub fn sets_of(&self, thread: ThreadId) -> Option<HashMap<CoreTypeId, ExperimentSet>> {
        self.threads.lock().get(&thread).map(|s| s.sets.clone())
    }

    /// Toggles the profiling bit for `thread` (spec §4.E `ON`/`OFF`).
    /// Disabling preserves the configured mode so a later `ON` resumes
    /// sampling without reconfiguration.
    pub fn set_enabled(&self, thread: ThreadId, enabled: bool) -> PmcResult<()> {
        let mut threads = self.threads.lock();
        let state = threads.get_mut(&thread).ok_or_else(|| {
            crate::error::PmcError::StateConflict(format!("thread {thread} is not monitored"))
        })?;
        if enabled {
            if state.mode == SamplingMode::None {
                state.mode = state.configured_mode;
            }
        } else if state.mode != SamplingMode::None {
            state.configured_mode = state.mode;
            state.mode = SamplingMode::None;
        }
        Ok(())
    }

    /// Per-thread override of the scheduler-tick sampling interval
    /// (`nticks_t`, spec §6).
    pub fn set_nticks_t(&self, thread: ThreadId, nticks: u32) -> PmcResult<()> {
        let mut threads = self.threads.lock();
        let state = threads.get_mut(&thread).ok_or_else(|| {
            crate::error::PmcError::StateConflict(format!("thread {thread} is not monitored"))
        })?;
        state.nticks = nticks.max(1);
        Ok(())
    }

    /// Per-thread override of the wall-clock sampling window (`timeout`,
    /// spec §6), milliseconds.
    pub fn set_timeout_t(&self, thread: ThreadId, timeout_ms: u64) -> PmcResult<()> {
        let mut threads = self.threads.lock();
        let state = threads.get_mut(&thread).ok_or_else(|| {
            crate::error::PmcError::StateConflict(format!("thread {thread} is not monitored"))
        })?;
        state.timeout_ms = timeout_ms;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::counter::{do_setup_pmcs, parse_experiment_set, Experiment, ExperimentSet};
    use crate::pmu::{init_pmu, CoreTypeId, HwPmu, PmuDescriptor, RawCapability};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct OneCoreType;
    impl HwPmu for OneCoreType {
        fn probe_cpu(&self, _cpu: u32) -> PmcResult<RawCapability> {
            Ok(RawCapability {
                fixed_pmcs: 3,
                gp_pmcs: 4,
                counter_width: 48,
                vendor_id: 1,
                arch: "mock",
            })
        }
        fn install_overflow_handler(&self, _cpu: u32) -> PmcResult<()> {
            Ok(())
        }
        fn remove_overflow_handler(&self, _cpu: u32) {}
        fn recognized_flags(&self, _raw: &RawCapability) -> Vec<&'static str> {
            vec![]
        }
        fn clear_all_counters(&self, _core_type: CoreTypeId) {}
    }

    struct CountingHw {
        cycles: AtomicU64,
    }

    impl HwCounters for CountingHw {
        fn restart(&self, _cpu: u32, experiment: &crate::counter::Experiment) {
            let _ = experiment;
        }
        fn stop(&self, _cpu: u32, _experiment: &crate::counter::Experiment) {}
        fn clear(&self, _cpu: u32, _experiment: &crate::counter::Experiment) {}
        fn read_counts(&self, _cpu: u32, experiment: &crate::counter::Experiment) -> Vec<u64> {
            let c = self.cycles.fetch_add(1000, Ordering::SeqCst);
            vec![c; experiment.len()]
        }
        fn save_state(&self, cpu: u32, experiment: &crate::counter::Experiment) -> Vec<u64> {
            self.read_counts(cpu, experiment)
        }
        fn restore_state(&self, _cpu: u32, _experiment: &crate::counter::Experiment, _saved: &[u64]) {}
    }

    fn build(cores: &[u32]) -> (Arc<PmuRegistry>, PmuDescriptor) {
        let backend = OneCoreType;
        let reg = Arc::new(init_pmu(&backend, cores).unwrap());
        let ct = reg.core_type_of_cpu(cores[0]).unwrap();
        let desc = reg.pmu_descriptor(ct).unwrap().clone();
        (reg, desc)
    }

    fn one_experiment_set(desc: &PmuDescriptor, raw: &str) -> ExperimentSet {
        let raws = parse_experiment_set(raw).unwrap();
        let exps: Vec<Experiment> = raws
            .iter()
            .enumerate()
            .map(|(i, r)| do_setup_pmcs(r, desc, i).unwrap())
            .collect();
        ExperimentSet::new(exps).unwrap()
    }

    #[test]
    fn tbs_scheduler_samples_every_nticks() {
        let (pmu, desc) = build(&[0]);
        let ct = pmu.core_type_of_cpu(0).unwrap();
        let modules = Arc::new(ModuleManager::new());
        let engine = Engine::new(CountingHw { cycles: AtomicU64::new(0) }, pmu, modules);

        let ring = RingBuffer::new(64);
        let mut sets = HashMap::new();
        sets.insert(ct, one_experiment_set(&desc, "pmc0,pmc1"));
        engine.on_fork(1, Arc::clone(&ring), sets, SamplingMode::TbsScheduler, 3, 0);

        for _ in 0..10 {
            engine.on_tick(1, 0);
        }
        let mut count = 0;
        while ring.try_recv().is_some() {
            count += 1;
        }
        assert!(count >= 3, "expected several tick samples, got {count}");
    }

    #[test]
    fn multiplexed_set_alternates_experiment_index() {
        let (pmu, desc) = build(&[0]);
        let ct = pmu.core_type_of_cpu(0).unwrap();
        let modules = Arc::new(ModuleManager::new());
        let engine = Engine::new(CountingHw { cycles: AtomicU64::new(0) }, pmu, modules);

        let ring = RingBuffer::new(64);
        let mut sets = HashMap::new();
        sets.insert(ct, one_experiment_set(&desc, "pmc0,pmc1;pmc2,pmc3"));
        engine.on_fork(1, Arc::clone(&ring), sets, SamplingMode::TbsScheduler, 1, 0);

        for _ in 0..4 {
            engine.on_tick(1, 0);
        }
        let indices: Vec<u8> = std::iter::from_fn(|| ring.try_recv())
            .map(|s| s.experiment_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 0, 1]);
    }

    #[test]
    fn exit_emits_final_sample_and_drops_ring_reference() {
        let (pmu, desc) = build(&[0]);
        let ct = pmu.core_type_of_cpu(0).unwrap();
        let modules = Arc::new(ModuleManager::new());
        let engine = Engine::new(CountingHw { cycles: AtomicU64::new(0) }, pmu, modules);

        let ring = RingBuffer::new(64);
        let mut sets = HashMap::new();
        sets.insert(ct, one_experiment_set(&desc, "pmc0"));
        engine.on_fork(1, Arc::clone(&ring), sets, SamplingMode::TbsScheduler, 1000, 0);

        engine.on_exit(1, 0);
        let sample = ring.try_recv().unwrap();
        assert_eq!(sample.kind, SampleKind::Exit);
        assert_eq!(ring.ref_count(), 1); // only our local `ring` handle remains
    }

    #[test]
    fn ebs_overflow_produces_sample_with_reset_value_restored() {
        let (pmu, desc) = build(&[0]);
        let ct = pmu.core_type_of_cpu(0).unwrap();
        let modules = Arc::new(ModuleManager::new());
        let engine = Engine::new(CountingHw { cycles: AtomicU64::new(0) }, pmu, modules);

        let ring = RingBuffer::new(64);
        let mut sets = HashMap::new();
        sets.insert(ct, one_experiment_set(&desc, "ebs0=100000,pmc0=0x3c"));
        engine.on_fork(1, Arc::clone(&ring), sets, SamplingMode::Ebs, 0, 0);

        // bit 0 overflowed (the EBS counter itself).
        engine.on_overflow(1, 0, 0b1);
        let sample = ring.try_recv().unwrap();
        assert_eq!(sample.kind, SampleKind::Ebs);
        assert!(sample.pmc_values[0] >= 100_000);
    }
}

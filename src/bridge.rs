//! Component E: monitor-process bridge (spec §4.E).
//!
//! Implements the control-surface contract of spec §6 on top of the
//! monitoring engine (`crate::engine`) and system-wide mode
//! (`crate::syswide`): attach/detach semantics, the enable toggle, and
//! per-thread/process-global configuration overrides. Each control-file
//! "open" on the real kernel side maps to one [`MonitorId`] here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::counter::ExperimentSet;
use crate::engine::{Engine, HwCounters};
use crate::error::{PmcError, PmcResult};
use crate::pmu::CoreTypeId;
use crate::sample::RingBuffer;
use crate::syswide::Syswide;
use crate::ThreadId;

pub type MonitorId = u32;

/// Sends the monitored process a termination signal (spec §5 "Cancellation
/// & timeouts": `max_samples` or a timeout makes the core issue `SIGTERM`).
/// Real process signaling is out of scope (spec §1); this is the seam a
/// platform backend implements.
pub trait ProcessSignals: Send + Sync {
    fn send_sigterm(&self, target: ThreadId);
}

struct MonitorState {
    /// `pid_monitor`/`pid_attach` target, if any.
    target: Option<ThreadId>,
    /// Set by `pid_attach`, cleared by `pid_monitor`: whether `max_samples`
    /// exhaustion should detach rather than signal (spec §5).
    attached_config: bool,
    ring: Option<Arc<RingBuffer>>,
    /// Process-global default, applied to new targets this monitor forks
    /// (spec §4.E/§6 `nticks`).
    nticks: u32,
    /// Process-global default ring buffer capacity for new targets
    /// (spec §4.E/§6 `kernel_buffer_size`).
    kernel_buffer_size: usize,
    max_samples: Option<u64>,
    samples_delivered: u64,
}

impl Default for MonitorState {
    fn default() -> Self {
        MonitorState {
            target: None,
            attached_config: false,
            ring: None,
            nticks: 1,
            kernel_buffer_size: 4096,
            max_samples: None,
            samples_delivered: 0,
        }
    }
}

/// The monitor-process bridge (spec §4.E). One instance serves every
/// monitor process talking to the control files of spec §6.
pub struct Bridge<H: HwCounters> {
    engine: Arc<Engine<H>>,
    syswide: Arc<Syswide<H>>,
    signals: Arc<dyn ProcessSignals>,
    monitors: Mutex<HashMap<MonitorId, MonitorState>>,
    next_monitor_id: AtomicU32,
}

impl<H: HwCounters> Bridge<H> {
    pub fn new(
        engine: Arc<Engine<H>>,
        syswide: Arc<Syswide<H>>,
        signals: Arc<dyn ProcessSignals>,
    ) -> Self {
        Bridge {
            engine,
            syswide,
            signals,
            monitors: Mutex::new(HashMap::new()),
            next_monitor_id: AtomicU32::new(0),
        }
    }

    /// Registers a new monitor process, returning the id used on every
    /// other bridge call (models one control-file open's private state).
    pub fn new_monitor(&self) -> MonitorId {
        let id = self.next_monitor_id.fetch_add(1, Ordering::SeqCst);
        self.monitors.lock().insert(id, MonitorState::default());
        id
    }

    fn with_monitor<R>(
        &self,
        monitor: MonitorId,
        f: impl FnOnce(&mut MonitorState) -> PmcResult<R>,
    ) -> PmcResult<R> {
        let mut monitors = self.monitors.lock();
        let state = monitors
            .get_mut(&monitor)
            .ok_or_else(|| PmcError::StateConflict(format!("unknown monitor {monitor}")))?;
        f(state)
    }

    /// `pid_monitor <pid>` (spec §4.E): attach to `target`'s existing ring
    /// buffer without touching its counter configuration. The target must
    /// already be monitored.
    pub fn pid_monitor(&self, monitor: MonitorId, target: ThreadId) -> PmcResult<()> {
        let ring = self.engine.ring_of(target).ok_or_else(|| {
            PmcError::StateConflict(format!("thread {target} is not monitored"))
        })?;
        self.with_monitor(monitor, |state| {
            state.target = Some(target);
            state.attached_config = false;
            state.ring = Some(ring);
            Ok(())
        })
    }

    /// `pid_attach <pid>` (spec §4.E): as `pid_monitor`, additionally
    /// snapshotting the target's counter configuration for the caller.
    pub fn pid_attach(
        &self,
        monitor: MonitorId,
        target: ThreadId,
    ) -> PmcResult<HashMap<CoreTypeId, ExperimentSet>> {
        let ring = self.engine.ring_of(target).ok_or_else(|| {
            PmcError::StateConflict(format!("thread {target} is not monitored"))
        })?;
        let sets = self.engine.sets_of(target).unwrap_or_default();
        self.with_monitor(monitor, |state| {
            state.target = Some(target);
            state.attached_config = true;
            state.ring = Some(ring);
            Ok(())
        })?;
        Ok(sets)
    }

    /// `pid_detach <pid>` (spec §4.E): releases this monitor's reference on
    /// its target's ring buffer, decrementing the refcount the buffer's EOF
    /// semantics depend on (spec §4.C).
    pub fn pid_detach(&self, monitor: MonitorId) -> PmcResult<()> {
        self.with_monitor(monitor, |state| {
            state.target = None;
            state.attached_config = false;
            state.ring = None;
            Ok(())
        })
    }

    pub fn ring_of(&self, monitor: MonitorId) -> Option<Arc<RingBuffer>> {
        self.monitors
            .lock()
            .get(&monitor)
            .and_then(|s| s.ring.clone())
    }

    /// `ON`/`OFF` on the enable entry (spec §4.E): toggles the profiling bit
    /// of the monitor's current target.
    pub fn enable(&self, monitor: MonitorId, enabled: bool) -> PmcResult<()> {
        let target = self.current_target(monitor)?;
        self.engine.set_enabled(target, enabled)
    }

    /// `syswide on` (spec §4.E/§4.F): this monitor becomes the system-wide
    /// owner across `cpus`.
    pub fn syswide_on(
        &self,
        monitor: MonitorId,
        cpus: &[u32],
        sets: &HashMap<CoreTypeId, ExperimentSet>,
    ) -> PmcResult<Arc<RingBuffer>> {
        self.syswide.enable(monitor, cpus, sets)?;
        Ok(self.syswide.ring())
    }

    pub fn syswide_off(&self, monitor: MonitorId) -> PmcResult<()> {
        self.syswide.disable(monitor)
    }

    pub fn syswide_pause(&self, monitor: MonitorId) -> PmcResult<()> {
        self.syswide.pause(monitor)
    }

    pub fn syswide_resume(&self, monitor: MonitorId) -> PmcResult<()> {
        self.syswide.resume(monitor)
    }

    /// `nticks_t N` (spec §4.E/§6): per-thread override on the monitor's
    /// current target.
    pub fn nticks_t(&self, monitor: MonitorId, nticks: u32) -> PmcResult<()> {
        let target = self.current_target(monitor)?;
        self.engine.set_nticks_t(target, nticks)
    }

    /// `timeout MS` (spec §4.E/§6): per-thread wall-clock window override.
    pub fn timeout(&self, monitor: MonitorId, timeout_ms: u64) -> PmcResult<()> {
        let target = self.current_target(monitor)?;
        self.engine.set_timeout_t(target, timeout_ms)
    }

    /// `kernel_buffer_size_t N` (spec §4.E/§6): recorded for the next ring
    /// buffer allocated for this monitor's target — this crate's ring
    /// buffers are fixed-capacity once created (spec §4.C), so the value
    /// only takes effect on the next allocation.
    ///
    /// A size of zero holds no samples at all (spec §9 Open Questions:
    /// reject explicitly rather than silently rounding up to one record,
    /// which would also later trip `RingBuffer::new`'s capacity assert).
    pub fn kernel_buffer_size_t(&self, monitor: MonitorId, size: usize) -> PmcResult<()> {
        if size == 0 {
            return Err(PmcError::ConfigRejected(
                "kernel_buffer_size_t must hold at least one sample record".into(),
            ));
        }
        self.with_monitor(monitor, |state| {
            state.kernel_buffer_size = size;
            Ok(())
        })
    }

    /// `nticks N` (spec §6): process-global default for targets this
    /// monitor creates.
    pub fn set_nticks_default(&self, monitor: MonitorId, nticks: u32) -> PmcResult<()> {
        self.with_monitor(monitor, |state| {
            state.nticks = nticks.max(1);
            Ok(())
        })
    }

    /// `kernel_buffer_size N` (spec §6): process-global default.
    ///
    /// A size of zero holds no samples at all (spec §9 Open Questions:
    /// reject explicitly rather than silently rounding up to one record,
    /// which would also later trip `RingBuffer::new`'s capacity assert).
    pub fn set_kernel_buffer_size_default(&self, monitor: MonitorId, size: usize) -> PmcResult<()> {
        if size == 0 {
            return Err(PmcError::ConfigRejected(
                "kernel_buffer_size must hold at least one sample record".into(),
            ));
        }
        self.with_monitor(monitor, |state| {
            state.kernel_buffer_size = size;
            Ok(())
        })
    }

    pub fn nticks_default(&self, monitor: MonitorId) -> PmcResult<u32> {
        self.with_monitor(monitor, |state| Ok(state.nticks))
    }

    pub fn kernel_buffer_size_default(&self, monitor: MonitorId) -> PmcResult<usize> {
        self.with_monitor(monitor, |state| Ok(state.kernel_buffer_size))
    }

    /// Sets the sample budget that triggers cancellation once exhausted
    /// (spec §5 "Cancellation & timeouts"). Pass `None` to disable.
    pub fn set_max_samples(&self, monitor: MonitorId, max_samples: Option<u64>) -> PmcResult<()> {
        self.with_monitor(monitor, |state| {
            state.max_samples = max_samples;
            state.samples_delivered = 0;
            Ok(())
        })
    }

    fn current_target(&self, monitor: MonitorId) -> PmcResult<ThreadId> {
        self.with_monitor(monitor, |state| {
            state
                .target
                .ok_or_else(|| PmcError::StateConflict("monitor has no attached target".into()))
        })
    }

    /// Called by the monitor's read loop after delivering `n` samples. Once
    /// `max_samples` is exhausted: in attach mode, detaches (this monitor
    /// doesn't own the process) rather than killing it; otherwise sends
    /// `SIGTERM` to the monitored process (spec §5).
    pub fn record_samples_delivered(&self, monitor: MonitorId, n: u64) -> PmcResult<()> {
        let (target, attached, exhausted) = self.with_monitor(monitor, |state| {
            state.samples_delivered += n;
            let exhausted = state
                .max_samples
                .is_some_and(|max| state.samples_delivered >= max);
            Ok((state.target, state.attached_config, exhausted))
        })?;
        if !exhausted {
            return Ok(());
        }
        match (target, attached) {
            (Some(target), true) => {
                info!(monitor, target, "max_samples reached in attach mode, detaching");
                self.pid_detach(monitor)?;
            }
            (Some(target), false) => {
                info!(monitor, target, "max_samples reached, sending SIGTERM");
                self.signals.send_sigterm(target);
            }
            (None, _) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::counter::{do_setup_pmcs, parse_experiment_set, Experiment};
    use crate::engine::SamplingMode;
    use crate::module_mgr::ModuleManager;
    use crate::pmu::{init_pmu, HwPmu, PmuDescriptor, PmuRegistry, RawCapability};
    use crate::sample::SampleKind;
    use parking_lot::Mutex as StdMutex;
    use std::sync::atomic::AtomicU64;

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
        fn restart(&self, _cpu: u32, _experiment: &Experiment) {}
        fn stop(&self, _cpu: u32, _experiment: &Experiment) {}
        fn clear(&self, _cpu: u32, _experiment: &Experiment) {}
        fn read_counts(&self, _cpu: u32, experiment: &Experiment) -> Vec<u64> {
            let c = self.cycles.fetch_add(10, Ordering::SeqCst);
            vec![c; experiment.len()]
        }
        fn save_state(&self, cpu: u32, experiment: &Experiment) -> Vec<u64> {
            self.read_counts(cpu, experiment)
        }
        fn restore_state(&self, _cpu: u32, _experiment: &Experiment, _saved: &[u64]) {}
    }

    #[derive(Default)]
    struct RecordingSignals {
        sigtermed: StdMutex<Vec<ThreadId>>,
    }
    impl ProcessSignals for RecordingSignals {
        fn send_sigterm(&self, target: ThreadId) {
            self.sigtermed.lock().push(target);
        }
    }

    fn build() -> (Arc<PmuRegistry>, CoreTypeId, PmuDescriptor) {
        let backend = OneCoreType;
        let reg = Arc::new(init_pmu(&backend, &[0]).unwrap());
        let ct = reg.core_type_of_cpu(0).unwrap();
        let desc = reg.pmu_descriptor(ct).unwrap().clone();
        (reg, ct, desc)
    }

    fn one_set(desc: &PmuDescriptor, raw: &str) -> ExperimentSet {
        let raws = parse_experiment_set(raw).unwrap();
        let exps: Vec<Experiment> = raws
            .iter()
            .enumerate()
            .map(|(i, r)| do_setup_pmcs(r, desc, i).unwrap())
            .collect();
        ExperimentSet::new(exps).unwrap()
    }

    fn build_bridge() -> (
        Bridge<CountingHw>,
        Arc<Engine<CountingHw>>,
        CoreTypeId,
        PmuDescriptor,
        Arc<RecordingSignals>,
    ) {
        let (pmu, ct, desc) = build();
        let modules = Arc::new(ModuleManager::new());
        let engine = Arc::new(Engine::new(CountingHw { cycles: AtomicU64::new(0) }, Arc::clone(&pmu), modules));
        let syswide = Arc::new(Syswide::new(CountingHw { cycles: AtomicU64::new(0) }, pmu, 64));
        let signals = Arc::new(RecordingSignals::default());
        let bridge = Bridge::new(Arc::clone(&engine), syswide, Arc::clone(&signals) as Arc<dyn ProcessSignals>);
        (bridge, engine, ct, desc, signals)
    }

    #[test]
    fn pid_monitor_attaches_ring_without_config() {
        let (bridge, engine, ct, desc, _sig) = build_bridge();
        let ring = RingBuffer::new(16);
        let mut sets = HashMap::new();
        sets.insert(ct, one_set(&desc, "pmc0"));
        engine.on_fork(7, Arc::clone(&ring), sets, SamplingMode::TbsScheduler, 1, 0);

        let m = bridge.new_monitor();
        bridge.pid_monitor(m, 7).unwrap();
        assert!(bridge.ring_of(m).is_some());
        assert_eq!(ring.ref_count(), 3); // local `ring`, engine's clone, bridge's clone
    }

    #[test]
    fn pid_attach_returns_counter_config() {
        let (bridge, engine, ct, desc, _sig) = build_bridge();
        let ring = RingBuffer::new(16);
        let mut sets = HashMap::new();
        sets.insert(ct, one_set(&desc, "pmc0,pmc1"));
        engine.on_fork(3, ring, sets, SamplingMode::TbsScheduler, 1, 0);

        let m = bridge.new_monitor();
        let got = bridge.pid_attach(m, 3).unwrap();
        assert!(got.contains_key(&ct));
    }

    #[test]
    fn pid_detach_releases_ring_reference() {
        let (bridge, engine, ct, desc, _sig) = build_bridge();
        let ring = RingBuffer::new(16);
        let mut sets = HashMap::new();
        sets.insert(ct, one_set(&desc, "pmc0"));
        engine.on_fork(5, Arc::clone(&ring), sets, SamplingMode::TbsScheduler, 1, 0);

        let m = bridge.new_monitor();
        bridge.pid_monitor(m, 5).unwrap();
        assert_eq!(ring.ref_count(), 3);
        bridge.pid_detach(m).unwrap();
        assert_eq!(ring.ref_count(), 2);
    }

    #[test]
    fn enable_toggle_short_circuits_engine_sampling() {
        let (bridge, engine, ct, desc, _sig) = build_bridge();
        let ring = RingBuffer::new(16);
        let mut sets = HashMap::new();
        sets.insert(ct, one_set(&desc, "pmc0"));
        engine.on_fork(9, Arc::clone(&ring), sets, SamplingMode::TbsScheduler, 1, 0);

        let m = bridge.new_monitor();
        bridge.pid_monitor(m, 9).unwrap();
        bridge.enable(m, false).unwrap();
        engine.on_tick(9, 0);
        assert!(ring.try_recv().is_none(), "disabled thread must not sample");

        bridge.enable(m, true).unwrap();
        engine.on_tick(9, 0);
        let sample = ring.try_recv().unwrap();
        assert_eq!(sample.kind, SampleKind::Tick);
    }

    #[test]
    fn max_samples_in_attach_mode_detaches_instead_of_signaling() {
        let (bridge, engine, ct, desc, sig) = build_bridge();
        let ring = RingBuffer::new(16);
        let mut sets = HashMap::new();
        sets.insert(ct, one_set(&desc, "pmc0"));
        engine.on_fork(11, ring, sets, SamplingMode::TbsScheduler, 1, 0);

        let m = bridge.new_monitor();
        bridge.pid_attach(m, 11).unwrap();
        bridge.set_max_samples(m, Some(2)).unwrap();
        bridge.record_samples_delivered(m, 2).unwrap();

        assert!(bridge.ring_of(m).is_none(), "attach-mode exhaustion should detach");
        assert!(sig.sigtermed.lock().is_empty());
    }

    #[test]
    fn max_samples_in_plain_monitor_mode_sends_sigterm() {
        let (bridge, engine, ct, desc, sig) = build_bridge();
        let ring = RingBuffer::new(16);
        let mut sets = HashMap::new();
        sets.insert(ct, one_set(&desc, "pmc0"));
        engine.on_fork(13, ring, sets, SamplingMode::TbsScheduler, 1, 0);

        let m = bridge.new_monitor();
        bridge.pid_monitor(m, 13).unwrap();
        bridge.set_max_samples(m, Some(1)).unwrap();
        bridge.record_samples_delivered(m, 1).unwrap();

        assert_eq!(sig.sigtermed.lock().as_slice(), &[13]);
    }

    #[test]
    fn zero_kernel_buffer_size_is_rejected() {
        let (bridge, ..) = build_bridge();
        let m = bridge.new_monitor();
        assert!(matches!(
            bridge.set_kernel_buffer_size_default(m, 0),
            Err(PmcError::ConfigRejected(_))
        ));
        assert!(matches!(
            bridge.kernel_buffer_size_t(m, 0),
            Err(PmcError::ConfigRejected(_))
        ));
        // the stored default is untouched by the rejected write
        assert_eq!(bridge.kernel_buffer_size_default(m).unwrap(), 4096);
    }
}

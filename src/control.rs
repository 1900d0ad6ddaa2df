//! Control-file contract (spec §6). Real procfs plumbing is out of scope
//! (spec §1); this models the six `/proc/pmc/*` files as one [`ControlFs`]
//! over [`Bridge`], [`ModuleManager`] and [`PmuRegistry`], with one
//! [`MonitorId`]-keyed session per file open.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::{Bridge, MonitorId};
use crate::counter::{do_setup_pmcs, parse_experiment_set, serialize_experiment_set, Experiment, ExperimentSet, RawExperiment};
use crate::engine::HwCounters;
use crate::error::{PmcError, PmcResult};
use crate::module_mgr::ModuleManager;
use crate::pmu::{CoreTypeId, PmuRegistry};
use crate::sample::SampleRecord;

#[derive(Default)]
struct Session {
    raw_config: String,
    sets: HashMap<CoreTypeId, ExperimentSet>,
    cpumask: Vec<u32>,
    properties_cursor: Option<String>,
    last_enable_line: String,
    /// Module-specific keys written through `config`'s default branch, kept
    /// so `read_config` can play them back through the active module's
    /// `on_read_config` (spec §6 "config" read side, original_source's
    /// per-module key/value enumeration on read).
    module_keys: Vec<String>,
}

/// In-memory backend for the six control files of spec §6, wired to a
/// [`Bridge`] (monitor lifecycle), a [`ModuleManager`] (`mm_manager`) and a
/// [`PmuRegistry`] (`info`, raw-config compilation across core types).
pub struct ControlFs<H: HwCounters> {
    bridge: Arc<Bridge<H>>,
    modules: Arc<ModuleManager>,
    pmu: Arc<PmuRegistry>,
    sessions: Mutex<HashMap<MonitorId, Session>>,
}

impl<H: HwCounters> ControlFs<H> {
    pub fn new(bridge: Arc<Bridge<H>>, modules: Arc<ModuleManager>, pmu: Arc<PmuRegistry>) -> Self {
        ControlFs {
            bridge,
            modules,
            pmu,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Models one control-file `open()`: allocates a monitor id shared by
    /// all six files for this caller.
    pub fn open(&self) -> MonitorId {
        let id = self.bridge.new_monitor();
        self.sessions.lock().insert(id, Session::default());
        id
    }

    fn with_session<R>(&self, monitor: MonitorId, f: impl FnOnce(&mut Session) -> R) -> PmcResult<R> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&monitor)
            .ok_or_else(|| PmcError::StateConflict(format!("unknown monitor {monitor}")))?;
        Ok(f(session))
    }

    /// Compiles a raw configuration string into one [`ExperimentSet`] per
    /// core type known to the PMU registry: an experiment tagged
    /// `coretype=N` binds only to that core type, untagged experiments bind
    /// to every core type (spec §4.B).
    fn compile_raw_config(&self, raw: &str) -> PmcResult<HashMap<CoreTypeId, ExperimentSet>> {
        let parsed = parse_experiment_set(raw)?;
        let mut by_core_type: HashMap<CoreTypeId, Vec<RawExperiment>> = HashMap::new();
        for core_type in self.pmu.core_types() {
            by_core_type.insert(core_type, Vec::new());
        }
        for exp in &parsed {
            match exp.core_type {
                Some(ct) => {
                    by_core_type.entry(CoreTypeId(ct)).or_default().push(exp.clone());
                }
                None => {
                    for bucket in by_core_type.values_mut() {
                        bucket.push(exp.clone());
                    }
                }
            }
        }

        let mut sets = HashMap::new();
        for (core_type, exps) in by_core_type {
            if exps.is_empty() {
                continue;
            }
            let desc = self
                .pmu
                .pmu_descriptor(core_type)
                .ok_or_else(|| PmcError::CapabilityUnsupported(format!("unknown core type {}", core_type.0)))?;
            let compiled: Vec<Experiment> = exps
                .iter()
                .enumerate()
                .map(|(i, r)| do_setup_pmcs(r, desc, i))
                .collect::<PmcResult<_>>()?;
            sets.insert(core_type, ExperimentSet::new(compiled)?);
        }
        Ok(sets)
    }

    // ---- config ----

    /// Writes one line to `config` (spec §6): `nticks N`,
    /// `kernel_buffer_size N`, `nticks_t N`, `timeout MS`,
    /// `kernel_buffer_size_t N`, `[selfcfg] <raw config string>`, or a
    /// module-specific `key value` pair routed to the active module.
    pub fn write_config(&self, monitor: MonitorId, line: &str) -> PmcResult<()> {
        let line = line.trim();
        let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        match cmd {
            "nticks" => {
                let n: u32 = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("nticks expects an integer: {rest:?}")))?;
                self.bridge.set_nticks_default(monitor, n)
            }
            "kernel_buffer_size" => {
                let n: usize = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("kernel_buffer_size expects an integer: {rest:?}")))?;
                self.bridge.set_kernel_buffer_size_default(monitor, n)
            }
            "nticks_t" => {
                let n: u32 = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("nticks_t expects an integer: {rest:?}")))?;
                self.bridge.nticks_t(monitor, n)
            }
            "timeout" => {
                let ms: u64 = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("timeout expects milliseconds: {rest:?}")))?;
                self.bridge.timeout(monitor, ms)
            }
            "kernel_buffer_size_t" => {
                let n: usize = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("kernel_buffer_size_t expects an integer: {rest:?}")))?;
                self.bridge.kernel_buffer_size_t(monitor, n)
            }
            "[selfcfg]" => {
                let sets = self.compile_raw_config(rest)?;
                self.with_session(monitor, |s| {
                    s.raw_config = rest.to_string();
                    s.sets = sets;
                })
            }
            _ => match self.modules.active_module() {
                Some(m) => {
                    m.on_write_config(cmd, rest)?;
                    self.with_session(monitor, |s| {
                        if !s.module_keys.iter().any(|k| k == cmd) {
                            s.module_keys.push(cmd.to_string());
                        }
                    })
                }
                None => Err(PmcError::ConfigRejected(format!("unrecognized config key: {cmd:?}"))),
            },
        }
    }

    /// Reads `config` (spec §6): current globals plus the active module's
    /// summary.
    pub fn read_config(&self, monitor: MonitorId) -> PmcResult<String> {
        let nticks = self.bridge.nticks_default(monitor)?;
        let buf_size = self.bridge.kernel_buffer_size_default(monitor)?;
        let (raw, module_keys) = self.with_session(monitor, |s| {
            let raw = if s.raw_config.is_empty() {
                String::new()
            } else {
                serialize_experiment_set(&parse_experiment_set(&s.raw_config).unwrap_or_default())
            };
            (raw, s.module_keys.clone())
        })?;

        let mut out = format!("nticks={nticks}\nkernel_buffer_size={buf_size}\n");
        if !raw.is_empty() {
            out.push_str(&format!("selfcfg={raw}\n"));
        }
        if let Some(active) = self.modules.active_module() {
            out.push_str(&format!("module={}\n", active.name()));
            for key in &module_keys {
                if let Some(value) = active.on_read_config(key) {
                    out.push_str(&format!("{key}={value}\n"));
                }
            }
        }
        Ok(out)
    }

    // ---- enable ----

    /// Writes `enable` (spec §6): `ON`, `OFF`, or `syswide on|off|pause|resume`.
    pub fn write_enable(&self, monitor: MonitorId, line: &str) -> PmcResult<()> {
        let line = line.trim();
        self.with_session(monitor, |s| s.last_enable_line = line.to_string())?;
        match line {
            "ON" => self.bridge.enable(monitor, true),
            "OFF" => self.bridge.enable(monitor, false),
            "syswide on" => {
                let (cpus, sets) = self.with_session(monitor, |s| (s.cpumask.clone(), s.sets.clone()))?;
                self.bridge.syswide_on(monitor, &cpus, &sets).map(|_| ())
            }
            "syswide off" => self.bridge.syswide_off(monitor),
            "syswide pause" => self.bridge.syswide_pause(monitor),
            "syswide resume" => self.bridge.syswide_resume(monitor),
            other => Err(PmcError::ConfigRejected(format!("unrecognized enable command: {other:?}"))),
        }
    }

    pub fn read_enable(&self, monitor: MonitorId) -> PmcResult<String> {
        self.with_session(monitor, |s| s.last_enable_line.clone())
    }

    // ---- monitor ----

    /// Writes `monitor` (spec §6): `pid_monitor PID`, `pid_attach PID`,
    /// `pid_detach PID`, `ON`, `OFF`, `syswide on|off`.
    pub fn write_monitor(&self, monitor: MonitorId, line: &str) -> PmcResult<()> {
        let line = line.trim();
        let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match cmd {
            "pid_monitor" => {
                let pid: u32 = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("pid_monitor expects a pid: {rest:?}")))?;
                self.bridge.pid_monitor(monitor, pid)
            }
            "pid_attach" => {
                let pid: u32 = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("pid_attach expects a pid: {rest:?}")))?;
                let sets = self.bridge.pid_attach(monitor, pid)?;
                self.with_session(monitor, |s| s.sets = sets)
            }
            "pid_detach" => self.bridge.pid_detach(monitor),
            "ON" => self.bridge.enable(monitor, true),
            "OFF" => self.bridge.enable(monitor, false),
            "syswide on" => {
                let (cpus, sets) = self.with_session(monitor, |s| (s.cpumask.clone(), s.sets.clone()))?;
                self.bridge.syswide_on(monitor, &cpus, &sets).map(|_| ())
            }
            "syswide off" => self.bridge.syswide_off(monitor),
            other => Err(PmcError::ConfigRejected(format!("unrecognized monitor command: {other:?}"))),
        }
    }

    /// Reads `monitor` (spec §6): drains up to `max` samples from this
    /// monitor's current ring buffer. Real mmap delivery is out of scope
    /// (spec §1); this is the non-blocking-poll equivalent.
    pub fn read_monitor(&self, monitor: MonitorId, max: usize) -> PmcResult<Vec<SampleRecord>> {
        let ring = self
            .bridge
            .ring_of(monitor)
            .ok_or_else(|| PmcError::StateConflict(format!("monitor {monitor} has no attached ring")))?;
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            match ring.try_recv() {
                Some(rec) => out.push(rec),
                None => break,
            }
        }
        self.bridge.record_samples_delivered(monitor, out.len() as u64)?;
        Ok(out)
    }

    // ---- properties ----

    /// Writes `properties` (spec §6): `get <key>` sets this open's cursor.
    pub fn write_properties(&self, monitor: MonitorId, line: &str) -> PmcResult<()> {
        let line = line.trim();
        let (cmd, key) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        if cmd != "get" {
            return Err(PmcError::ConfigRejected(format!("unrecognized properties command: {cmd:?}")));
        }
        let key = key.trim().to_string();
        self.with_session(monitor, |s| s.properties_cursor = Some(key))
    }

    /// Reads `properties` (spec §6): the cursor key's value. Keys:
    /// `cpumask`, `pmcmask`, `nr_pmcs`, `nr_experiments`.
    pub fn read_properties(&self, monitor: MonitorId) -> PmcResult<String> {
        let (key, sets, cpumask) = self.with_session(monitor, |s| {
            (s.properties_cursor.clone(), s.sets.clone(), s.cpumask.clone())
        })?;
        let key = key.ok_or_else(|| PmcError::StateConflict("no properties key selected via `get`".into()))?;

        match key.as_str() {
            "cpumask" => Ok(cpumask.iter().map(u32::to_string).collect::<Vec<_>>().join(",")),
            "pmcmask" => {
                let mask = sets.values().map(|s| s.current().used_mask()).fold(0u32, |a, b| a | b);
                Ok(format!("{mask:#x}"))
            }
            "nr_pmcs" => {
                let n: usize = sets.values().map(|s| s.current().len()).sum();
                Ok(n.to_string())
            }
            "nr_experiments" => {
                let n: usize = sets.values().map(|s| s.len()).sum();
                Ok(n.to_string())
            }
            other => Err(PmcError::ConfigRejected(format!("unknown properties key: {other:?}"))),
        }
    }

    /// Sets the CPU mask consulted by `syswide on` (not itself one of the
    /// named `properties` keys on the read path, since spec §6 lists
    /// `cpumask` as read-only per-open state derived from the write side of
    /// `properties`/`monitor`).
    pub fn set_cpumask(&self, monitor: MonitorId, cpus: Vec<u32>) -> PmcResult<()> {
        self.with_session(monitor, |s| s.cpumask = cpus)
    }

    // ---- info ----

    /// Reads `info` (spec §6): human-readable PMU, active-module and
    /// virtual-counter catalog.
    pub fn read_info(&self) -> String {
        let mut out = String::new();
        for core_type in self.pmu.core_types() {
            if let Some(desc) = self.pmu.pmu_descriptor(core_type) {
                out.push_str(&format!(
                    "core_type {}: arch={} fixed={} gp={} width={}\n",
                    core_type.0, desc.arch, desc.fixed_pmcs, desc.gp_pmcs, desc.counter_width
                ));
            }
        }
        match self.modules.active_module() {
            Some(m) => {
                let usage = m.module_counter_usage();
                out.push_str(&format!("active_module={}\n", m.name()));
                out.push_str(&format!("virtual_counters={}\n", usage.virtual_counter_names.join(",")));
            }
            None => out.push_str("active_module=none\n"),
        }
        out
    }

    // ---- mm_manager ----

    /// Writes `mm_manager` (spec §6): `activate N`, `deactivate`,
    /// `reinitialize N`.
    pub fn write_mm_manager(&self, line: &str) -> PmcResult<()> {
        let line = line.trim();
        let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match cmd {
            "activate" => {
                let id: u32 = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("activate expects a module id: {rest:?}")))?;
                self.modules.activate(id).map(|_| ())
            }
            "deactivate" => {
                self.modules.deactivate();
                Ok(())
            }
            "reinitialize" => {
                let id: u32 = rest
                    .parse()
                    .map_err(|_| PmcError::ConfigRejected(format!("reinitialize expects a module id: {rest:?}")))?;
                self.modules.reinitialize(id).map(|_| ())
            }
            other => Err(PmcError::ConfigRejected(format!("unrecognized mm_manager command: {other:?}"))),
        }
    }

    /// Reads `mm_manager` (spec §6): module list with active marker.
    pub fn read_mm_manager(&self) -> String {
        let active = self.modules.active_id();
        self.modules
            .registered()
            .into_iter()
            .map(|(id, name)| {
                let marker = if Some(id) == active { "*" } else { " " };
                format!("{marker} {id} {name}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::{Engine, SamplingMode};
    use crate::module_mgr::{CounterUsage, MonitoringModule};
    use crate::modules::DummyModule;
    use crate::pmu::{init_pmu, HwPmu, PmuDescriptor, RawCapability};
    use crate::sample::RingBuffer;
    use crate::syswide::Syswide;
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

    struct NoSignals;
    impl crate::bridge::ProcessSignals for NoSignals {
        fn send_sigterm(&self, _target: u32) {}
    }

    fn build() -> ControlFs<CountingHw> {
        let backend = OneCoreType;
        let pmu = Arc::new(init_pmu(&backend, &[0]).unwrap());
        let modules = Arc::new(ModuleManager::new());
        let id = modules.register(Arc::new(DummyModule)).unwrap();
        modules.activate(id).unwrap();
        let engine = Arc::new(Engine::new(CountingHw { cycles: AtomicU64::new(0) }, Arc::clone(&pmu), Arc::clone(&modules)));
        let syswide = Arc::new(Syswide::new(CountingHw { cycles: AtomicU64::new(0) }, Arc::clone(&pmu), 64));
        let bridge = Arc::new(Bridge::new(engine, syswide, Arc::new(NoSignals)));
        ControlFs::new(bridge, modules, pmu)
    }

    #[test]
    fn selfcfg_write_then_read_round_trips_through_properties() {
        let cfs = build();
        let m = cfs.open();
        cfs.write_config(m, "[selfcfg] pmc0,pmc1=0xc0").unwrap();
        cfs.write_properties(m, "get nr_pmcs").unwrap();
        assert_eq!(cfs.read_properties(m).unwrap(), "2");
    }

    #[test]
    fn nticks_globals_reflected_in_config_read() {
        let cfs = build();
        let m = cfs.open();
        cfs.write_config(m, "nticks 5").unwrap();
        let out = cfs.read_config(m).unwrap();
        assert!(out.contains("nticks=5"));
    }

    #[test]
    fn mm_manager_marks_active_module() {
        let cfs = build();
        let out = cfs.read_mm_manager();
        assert!(out.contains("* 0 dummy"));
    }

    #[test]
    fn info_reports_core_type_and_active_module() {
        let cfs = build();
        let info = cfs.read_info();
        assert!(info.contains("active_module=dummy"));
        assert!(info.contains("arch=mock"));
    }

    #[test]
    fn monitor_read_drains_targets_ring() {
        let backend = OneCoreType;
        let pmu = Arc::new(init_pmu(&backend, &[0]).unwrap());
        let modules = Arc::new(ModuleManager::new());
        let engine = Arc::new(Engine::new(CountingHw { cycles: AtomicU64::new(0) }, Arc::clone(&pmu), Arc::clone(&modules)));
        let syswide = Arc::new(Syswide::new(CountingHw { cycles: AtomicU64::new(0) }, Arc::clone(&pmu), 64));
        let bridge = Arc::new(Bridge::new(Arc::clone(&engine), syswide, Arc::new(NoSignals)));
        let cfs = ControlFs::new(Arc::clone(&bridge), modules, Arc::clone(&pmu));

        let m = cfs.open();
        cfs.write_config(m, "[selfcfg] pmc0").unwrap();
        let sets = cfs.with_session(m, |s| s.sets.clone()).unwrap();

        let ring = RingBuffer::new(4);
        engine.on_fork(42, Arc::clone(&ring), sets, SamplingMode::TbsScheduler, 1, 0);
        cfs.write_monitor(m, "pid_monitor 42").unwrap();
        engine.on_tick(42, 0);
        engine.on_tick(42, 0);

        let drained = cfs.read_monitor(m, 10).unwrap();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn unrecognized_enable_command_is_rejected() {
        let cfs = build();
        let m = cfs.open();
        assert!(cfs.write_enable(m, "bogus").is_err());
    }

    #[test]
    fn zero_kernel_buffer_size_write_is_rejected() {
        let cfs = build();
        let m = cfs.open();
        assert!(matches!(
            cfs.write_config(m, "kernel_buffer_size 0"),
            Err(PmcError::ConfigRejected(_))
        ));
        assert!(matches!(
            cfs.write_config(m, "kernel_buffer_size_t 0"),
            Err(PmcError::ConfigRejected(_))
        ));
    }

    struct EchoModule;
    impl MonitoringModule for EchoModule {
        fn name(&self) -> &str {
            "echo"
        }
        fn module_counter_usage(&self) -> CounterUsage {
            CounterUsage::default()
        }
        fn on_write_config(&self, _key: &str, _value: &str) -> PmcResult<()> {
            Ok(())
        }
        fn on_read_config(&self, key: &str) -> Option<String> {
            Some(format!("echo-{key}"))
        }
    }

    #[test]
    fn module_specific_config_keys_round_trip_through_read_config() {
        let backend = OneCoreType;
        let pmu = Arc::new(init_pmu(&backend, &[0]).unwrap());
        let modules = Arc::new(ModuleManager::new());
        let id = modules.register(Arc::new(EchoModule)).unwrap();
        modules.activate(id).unwrap();
        let engine = Arc::new(Engine::new(CountingHw { cycles: AtomicU64::new(0) }, Arc::clone(&pmu), Arc::clone(&modules)));
        let syswide = Arc::new(Syswide::new(CountingHw { cycles: AtomicU64::new(0) }, Arc::clone(&pmu), 64));
        let bridge = Arc::new(Bridge::new(engine, syswide, Arc::new(NoSignals)));
        let cfs = ControlFs::new(bridge, modules, pmu);

        let m = cfs.open();
        cfs.write_config(m, "sample_period 100").unwrap();
        let out = cfs.read_config(m).unwrap();
        assert!(out.contains("sample_period=echo-sample_period"));
    }
}

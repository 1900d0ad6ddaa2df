//! Component F: system-wide mode (spec §4.F).
//!
//! At most one monitor owns system-wide mode at a time. Enabling installs
//! counters on every requested CPU and arms a per-CPU timer (driven from
//! outside this module — see [`Syswide::on_timer_tick`]) that produces one
//! sample per CPU per interval into a single shared ring buffer. Per-thread
//! monitoring on a CPU is dormant while system-wide mode owns it; the
//! engine's context-switch hooks consult [`Syswide::is_active_on`] to decide
//! whether to defer (spec §4.D "If system-wide mode is active on this CPU
//! ... do nothing").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::counter::ExperimentSet;
use crate::engine::HwCounters;
use crate::error::{PmcError, PmcResult};
use crate::pmu::{CoreTypeId, PmuRegistry};
use crate::sample::{RingBuffer, SampleKind, SampleRecord};

pub type MonitorId = u32;

struct CpuState {
    core_type: CoreTypeId,
    set: ExperimentSet,
}

struct Inner {
    owner: Option<MonitorId>,
    paused: bool,
    cpus: HashMap<u32, CpuState>,
}

/// System-wide monitoring owner and per-CPU sampling state (spec §4.F).
pub struct Syswide<H: HwCounters> {
    hw: H,
    pmu: Arc<PmuRegistry>,
    ring: Arc<RingBuffer>,
    state: Mutex<Inner>,
}

impl<H: HwCounters> Syswide<H> {
    pub fn new(hw: H, pmu: Arc<PmuRegistry>, ring_capacity: usize) -> Self {
        Syswide {
            hw,
            pmu,
            ring: RingBuffer::new(ring_capacity),
            state: Mutex::new(Inner {
                owner: None,
                paused: false,
                cpus: HashMap::new(),
            }),
        }
    }

    /// The shared ring buffer every CPU's samples land in. Cloning bumps
    /// its reference count the same way attaching to a per-thread buffer
    /// does (spec §4.C).
    pub fn ring(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    /// Enables system-wide mode for `monitor` across `cpus`, each bound to
    /// the experiment set for its core type. Fails with `StateConflict` if
    /// another monitor already owns the mode (spec §4.F "At most one
    /// monitor process at a time").
    pub fn enable(
        &self,
        monitor: MonitorId,
        cpus: &[u32],
        sets: &HashMap<CoreTypeId, ExperimentSet>,
    ) -> PmcResult<()> {
        let mut state = self.state.lock();
        if let Some(owner) = state.owner {
            if owner != monitor {
                return Err(PmcError::StateConflict(
                    "system-wide mode is already owned by another monitor".into(),
                ));
            }
            return Ok(());
        }

        let mut installed = HashMap::new();
        for &cpu in cpus {
            let core_type = self
                .pmu
                .core_type_of_cpu(cpu)
                .ok_or_else(|| PmcError::CapabilityUnsupported(format!("unknown cpu {cpu}")))?;
            let set = sets
                .get(&core_type)
                .ok_or_else(|| {
                    PmcError::ConfigRejected(format!(
                        "no experiment set configured for core type {}",
                        core_type.0
                    ))
                })?
                .clone();
            self.hw.restart(cpu, set.current());
            installed.insert(cpu, CpuState { core_type, set });
        }

        info!(monitor, cpus = installed.len(), "system-wide mode enabled");
        state.owner = Some(monitor);
        state.paused = false;
        state.cpus = installed;
        Ok(())
    }

    /// Disables system-wide mode, stopping every installed counter. Only
    /// the owning monitor may do so.
    pub fn disable(&self, monitor: MonitorId) -> PmcResult<()> {
        let mut state = self.state.lock();
        self.require_owner(&state, monitor)?;
        for (&cpu, cpu_state) in state.cpus.iter() {
            self.hw.stop(cpu, cpu_state.set.current());
        }
        state.owner = None;
        state.paused = false;
        state.cpus.clear();
        Ok(())
    }

    /// Stops sample production but keeps the per-CPU configuration
    /// installed, so `resume` needs no reconfiguration (spec §4.F).
    pub fn pause(&self, monitor: MonitorId) -> PmcResult<()> {
        let mut state = self.state.lock();
        self.require_owner(&state, monitor)?;
        state.paused = true;
        Ok(())
    }

    pub fn resume(&self, monitor: MonitorId) -> PmcResult<()> {
        let mut state = self.state.lock();
        self.require_owner(&state, monitor)?;
        state.paused = false;
        Ok(())
    }

    fn require_owner(&self, state: &Inner, monitor: MonitorId) -> PmcResult<()> {
        match state.owner {
            Some(owner) if owner == monitor => Ok(()),
            Some(_) => Err(PmcError::StateConflict(
                "caller does not own system-wide mode".into(),
            )),
            None => Err(PmcError::StateConflict(
                "system-wide mode is not enabled".into(),
            )),
        }
    }

    /// Whether system-wide mode currently owns `cpu` — consulted by the
    /// engine's context-switch hooks to decide whether per-thread
    /// monitoring on that CPU is dormant (spec §4.D).
    pub fn is_active_on(&self, cpu: u32) -> bool {
        let state = self.state.lock();
        state.owner.is_some() && !state.paused && state.cpus.contains_key(&cpu)
    }

    /// Per-CPU timer hook: reads counters, pushes one sample, rotates the
    /// multiplexing cursor if configured. A no-op when disabled, paused, or
    /// `cpu` is not installed.
    pub fn on_timer_tick(&self, cpu: u32) {
        let mut state = self.state.lock();
        if state.owner.is_none() || state.paused {
            return;
        }
        let width_mask = state
            .cpus
            .get(&cpu)
            .and_then(|c| self.pmu.pmu_descriptor(c.core_type))
            .map(|d| d.width_mask)
            .unwrap_or(u64::MAX);
        let cpu_state = match state.cpus.get_mut(&cpu) {
            Some(c) => c,
            None => {
                warn!(cpu, "system-wide timer tick on an uninstalled cpu");
                return;
            }
        };
        let experiment = cpu_state.set.current();
        let raw = self.hw.read_counts(cpu, experiment);
        let values: Vec<u64> = raw
            .iter()
            .enumerate()
            .map(|(logical, &v)| experiment.real_count(logical as u8, v, width_mask))
            .collect();
        let sample = SampleRecord::new(SampleKind::Tick, cpu_state.core_type.0, 0).with_pmcs(
            experiment.index_in_set() as u8,
            experiment.used_mask(),
            &values,
        );
        self.ring.push(sample);
        if cpu_state.set.is_multiplexed() {
            cpu_state.set.rotate();
        }
    }
}

//! Experiment / experiment-set data structures (spec §3) and the
//! `do_setup_pmcs` operation (spec §4.B). Setup only fills data structures;
//! it never touches hardware — that is the monitoring engine's job
//! (`crate::engine`).

use arrayvec::ArrayVec;

use super::config::RawExperiment;
use super::MAX_COUNTERS;
use crate::error::{PmcError, PmcResult};
use crate::pmu::{CoreTypeId, PmuDescriptor};

/// A single low-level event bound to one physical counter (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LowLevelEvent {
    /// A general-purpose counter: event-selector bitfield + counter index
    /// + reset value.
    General {
        selector: u64,
        counter_idx: u8,
        reset_value: u64,
    },
    /// A fixed-function counter: fixed-counter index + ctrl bitfield +
    /// reset value.
    Fixed {
        fixed_idx: u8,
        ctrl: u64,
        reset_value: u64,
    },
}

impl LowLevelEvent {
    pub fn reset_value(&self) -> u64 {
        match *self {
            LowLevelEvent::General { reset_value, .. } => reset_value,
            LowLevelEvent::Fixed { reset_value, .. } => reset_value,
        }
    }

    pub fn physical_index(&self) -> u8 {
        match *self {
            LowLevelEvent::General { counter_idx, .. } => counter_idx,
            LowLevelEvent::Fixed { fixed_idx, .. } => fixed_idx,
        }
    }
}

fn build_selector(cfg: &super::config::CounterCfg, base: u64) -> u64 {
    // The real bit layout is vendor-specific and out of scope (spec §1);
    // this folds the declarative fields into one opaque u64 deterministically,
    // which is all setup/overflow accounting depends on.
    let mut sel = base;
    if let Some(u) = cfg.umask {
        sel |= (u & 0xff) << 8;
    }
    if let Some(c) = cfg.cmask {
        sel |= (c & 0xff) << 16;
    }
    if let Some(e) = cfg.edge {
        sel |= (e & 1) << 24;
    }
    if let Some(i) = cfg.inv {
        sel |= (i & 1) << 25;
    }
    if let Some(a) = cfg.any {
        sel |= (a & 1) << 26;
    }
    if cfg.usr.unwrap_or(true) {
        sel |= 1 << 27;
    }
    if cfg.os.unwrap_or(true) {
        sel |= 1 << 28;
    }
    sel
}

fn build_ctrl(cfg: &super::config::CounterCfg) -> u64 {
    let mut ctrl = 0u64;
    if cfg.usr.unwrap_or(true) {
        ctrl |= 1 << 0;
    }
    if cfg.os.unwrap_or(true) {
        ctrl |= 1 << 1;
    }
    ctrl
}

/// An ordered collection of up to [`MAX_COUNTERS`] low-level events, plus
/// the bookkeeping the engine needs to program and read it back (spec §3).
#[derive(Clone, Debug)]
pub struct Experiment {
    events: ArrayVec<LowLevelEvent, MAX_COUNTERS>,
    /// Bitmask of physical counters this experiment uses.
    used_mask: u32,
    /// logical index -> physical counter index.
    log_to_phys: ArrayVec<u8, MAX_COUNTERS>,
    /// physical counter index -> logical index, when used.
    phys_to_log: [Option<u8>; MAX_COUNTERS],
    /// Logical index of the EBS-armed event, if any.
    ebs_idx: Option<u8>,
    /// Index of this experiment within its owning set.
    index_in_set: usize,
    /// Per-event overflow counter, incremented by the engine on each
    /// non-EBS overflow (spec §4.D).
    overflow_counts: ArrayVec<u64, MAX_COUNTERS>,
    /// Set until the hardware has been programmed at least once.
    needs_setup: bool,
    core_type: Option<CoreTypeId>,
}

impl Experiment {
    pub fn events(&self) -> &[LowLevelEvent] {
        &self.events
    }

    pub fn used_mask(&self) -> u32 {
        self.used_mask
    }

    pub fn logical_to_physical(&self, logical: u8) -> Option<u8> {
        self.log_to_phys.get(logical as usize).copied()
    }

    pub fn physical_to_logical(&self, physical: u8) -> Option<u8> {
        self.phys_to_log.get(physical as usize).copied().flatten()
    }

    pub fn ebs_logical_index(&self) -> Option<u8> {
        self.ebs_idx
    }

    pub fn is_ebs_armed(&self) -> bool {
        self.ebs_idx.is_some()
    }

    pub fn index_in_set(&self) -> usize {
        self.index_in_set
    }

    pub fn core_type(&self) -> Option<CoreTypeId> {
        self.core_type
    }

    pub fn needs_setup(&self) -> bool {
        self.needs_setup
    }

    pub fn mark_setup_done(&mut self) {
        self.needs_setup = false;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn overflow_count(&self, logical: u8) -> u64 {
        self.overflow_counts.get(logical as usize).copied().unwrap_or(0)
    }

    /// Increments the overflow counter for `logical`, used by the engine's
    /// overflow handler for every non-EBS counter in the ISR's bitmask
    /// (spec §4.D "Overflow handling").
    pub fn record_overflow(&mut self, logical: u8) {
        if let Some(c) = self.overflow_counts.get_mut(logical as usize) {
            *c += 1;
        }
    }

    /// Clears every per-event overflow counter. Called on restart (spec
    /// §4.B "Restart clears the per-event overflow counter").
    pub fn clear_overflow_counts(&mut self) {
        for c in self.overflow_counts.iter_mut() {
            *c = 0;
        }
    }

    /// Reconstructs the real (un-wrapped) count from a raw hardware read,
    /// per spec §4.D: `real = sampled + overflows*(width_mask+1)`.
    pub fn real_count(&self, logical: u8, sampled: u64, width_mask: u64) -> u64 {
        let overflows = self.overflow_count(logical);
        sampled.wrapping_add(overflows.wrapping_mul(width_mask.wrapping_add(1)))
    }
}

/// Fills an [`Experiment`] from a parsed [`RawExperiment`] without touching
/// hardware (spec §4.B). Idempotent: calling it twice with the same inputs
/// produces an equal `Experiment` (module up `needs_setup`, which always
/// starts `true`).
pub fn do_setup_pmcs(
    raw: &RawExperiment,
    pmu: &PmuDescriptor,
    index_in_set: usize,
) -> PmcResult<Experiment> {
    if raw.counters.is_empty() {
        return Err(PmcError::ConfigRejected("experiment has no counters".into()));
    }
    if raw.counters.len() > MAX_COUNTERS {
        return Err(PmcError::ConfigRejected(format!(
            "experiment uses {} counters, more than the {} available",
            raw.counters.len(),
            MAX_COUNTERS
        )));
    }
    if raw.counters.len() > pmu.total_pmcs() as usize {
        return Err(PmcError::CapabilityUnsupported(format!(
            "experiment needs {} counters but core type only has {}",
            raw.counters.len(),
            pmu.total_pmcs()
        )));
    }

    let mut events = ArrayVec::new();
    let mut log_to_phys = ArrayVec::new();
    let mut phys_to_log = [None; MAX_COUNTERS];
    let mut overflow_counts = ArrayVec::new();
    let mut used_mask = 0u32;
    let mut ebs_logical_idx = None;

    for (log_idx, (&phys, cfg)) in raw.counters.iter().enumerate() {
        if phys as usize >= MAX_COUNTERS {
            return Err(PmcError::ConfigRejected(format!(
                "counter index {phys} out of range"
            )));
        }
        let is_ebs = raw.ebs.map(|(i, _)| i) == Some(phys);
        let reset_value = if is_ebs {
            let count = raw.ebs.expect("checked above").1;
            count.wrapping_neg() & pmu.width_mask
        } else {
            0
        };

        let event = match cfg.selector {
            Some(sel) => LowLevelEvent::General {
                selector: build_selector(cfg, sel),
                counter_idx: phys,
                reset_value,
            },
            None => LowLevelEvent::Fixed {
                fixed_idx: phys,
                ctrl: build_ctrl(cfg),
                reset_value,
            },
        };

        events.push(event);
        log_to_phys.push(phys);
        phys_to_log[phys as usize] = Some(log_idx as u8);
        overflow_counts.push(0);
        used_mask |= 1 << phys;
        if is_ebs {
            ebs_logical_idx = Some(log_idx as u8);
        }
    }

    Ok(Experiment {
        events,
        used_mask,
        log_to_phys,
        phys_to_log,
        ebs_idx: ebs_logical_idx,
        index_in_set,
        overflow_counts,
        needs_setup: true,
        core_type: raw.core_type.map(CoreTypeId),
    })
}

/// A restartable cyclic sequence of experiments for multiplexing
/// (spec §3). At most one experiment per core type is "current" at any
/// instant; the engine enforces that by owning one `ExperimentSet` per
/// core type in [`crate::engine::ThreadMonitoringState`].
#[derive(Clone, Debug)]
pub struct ExperimentSet {
    experiments: Vec<Experiment>,
    cursor: usize,
}

impl ExperimentSet {
    /// Builds a set, rejecting EBS combined with multiplexing (spec §4.B:
    /// "An EBS-armed experiment MUST be the only experiment in its set").
    pub fn new(experiments: Vec<Experiment>) -> PmcResult<Self> {
        if experiments.is_empty() {
            return Err(PmcError::ConfigRejected("empty experiment set".into()));
        }
        let ebs_count = experiments.iter().filter(|e| e.is_ebs_armed()).count();
        if ebs_count > 0 && experiments.len() > 1 {
            return Err(PmcError::ConfigRejected(
                "EBS-armed experiment must be the only experiment in its set".into(),
            ));
        }
        Ok(ExperimentSet {
            experiments,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    pub fn is_multiplexed(&self) -> bool {
        self.experiments.len() > 1
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> &Experiment {
        &self.experiments[self.cursor]
    }

    pub fn current_mut(&mut self) -> &mut Experiment {
        &mut self.experiments[self.cursor]
    }

    /// Advances the cursor to the next experiment, wrapping around.
    /// No-op (but still returns the sole experiment) for a non-multiplexed
    /// set.
    pub fn rotate(&mut self) -> &Experiment {
        self.cursor = (self.cursor + 1) % self.experiments.len();
        self.current()
    }

    /// Rewinds the cursor to the set's start, used on migration to a new
    /// core type (spec §4.D).
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::counter::parse_experiment_set;
    use crate::pmu::RawCapability;

    fn test_pmu() -> PmuDescriptor {
        PmuDescriptor::new(
            RawCapability {
                fixed_pmcs: 3,
                gp_pmcs: 4,
                counter_width: 48,
                vendor_id: 1,
                arch: "mock",
            },
            vec![],
        )
    }

    #[test]
    fn setup_round_trips_logical_physical_mapping() {
        let pmu = test_pmu();
        let raw = &parse_experiment_set("pmc0,pmc1=0xc0,pmc3=0x10").unwrap()[0];
        let exp = do_setup_pmcs(raw, &pmu, 0).unwrap();
        for k in 0..exp.len() as u8 {
            let phys = exp.logical_to_physical(k).unwrap();
            assert_eq!(exp.physical_to_logical(phys), Some(k));
        }
        assert_eq!(exp.used_mask().count_ones() as usize, exp.len());
    }

    #[test]
    fn ebs_reset_value_is_twos_complement_of_count() {
        let pmu = test_pmu();
        let raw = &parse_experiment_set("ebs0=100000,pmc0=0x3c").unwrap()[0];
        let exp = do_setup_pmcs(raw, &pmu, 0).unwrap();
        let logical = exp.ebs_logical_index().unwrap();
        let reset = exp.events()[logical as usize].reset_value();
        assert_eq!(reset, (100_000u64.wrapping_neg()) & pmu.width_mask);
    }

    #[test]
    fn rejects_experiment_wider_than_pmu() {
        let pmu = PmuDescriptor::new(
            RawCapability {
                fixed_pmcs: 0,
                gp_pmcs: 1,
                counter_width: 48,
                vendor_id: 1,
                arch: "mock",
            },
            vec![],
        );
        let raw = &parse_experiment_set("pmc0,pmc1").unwrap()[0];
        assert!(do_setup_pmcs(raw, &pmu, 0).is_err());
    }

    #[test]
    fn overflow_accounting_matches_spec_formula() {
        let pmu = test_pmu();
        let raw = &parse_experiment_set("pmc0=0x3c").unwrap()[0];
        let mut exp = do_setup_pmcs(raw, &pmu, 0).unwrap();
        for _ in 0..3 {
            exp.record_overflow(0);
        }
        let real = exp.real_count(0, 42, pmu.width_mask);
        assert_eq!(real, 42 + 3 * (pmu.width_mask + 1));
    }

    #[test]
    fn experiment_set_rejects_ebs_plus_multiplexing() {
        let pmu = test_pmu();
        let raws = parse_experiment_set("ebs0=100,pmc0=0x3c").unwrap();
        let e0 = do_setup_pmcs(&raws[0], &pmu, 0).unwrap();
        let raws2 = parse_experiment_set("pmc1=0x1").unwrap();
        let e1 = do_setup_pmcs(&raws2[0], &pmu, 1).unwrap();
        assert!(ExperimentSet::new(vec![e0, e1]).is_err());
    }

    #[test]
    fn experiment_set_rotates_and_rewinds() {
        let pmu = test_pmu();
        let raws = parse_experiment_set("pmc0;pmc1").unwrap();
        let e0 = do_setup_pmcs(&raws[0], &pmu, 0).unwrap();
        let e1 = do_setup_pmcs(&raws[1], &pmu, 1).unwrap();
        let mut set = ExperimentSet::new(vec![e0, e1]).unwrap();
        assert_eq!(set.cursor(), 0);
        set.rotate();
        assert_eq!(set.cursor(), 1);
        set.rotate();
        assert_eq!(set.cursor(), 0);
        set.rotate();
        set.rewind();
        assert_eq!(set.cursor(), 0);
    }
}

//! Component A: PMU capability probe.
//!
//! Owns the one-time discovery of the hardware PMU(s) present on the
//! machine, grouping online CPUs into *core types* (spec §3, §4.A). The
//! actual register encodings are vendor-specific and out of scope for this
//! crate (spec §1); [`HwPmu`] is the seam a platform backend implements.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::{PmcError, PmcResult};

/// Equivalence class of CPUs sharing an identical [`PmuDescriptor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreTypeId(pub u16);

/// What [`HwPmu::probe_cpu`] reports for one CPU, before core types are
/// derived by hashing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawCapability {
    pub fixed_pmcs: u8,
    pub gp_pmcs: u8,
    pub counter_width: u8,
    /// Vendor/microarchitecture identifier, opaque to the core; only used
    /// to distinguish core types that otherwise share counter layout (e.g.
    /// big.LITTLE pairs with identical counter counts but different PMUs).
    pub vendor_id: u64,
    pub arch: &'static str,
}

/// Immutable, per-core-type hardware description (spec §3).
///
/// One descriptor exists per detected core type; every online CPU maps to
/// exactly one descriptor. Never mutated after [`init_pmu`] returns.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PmuDescriptor {
    pub fixed_pmcs: u8,
    pub gp_pmcs: u8,
    pub counter_width: u8,
    /// `(1 << counter_width) - 1`, the canonical "modulo register" mask
    /// used everywhere counters are arithmeticized (overflow accounting,
    /// EBS reset-value computation).
    pub width_mask: u64,
    pub arch: String,
    /// Tokens the raw-configuration parser (`crate::counter::config`)
    /// accepts for experiments bound to this core type, beyond the
    /// universally-recognized set.
    pub recognized_flags: Vec<&'static str>,
}

impl PmuDescriptor {
    pub fn new(raw: RawCapability, recognized_flags: Vec<&'static str>) -> Self {
        let width_mask = if raw.counter_width >= 64 {
            u64::MAX
        } else {
            (1u64 << raw.counter_width) - 1
        };
        PmuDescriptor {
            fixed_pmcs: raw.fixed_pmcs,
            gp_pmcs: raw.gp_pmcs,
            counter_width: raw.counter_width,
            width_mask,
            arch: raw.arch.to_string(),
            recognized_flags,
        }
    }

    /// Total number of physical counters (fixed + general-purpose), the
    /// bound on experiment size (spec §3 "up to N low-level events, N = max
    /// physical counters").
    pub fn total_pmcs(&self) -> u8 {
        self.fixed_pmcs + self.gp_pmcs
    }
}

/// The platform-specific collaborator this crate never implements for real
/// hardware (spec §1): vendor register encodings, overflow-interrupt/NMI
/// wiring, and the "clear all counters" reset sequence.
pub trait HwPmu: Send + Sync {
    /// Query the PMU visible from `cpu`. Called once per online CPU during
    /// [`init_pmu`].
    fn probe_cpu(&self, cpu: u32) -> PmcResult<RawCapability>;

    /// Install the overflow-interrupt (or NMI) handler on `cpu`.
    fn install_overflow_handler(&self, cpu: u32) -> PmcResult<()>;

    /// Undo [`HwPmu::install_overflow_handler`]; used both on normal
    /// module unload and to unwind a partially-completed probe.
    fn remove_overflow_handler(&self, cpu: u32);

    /// Flags recognized by the raw-config parser in addition to the
    /// universal token set, for a given core type's vendor.
    fn recognized_flags(&self, raw: &RawCapability) -> Vec<&'static str>;

    /// Write the defined reset sequence to every selector/counter register
    /// reachable from `cpu`'s core type.
    fn clear_all_counters(&self, core_type: CoreTypeId);
}

/// Result of [`init_pmu`]: one descriptor per core type plus the CPU→core
/// type map.
#[derive(Debug)]
pub struct PmuRegistry {
    descriptors: Vec<PmuDescriptor>,
    cpu_to_core_type: HashMap<u32, CoreTypeId>,
}

impl PmuRegistry {
    pub fn pmu_descriptor(&self, core_type: CoreTypeId) -> Option<&PmuDescriptor> {
        self.descriptors.get(core_type.0 as usize)
    }

    pub fn core_type_of_cpu(&self, cpu: u32) -> Option<CoreTypeId> {
        self.cpu_to_core_type.get(&cpu).copied()
    }

    pub fn core_types(&self) -> impl Iterator<Item = CoreTypeId> + '_ {
        (0..self.descriptors.len() as u16).map(CoreTypeId)
    }

    pub fn clear_all_counters(&self, backend: &dyn HwPmu, core_type: CoreTypeId) {
        backend.clear_all_counters(core_type);
    }
}

fn capability_key(raw: &RawCapability) -> (u8, u8, u8, u64) {
    (raw.fixed_pmcs, raw.gp_pmcs, raw.counter_width, raw.vendor_id)
}

/// Probe every CPU in `online_cpus`, group them into core types by hashing
/// `(fixed_pmcs, gp_pmcs, width, vendor_id)`, and install the overflow
/// handler on each. Rolls back (deregisters already-initialized CPUs) and
/// fails the whole probe if any per-CPU step fails, per spec §4.A.
pub fn init_pmu(backend: &dyn HwPmu, online_cpus: &[u32]) -> PmcResult<PmuRegistry> {
    if online_cpus.is_empty() {
        return Err(PmcError::CapabilityUnsupported(
            "no online CPUs reported".into(),
        ));
    }

    let mut key_to_core_type: HashMap<(u8, u8, u8, u64), CoreTypeId> = HashMap::new();
    let mut descriptors = Vec::new();
    let mut cpu_to_core_type = HashMap::new();
    let mut installed: Vec<u32> = Vec::new();

    for &cpu in online_cpus {
        let raw = match backend.probe_cpu(cpu) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(cpu, error = %e, "PMU probe failed, rolling back");
                for done in installed {
                    backend.remove_overflow_handler(done);
                }
                return Err(PmcError::CapabilityUnsupported(format!(
                    "probe failed on cpu {cpu}: {e}"
                )));
            }
        };

        let key = capability_key(&raw);
        let core_type = *key_to_core_type.entry(key).or_insert_with(|| {
            let id = CoreTypeId(descriptors.len() as u16);
            let flags = backend.recognized_flags(&raw);
            descriptors.push(PmuDescriptor::new(raw, flags));
            debug!(core_type = id.0, ?raw, "new core type discovered");
            id
        });

        if let Err(e) = backend.install_overflow_handler(cpu) {
            warn!(cpu, error = %e, "overflow handler install failed, rolling back");
            for done in installed {
                backend.remove_overflow_handler(done);
            }
            return Err(PmcError::CapabilityUnsupported(format!(
                "overflow handler install failed on cpu {cpu}: {e}"
            )));
        }

        cpu_to_core_type.insert(cpu, core_type);
        installed.push(cpu);
    }

    info!(
        core_types = descriptors.len(),
        cpus = online_cpus.len(),
        "PMU probe complete"
    );

    Ok(PmuRegistry {
        descriptors,
        cpu_to_core_type,
    })
}

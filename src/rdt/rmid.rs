//! RMID pool and memory-bandwidth scaling (spec §4.I).

use std::collections::{HashMap, VecDeque};

use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::debug;

use crate::error::{PmcError, PmcResult};

pub type Rmid = u32;

/// Free-list discipline for [`RmidPool::get_rmid`] (spec §4.I).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmidPolicy {
    Fifo,
    Lifo,
    Random,
}

/// What the platform reports at init (spec §4.I "On init, query the
/// platform..."). Vendor MSR/CPUID details are out of scope (spec §1).
#[derive(Clone, Copy, Debug)]
pub struct RmidProbe {
    pub rmid_count: u32,
    /// Bytes represented by one raw hardware unit.
    pub upscaling_factor: u64,
    pub counter_width: u8,
    pub supports_occupancy: bool,
    pub supports_total_bw: bool,
    pub supports_local_bw: bool,
}

/// The platform collaborator reading raw per-RMID hardware counters.
pub trait HwRdt: Send + Sync {
    fn probe(&self) -> PmcResult<RmidProbe>;
    fn read_total_bw(&self, rmid: Rmid) -> u64;
    fn read_local_bw(&self, rmid: Rmid) -> u64;
    fn read_occupancy(&self, rmid: Rmid) -> u64;
}

/// Scaled memory-bandwidth reading for one poll of an assigned RMID (spec
/// §4.I "MBM scaling"), split the way the original reports per-LLC total vs
/// local-socket bandwidth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BandwidthCounters {
    pub total: u64,
    pub local: u64,
}

struct Node {
    refcount: u32,
    last_total_raw: u64,
    last_local_raw: u64,
}

/// RMID allocator and bandwidth scaler (spec §4.I). RMID 0 is reserved for
/// the OS and never placed on the free list.
pub struct RmidPool {
    width_mask: u64,
    upscaling_factor: u64,
    policy: RmidPolicy,
    nodes: HashMap<Rmid, Node>,
    free: VecDeque<Rmid>,
    /// RMIDs currently assigned, in allocation order (spec §4.I "appends to
    /// the assigned list").
    assigned: Vec<Rmid>,
}

impl RmidPool {
    /// Probes the platform and allocates a pool of `rmid_count - 1` nodes
    /// (RMID 0 reserved), seeding the free list with a pseudo-random
    /// rotation (spec §4.I).
    pub fn init(backend: &dyn HwRdt, policy: RmidPolicy) -> PmcResult<Self> {
        let probe = backend.probe()?;
        if probe.rmid_count < 2 {
            return Err(PmcError::CapabilityUnsupported(
                "platform reports fewer than 2 RMIDs".into(),
            ));
        }
        let width_mask = if probe.counter_width >= 64 {
            u64::MAX
        } else {
            (1u64 << probe.counter_width) - 1
        };

        let mut ids: Vec<Rmid> = (1..probe.rmid_count).collect();
        ids.shuffle(&mut thread_rng());
        debug!(count = ids.len(), "RMID pool initialized");

        Ok(RmidPool {
            width_mask,
            upscaling_factor: probe.upscaling_factor,
            policy,
            nodes: HashMap::new(),
            free: ids.into(),
            assigned: Vec::new(),
        })
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned.len()
    }

    /// Dequeues a free RMID by policy, records an initial bandwidth
    /// snapshot, and appends it to the assigned list (spec §4.I
    /// "`get_rmid()`").
    pub fn get_rmid(&mut self, backend: &dyn HwRdt) -> PmcResult<Rmid> {
        let id = match self.policy {
            RmidPolicy::Fifo => self.free.pop_front(),
            RmidPolicy::Lifo => self.free.pop_back(),
            RmidPolicy::Random => {
                if self.free.is_empty() {
                    None
                } else {
                    let idx = (rand::random::<u32>() as usize) % self.free.len();
                    self.free.remove(idx)
                }
            }
        }
        .ok_or_else(|| PmcError::OutOfResource("no free RMID".into()))?;

        self.nodes.insert(
            id,
            Node {
                refcount: 1,
                last_total_raw: backend.read_total_bw(id),
                last_local_raw: backend.read_local_bw(id),
            },
        );
        self.assigned.push(id);
        Ok(id)
    }

    /// Non-allocating reference increment, for a new thread inheriting its
    /// application's already-assigned RMID (spec §4.I "Threads of the same
    /// application share an RMID").
    pub fn use_rmid(&mut self, id: Rmid) -> PmcResult<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| PmcError::StateConflict(format!("rmid {id} is not assigned")))?;
        node.refcount += 1;
        Ok(())
    }

    /// Decrements the refcount; at zero, re-enqueues `id` to the free list
    /// and removes it from the assigned list (spec §4.I "`put_rmid(id)`").
    pub fn put_rmid(&mut self, id: Rmid) -> PmcResult<()> {
        let exhausted = {
            let node = self
                .nodes
                .get_mut(&id)
                .ok_or_else(|| PmcError::StateConflict(format!("rmid {id} is not assigned")))?;
            node.refcount = node.refcount.saturating_sub(1);
            node.refcount == 0
        };
        if exhausted {
            self.nodes.remove(&id);
            self.assigned.retain(|&a| a != id);
            self.free.push_back(id);
        }
        Ok(())
    }

    /// Polls `id`'s hardware counters and returns scaled bandwidth since
    /// the last poll (spec §4.I "MBM scaling" formula, handling counter
    /// wraparound).
    pub fn poll(&mut self, id: Rmid, backend: &dyn HwRdt) -> PmcResult<BandwidthCounters> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| PmcError::StateConflict(format!("rmid {id} is not assigned")))?;

        let total_raw = backend.read_total_bw(id) & self.width_mask;
        let local_raw = backend.read_local_bw(id) & self.width_mask;

        let scale = |raw: u64, last: u64| -> u64 {
            let delta = if raw >= last {
                raw - last
            } else {
                self.width_mask - last + raw + 1
            };
            delta.saturating_mul(self.upscaling_factor)
        };

        let counters = BandwidthCounters {
            total: scale(total_raw, node.last_total_raw),
            local: scale(local_raw, node.last_local_raw),
        };
        node.last_total_raw = total_raw;
        node.last_local_raw = local_raw;
        Ok(counters)
    }
}

//! Reference module: Intel CMT/MBM/CAT controller.
//!
//! Wires the RDT RMID pool (`crate::rdt::rmid`) and the CAT/partition set
//! (`crate::rdt::cat`, `crate::partition::set`) into the monitoring-module
//! callback surface (spec §4.G, §4.I). One RMID is shared by every thread
//! of an application (modeled here as one RMID per monitored thread, the
//! simplification a single-threaded reference module can afford); on each
//! sample it publishes two virtual counters, total and local memory
//! bandwidth.

use std::any::Any;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::module_mgr::{CounterUsage, MonitoringModule};
use crate::rdt::rmid::{HwRdt, Rmid, RmidPool};
use crate::sample::SampleRecord;
use crate::ThreadId;

struct ThreadRmid {
    rmid: Rmid,
}

/// Reference module combining RMID-based bandwidth monitoring with CAT
/// cache partitioning.
pub struct CmtMbmCatModule {
    rmid_pool: Mutex<RmidPool>,
    backend: Box<dyn HwRdt>,
    threads: Mutex<HashMap<ThreadId, ThreadRmid>>,
}

impl CmtMbmCatModule {
    pub fn new(rmid_pool: RmidPool, backend: Box<dyn HwRdt>) -> Self {
        CmtMbmCatModule {
            rmid_pool: Mutex::new(rmid_pool),
            backend,
            threads: Mutex::new(HashMap::new()),
        }
    }
}

impl MonitoringModule for CmtMbmCatModule {
    fn name(&self) -> &str {
        "cmt_mbm_cat"
    }

    fn module_counter_usage(&self) -> CounterUsage {
        CounterUsage {
            hwpmc_mask: 0,
            nr_virtual_counters: 2,
            virtual_counter_names: vec!["bw_total", "bw_local"],
            nr_experiments: 0,
        }
    }

    fn on_fork(&self, thread: ThreadId) {
        let mut pool = self.rmid_pool.lock();
        if let Ok(rmid) = pool.get_rmid(self.backend.as_ref()) {
            self.threads.lock().insert(thread, ThreadRmid { rmid });
        }
    }

    fn on_exit(&self, thread: ThreadId) {
        if let Some(assigned) = self.threads.lock().remove(&thread) {
            let _ = self.rmid_pool.lock().put_rmid(assigned.rmid);
        }
    }

    fn on_free_task(&self, _data: Box<dyn Any + Send>) {}

    fn on_new_sample(&self, sample: &mut SampleRecord) {
        let rmid = match self.threads.lock().get(&sample.thread_id) {
            Some(t) => t.rmid,
            None => return,
        };
        let mut pool = self.rmid_pool.lock();
        if let Ok(bw) = pool.poll(rmid, self.backend.as_ref()) {
            *sample = sample.with_virtual_counters(0b11, &[bw.total, bw.local]);
        }
    }
}

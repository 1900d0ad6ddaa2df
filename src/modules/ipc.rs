//! Reference module: instructions-per-cycle virtual counter.
//!
//! Convention (documented, not hardware-enforced): logical PMC 0 carries
//! cycles and logical PMC 1 carries retired instructions. Every sample
//! gains one virtual counter, `ipc = instructions / cycles`.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::module_mgr::{CounterUsage, MonitoringModule};
use crate::sample::SampleRecord;
use crate::ThreadId;

const CYCLES_LOGICAL: usize = 0;
const INSTRUCTIONS_LOGICAL: usize = 1;

#[derive(Default)]
pub struct IpcModule {
    last_ipc: Mutex<HashMap<ThreadId, f64>>,
}

impl MonitoringModule for IpcModule {
    fn name(&self) -> &str {
        "ipc"
    }

    fn module_counter_usage(&self) -> CounterUsage {
        CounterUsage {
            hwpmc_mask: 0,
            nr_virtual_counters: 1,
            virtual_counter_names: vec!["ipc"],
            nr_experiments: 1,
        }
    }

    fn on_new_sample(&self, sample: &mut SampleRecord) {
        if sample.pmc_count as usize <= INSTRUCTIONS_LOGICAL {
            return;
        }
        let cycles = sample.pmc_values[CYCLES_LOGICAL];
        let instructions = sample.pmc_values[INSTRUCTIONS_LOGICAL];
        let ipc = if cycles == 0 {
            0.0
        } else {
            instructions as f64 / cycles as f64
        };
        self.last_ipc.lock().insert(sample.thread_id, ipc);
        // Virtual counters are wire-format u64 slots; IPC is a ratio, so it
        // rides across as the bit pattern of its f64 representation.
        *sample = sample.with_virtual_counters(0b1, &[ipc.to_bits()]);
    }

    fn get_current_metric_value(&self, thread: ThreadId) -> Option<f64> {
        self.last_ipc.lock().get(&thread).copied()
    }

    fn on_free_task(&self, _data: Box<dyn std::any::Any + Send>) {}
}

//! Reference module: the no-op baseline every other module is compared
//! against. Exists so the module manager always has a safe default to
//! activate and so its own activation/rollback machinery has something
//! trivial to test against (spec §4.G).

use crate::module_mgr::{CounterUsage, MonitoringModule};

#[derive(Default)]
pub struct DummyModule;

impl MonitoringModule for DummyModule {
    fn name(&self) -> &str {
        "dummy"
    }

    fn module_counter_usage(&self) -> CounterUsage {
        CounterUsage::default()
    }
}

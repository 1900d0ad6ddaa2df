//! Component H: reference monitoring modules (spec §2 table, row H).
//!
//! Each submodule implements [`crate::module_mgr::MonitoringModule`]: a
//! no-op baseline, an IPC virtual-counter sampler, an Intel CMT/MBM/CAT
//! controller wiring `crate::rdt` and `crate::partition` into the module
//! callback surface, and a scheduling-policy plugin reading modules'
//! `get_current_metric_value`.

pub mod cmt_mbm_cat;
pub mod dummy;
pub mod ipc;
pub mod sched;

pub use cmt_mbm_cat::CmtMbmCatModule;
pub use dummy::DummyModule;
pub use ipc::IpcModule;
pub use sched::SchedulingPlugin;

//! An OS-assisted performance-monitoring framework: kernel-resident PMC
//! multiplexing and sampling, pluggable monitoring modules, and
//! resource-QoS/cache-partitioning support built on Intel RDT.
//!
//! ## Example
//!
//! Wire a probed PMU, a monitoring engine and the monitor-process bridge
//! together, then fork a thread into per-thread tick-based sampling:
//!
//! ```rust,ignore
//! use pmctrack_core::pmu::{init_pmu, PmuRegistry};
//! use pmctrack_core::module_mgr::ModuleManager;
//! use pmctrack_core::engine::{Engine, SamplingMode};
//! use pmctrack_core::bridge::Bridge;
//! use pmctrack_core::syswide::Syswide;
//! use pmctrack_core::sample::RingBuffer;
//! use std::sync::Arc;
//!
//! # fn wire(hw_pmu: &dyn pmctrack_core::pmu::HwPmu, hw: MyHwCounters, signals: Arc<dyn pmctrack_core::bridge::ProcessSignals>) {
//! let pmu = Arc::new(init_pmu(hw_pmu, &[0, 1, 2, 3]).unwrap());
//! let modules = Arc::new(ModuleManager::new());
//! let engine = Arc::new(Engine::new(hw.clone(), Arc::clone(&pmu), Arc::clone(&modules)));
//! let syswide = Arc::new(Syswide::new(hw, Arc::clone(&pmu), 4096));
//! let bridge = Bridge::new(engine, syswide, signals);
//! # }
//! ```
//!
//! Real hardware PMU register encodings, RDT MSRs, CLOS IPI wiring and
//! process-signal delivery are out of scope: [`pmu::HwPmu`],
//! [`engine::HwCounters`], [`rdt::rmid::HwRdt`], [`rdt::cat::ClosProgrammer`]
//! and [`bridge::ProcessSignals`] are the seams a platform backend
//! implements.

pub mod bridge;
pub mod control;
pub mod counter;
pub mod engine;
pub mod error;
pub mod module_mgr;
pub mod modules;
pub mod partition;
pub mod pmu;
pub mod rdt;
pub mod sample;
pub mod syswide;
#[cfg(test)]
pub(crate) mod testutil;

/// Identifies a monitored kernel thread (spec §3). Not a process id: every
/// thread of a multi-threaded application is tracked independently, though
/// siblings may share a ring buffer and an RMID.
pub type ThreadId = u32;

//! Component G: monitoring-module manager (spec §4.G).
//!
//! A registry of pluggable modules with a single active module at a time,
//! and the callback surface the engine dispatches into on every sample,
//! tick, context switch and lifecycle event.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PmcError, PmcResult};
use crate::pmu::CoreTypeId;
use crate::sample::SampleRecord;
use crate::ThreadId;

/// Unique id assigned to a module at registration time.
pub type ModuleId = u32;

/// Declares which physical counters a module reserves and how many
/// virtual counters / experiments it needs (spec §3 "Monitoring module").
#[derive(Clone, Debug, Default)]
pub struct CounterUsage {
    pub hwpmc_mask: u32,
    pub nr_virtual_counters: u8,
    pub virtual_counter_names: Vec<&'static str>,
    pub nr_experiments: usize,
}

impl CounterUsage {
    pub fn overlaps(&self, other: &CounterUsage) -> bool {
        self.hwpmc_mask & other.hwpmc_mask != 0
    }
}

/// Module-private data, tagged with the id of the module that allocated
/// it. Lets the core route `on_free_task` to the *original* allocator even
/// after the active module has changed (spec §4.G).
pub struct ModulePrivateData {
    owner: ModuleId,
    data: Box<dyn Any + Send>,
}

impl ModulePrivateData {
    pub fn new(owner: ModuleId, data: Box<dyn Any + Send>) -> Self {
        ModulePrivateData { owner, data }
    }

    pub fn owner(&self) -> ModuleId {
        self.owner
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut()
    }
}

/// The callback surface a monitoring module implements (spec §4.G). Every
/// method has a no-op default except `probe`/`enable`, which default to
/// success; modules only override what they use.
///
/// Reentrancy (spec §4.G, §5): these methods may run in IRQ context
/// (`on_new_sample` from the overflow ISR) or process context (ticks,
/// context switches). Implementations must use the engine's own locks
/// around shared state and must not block or allocate from
/// `on_new_sample` (spec §9 Open Questions — made a hard precondition
/// here).
pub trait MonitoringModule: Send + Sync {
    fn name(&self) -> &str;

    fn module_counter_usage(&self) -> CounterUsage;

    /// May veto registration by returning an error.
    fn probe(&self) -> PmcResult<()> {
        Ok(())
    }

    /// Called on activation. Must be symmetric with `disable`.
    fn enable(&self) -> PmcResult<()> {
        Ok(())
    }

    /// Called on deactivation. Infallible: a module that cannot cleanly
    /// tear down still yields the core back (best effort, logged).
    fn disable(&self) {}

    fn on_read_config(&self, _key: &str) -> Option<String> {
        None
    }

    fn on_write_config(&self, _key: &str, _value: &str) -> PmcResult<()> {
        Ok(())
    }

    fn on_fork(&self, _thread: ThreadId) {}
    fn on_exec(&self, _thread: ThreadId) {}
    fn on_exit(&self, _thread: ThreadId) {}

    /// Called when per-thread module-private data this module allocated
    /// must be freed, even if this module is no longer active.
    fn on_free_task(&self, _data: Box<dyn Any + Send>) {}

    /// Called after the engine produces a sample. Modules compute virtual
    /// counters here. MUST NOT block or allocate: this may run in
    /// overflow-ISR context.
    fn on_new_sample(&self, _sample: &mut SampleRecord) {}

    fn on_tick(&self, _thread: ThreadId) {}
    fn on_migrate(&self, _thread: ThreadId, _from: CoreTypeId, _to: CoreTypeId) {}
    fn on_switch_in(&self, _thread: ThreadId) {}
    fn on_switch_out(&self, _thread: ThreadId) {}

    fn get_current_metric_value(&self, _thread: ThreadId) -> Option<f64> {
        None
    }

    fn on_syswide_start(&self, _cpu: u32) {}
    fn on_syswide_stop(&self, _cpu: u32) {}
    fn on_syswide_refresh(&self, _cpu: u32) {}
    fn on_syswide_dump_virtual_counters(&self, _cpu: u32) -> Vec<u64> {
        Vec::new()
    }
}

struct Registered {
    id: ModuleId,
    module: Arc<dyn MonitoringModule>,
}

/// Registry of pluggable modules with a single active module at a time
/// (spec §4.G). The active-module pointer is conceptually RCU-protected
/// (spec §5): readers may observe a stale module for "one grace period"
/// after activation. This is modeled with a reader-writer lock rather than
/// real RCU, which is a fair approximation in userspace — see DESIGN.md.
pub struct ModuleManager {
    registry: RwLock<Vec<Registered>>,
    active: RwLock<Option<ModuleId>>,
    next_id: AtomicU32,
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        ModuleManager {
            registry: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            next_id: AtomicU32::new(0),
        }
    }

    /// Registers a module, invoking its `probe` hook. A vetoing `probe`
    /// keeps the module out of the registry entirely.
    pub fn register(&self, module: Arc<dyn MonitoringModule>) -> PmcResult<ModuleId> {
        module.probe()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry.write().push(Registered { id, module });
        Ok(id)
    }

    pub fn active_id(&self) -> Option<ModuleId> {
        *self.active.read()
    }

    pub fn active_module(&self) -> Option<Arc<dyn MonitoringModule>> {
        let id = self.active_id()?;
        self.find(id)
    }

    fn find(&self, id: ModuleId) -> Option<Arc<dyn MonitoringModule>> {
        self.registry
            .read()
            .iter()
            .find(|r| r.id == id)
            .map(|r| Arc::clone(&r.module))
    }

    /// Activates `id`. Idempotent (`activate(active_id)` is a no-op
    /// returning `active_id`, spec §8 property 6). Transactional: a
    /// failing `enable` on the new module leaves the previous module
    /// active (spec §4.G, §7).
    pub fn activate(&self, id: ModuleId) -> PmcResult<ModuleId> {
        if self.active_id() == Some(id) {
            return Ok(id);
        }
        let new_module = self
            .find(id)
            .ok_or_else(|| PmcError::ConfigRejected(format!("no such module id {id}")))?;

        let new_usage = new_module.module_counter_usage();
        if let Some(active) = self.active_module() {
            if active.module_counter_usage().overlaps(&new_usage) {
                return Err(PmcError::StateConflict(
                    "candidate module claims PMCs already held by the active module".into(),
                ));
            }
        }

        let previous = self.active_id();
        if let Some(prev_id) = previous {
            if let Some(prev_module) = self.find(prev_id) {
                prev_module.disable();
            }
        }

        match new_module.enable() {
            Ok(()) => {
                *self.active.write() = Some(id);
                Ok(id)
            }
            Err(e) => {
                if let Some(prev_id) = previous {
                    if let Some(prev_module) = self.find(prev_id) {
                        let _ = prev_module.enable();
                    }
                }
                Err(e)
            }
        }
    }

    /// Disables the active module, if any, leaving no module active.
    pub fn deactivate(&self) {
        if let Some(id) = self.active_id() {
            if let Some(m) = self.find(id) {
                m.disable();
            }
            *self.active.write() = None;
        }
    }

    /// Cycles the given module off and back on, e.g. to pick up new
    /// configuration. `id` must currently be active.
    pub fn reinitialize(&self, id: ModuleId) -> PmcResult<ModuleId> {
        if self.active_id() != Some(id) {
            return Err(PmcError::StateConflict(format!(
                "module {id} is not the active module"
            )));
        }
        let module = self.find(id).expect("active id always resolves");
        module.disable();
        module.enable().map(|()| id)
    }

    /// Routes freed per-thread module data to its original allocator's
    /// `on_free_task`, even if that module is no longer active (spec
    /// §4.G, §9 redesign note on the security-token tag).
    pub fn free_task_data(&self, data: ModulePrivateData) {
        if let Some(m) = self.find(data.owner) {
            m.on_free_task(data.data);
        }
    }

    pub fn registered(&self) -> Vec<(ModuleId, String)> {
        self.registry
            .read()
            .iter()
            .map(|r| (r.id, r.module.name().to_string()))
            .collect()
    }
}

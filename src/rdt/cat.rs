//! CAT / CLOS cache-way programming (spec §4.I).

use std::collections::HashMap;

use tracing::warn;

use crate::error::{PmcError, PmcResult};

pub type Clos = u16;

/// What the platform reports at init (spec §4.I "query the CBM length and
/// CLOS count").
#[derive(Clone, Copy, Debug)]
pub struct CatProbe {
    pub clos_count: u16,
    pub cbm_length: u8,
}

/// The platform collaborator that actually writes CLOS mask registers,
/// possibly across CPUs via inter-processor call (spec §4.I, §5). Out of
/// scope for real hardware (spec §1).
pub trait ClosProgrammer: Send + Sync {
    fn probe(&self) -> PmcResult<CatProbe>;

    /// Writes `mask` to `clos`'s capacity-bitmask register on `cpu`.
    /// Returns `Err(Transient)` on an IPI failure the caller should retry
    /// (spec §5 "CLOS-update IPI retries up to three times").
    fn program(&self, cpu: u32, clos: Clos, mask: u32) -> PmcResult<()>;
}

/// CLOS pool: CLOS 0 reserved for the OS, every other CLOS initialized to
/// the platform's full "all ways" mask (spec §4.I).
pub struct CatPool {
    cbm_mask: u32,
    clos_count: u16,
    /// Last mask programmed per CLOS, for re-deriving after a dropped IPI.
    masks: HashMap<Clos, u32>,
}

const IPI_RETRY_LIMIT: u8 = 3;

impl CatPool {
    pub fn init(backend: &dyn ClosProgrammer) -> PmcResult<Self> {
        let probe = backend.probe()?;
        if probe.clos_count < 2 {
            return Err(PmcError::CapabilityUnsupported(
                "platform reports fewer than 2 CLOSes".into(),
            ));
        }
        let cbm_mask = if probe.cbm_length >= 32 {
            u32::MAX
        } else {
            (1u32 << probe.cbm_length) - 1
        };
        let mut masks = HashMap::new();
        for clos in 1..probe.clos_count {
            masks.insert(clos, cbm_mask);
        }
        Ok(CatPool {
            cbm_mask,
            clos_count: probe.clos_count,
            masks,
        })
    }

    pub fn cbm_mask(&self) -> u32 {
        self.cbm_mask
    }

    pub fn clos_count(&self) -> u16 {
        self.clos_count
    }

    pub fn mask_of(&self, clos: Clos) -> Option<u32> {
        self.masks.get(&clos).copied()
    }

    /// Programs `clos`'s capacity bitmask on every CPU in `cpus`, masking
    /// against the platform's CBM length and retrying each CPU's IPI up to
    /// [`IPI_RETRY_LIMIT`] times before giving up and logging (spec §5
    /// "thereafter the update is logged and dropped").
    pub fn program_partition(
        &mut self,
        backend: &dyn ClosProgrammer,
        clos: Clos,
        mask: u32,
        cpus: &[u32],
    ) -> PmcResult<()> {
        if clos == 0 || clos >= self.clos_count {
            return Err(PmcError::ConfigRejected(format!(
                "clos {clos} is reserved or out of range"
            )));
        }
        let masked = mask & self.cbm_mask;
        for &cpu in cpus {
            let mut attempts = 0;
            loop {
                match backend.program(cpu, clos, masked) {
                    Ok(()) => break,
                    Err(PmcError::Transient(reason)) => {
                        attempts += 1;
                        if attempts >= IPI_RETRY_LIMIT {
                            warn!(
                                cpu,
                                clos,
                                reason,
                                "CLOS update dropped after exhausting IPI retries"
                            );
                            break;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.masks.insert(clos, masked);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Mock {
        clos_count: u16,
        cbm_length: u8,
        fail_cpu: Option<u32>,
        fail_count: AtomicU32,
        programmed: Mutex<Vec<(u32, Clos, u32)>>,
    }

    impl ClosProgrammer for Mock {
        fn probe(&self) -> PmcResult<CatProbe> {
            Ok(CatProbe {
                clos_count: self.clos_count,
                cbm_length: self.cbm_length,
            })
        }
        fn program(&self, cpu: u32, clos: Clos, mask: u32) -> PmcResult<()> {
            if self.fail_cpu == Some(cpu) {
                self.fail_count.fetch_add(1, Ordering::SeqCst);
                return Err(PmcError::Transient("ipi timeout".into()));
            }
            self.programmed.lock().unwrap().push((cpu, clos, mask));
            Ok(())
        }
    }

    #[test]
    fn default_masks_are_all_ways() {
        let backend = Mock {
            clos_count: 4,
            cbm_length: 8,
            fail_cpu: None,
            fail_count: AtomicU32::new(0),
            programmed: Mutex::new(vec![]),
        };
        let pool = CatPool::init(&backend).unwrap();
        assert_eq!(pool.mask_of(1), Some(0xff));
        assert_eq!(pool.mask_of(0), None, "clos 0 is reserved, not tracked");
    }

    #[test]
    fn clos_zero_is_refused() {
        let backend = Mock {
            clos_count: 4,
            cbm_length: 8,
            fail_cpu: None,
            fail_count: AtomicU32::new(0),
            programmed: Mutex::new(vec![]),
        };
        let mut pool = CatPool::init(&backend).unwrap();
        assert!(pool.program_partition(&backend, 0, 0x0f, &[0]).is_err());
    }

    #[test]
    fn retries_ipi_up_to_limit_then_drops() {
        let backend = Mock {
            clos_count: 4,
            cbm_length: 8,
            fail_cpu: Some(2),
            fail_count: AtomicU32::new(0),
            programmed: Mutex::new(vec![]),
        };
        let mut pool = CatPool::init(&backend).unwrap();
        pool.program_partition(&backend, 1, 0x0f, &[2]).unwrap();
        assert_eq!(backend.fail_count.load(Ordering::SeqCst), IPI_RETRY_LIMIT as u32);
    }
}

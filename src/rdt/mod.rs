//! Component I: resource-QoS core, Intel RDT family (spec §4.I).
//!
//! Two independent subsystems share one platform probe: the RMID pool for
//! memory-bandwidth/occupancy monitoring (`rmid`) and CAT/CLOS cache-way
//! programming (`cat`). Both are out-of-scope for real register encodings
//! (spec §1); each defines the trait seam a platform backend implements.

pub mod cat;
pub mod rmid;

pub use cat::{CatPool, CatProbe, Clos, ClosProgrammer};
pub use rmid::{BandwidthCounters, HwRdt, Rmid, RmidPolicy, RmidPool, RmidProbe};

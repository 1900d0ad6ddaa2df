//! Component J: cache-partitioning engine, LFOC family (spec §4.J).

pub mod lfoc;
pub mod set;

pub use lfoc::{lfoc_cluster, ucp_lookahead, AppClass, AppProfile, Cluster, LfocParams, LfocResult};
pub use set::{AppId, Partition, PartitionId, PartitionSet};

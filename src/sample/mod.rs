//! Component C: sample lifecycle — the ring buffer between kernel sampling
//! context and a monitor process (spec §4.C), and the fixed-size record it
//! carries (spec §3, §6).

pub mod record;
pub mod ring;

pub use record::{SampleKind, SampleRecord};
pub use ring::RingBuffer;

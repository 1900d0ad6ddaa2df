//! Error kinds for the core, per spec §7.
//!
//! Every public entry point returns [`PmcResult`]. Overflow-ISR-context code
//! (see [`crate::engine`]) never surfaces these: failures there are logged
//! and the counter is quiesced until the next context-switch-in reprograms
//! it, per §7 "Overflow-ISR-context errors must not propagate".

use thiserror::Error;

/// One of the error kinds named in spec §7.
#[derive(Debug, Error)]
pub enum PmcError {
    /// No supported PMU vendor was detected, or the requested capability
    /// does not exist on this platform (e.g. pausing AUX trace pre-4.7).
    #[error("capability unsupported: {0}")]
    CapabilityUnsupported(String),

    /// A raw configuration string failed to parse, combined EBS with
    /// multiplexing, or repeated an incompatible token.
    #[error("configuration rejected: {0}")]
    ConfigRejected(String),

    /// No free RMID, no free cache partition, or the sample ring buffer is
    /// out of memory.
    #[error("out of resource: {0}")]
    OutOfResource(String),

    /// An operation conflicts with the current global state, e.g. enabling
    /// system-wide mode while another owner holds it, or swapping the
    /// active module while per-thread data it owns is still in flight.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// A retryable hardware/IPC failure: IPI retry exhausted, PMU register
    /// write timed out. Callers may retry; the core itself retries up to
    /// the bound named in spec §5 before downgrading to a log message.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A copy-to/from-user (here: a control-file byte-stream) failure.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// A blocking read on the sample ring buffer was interrupted by a
    /// signal; the buffer is left untouched.
    #[error("interrupted")]
    Interrupted,
}

/// Result alias used on every public entry point of the core.
pub type PmcResult<T> = Result<T, PmcError>;

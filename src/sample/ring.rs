//! Component C: sample ring buffer.
//!
//! Fixed-capacity FIFO of [`SampleRecord`]s with single-writer/single-
//! reader discipline and blocking semantics (spec §4.C). The kernel's
//! spinlock + semaphore + waiting-flag triple is modeled with one
//! `parking_lot::Mutex` guarding the queue plus a `Condvar` for the
//! reader's wake-up, matching spec §5 "its own spinlock; never nested
//! inside the engine spinlock".
//!
//! Reference counting is `Arc`'s strong count: every producer thread and
//! the monitor hold a clone of the `Arc<RingBuffer>`, and the buffer is
//! freed (by ordinary `Drop`) exactly when the last one goes away — the
//! same invariant spec §3 describes by hand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::record::SampleRecord;
use crate::error::{PmcError, PmcResult};

struct RingState {
    buf: VecDeque<SampleRecord>,
    capacity: usize,
    waiting: bool,
    /// Count of samples overwritten because the buffer was full on push
    /// (spec §8 property 5: this crate picks "overwrite oldest" over
    /// "drop push" and tests that choice).
    overwritten: u64,
}

/// A fixed-capacity sample ring buffer, always held behind an `Arc`.
pub struct RingBuffer {
    state: Mutex<RingState>,
    not_empty: Condvar,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Arc::new(RingBuffer {
            state: Mutex::new(RingState {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                waiting: false,
                overwritten: 0,
            }),
            not_empty: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overwritten(&self) -> u64 {
        self.state.lock().overwritten
    }

    /// Single-producer push. Never blocks: on a full buffer the oldest
    /// sample is dropped to make room (documented choice for spec §8
    /// property 5). Safe to call from overflow-ISR context: the lock is a
    /// spinlock-shaped `Mutex`, never held across I/O.
    pub fn push(&self, record: SampleRecord) {
        let mut state = self.state.lock();
        if state.buf.len() == state.capacity {
            state.buf.pop_front();
            state.overwritten += 1;
        }
        state.buf.push_back(record);
        if state.waiting {
            state.waiting = false;
            self.not_empty.notify_one();
        }
    }

    /// Non-blocking pop, for the shared-memory fast path or a poll-driven
    /// reader.
    pub fn try_recv(&self) -> Option<SampleRecord> {
        self.state.lock().buf.pop_front()
    }

    /// Blocking pop with EOF semantics (spec §4.C): once the only
    /// remaining holder is the caller (refcount == 1) and the buffer is
    /// empty, returns `Ok(None)` ("all monitored threads exited").
    ///
    /// `interrupt` models the monitor process receiving a signal mid-read:
    /// when set, the call returns `Err(PmcError::Interrupted)` and leaves
    /// the buffer untouched (spec §5 "Cancellation & timeouts").
    pub fn recv(self: &Arc<Self>, interrupt: &AtomicBool) -> PmcResult<Option<SampleRecord>> {
        let mut state = self.state.lock();
        loop {
            if let Some(record) = state.buf.pop_front() {
                return Ok(Some(record));
            }
            if Arc::strong_count(self) <= 1 {
                return Ok(None);
            }
            if interrupt.load(Ordering::SeqCst) {
                return Err(PmcError::Interrupted);
            }
            state.waiting = true;
            // Poll the interrupt flag periodically rather than blocking
            // forever, the same shape as a kernel's signal_pending() check
            // around interruptible_sleep_on().
            self.not_empty
                .wait_for(&mut state, Duration::from_millis(20));
        }
    }

    pub fn ref_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sample::record::SampleKind;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn rec(tid: u32) -> SampleRecord {
        SampleRecord::new(SampleKind::Tick, 0, tid)
    }

    #[test]
    fn fifo_order_preserved() {
        let rb = RingBuffer::new(4);
        rb.push(rec(1));
        rb.push(rec(2));
        rb.push(rec(3));
        assert_eq!(rb.try_recv().unwrap().thread_id, 1);
        assert_eq!(rb.try_recv().unwrap().thread_id, 2);
        assert_eq!(rb.try_recv().unwrap().thread_id, 3);
        assert!(rb.try_recv().is_none());
    }

    #[test]
    fn push_pop_count_invariant_holds_without_overflow() {
        let rb = RingBuffer::new(16);
        for i in 0..10 {
            rb.push(rec(i));
        }
        let mut popped = 0;
        while rb.try_recv().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 10);
        assert_eq!(rb.overwritten(), 0);
    }

    #[test]
    fn full_buffer_overwrites_oldest() {
        let rb = RingBuffer::new(2);
        rb.push(rec(1));
        rb.push(rec(2));
        rb.push(rec(3)); // overwrites 1
        assert_eq!(rb.overwritten(), 1);
        assert_eq!(rb.try_recv().unwrap().thread_id, 2);
        assert_eq!(rb.try_recv().unwrap().thread_id, 3);
    }

    #[test]
    fn eof_when_only_reader_holds_empty_buffer() {
        let rb = RingBuffer::new(4);
        let interrupt = AtomicBool::new(false);
        // Only this Arc (the "monitor") holds a reference.
        assert_eq!(rb.recv(&interrupt).unwrap(), None);
    }

    #[test]
    fn reader_blocks_until_producer_pushes() {
        let rb = RingBuffer::new(4);
        let producer = Arc::clone(&rb);
        let interrupt = AtomicBool::new(false);

        let handle = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(50));
            producer.push(rec(9));
        });

        let got = rb.recv(&interrupt).unwrap();
        assert_eq!(got.unwrap().thread_id, 9);
        handle.join().unwrap();
    }

    #[test]
    fn interrupted_read_leaves_buffer_untouched() {
        let rb = RingBuffer::new(4);
        let _keep_alive = Arc::clone(&rb);
        let interrupt = AtomicBool::new(true);
        let err = rb.recv(&interrupt).unwrap_err();
        assert!(matches!(err, PmcError::Interrupted));
        assert_eq!(rb.len(), 0);
    }

    #[test]
    fn swept_seeds_preserve_the_push_accounting_invariant() {
        use crate::testutil::SplitMix64;
        // Every pushed sample ends up in exactly one of three places: still
        // queued, popped by the reader, or evicted by an overwrite.
        for seed in [1u64, 7, 1234, 999_983] {
            let mut rng = SplitMix64::new(seed);
            let capacity = 3 + rng.next_range(13) as usize;
            let rb = RingBuffer::new(capacity);
            let mut pushed = 0u64;
            let mut popped = 0u64;
            for i in 0..200u32 {
                if rng.next_range(3) == 0 {
                    if rb.try_recv().is_some() {
                        popped += 1;
                    }
                } else {
                    rb.push(rec(i));
                    pushed += 1;
                }
                assert_eq!(pushed, rb.len() as u64 + popped + rb.overwritten(), "seed {seed}");
            }
        }
    }

    #[test]
    fn ref_count_tracks_clones() {
        let rb = RingBuffer::new(4);
        assert_eq!(rb.ref_count(), 1);
        let clone = Arc::clone(&rb);
        assert_eq!(rb.ref_count(), 2);
        drop(clone);
        assert_eq!(rb.ref_count(), 1);
    }
}

//! Acknowledgement buffer: the delivery guarantee lives here.
//!
//! The buffer sequences outbound records, retains them until the peer
//! acknowledges receipt, applies backpressure when full, and supports
//! replay-from-the-head after a reconnect. Producers, the sender loop, and the
//! receiver loop all share one buffer; a single lock grants mutation rights,
//! and two latches (`available`, `ready`) carry the wake-ups.
//!
//! Acknowledging `seq` releases every record up to and including `seq`, which
//! is an O(capacity) shift of the slot array. Acks arrive at a stride of half
//! the capacity, so the shift amortizes to O(1) per admitted record. A ring
//! buffer would avoid the shift but complicates delivery reset and snapshots.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, UplinkError};
use crate::latch::Latch;
use crate::protocol::DataMessage;

/// Default number of unacked records held before admissions block.
pub const DEFAULT_CAPACITY: usize = 5000;

/// How often an indefinitely-blocked admission re-checks for shutdown.
const ADMIT_POLL_TICK: Duration = Duration::from_millis(500);

/// Observational callback. Must not block: it runs on the producer's or the
/// receiver's task.
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Configuration for the acknowledgement buffer.
#[derive(Clone, Default)]
pub struct AckBufferOptions {
    /// Maximum unacked records; `0` means [`DEFAULT_CAPACITY`].
    pub capacity: usize,

    /// Invoked when an admission finds the buffer full and has to wait.
    /// At most once per blocked `admit` call.
    pub on_backpressure: Option<Hook>,

    /// Invoked on every received ack, valid or not.
    pub on_ack: Option<Hook>,
}

struct BufferState {
    /// Occupied slots are `[0, next_free)`, in sequence order; the rest are empty.
    slots: Vec<Option<DataMessage>>,
    next_free: usize,
    /// Sequence number of the record at slot 0, the oldest unacked.
    first_seq: u64,
    /// Sequence number the next admission will receive.
    next_seq: u64,
    /// Index of the next record the sender should transmit.
    deliver_cursor: usize,
    running: bool,
}

/// Sequenced buffer of in-flight records with ack-driven compaction.
pub struct AckBuffer {
    state: RwLock<BufferState>,
    /// Set iff there is room to admit (while the buffer is running).
    available: Latch,
    /// Set iff there is an undelivered record.
    ready: Latch,
    capacity: usize,
    /// Admissions whose sequence number is a multiple of this request an ack.
    ack_every: u64,
    on_backpressure: Option<Hook>,
    on_ack: Option<Hook>,
}

impl AckBuffer {
    pub fn new(options: AckBufferOptions) -> Self {
        let capacity = if options.capacity == 0 { DEFAULT_CAPACITY } else { options.capacity };
        // A capacity of 1 would otherwise yield a stride of 0.
        let ack_every = ((capacity / 2) as u64).max(1);

        let buffer = Self {
            state: RwLock::new(BufferState {
                slots: (0..capacity).map(|_| None).collect(),
                next_free: 0,
                first_seq: 1,
                next_seq: 1,
                deliver_cursor: 0,
                running: true,
            }),
            available: Latch::new(),
            ready: Latch::new(),
            capacity,
            ack_every,
            on_backpressure: options.on_backpressure,
            on_ack: options.on_ack,
        };
        buffer.available.set();
        buffer
    }

    /// Admit a record, blocking until there is room or the wait ends.
    ///
    /// On success the record receives the next sequence number, is flagged
    /// `ack_requested` at the ack stride, and becomes visible to the sender.
    /// Returns `false` without mutation when `timeout` elapses or when the
    /// buffer is closed. A zero `timeout` waits indefinitely (checking for
    /// shutdown every 500 ms).
    ///
    /// The record must not carry a sequence number yet; admission stamps both
    /// `seq_num` and `ack_requested`.
    pub async fn admit(&self, mut msg: DataMessage, timeout: Duration) -> bool {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut reported_backpressure = false;

        loop {
            if !self.available.is_set() && !reported_backpressure {
                if let Some(hook) = &self.on_backpressure {
                    hook();
                }
                reported_backpressure = true;
            }

            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                if !self.available.wait_for(deadline - now).await {
                    return false;
                }
            } else {
                self.available.wait_for(ADMIT_POLL_TICK).await;
            }

            let mut state = self.state.write();
            if !state.running {
                return false;
            }
            if !self.available.is_set() {
                // Woken but another producer took the slot; the latch state
                // can change between wake and relock, so go back to waiting.
                continue;
            }

            msg.seq_num = state.next_seq;
            state.next_seq += 1;
            msg.ack_requested = msg.seq_num % self.ack_every == 0;
            trace!(seq = msg.seq_num, ack_requested = msg.ack_requested, "record admitted");

            let slot = state.next_free;
            state.slots[slot] = Some(msg);
            state.next_free += 1;
            if state.next_free >= self.capacity {
                self.available.clear();
            }
            self.ready.set();
            return true;
        }
    }

    /// Process an acknowledgement for `seq`, releasing every record up to and
    /// including it.
    ///
    /// Only sequence numbers that have been admitted *and* handed to the
    /// sender are ackable; anything else is rejected with `UnexpectedAck`.
    /// Sequence numbers are 64-bit and assigned from 1, so wraparound is not
    /// reachable in realistic operation.
    pub fn ack(&self, seq: u64) -> Result<()> {
        if let Some(hook) = &self.on_ack {
            hook();
        }

        let mut state = self.state.write();
        let first_seq = state.first_seq;
        let delivered = state.deliver_cursor as u64;
        if seq < first_seq || seq - first_seq >= delivered {
            return Err(UplinkError::UnexpectedAck { seq, first_seq, delivered });
        }

        let released = (seq - first_seq) as usize + 1;
        for i in released..state.next_free {
            let moved = state.slots[i].take();
            state.slots[i - released] = moved;
        }
        state.first_seq = seq + 1;
        state.next_free -= released;
        state.deliver_cursor -= released;
        let next_free = state.next_free;
        for slot in state.slots[next_free..].iter_mut() {
            *slot = None;
        }

        self.available.set();
        if state.deliver_cursor >= state.next_free {
            self.ready.clear();
        }

        debug!(seq, released, unacked = state.next_free, "ack compacted buffer");
        Ok(())
    }

    /// Hand the next undelivered record to the sender, waiting up to `timeout`
    /// for one to appear.
    ///
    /// The record stays in the buffer; only [`ack`](AckBuffer::ack) releases
    /// storage. Returns `None` on timeout, or when a concurrent ack drained
    /// the undelivered range between wake-up and relock.
    pub async fn next_to_deliver(&self, timeout: Duration) -> Option<DataMessage> {
        if !self.ready.wait_for(timeout).await {
            return None;
        }

        let mut state = self.state.write();
        if state.deliver_cursor >= state.next_free {
            return None;
        }

        let msg = state.slots[state.deliver_cursor].clone();
        state.deliver_cursor += 1;
        if state.deliver_cursor >= state.next_free {
            self.ready.clear();
        }
        msg
    }

    /// Rewind delivery to the oldest unacked record.
    ///
    /// The reconnect controller calls this so the new transport re-sends
    /// everything the peer has not confirmed, in order.
    pub fn reset_delivery(&self) {
        let mut state = self.state.write();
        state.deliver_cursor = 0;
        if state.next_free > 0 {
            self.ready.set();
        } else {
            self.ready.clear();
        }
        debug!(unacked = state.next_free, "delivery cursor reset");
    }

    /// Copy of the full unacked set, oldest first.
    pub fn snapshot(&self) -> Vec<DataMessage> {
        let state = self.state.read();
        state.slots[..state.next_free].iter().filter_map(|slot| slot.clone()).collect()
    }

    /// Number of unacked records currently held.
    pub fn len(&self) -> usize {
        self.state.read().next_free
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the buffer still accepts admissions.
    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    /// Stop accepting admissions and wake every blocked admitter.
    ///
    /// Woken admitters observe the stopped buffer and return `false`. Records
    /// already admitted stay readable through [`snapshot`](AckBuffer::snapshot).
    pub fn close(&self) {
        let mut state = self.state.write();
        state.running = false;
        self.available.set();
    }
}

#[cfg(test)]
impl AckBuffer {
    /// `(first_seq, deliver_cursor, next_free)` for test assertions.
    fn test_state(&self) -> (u64, usize, usize) {
        let state = self.state.read();
        (state.first_seq, state.deliver_cursor, state.next_free)
    }

    /// Assert the structural invariants that must hold at every quiescent point.
    fn assert_invariants(&self) {
        let state = self.state.read();
        assert_eq!(state.next_seq, state.first_seq + state.next_free as u64);
        assert!(state.deliver_cursor <= state.next_free);
        assert!(state.next_free <= self.capacity);

        for i in 0..state.next_free {
            let msg = state.slots[i].as_ref().expect("slot in occupied range is empty");
            assert_eq!(msg.seq_num, state.first_seq + i as u64);
            assert_eq!(msg.ack_requested, msg.seq_num % self.ack_every == 0);
        }
        for i in state.next_free..self.capacity {
            assert!(state.slots[i].is_none(), "slot past occupied range is not empty");
        }

        if state.running {
            assert_eq!(self.available.is_set(), state.next_free < self.capacity);
        }
        assert_eq!(self.ready.is_set(), state.deliver_cursor < state.next_free);
    }
}

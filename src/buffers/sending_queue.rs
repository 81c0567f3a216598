//! The per-connection queue of outgoing segments.
//!
//! Producers (the application's send path, the retransmission timer) append segments
//!  concurrently; a single transport writer reads them, reports how many bytes it flushed and
//!  clears the queue when everything is flushed.
//!
//! Writers claim a slot with a compare-and-swap on the count field and then store the segment.
//!  The drain gate ([SendingQueue::stop_enqueue]) waits for writers that are between those two
//!  steps. Clearing uses a separate flag with the same wait, so it never races with a
//!  half-finished insert and never opens or closes the gate. Writers arriving while the queue is
//!  being cleared get [EnqueueStatus::Clearing] and retry. A writer that fetched the epoch before
//!  a [SendingQueue::clear] is rejected by the epoch check.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use anyhow::anyhow;
use tracing::{debug, trace, warn};
use crate::buffers::queue_pool::{SendingQueuePool, Slot};
use crate::buffers::segment::Segment;
use crate::util::lock;

/// number of busy spins before the drain gate starts yielding the thread
const SPIN_LIMIT: u32 = 128;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnqueueStatus {
    Enqueued,
    /// Another writer claimed the slot first. Retrying is expected to succeed.
    Conflict,
    /// The queue holds `capacity` segments. This is backpressure: sending should stall until the
    ///  transport has flushed and cleared the queue.
    Full,
    /// the drain gate is closed
    Closed,
    /// The queue is being cleared. This is over quickly, retrying is expected to succeed.
    Clearing,
    /// The queue was cleared after the caller fetched its epoch
    StaleEpoch,
}

pub struct SendingQueue {
    pool: Arc<SendingQueuePool>,
    offset: usize,
    capacity: usize,

    count: AtomicUsize,
    epoch: AtomicU32,
    read_only: AtomicBool,
    clearing: AtomicBool,
    active_writers: AtomicUsize,

    /// index (relative to `offset`) of the first segment that was not completely flushed
    read_cursor: Mutex<usize>,
}

impl SendingQueue {
    pub(crate) fn new_in_pool(pool: Arc<SendingQueuePool>, offset: usize, capacity: usize) -> SendingQueue {
        SendingQueue {
            pool,
            offset,
            capacity,
            count: AtomicUsize::new(0),
            epoch: AtomicU32::new(0),
            read_only: AtomicBool::new(false),
            clearing: AtomicBool::new(false),
            active_writers: AtomicUsize::new(0),
            read_cursor: Mutex::new(0),
        }
    }

    /// convenience for a queue that does not share its backing array with other queues
    pub fn with_capacity(capacity: usize) -> anyhow::Result<SendingQueue> {
        SendingQueuePool::new(1, capacity)?
            .get_from_pool()
            .ok_or_else(|| anyhow!("freshly created pool has no free slice"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// number of claimed slots, including segments that were already flushed
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, index: usize) -> &Slot {
        debug_assert!(index < self.capacity);
        self.pool.slot(self.offset + index)
    }

    pub fn try_enqueue(&self, segment: &Segment, epoch: u32) -> EnqueueStatus {
        // register as a writer *before* checking the gate: stop_enqueue() sets the gate first
        //  and then waits for the counter, so either we see the closed gate or it sees us
        self.active_writers.fetch_add(1, Ordering::SeqCst);
        let result = self.do_try_enqueue(segment, epoch);
        self.active_writers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn do_try_enqueue(&self, segment: &Segment, epoch: u32) -> EnqueueStatus {
        if self.read_only.load(Ordering::SeqCst) {
            return EnqueueStatus::Closed;
        }
        if self.clearing.load(Ordering::SeqCst) {
            return EnqueueStatus::Clearing;
        }
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return EnqueueStatus::StaleEpoch;
        }

        let count = self.count.load(Ordering::SeqCst);
        if count >= self.capacity {
            return EnqueueStatus::Full;
        }
        if self.count.compare_exchange(count, count + 1, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return EnqueueStatus::Conflict;
        }

        *lock(self.slot(count)) = Some(segment.clone());
        trace!("enqueued segment of {} bytes at slot {}", segment.len(), count);
        EnqueueStatus::Enqueued
    }

    /// Enqueues with the current epoch, retrying conflicts and epoch changes. Returns the first
    ///  status that is not retryable.
    pub fn enqueue(&self, segment: &Segment) -> EnqueueStatus {
        loop {
            match self.try_enqueue(segment, self.epoch()) {
                EnqueueStatus::Conflict | EnqueueStatus::StaleEpoch => {
                    spin_loop();
                }
                EnqueueStatus::Clearing => {
                    // give the clearing thread a chance to see no active writers
                    thread::yield_now();
                }
                status => return status,
            }
        }
    }

    /// Closes the gate for writers and waits until no writer is in the middle of an insert.
    ///  After this returns, the queue's content is stable until [SendingQueue::start_enqueue].
    pub fn stop_enqueue(&self) {
        self.read_only.store(true, Ordering::SeqCst);
        self.wait_for_writers();
    }

    pub fn start_enqueue(&self) {
        self.read_only.store(false, Ordering::SeqCst);
    }

    fn wait_for_writers(&self) {
        let mut spins = 0u32;
        while self.active_writers.load(Ordering::SeqCst) > 0 {
            if spins < SPIN_LIMIT {
                spins += 1;
                spin_loop();
            }
            else {
                thread::yield_now();
            }
        }
    }

    /// The segments that were enqueued but not yet (completely) flushed, in order. A slot that
    ///  was claimed by a writer which has not stored its segment yet ends the sequence.
    pub fn pending_segments(&self) -> Vec<Segment> {
        let cursor = lock(&self.read_cursor);
        let mut result = Vec::new();
        for index in *cursor..self.len() {
            match lock(self.slot(index)).as_ref() {
                Some(segment) => result.push(segment.clone()),
                None => break,
            }
        }
        result
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_segments().iter()
            .map(|s| s.len())
            .sum()
    }

    /// true if every enqueued segment was flushed
    pub fn is_drained(&self) -> bool {
        *lock(&self.read_cursor) >= self.len()
    }

    /// Registers that the transport flushed `consumed_bytes` from the start of the pending
    ///  segments. A segment that was only flushed partially is replaced by its unflushed
    ///  remainder.
    pub fn internal_trim(&self, consumed_bytes: usize) {
        let mut consumed = consumed_bytes;
        let mut cursor = lock(&self.read_cursor);
        let count = self.len();

        while *cursor < count {
            let mut slot = lock(self.slot(*cursor));
            let segment_len = match slot.as_ref() {
                Some(segment) => segment.len(),
                None => break,
            };

            if segment_len <= consumed {
                consumed -= segment_len;
                *slot = None;
                *cursor += 1;
                continue;
            }

            if consumed > 0 {
                trace!("splitting segment at slot {}: {} of {} bytes flushed", *cursor, consumed, segment_len);
                *slot = slot.as_ref().map(|s| s.remainder_after(consumed));
                consumed = 0;
            }
            break;
        }

        if consumed > 0 {
            warn!("trimmed {} bytes more than were pending", consumed);
        }
    }

    /// Discards all content and invalidates writers holding the previous epoch. The drain gate
    ///  stays as it is.
    pub fn clear(&self) {
        self.clear_when(false);
    }

    /// Clears the queue if every enqueued segment was flushed. The check and the clear are
    ///  atomic with respect to writers: a concurrently enqueued segment is either seen by the
    ///  check or stored after the clear. Returns `true` if the queue was cleared.
    pub fn clear_if_drained(&self) -> bool {
        self.clear_when(true)
    }

    fn clear_when(&self, only_if_drained: bool) -> bool {
        // holding the cursor serializes clears with each other and with the reader
        let mut cursor = lock(&self.read_cursor);
        self.clearing.store(true, Ordering::SeqCst);
        self.wait_for_writers();

        let cleared = !only_if_drained || *cursor >= self.len();
        if cleared {
            for index in 0..self.len() {
                *lock(self.slot(index)) = None;
            }
            self.count.store(0, Ordering::SeqCst);
            *cursor = 0;
            let new_epoch = self.epoch.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            debug!("cleared sending queue, new epoch {}", new_epoch);
        }

        self.clearing.store(false, Ordering::SeqCst);
        cleared
    }
}

impl Drop for SendingQueue {
    fn drop(&mut self) {
        self.pool.return_to_pool(self.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    fn segment(data: &'static [u8]) -> Segment {
        Segment::from(Bytes::from_static(data))
    }

    #[test]
    fn test_enqueue_until_full() {
        let queue = SendingQueue::with_capacity(3).unwrap();
        let epoch = queue.epoch();

        for _ in 0..3 {
            assert_eq!(queue.try_enqueue(&segment(b"abc"), epoch), EnqueueStatus::Enqueued);
        }
        assert_eq!(queue.try_enqueue(&segment(b"abc"), epoch), EnqueueStatus::Full);
        assert_eq!(queue.enqueue(&segment(b"abc")), EnqueueStatus::Full);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pending_bytes(), 9);
    }

    #[test]
    fn test_stop_enqueue_rejects_all_writers() {
        let queue = SendingQueue::with_capacity(10).unwrap();
        assert_eq!(queue.enqueue(&segment(b"a")), EnqueueStatus::Enqueued);

        queue.stop_enqueue();
        assert!(queue.is_closed());
        for _ in 0..5 {
            assert_eq!(queue.try_enqueue(&segment(b"b"), queue.epoch()), EnqueueStatus::Closed);
            assert_eq!(queue.enqueue(&segment(b"b")), EnqueueStatus::Closed);
        }
        assert_eq!(queue.pending_segments(), vec![segment(b"a")]);

        queue.start_enqueue();
        assert_eq!(queue.enqueue(&segment(b"b")), EnqueueStatus::Enqueued);
    }

    #[test]
    fn test_stale_epoch() {
        let queue = SendingQueue::with_capacity(10).unwrap();
        let old_epoch = queue.epoch();
        queue.clear();

        assert_ne!(queue.epoch(), old_epoch);
        assert_eq!(queue.try_enqueue(&segment(b"a"), old_epoch), EnqueueStatus::StaleEpoch);
        assert_eq!(queue.try_enqueue(&segment(b"a"), queue.epoch()), EnqueueStatus::Enqueued);
    }

    #[test]
    fn test_clear_resets() {
        let queue = SendingQueue::with_capacity(2).unwrap();
        queue.enqueue(&segment(b"abc"));
        queue.enqueue(&segment(b"def"));
        queue.internal_trim(4);

        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.pending_segments().is_empty());
        assert!(!queue.is_closed());
        assert_eq!(queue.enqueue(&segment(b"x")), EnqueueStatus::Enqueued);
        assert_eq!(queue.pending_segments(), vec![segment(b"x")]);
    }

    #[test]
    fn test_clear_keeps_gate_closed() {
        let queue = SendingQueue::with_capacity(2).unwrap();
        queue.stop_enqueue();
        queue.clear();
        assert!(queue.is_closed());
    }

    #[test]
    fn test_clear_does_not_reopen_gate_closed_concurrently() {
        let queue = Arc::new(SendingQueue::with_capacity(4).unwrap());

        for _ in 0..200 {
            let clearing = {
                let queue = queue.clone();
                thread::spawn(move || queue.clear())
            };
            queue.stop_enqueue();
            clearing.join().unwrap();

            assert!(queue.is_closed());
            assert_eq!(queue.enqueue(&segment(b"a")), EnqueueStatus::Closed);
            queue.start_enqueue();
        }
    }

    #[test]
    fn test_writers_are_not_closed_out_by_clear() {
        let queue = Arc::new(SendingQueue::with_capacity(8).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let writers = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut statuses = Vec::new();
                    while !done.load(Ordering::SeqCst) {
                        let status = queue.enqueue(&segment(b"ack"));
                        if status != EnqueueStatus::Enqueued && !statuses.contains(&status) {
                            statuses.push(status);
                        }
                    }
                    statuses
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..500 {
            queue.clear();
        }
        done.store(true, Ordering::SeqCst);

        for w in writers {
            let statuses = w.join().unwrap();
            assert!(statuses.iter().all(|s| *s == EnqueueStatus::Full), "{:?}", statuses);
        }
    }

    #[rstest]
    #[case::empty(0, 0, true)]
    #[case::drained(2, 6, true)]
    #[case::partially_flushed(2, 4, false)]
    #[case::nothing_flushed(2, 0, false)]
    fn test_clear_if_drained(#[case] num_segments: usize, #[case] flushed: usize, #[case] expected: bool) {
        let queue = SendingQueue::with_capacity(4).unwrap();
        for _ in 0..num_segments {
            queue.enqueue(&segment(b"abc"));
        }
        queue.internal_trim(flushed);
        let epoch = queue.epoch();

        assert_eq!(queue.clear_if_drained(), expected);
        assert_eq!(queue.epoch() != epoch, expected);
        assert_eq!(queue.is_empty(), expected || num_segments == 0);
        assert!(!queue.is_closed());
    }

    #[test]
    fn test_clear_if_drained_keeps_concurrent_segments() {
        let queue = Arc::new(SendingQueue::with_capacity(100_000).unwrap());

        let writer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut enqueued = 0usize;
                for _ in 0..20_000 {
                    if queue.enqueue(&segment(b"x")) == EnqueueStatus::Enqueued {
                        enqueued += 1;
                    }
                }
                enqueued
            })
        };

        // play the transport: flush whatever is pending, then clear if nothing is left
        let mut flushed = 0usize;
        while !writer.is_finished() {
            let pending = queue.pending_bytes();
            queue.internal_trim(pending);
            flushed += pending;
            queue.clear_if_drained();
        }
        let enqueued = writer.join().unwrap();
        flushed += queue.pending_bytes();

        assert_eq!(flushed, enqueued);
        assert_eq!(enqueued, 20_000);
    }

    #[rstest]
    #[case::nothing(0, vec![b"abcd".as_slice(), b"efg".as_slice(), b"hi".as_slice()], false)]
    #[case::inside_first(1, vec![b"bcd".as_slice(), b"efg".as_slice(), b"hi".as_slice()], false)]
    #[case::end_of_first(4, vec![b"efg".as_slice(), b"hi".as_slice()], false)]
    #[case::inside_second(6, vec![b"g".as_slice(), b"hi".as_slice()], false)]
    #[case::inside_last(8, vec![b"i".as_slice()], false)]
    #[case::everything(9, vec![], true)]
    #[case::more_than_everything(20, vec![], true)]
    fn test_internal_trim(#[case] consumed: usize, #[case] expected: Vec<&'static [u8]>, #[case] expected_drained: bool) {
        let queue = SendingQueue::with_capacity(5).unwrap();
        queue.enqueue(&segment(b"abcd"));
        queue.enqueue(&segment(b"efg"));
        queue.enqueue(&segment(b"hi"));

        queue.internal_trim(consumed);

        let pending = queue.pending_segments();
        let pending: Vec<&[u8]> = pending.iter().map(|s| s.as_ref()).collect();
        assert_eq!(pending, expected);
        assert_eq!(queue.is_drained(), expected_drained);
    }

    #[test]
    fn test_partial_segment_length() {
        let queue = SendingQueue::with_capacity(5).unwrap();
        let array = Bytes::from(vec![1u8; 100]);
        queue.enqueue(&Segment::new(&array, 10, 50));
        queue.enqueue(&Segment::new(&array, 60, 40));

        // 50 bytes of the first segment, 15 of the second
        queue.internal_trim(65);
        assert_eq!(queue.pending_segments().iter().map(|s| s.len()).collect::<Vec<_>>(), vec![40 - 15]);
    }

    #[test]
    fn test_incremental_trims() {
        let queue = SendingQueue::with_capacity(5).unwrap();
        queue.enqueue(&segment(b"abcdef"));

        queue.internal_trim(2);
        queue.internal_trim(2);
        assert_eq!(queue.pending_segments(), vec![segment(b"ef")]);
        queue.internal_trim(2);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_concurrent_writers() {
        let queue = Arc::new(SendingQueue::with_capacity(1000).unwrap());

        let handles = (0..8)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut enqueued = 0;
                    for _ in 0..200 {
                        if queue.enqueue(&segment(b"data")) == EnqueueStatus::Enqueued {
                            enqueued += 1;
                        }
                    }
                    enqueued
                })
            })
            .collect::<Vec<_>>();

        let total: usize = handles.into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(total, 1000);
        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.pending_segments().len(), 1000);
    }

    #[test]
    fn test_stop_enqueue_while_writing() {
        let queue = Arc::new(SendingQueue::with_capacity(100_000).unwrap());

        let handles = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    while queue.enqueue(&segment(b"x")) == EnqueueStatus::Enqueued {}
                })
            })
            .collect::<Vec<_>>();

        thread::sleep(std::time::Duration::from_millis(5));
        queue.stop_enqueue();

        // no writer is mid-insert: every claimed slot holds its segment
        let len = queue.len();
        assert_eq!(queue.pending_segments().len(), len);

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.len(), len);
    }
}

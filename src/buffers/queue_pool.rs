use std::sync::{Arc, Mutex};
use anyhow::bail;
use tracing::{debug, trace};
use crate::buffers::segment::Segment;
use crate::buffers::sending_queue::SendingQueue;
use crate::util::lock;

pub(crate) type Slot = Mutex<Option<Segment>>;

/// A single pre-allocated array of segment slots, sliced into fixed-capacity [SendingQueue]s.
///
/// Connections come and go frequently in a game server, and allocating one array for all of
///  them amortizes the allocation. Each queue exclusively owns its slice
///  `[offset, offset+capacity)` for as long as it lives; dropping the queue returns the slice.
pub struct SendingQueuePool {
    capacity_per_queue: usize,
    slots: Box<[Slot]>,
    free_offsets: Mutex<Vec<usize>>,
}

impl SendingQueuePool {
    pub fn new(num_queues: usize, capacity_per_queue: usize) -> anyhow::Result<Arc<SendingQueuePool>> {
        if num_queues == 0 {
            bail!("a sending queue pool needs room for at least one queue");
        }
        if capacity_per_queue == 0 {
            bail!("sending queue capacity must be positive");
        }
        let Some(num_slots) = num_queues.checked_mul(capacity_per_queue) else {
            bail!("sending queue pool of {} x {} slots is too big", num_queues, capacity_per_queue);
        };

        debug!("allocating sending queue pool for {} queues with {} slots each", num_queues, capacity_per_queue);
        let slots = (0..num_slots)
            .map(|_| Mutex::new(None))
            .collect();
        // hand out low offsets first
        let free_offsets = (0..num_queues)
            .rev()
            .map(|i| i * capacity_per_queue)
            .collect();

        Ok(Arc::new(SendingQueuePool {
            capacity_per_queue,
            slots,
            free_offsets: Mutex::new(free_offsets),
        }))
    }

    pub fn capacity_per_queue(&self) -> usize {
        self.capacity_per_queue
    }

    pub fn num_available(&self) -> usize {
        lock(&self.free_offsets).len()
    }

    /// returns `None` if all slices are in use
    pub fn get_from_pool(self: &Arc<Self>) -> Option<SendingQueue> {
        let offset = lock(&self.free_offsets).pop()?;
        trace!("handing out sending queue slice at offset {}", offset);
        Some(SendingQueue::new_in_pool(self.clone(), offset, self.capacity_per_queue))
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// called by [SendingQueue]'s drop
    pub(crate) fn return_to_pool(&self, offset: usize) {
        for slot in &self.slots[offset..offset + self.capacity_per_queue] {
            *lock(slot) = None;
        }

        trace!("sending queue slice at offset {} returned to pool", offset);
        lock(&self.free_offsets).push(offset);
    }
}

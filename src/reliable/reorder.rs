use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, trace};
use crate::error::ProtocolViolation;
use crate::frame::Frame;

/// Receive-side reassembly: frames that arrive ahead of their predecessors are held back until
///  the gap is filled, and then released in strict sequence order.
pub struct ReorderBuffer {
    /// sequence number of the last frame that was released; the next one to release is
    ///  `expected_sequence + 1`
    expected_sequence: i64,
    pending: BTreeMap<i64, Frame>,
    max_len: usize,
}

impl ReorderBuffer {
    pub fn new(max_len: usize) -> ReorderBuffer {
        ReorderBuffer {
            expected_sequence: 0,
            pending: BTreeMap::default(),
            max_len,
        }
    }

    pub fn expected_sequence(&self) -> i64 {
        self.expected_sequence
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns the frames that are ready for delivery in order: none, this one, or this one
    ///  followed by a run of previously buffered frames.
    ///
    /// A peer that makes us buffer more than `max_len` frames is treated as misbehaving. The
    ///  frame that fills the gap is always accepted.
    pub fn on_receive(&mut self, frame: Frame) -> Result<Vec<Frame>, ProtocolViolation> {
        let sequence_number = frame.sequence_number;
        if sequence_number <= self.expected_sequence {
            debug!("dropping frame #{}: already delivered up to #{}", sequence_number, self.expected_sequence);
            return Ok(Vec::new());
        }

        let is_full = self.pending.len() >= self.max_len && sequence_number != self.expected_sequence + 1;
        match self.pending.entry(sequence_number) {
            Entry::Occupied(_) => {
                debug!("dropping duplicate of buffered frame #{}", sequence_number);
                return Ok(Vec::new());
            }
            Entry::Vacant(_) if is_full => {
                return Err(ProtocolViolation::ReorderBufferOverflow { max: self.max_len });
            }
            Entry::Vacant(e) => {
                e.insert(frame);
            }
        }

        let mut result = Vec::new();
        while let Some(frame) = self.pending.remove(&(self.expected_sequence + 1)) {
            self.expected_sequence += 1;
            result.push(frame);
        }

        if result.is_empty() {
            trace!("buffered frame #{} waiting for #{}", sequence_number, self.expected_sequence + 1);
        }
        Ok(result)
    }

    pub fn reset(&mut self) {
        self.expected_sequence = 0;
        self.pending.clear();
    }
}

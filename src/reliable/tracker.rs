use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};
use crate::config::TransportConfig;
use crate::error::ProtocolViolation;
use crate::frame::Frame;
use crate::reliable::clock::Clock;
use crate::reliable::reorder::ReorderBuffer;
use crate::reliable::rtt::RttEstimator;
use crate::util::lock;

/// A sent frame that was not acknowledged yet
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub frame: Frame,
    pub expire_at: Instant,
    pub resend_count: u32,
    pub resend_limit: u32,
    /// the retransmission timeout in effect when the frame was sent
    pub timeout: Duration,
    pub last_sent_at: Instant,
    /// `false` while the sending queue has never accepted the frame. Such a frame is due
    ///  immediately, and pushing it is its first transmission rather than a retransmission.
    pub transmitted: bool,
}

impl InFlightMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expire_at <= now
    }

    fn is_exhausted(&self) -> bool {
        self.transmitted && self.resend_count >= self.resend_limit
    }

    fn on_sent(&mut self, now: Instant) {
        if self.transmitted {
            self.resend_count += 1;
        }
        else {
            self.transmitted = true;
        }
        self.expire_at = now + self.timeout;
        self.last_sent_at = now;
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub to_resend: Vec<Frame>,
    /// At least one frame was retransmitted `resend_limit` times and is still not acknowledged.
    ///  `to_resend` is empty in this case: the connection is going to be closed.
    pub limit_exceeded: bool,
}

impl ScanResult {
    fn exceeded() -> ScanResult {
        ScanResult {
            to_resend: Vec::new(),
            limit_exceeded: true,
        }
    }
}

/// Sequencing and acknowledgement state of one connection, for both directions.
///
/// The send path and the retransmission timer run concurrently: sequence numbers come from an
///  atomic counter, and the tables are guarded by separate mutexes. Lock order is `in_flight`
///  before `rtt`.
pub struct ReliableDeliveryTracker {
    clock: Arc<dyn Clock>,
    resend_limit: u32,
    next_sequence: AtomicI64,
    in_flight: Mutex<BTreeMap<i64, InFlightMessage>>,
    rtt: Mutex<RttEstimator>,
    reorder: Mutex<ReorderBuffer>,
}

impl ReliableDeliveryTracker {
    pub fn new(config: &TransportConfig, clock: Arc<dyn Clock>) -> ReliableDeliveryTracker {
        ReliableDeliveryTracker {
            clock,
            resend_limit: config.resend_limit,
            next_sequence: AtomicI64::new(1),
            in_flight: Default::default(),
            rtt: Mutex::new(RttEstimator::new(config.initial_send_timeout, config.min_send_timeout)),
            reorder: Mutex::new(ReorderBuffer::new(config.max_reorder_buffer_len)),
        }
    }

    /// Assigns the next sequence number to the frame and registers it as in flight. Returns the
    ///  assigned sequence number.
    pub fn add_sending(&self, frame: &mut Frame) -> i64 {
        let sequence_number = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        frame.sequence_number = sequence_number;

        let now = self.clock.now();
        let timeout = lock(&self.rtt).timeout();

        lock(&self.in_flight).insert(sequence_number, InFlightMessage {
            frame: frame.clone(),
            expire_at: now + timeout,
            resend_count: 0,
            resend_limit: self.resend_limit,
            timeout,
            last_sent_at: now,
            transmitted: true,
        });
        trace!("frame #{} in flight, timeout {:?}", sequence_number, timeout);
        sequence_number
    }

    /// Acks may be late or duplicated, so an unknown sequence number is silently ignored
    pub fn on_ack(&self, sequence_number: i64) {
        let mut in_flight = lock(&self.in_flight);
        let Some(acked) = in_flight.remove(&sequence_number) else {
            trace!("ignoring ack for #{} which is not in flight", sequence_number);
            return;
        };

        let rtt_sample = self.clock.now().saturating_duration_since(acked.last_sent_at);
        let mut rtt = lock(&self.rtt);
        rtt.on_sample(rtt_sample);
        trace!("frame #{} acknowledged after {:?}, timeout now {:?}", sequence_number, rtt_sample, rtt.timeout());
    }

    /// Records that the sending queue did not accept the frame's first transmission. The frame
    ///  becomes due right away, and its resend count is not touched.
    pub fn mark_stalled(&self, sequence_number: i64) {
        if let Some(m) = lock(&self.in_flight).get_mut(&sequence_number) {
            m.transmitted = false;
            m.expire_at = m.last_sent_at;
            trace!("frame #{} stalled before its first transmission", sequence_number);
        }
    }

    /// Records that the sending queue accepted the frame. Only then does a retransmission count
    ///  against the resend limit, so backpressure from the queue can not exhaust it.
    pub fn mark_sent(&self, sequence_number: i64) {
        let now = self.clock.now();
        if let Some(m) = lock(&self.in_flight).get_mut(&sequence_number) {
            m.on_sent(now);
        }
    }

    /// Collects the frames whose timeout expired, without changing their state. The caller
    ///  pushes them in the returned order and calls [ReliableDeliveryTracker::mark_sent] for each
    ///  frame the sending queue accepted.
    ///
    /// Frames that never made it into the queue come first, then the rest by sequence number.
    ///
    /// If a single expired frame has reached its resend limit, nothing is returned and the
    ///  connection is reported as broken: delivery in order can not be guaranteed any more once
    ///  one frame is lost for good.
    pub fn collect_expired(&self) -> ScanResult {
        let now = self.clock.now();
        let in_flight = lock(&self.in_flight);
        Self::collect(&in_flight, now)
    }

    /// [ReliableDeliveryTracker::collect_expired] followed by marking every returned frame as
    ///  sent, for callers that can not fail to send.
    pub fn scan_expired(&self) -> ScanResult {
        let now = self.clock.now();
        let mut in_flight = lock(&self.in_flight);

        let result = Self::collect(&in_flight, now);
        for frame in &result.to_resend {
            if let Some(m) = in_flight.get_mut(&frame.sequence_number) {
                m.on_sent(now);
            }
        }
        result
    }

    fn collect(in_flight: &BTreeMap<i64, InFlightMessage>, now: Instant) -> ScanResult {
        let mut expired = in_flight.values()
            .filter(|m| m.is_expired(now))
            .collect::<Vec<_>>();

        if let Some(exhausted) = expired.iter().find(|m| m.is_exhausted()) {
            error!("frame #{} was not acknowledged after {} retransmissions", exhausted.frame.sequence_number, exhausted.resend_count);
            return ScanResult::exceeded();
        }

        // stable sort, so each group stays ordered by sequence number
        expired.sort_by_key(|m| m.transmitted);

        let to_resend = expired.into_iter()
            .map(|m| m.frame.clone())
            .collect::<Vec<_>>();
        if !to_resend.is_empty() {
            debug!("{} frames due for (re)transmission", to_resend.len());
        }
        ScanResult {
            to_resend,
            limit_exceeded: false,
        }
    }

    /// Receive side: returns the frames that are ready for in-order delivery
    pub fn on_receive(&self, frame: Frame) -> Result<Vec<Frame>, ProtocolViolation> {
        lock(&self.reorder).on_receive(frame)
    }

    /// Forgets all state of the previous logical stream
    pub fn reset(&self) {
        let mut in_flight = lock(&self.in_flight);
        let mut rtt = lock(&self.rtt);
        let mut reorder = lock(&self.reorder);

        debug!("resetting reliable delivery state, dropping {} in-flight and {} buffered frames", in_flight.len(), reorder.num_pending());
        in_flight.clear();
        rtt.reset();
        reorder.reset();
        self.next_sequence.store(1, Ordering::SeqCst);
    }

    pub fn in_flight_len(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn current_timeout(&self) -> Duration {
        lock(&self.rtt).timeout()
    }

    pub fn estimated_rtt(&self) -> Option<Duration> {
        lock(&self.rtt).estimated_rtt()
    }
}

use std::io;
use std::sync::{Arc, Mutex};
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};
use crate::buffers::segment::Segment;
use crate::buffers::sending_queue::{EnqueueStatus, SendingQueue};
use crate::config::TransportConfig;
use crate::error::{ProtocolViolation, TransportError, TransportResult};
use crate::frame::{Frame, OptionFlags};
use crate::message_dispatcher::{ProtocolRegistry, ACK_PROTOCOL_ID};
use crate::reliable::clock::Clock;
use crate::reliable::retransmit_timer::RetransmitTarget;
use crate::reliable::tracker::ReliableDeliveryTracker;
use crate::security::key_exchange::SessionKeys;
use crate::security::pipeline::SecurityPipeline;
use crate::util::lock;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// The frame was handed to the sending queue. Carries the frame's sequence number, which is
    ///  0 for unreliable frames.
    Queued(i64),
    /// The sending queue did not accept the frame. A reliable frame is still in flight and will
    ///  be pushed again by the retransmission scan; an unreliable frame is dropped.
    Stalled(i64),
}

/// One connection's transport state, combining framing, payload security, reliable delivery
///  and the outgoing segment queue.
///
/// The session layer owning the socket feeds received bytes into
///  [ReliableChannel::on_bytes_received] and writes outgoing bytes using
///  [ReliableChannel::flush_with]. A [RetransmitTimer](crate::reliable::retransmit_timer::RetransmitTimer)
///  drives [ReliableChannel::on_retransmit_tick].
///
/// Acknowledgements are frames of their own, with sequence number 0, the reserved protocol id
///  [ACK_PROTOCOL_ID] and the acknowledged sequence number as an i64 LE payload. If the security
///  policy authenticates, acks carry an HMAC like every other frame, and unauthenticated frames
///  are rejected.
pub struct ReliableChannel {
    max_frame_payload_len: usize,
    pipeline: SecurityPipeline,
    tracker: ReliableDeliveryTracker,
    queue: SendingQueue,
    registry: Arc<ProtocolRegistry>,
    session_keys: Mutex<Option<Arc<SessionKeys>>>,
}

impl ReliableChannel {
    pub fn new(config: &TransportConfig, queue: SendingQueue, registry: Arc<ProtocolRegistry>, clock: Arc<dyn Clock>) -> anyhow::Result<ReliableChannel> {
        config.validate()?;

        Ok(ReliableChannel {
            max_frame_payload_len: config.max_frame_payload_len,
            pipeline: SecurityPipeline::new(config.security.clone()),
            tracker: ReliableDeliveryTracker::new(config, clock),
            queue,
            registry,
            session_keys: Mutex::new(None),
        })
    }

    /// called by the session layer when the key exchange is complete
    pub fn set_session_keys(&self, keys: SessionKeys) {
        debug!("session keys installed");
        *lock(&self.session_keys) = Some(Arc::new(keys));
    }

    fn session_keys(&self) -> Option<Arc<SessionKeys>> {
        lock(&self.session_keys).clone()
    }

    pub fn tracker(&self) -> &ReliableDeliveryTracker {
        &self.tracker
    }

    pub fn pending_bytes(&self) -> usize {
        self.queue.pending_bytes()
    }

    pub fn send(&self, protocol_id: u16, payload: Bytes) -> TransportResult<SendOutcome> {
        let mut frame = self.seal_into_frame(protocol_id, payload)?;
        let sequence_number = self.tracker.add_sending(&mut frame);

        if self.push(&frame) {
            Ok(SendOutcome::Queued(sequence_number))
        }
        else {
            self.tracker.mark_stalled(sequence_number);
            Ok(SendOutcome::Stalled(sequence_number))
        }
    }

    /// Sends a frame without sequence number. It is neither acknowledged nor retransmitted, and
    ///  the receiver dispatches it immediately, regardless of reliable frames that are missing.
    pub fn send_unreliable(&self, protocol_id: u16, payload: Bytes) -> TransportResult<SendOutcome> {
        let frame = self.seal_into_frame(protocol_id, payload)?;

        if self.push(&frame) {
            Ok(SendOutcome::Queued(Frame::UNSEQUENCED))
        }
        else {
            Ok(SendOutcome::Stalled(Frame::UNSEQUENCED))
        }
    }

    fn seal_into_frame(&self, protocol_id: u16, payload: Bytes) -> TransportResult<Frame> {
        if protocol_id == ACK_PROTOCOL_ID {
            return Err(TransportError::Configuration(format!("protocol id {:#06x} is reserved for acknowledgements", protocol_id)));
        }

        let (payload, option_flags) = self.pipeline.seal(payload, self.session_keys().as_deref())?;
        if payload.len() > self.max_frame_payload_len {
            return Err(TransportError::Configuration(format!(
                "sealed payload of {} bytes exceeds the maximum frame payload of {} bytes", payload.len(), self.max_frame_payload_len
            )));
        }
        Ok(Frame::new(protocol_id, option_flags, payload))
    }

    /// returns `false` if the queue did not accept the frame
    fn push(&self, frame: &Frame) -> bool {
        let segment = Segment::from(frame.encode());
        match self.queue.enqueue(&segment) {
            EnqueueStatus::Enqueued => {
                trace!("queued frame #{} for protocol {}: {} bytes", frame.sequence_number, frame.protocol_id, segment.len());
                true
            }
            status => {
                debug!("sending queue did not accept frame #{}: {:?}", frame.sequence_number, status);
                false
            }
        }
    }

    fn send_ack(&self, sequence_number: i64) -> TransportResult<()> {
        let (payload, option_flags) = self.pipeline.seal_control(
            Bytes::copy_from_slice(&sequence_number.to_le_bytes()),
            self.session_keys().as_deref(),
        )?;
        // a lost ack is compensated by the peer's retransmission
        self.push(&Frame::new(ACK_PROTOCOL_ID, option_flags, payload));
        Ok(())
    }

    /// Processes all complete frames in `buf`, leaving a trailing incomplete frame in place for
    ///  the next call. An error means the connection must be closed.
    pub fn on_bytes_received(&self, buf: &mut BytesMut) -> TransportResult<()> {
        for frame in Frame::decode_all(buf, self.max_frame_payload_len)? {
            self.on_frame(frame)?;
        }
        Ok(())
    }

    fn on_frame(&self, frame: Frame) -> TransportResult<()> {
        trace!("received frame #{} for protocol {}: {} bytes", frame.sequence_number, frame.protocol_id, frame.payload.len());

        if frame.protocol_id == ACK_PROTOCOL_ID {
            let mut payload = self.unseal(&frame)?;
            if payload.len() != size_of::<i64>() {
                return Err(ProtocolViolation::MalformedAck(payload.len()).into());
            }
            self.tracker.on_ack(payload.get_i64_le());
            return Ok(());
        }

        if !frame.requires_ack() {
            let payload = self.unseal(&frame)?;
            self.registry.dispatch(frame.protocol_id, payload);
            return Ok(());
        }

        let plain = Frame {
            sequence_number: frame.sequence_number,
            protocol_id: frame.protocol_id,
            option_flags: OptionFlags::empty(),
            payload: self.unseal(&frame)?,
        };

        // duplicates are acknowledged as well: the peer retransmits because our first ack got lost
        self.send_ack(frame.sequence_number)?;

        for ready in self.tracker.on_receive(plain)? {
            self.registry.dispatch(ready.protocol_id, ready.payload);
        }
        Ok(())
    }

    fn unseal(&self, frame: &Frame) -> TransportResult<Bytes> {
        self.pipeline.unseal(frame.payload.clone(), frame.option_flags, self.session_keys().as_deref())
    }

    /// Hands pending outgoing bytes to `write`, segment by segment, until everything is written
    ///  or `write` accepts less than it was offered. Returns the number of bytes written.
    ///
    /// The queue is cleared once everything in it was written, making room for new frames.
    pub fn flush_with<F>(&self, mut write: F) -> io::Result<usize>
    where F: FnMut(&[u8]) -> io::Result<usize>
    {
        let mut written = 0;
        let mut result = Ok(());

        for segment in self.queue.pending_segments() {
            match write(segment.as_ref()) {
                Ok(n) => {
                    written += n;
                    if n < segment.len() {
                        break;
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.queue.internal_trim(written);
        if self.queue.is_drained() {
            // a producer may squeeze in a frame after the first check, so re-check while clearing
            self.queue.clear_if_drained();
        }

        trace!("flushed {} bytes", written);
        result.map(|_| written)
    }

    /// Pushes expired frames to the sending queue. A frame counts as retransmitted only once the
    ///  queue accepted it: a full queue delays retransmissions but does not use up the resend
    ///  limit.
    pub fn on_retransmit_tick(&self) -> TransportResult<()> {
        let scan = self.tracker.collect_expired();
        if scan.limit_exceeded {
            return Err(TransportError::ResendLimitExceeded);
        }

        for frame in &scan.to_resend {
            if !self.push(frame) {
                // the rest is pushed by a later scan
                break;
            }
            self.tracker.mark_sent(frame.sequence_number);
        }
        Ok(())
    }

    /// Drops all sequencing state and queued bytes, starting a fresh logical stream
    pub fn reset(&self) {
        self.tracker.reset();
        self.queue.clear();
    }
}

impl RetransmitTarget for ReliableChannel {
    fn on_retransmit_tick(&self) -> TransportResult<()> {
        ReliableChannel::on_retransmit_tick(self)
    }
}

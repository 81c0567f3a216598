use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::error::ProtocolViolation;

bitflags! {
    /// Per-frame flags describing which transformations were applied to the payload. They are
    ///  reversed in the opposite order: authentication is checked first, then decryption, then
    ///  decompression.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct OptionFlags: u8 {
        const ENCRYPTED     = 0b0000_0001;
        const COMPRESSED    = 0b0000_0010;
        const AUTHENTICATED = 0b0000_0100;
    }
}

/// One message on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// 0 for frames that do not require acknowledgement
    pub sequence_number: i64,
    pub protocol_id: u16,
    pub option_flags: OptionFlags,
    pub payload: Bytes,
}

#[derive(Debug, Eq, PartialEq)]
pub enum DecodeResult {
    Decoded(Frame),
    /// The buffer holds only part of a frame. Nothing was consumed.
    NeedMoreData,
}

impl Frame {
    pub const UNSEQUENCED: i64 = 0;

    /// sequence number (i64) + protocol id (u16) + option flags (u8)
    pub const HEADER_LEN: usize = size_of::<i64>() + size_of::<u16>() + size_of::<u8>();
    pub const LENGTH_PREFIX_LEN: usize = size_of::<u32>();
    pub const OVERHEAD: usize = Self::HEADER_LEN + Self::LENGTH_PREFIX_LEN;

    pub fn new(protocol_id: u16, option_flags: OptionFlags, payload: impl Into<Bytes>) -> Frame {
        Frame {
            sequence_number: Self::UNSEQUENCED,
            protocol_id,
            option_flags,
            payload: payload.into(),
        }
    }

    pub fn requires_ack(&self) -> bool {
        self.sequence_number != Self::UNSEQUENCED
    }

    pub fn encoded_len(&self) -> usize {
        Self::OVERHEAD + self.payload.len()
    }

    /// NB: The payload length must fit into the u32 length prefix. Channels enforce the
    ///      (much smaller) configured maximum before a frame gets here.
    pub fn ser(&self, buf: &mut impl BufMut) {
        assert!(self.payload.len() <= u32::MAX as usize, "this is a bug: payload length should have been checked against the configured maximum");

        buf.put_i64_le(self.sequence_number);
        buf.put_u16_le(self.protocol_id);
        buf.put_u8(self.option_flags.bits());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Attempts to take one complete frame from the start of `buf`.
    ///
    /// Truncated input is never an error: if the header, the length prefix or the payload is
    ///  incomplete, `NeedMoreData` is returned and `buf` is left untouched so the caller can retry
    ///  after appending more bytes. Errors are reserved for input that can never become valid.
    pub fn try_decode(buf: &mut BytesMut, max_payload_len: usize) -> Result<DecodeResult, ProtocolViolation> {
        if buf.len() < Self::OVERHEAD {
            return Ok(DecodeResult::NeedMoreData);
        }

        // peek at the header without consuming anything
        let mut header = &buf[..Self::OVERHEAD];
        let sequence_number = header.get_i64_le();
        let protocol_id = header.get_u16_le();
        let raw_flags = header.get_u8();
        let payload_len = header.get_u32_le() as usize;
        debug_assert!(header.is_empty());

        let option_flags = OptionFlags::from_bits(raw_flags)
            .ok_or(ProtocolViolation::UnknownOptionFlags(raw_flags))?;

        if payload_len > max_payload_len {
            return Err(ProtocolViolation::FrameTooLarge { declared: payload_len, max: max_payload_len });
        }

        if buf.len() - Self::OVERHEAD < payload_len {
            trace!("frame #{} declares {} payload bytes, {} buffered - waiting for more", sequence_number, payload_len, buf.len() - Self::OVERHEAD);
            return Ok(DecodeResult::NeedMoreData);
        }

        buf.advance(Self::OVERHEAD);
        let payload = buf.split_to(payload_len).freeze();

        Ok(DecodeResult::Decoded(Frame {
            sequence_number,
            protocol_id,
            option_flags,
            payload,
        }))
    }

    /// decodes all complete frames in the buffer, leaving a trailing partial frame in place
    pub fn decode_all(buf: &mut BytesMut, max_payload_len: usize) -> Result<Vec<Frame>, ProtocolViolation> {
        let mut result = Vec::new();
        while let DecodeResult::Decoded(frame) = Self::try_decode(buf, max_payload_len)? {
            result.push(frame);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MAX: usize = 1024;

    fn frame(sequence_number: i64, protocol_id: u16, flags: OptionFlags, payload: &[u8]) -> Frame {
        Frame {
            sequence_number,
            protocol_id,
            option_flags: flags,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_ser_layout() {
        let f = frame(0x0102030405060708, 0x0a0b, OptionFlags::ENCRYPTED | OptionFlags::COMPRESSED, b"xyz");
        assert_eq!(f.encode().as_ref(), &[
            8,7,6,5,4,3,2,1,
            0x0b,0x0a,
            3,
            3,0,0,0,
            b'x',b'y',b'z',
        ]);
    }

    #[rstest]
    #[case::empty(frame(0, 1, OptionFlags::empty(), b""))]
    #[case::sequenced(frame(17, 2, OptionFlags::empty(), b"abc"))]
    #[case::negative_seq(frame(-5, 3, OptionFlags::ENCRYPTED, b"abc"))]
    #[case::all_flags(frame(i64::MAX, u16::MAX, OptionFlags::all(), &[9u8; 300]))]
    fn test_round_trip(#[case] original: Frame) {
        let mut buf = BytesMut::from(original.encode().as_ref());
        assert_eq!(Frame::try_decode(&mut buf, MAX).unwrap(), DecodeResult::Decoded(original));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_every_strict_prefix_needs_more_data() {
        let encoded = frame(3, 4, OptionFlags::COMPRESSED, b"hello world").encode();

        for len in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..len]);
            assert_eq!(Frame::try_decode(&mut buf, MAX).unwrap(), DecodeResult::NeedMoreData, "prefix of length {}", len);
            assert_eq!(buf.as_ref(), &encoded[..len], "prefix of length {} was consumed", len);
        }
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let first = frame(1, 1, OptionFlags::empty(), b"first");
        let second = frame(2, 1, OptionFlags::empty(), b"second");

        let mut buf = BytesMut::new();
        first.ser(&mut buf);
        second.ser(&mut buf);
        buf.extend_from_slice(&[1, 2, 3]);

        assert_eq!(Frame::decode_all(&mut buf, MAX).unwrap(), vec![first, second]);
        assert_eq!(buf.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_incremental_arrival() {
        let original = frame(9, 7, OptionFlags::empty(), b"split across reads");
        let encoded = original.encode();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..5]);
        assert_eq!(Frame::try_decode(&mut buf, MAX).unwrap(), DecodeResult::NeedMoreData);
        buf.extend_from_slice(&encoded[5..20]);
        assert_eq!(Frame::try_decode(&mut buf, MAX).unwrap(), DecodeResult::NeedMoreData);
        buf.extend_from_slice(&encoded[20..]);
        assert_eq!(Frame::try_decode(&mut buf, MAX).unwrap(), DecodeResult::Decoded(original));
    }

    #[test]
    fn test_unknown_flags() {
        let mut buf = BytesMut::from(frame(1, 1, OptionFlags::empty(), b"a").encode().as_ref());
        buf[10] = 0x80;
        assert_eq!(Frame::try_decode(&mut buf, MAX), Err(ProtocolViolation::UnknownOptionFlags(0x80)));
    }

    #[test]
    fn test_oversized_frame_is_rejected_before_payload_arrives() {
        let mut buf = BytesMut::new();
        buf.put_i64_le(1);
        buf.put_u16_le(1);
        buf.put_u8(0);
        buf.put_u32_le(MAX as u32 + 1);

        assert_eq!(Frame::try_decode(&mut buf, MAX), Err(ProtocolViolation::FrameTooLarge { declared: MAX + 1, max: MAX }));
    }

    #[test]
    fn test_requires_ack() {
        assert!(!Frame::new(1, OptionFlags::empty(), &b"x"[..]).requires_ack());
        assert!(frame(1, 1, OptionFlags::empty(), b"x").requires_ack());
    }
}

//! LZ4 block compression with an explicit length header.
//!
//! ```ascii
//! 0: original (uncompressed) length (u32 BE)
//! 4: LZ4 block
//! ```
//!
//! The length header lets the receiver allocate an exactly-sized output buffer, and check the
//!  declared size against a limit *before* allocating.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::error::ProtocolViolation;

pub const LENGTH_HEADER_LEN: usize = size_of::<u32>();

pub fn compress(payload: &[u8]) -> Bytes {
    assert!(payload.len() <= u32::MAX as usize, "this is a bug: payload length should have been checked against the configured maximum");

    let compressed = lz4_flex::block::compress(payload);

    let mut buf = BytesMut::with_capacity(LENGTH_HEADER_LEN + compressed.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&compressed);

    trace!("compressed {} bytes to {}", payload.len(), buf.len());
    buf.freeze()
}

pub fn decompress(mut data: &[u8], max_len: usize) -> Result<Bytes, ProtocolViolation> {
    if data.len() < LENGTH_HEADER_LEN {
        return Err(ProtocolViolation::TruncatedCompressionHeader);
    }

    let declared = data.get_u32() as usize;
    if declared > max_len {
        return Err(ProtocolViolation::DecompressedLengthExceeded { declared, max: max_len });
    }

    let mut result = vec![0u8; declared];
    let actual = lz4_flex::block::decompress_into(data, &mut result)
        .map_err(|_| ProtocolViolation::CorruptCompressedData)?;
    if actual != declared {
        return Err(ProtocolViolation::DecompressedLengthMismatch { declared, actual });
    }

    Ok(result.into())
}

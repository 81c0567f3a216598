//! A reliable, ordered messaging transport over an externally supplied byte or datagram conduit.
//!
//! Outgoing payloads are compressed, encrypted and optionally authenticated
//!  ([security::pipeline]), numbered and tracked until acknowledged ([reliable::tracker]), framed
//!  ([frame]) and queued as segments for the socket owner to flush ([buffers]). Received bytes
//!  are decoded incrementally, unsealed, put back in sequence order and dispatched by protocol id
//!  ([message_dispatcher]). [channel::ReliableChannel] ties this together for one connection, and
//!  [reliable::retransmit_timer] drives its retransmissions.
//!
//! Frame layout (little endian):
//! ```ascii
//! 0:  sequence number (i64) - 0 for frames that are not acknowledged
//! 8:  protocol id (u16)
//! 10: option flags (u8): 0x01 encrypted, 0x02 compressed, 0x04 authenticated
//! 11: payload length (u32)
//! 15: payload
//! ```
//!
//! Payload transformations are nested in the order they are applied:
//! ```ascii
//! compressed:    original length (u32 BE), LZ4 block
//! encrypted:     IV (16 bytes), AES-256-CBC ciphertext with PKCS7 padding
//! authenticated: data, HMAC-SHA256 tag (32 bytes)
//! ```

pub mod buffers;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod message_dispatcher;
pub mod reliable;
pub mod security;
mod util;

#[cfg(test)] mod test_util;

use std::time::Duration;
use anyhow::bail;
use crate::security::key_exchange::KeySize;

/// Per-message security settings, applied by the send path of a channel
#[derive(Clone, Debug)]
pub struct SecurityPolicy {
    pub compress: bool,
    /// Payloads shorter than this are sent uncompressed. LZ4 has a fixed overhead, and for tiny
    ///  payloads the compressed form is frequently longer than the original.
    pub compression_threshold: usize,
    pub encrypt: bool,
    /// append an HMAC-SHA256 tag after compression and encryption
    pub authenticate: bool,

    /// Upper bound for the length declared in a compressed payload's header. Anything bigger is
    ///  rejected before allocating, protecting against 'decompression bomb' headers.
    pub max_decompressed_len: usize,
}

impl SecurityPolicy {
    pub fn plaintext() -> SecurityPolicy {
        SecurityPolicy {
            compress: false,
            compression_threshold: 256,
            encrypt: false,
            authenticate: false,
            max_decompressed_len: 16*1024*1024,
        }
    }

    pub fn requires_keys(&self) -> bool {
        self.encrypt || self.authenticate
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        SecurityPolicy {
            compress: true,
            compression_threshold: 256,
            encrypt: true,
            authenticate: false,
            max_decompressed_len: 16*1024*1024,
        }
    }
}


#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Retransmission timeout used before the first RTT sample is available
    pub initial_send_timeout: Duration,
    /// Lower bound for the adaptive retransmission timeout. RTT samples on a LAN can be well
    ///  below a millisecond, and retransmitting that aggressively only floods the peer.
    pub min_send_timeout: Duration,
    /// Number of retransmissions of a single frame before the connection is considered broken
    pub resend_limit: u32,
    /// interval at which the retransmission scan runs
    pub retransmit_interval: Duration,

    /// This is the number of *segments* (not bytes) a connection's sending queue can hold
    pub sending_queue_capacity: usize,
    pub max_frame_payload_len: usize,
    /// Maximum number of frames held back while waiting for a missing predecessor
    pub max_reorder_buffer_len: usize,

    pub security: SecurityPolicy,
    pub key_size: KeySize,
}

impl TransportConfig {
    pub fn default_lan() -> TransportConfig {
        TransportConfig {
            initial_send_timeout: Duration::from_millis(500),
            min_send_timeout: Duration::from_millis(50),
            resend_limit: 5,
            retransmit_interval: Duration::from_millis(20),
            sending_queue_capacity: 1024,
            max_frame_payload_len: 16*1024*1024,
            max_reorder_buffer_len: 4096,
            security: SecurityPolicy::default(),
            key_size: KeySize::Bits2048,
        }
    }

    pub fn default_internet() -> TransportConfig {
        TransportConfig {
            initial_send_timeout: Duration::from_secs(1),
            min_send_timeout: Duration::from_millis(200),
            resend_limit: 8,
            retransmit_interval: Duration::from_millis(50),
            ..Self::default_lan()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_send_timeout.is_zero() {
            bail!("minimum send timeout must be positive");
        }
        if self.initial_send_timeout < self.min_send_timeout {
            bail!("initial send timeout {:?} is below the minimum send timeout {:?}", self.initial_send_timeout, self.min_send_timeout);
        }
        if self.resend_limit == 0 {
            bail!("resend limit must be at least 1");
        }
        if self.retransmit_interval.is_zero() {
            bail!("retransmit interval must be positive");
        }
        if self.sending_queue_capacity == 0 {
            bail!("sending queue capacity must be positive");
        }
        if self.max_frame_payload_len > u32::MAX as usize {
            bail!("maximum frame payload length must fit the u32 length prefix");
        }
        if self.max_reorder_buffer_len == 0 {
            bail!("reorder buffer length must be positive");
        }
        if self.security.max_decompressed_len > u32::MAX as usize {
            bail!("maximum decompressed length must fit the u32 length header");
        }

        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::default_lan()
    }
}

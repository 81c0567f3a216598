use thiserror::Error;

/// Conditions that mean the byte stream of a connection can no longer be trusted. The connection
///  must be closed; there is no in-place retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("unknown option flag bits {0:#04x}")]
    UnknownOptionFlags(u8),

    #[error("declared payload length {declared} exceeds the maximum of {max}")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("compressed payload is shorter than its length header")]
    TruncatedCompressionHeader,

    #[error("declared decompressed length {declared} exceeds the maximum of {max}")]
    DecompressedLengthExceeded { declared: usize, max: usize },

    #[error("decompressed length {actual} does not match the declared length {declared}")]
    DecompressedLengthMismatch { declared: usize, actual: usize },

    #[error("corrupt compressed payload")]
    CorruptCompressedData,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("HMAC verification failed")]
    HmacVerificationFailed,

    #[error("frame is not authenticated, but the connection requires authentication")]
    MissingAuthentication,

    #[error("reorder buffer exceeded {max} entries")]
    ReorderBufferOverflow { max: usize },

    #[error("malformed acknowledgement payload of {0} bytes")]
    MalformedAck(usize),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resend limit exceeded")]
    ResendLimitExceeded,

    #[error("key exchange failed: {0}")]
    KeyExchange(String),
}

impl TransportError {
    /// true for errors after which the connection has to be closed
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            TransportError::ProtocolViolation(_) | TransportError::ResendLimitExceeded => true,
            TransportError::Configuration(_) | TransportError::KeyExchange(_) => false,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

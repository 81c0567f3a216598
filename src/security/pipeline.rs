use bytes::Bytes;
use tracing::trace;
use crate::config::SecurityPolicy;
use crate::error::{ProtocolViolation, TransportError, TransportResult};
use crate::frame::OptionFlags;
use crate::security::compression::{compress, decompress};
use crate::security::encryption::{decrypt, encrypt, unwrap_and_verify, wrap_with_hmac};
use crate::security::key_exchange::SessionKeys;

/// Applies the payload transformations of a connection.
///
/// The order is fixed: compress, then encrypt, then MAC on the way out, and the exact reverse on
///  the way in. Compressing after encryption would be wasted work since ciphertext does not
///  compress.
pub struct SecurityPipeline {
    policy: SecurityPolicy,
}

impl SecurityPipeline {
    pub fn new(policy: SecurityPolicy) -> SecurityPipeline {
        SecurityPipeline { policy }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// returns the transformed payload and the flags describing what was applied to it
    pub fn seal(&self, payload: Bytes, keys: Option<&SessionKeys>) -> TransportResult<(Bytes, OptionFlags)> {
        let mut flags = OptionFlags::empty();
        let mut payload = payload;

        if self.policy.compress && payload.len() >= self.policy.compression_threshold {
            payload = compress(&payload);
            flags |= OptionFlags::COMPRESSED;
        }

        if self.policy.encrypt {
            payload = encrypt(&payload, &Self::require_keys(keys, "encryption")?.cipher_key)?;
            flags |= OptionFlags::ENCRYPTED;
        }

        if self.policy.authenticate {
            payload = wrap_with_hmac(&payload, &Self::require_keys(keys, "authentication")?.mac_key)?;
            flags |= OptionFlags::AUTHENTICATED;
        }

        trace!("sealed payload: {} bytes, flags {:?}", payload.len(), flags);
        Ok((payload, flags))
    }

    /// Authenticates a transport control payload (an acknowledgement) if the policy requires
    ///  authentication. Control payloads are tiny and carry no application data, so they are
    ///  neither compressed nor encrypted.
    pub fn seal_control(&self, payload: Bytes, keys: Option<&SessionKeys>) -> TransportResult<(Bytes, OptionFlags)> {
        if !self.policy.authenticate {
            return Ok((payload, OptionFlags::empty()));
        }

        let sealed = wrap_with_hmac(&payload, &Self::require_keys(keys, "authentication")?.mac_key)?;
        Ok((sealed, OptionFlags::AUTHENTICATED))
    }

    /// Reverses [SecurityPipeline::seal] based on the flags the sender put on the frame. Flags
    ///  are honored even if the local policy would not set them, but if the local policy
    ///  authenticates, a frame without a MAC is rejected.
    pub fn unseal(&self, payload: Bytes, flags: OptionFlags, keys: Option<&SessionKeys>) -> TransportResult<Bytes> {
        if self.policy.authenticate && !flags.contains(OptionFlags::AUTHENTICATED) {
            return Err(ProtocolViolation::MissingAuthentication.into());
        }

        let mut payload = payload;

        if flags.contains(OptionFlags::AUTHENTICATED) {
            let mac_key = &Self::require_keys(keys, "authentication")?.mac_key;
            let content_len = unwrap_and_verify(&payload, mac_key)?.len();
            payload.truncate(content_len);
        }

        if flags.contains(OptionFlags::ENCRYPTED) {
            payload = decrypt(&payload, &Self::require_keys(keys, "decryption")?.cipher_key)?;
        }

        if flags.contains(OptionFlags::COMPRESSED) {
            payload = decompress(&payload, self.policy.max_decompressed_len)?;
        }

        Ok(payload)
    }

    fn require_keys<'a>(keys: Option<&'a SessionKeys>, purpose: &str) -> TransportResult<&'a SessionKeys> {
        keys.ok_or_else(|| TransportError::Configuration(format!("{} requires session keys, but no key exchange took place", purpose)))
    }
}

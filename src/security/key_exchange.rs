//! Finite-field Diffie-Hellman over fixed, well-known MODP groups.
//!
//! The shared secret is hashed with SHA-512, and the 64 byte digest is split into two
//!  independent keys:
//! ```ascii
//!  0: AES-256 key (32 bytes)
//! 32: HMAC-SHA256 key (32 bytes)
//! ```
//!
//! Public values are always serialized with the byte length of the prime, left-padded with
//!  zeroes, so their wire size depends only on the group.

use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, BytesMut};
use num_bigint::BigUint;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::RngCore;
use sha2::{Digest, Sha512};
use tracing::{debug, trace};
use crate::error::{TransportError, TransportResult};
use crate::security::encryption::KEY_LEN;

/// Oakley group 2, RFC 2409
const MODP_1024: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF",
);

/// MODP group 5, RFC 3526
const MODP_1536: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF",
);

/// MODP group 14, RFC 3526
const MODP_2048: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

const GENERATOR: u32 = 2;

/// The key size is sent as part of the handshake, so its numeric values are part of the wire
///  format.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum KeySize {
    Bits1024 = 1,
    Bits1536 = 2,
    Bits2048 = 3,
}

#[derive(Clone)]
pub struct DhParams {
    pub prime: BigUint,
    pub generator: BigUint,
}

impl DhParams {
    pub fn for_key_size(key_size: KeySize) -> DhParams {
        let hex = match key_size {
            KeySize::Bits1024 => MODP_1024,
            KeySize::Bits1536 => MODP_1536,
            KeySize::Bits2048 => MODP_2048,
        };

        DhParams {
            prime: BigUint::parse_bytes(hex.as_bytes(), 16)
                .expect("this is a bug: built-in DH prime should be valid hex"),
            generator: BigUint::from(GENERATOR),
        }
    }

    /// the fixed wire length of public values for this group
    pub fn public_key_len(&self) -> usize {
        self.prime.bits().div_ceil(8) as usize
    }

    /// Valid public values (both for our own private exponent and for the peer's public value)
    ///  are in `[2, P-2]`. 0, 1 and P-1 confine the shared secret to a trivial subgroup.
    fn is_in_valid_range(&self, value: &BigUint) -> bool {
        let two = BigUint::from(2u32);
        *value >= two && *value <= &self.prime - &two
    }

    fn pad_to_length(&self, value: &BigUint) -> Vec<u8> {
        let raw = value.to_bytes_be();
        let len = self.public_key_len();
        debug_assert!(raw.len() <= len);

        let mut result = vec![0u8; len];
        result[len - raw.len()..].copy_from_slice(&raw);
        result
    }

    /// uniform in `[2, P-2]`, by rejection sampling over random bytes masked to the bit length of P
    fn random_private_exponent(&self) -> BigUint {
        let bits = self.prime.bits();
        let len = self.public_key_len();
        let excess_bits = (len as u64 * 8 - bits) as u32;
        let top_mask = 0xffu8 >> excess_bits;

        let mut rng = rand::thread_rng();
        let mut buf = vec![0u8; len];
        loop {
            rng.fill_bytes(&mut buf);
            buf[0] &= top_mask;

            let candidate = BigUint::from_bytes_be(&buf);
            if self.is_in_valid_range(&candidate) {
                return candidate;
            }
            trace!("rejected private exponent candidate outside of [2, P-2]");
        }
    }
}


/// Symmetric keys derived from a key exchange
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKeys {
    pub cipher_key: [u8; KEY_LEN],
    pub mac_key: [u8; KEY_LEN],
}

impl Debug for SessionKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKeys{{..}}")
    }
}

impl SessionKeys {
    fn from_shared_secret(shared: &BigUint) -> SessionKeys {
        let digest = Sha512::digest(shared.to_bytes_be());

        let mut cipher_key = [0u8; KEY_LEN];
        let mut mac_key = [0u8; KEY_LEN];
        cipher_key.copy_from_slice(&digest[..KEY_LEN]);
        mac_key.copy_from_slice(&digest[KEY_LEN..]);

        SessionKeys { cipher_key, mac_key }
    }
}


/// One side of a key exchange. This lives for a single connection attempt.
pub struct DhSession {
    key_size: KeySize,
    params: DhParams,
    private: BigUint,
    public: BigUint,
}

impl Debug for DhSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhSession{{key_size:{:?}}}", self.key_size)
    }
}

impl DhSession {
    pub fn generate(key_size: KeySize) -> DhSession {
        let params = DhParams::for_key_size(key_size);
        let private = params.random_private_exponent();
        let public = params.generator.modpow(&private, &params.prime);

        debug!("generated DH key pair for {:?}", key_size);
        DhSession {
            key_size,
            params,
            private,
            public,
        }
    }

    pub fn key_size(&self) -> KeySize {
        self.key_size
    }

    pub fn params(&self) -> &DhParams {
        &self.params
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.params.pad_to_length(&self.public)
    }

    pub fn derive_shared(&self, peer_public: &[u8]) -> TransportResult<SessionKeys> {
        if peer_public.len() != self.params.public_key_len() {
            return Err(TransportError::KeyExchange(format!(
                "peer public key has {} bytes, expected {}", peer_public.len(), self.params.public_key_len()
            )));
        }

        let peer_public = BigUint::from_bytes_be(peer_public);
        if !self.params.is_in_valid_range(&peer_public) {
            return Err(TransportError::KeyExchange("peer public key is outside of [2, P-2]".to_string()));
        }

        let shared = peer_public.modpow(&self.private, &self.params.prime);
        Ok(SessionKeys::from_shared_secret(&shared))
    }

    pub fn to_message(&self) -> KeyExchangeMessage {
        KeyExchangeMessage {
            key_size: self.key_size,
            public_key: self.public_key_bytes(),
        }
    }
}


/// The payload a peer sends to announce its public value:
/// ```ascii
/// 0: key size (u8)
/// 1: public key (fixed length for the key size, BE)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyExchangeMessage {
    pub key_size: KeySize,
    pub public_key: Vec<u8>,
}

impl KeyExchangeMessage {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.key_size.into());
        buf.put_slice(&self.public_key);
    }

    pub fn deser(buf: &mut impl Buf) -> TransportResult<KeyExchangeMessage> {
        if !buf.has_remaining() {
            return Err(TransportError::KeyExchange("empty key exchange message".to_string()));
        }

        let raw_key_size = buf.get_u8();
        let key_size = KeySize::try_from(raw_key_size)
            .map_err(|_| TransportError::KeyExchange(format!("unsupported key size {}", raw_key_size)))?;

        let len = DhParams::for_key_size(key_size).public_key_len();
        if buf.remaining() != len {
            return Err(TransportError::KeyExchange(format!(
                "public key has {} bytes, expected {} for {:?}", buf.remaining(), len, key_size
            )));
        }

        let mut public_key = vec![0u8; len];
        buf.copy_to_slice(&mut public_key);
        Ok(KeyExchangeMessage { key_size, public_key })
    }

    /// completes the exchange on the side that generated `session`
    pub fn derive_keys(&self, session: &DhSession) -> TransportResult<SessionKeys> {
        if self.key_size != session.key_size() {
            return Err(TransportError::KeyExchange(format!(
                "peer uses {:?}, local session uses {:?}", self.key_size, session.key_size()
            )));
        }
        session.derive_shared(&self.public_key)
    }
}

//! AES-256-CBC payload encryption and the HMAC-SHA256 wrapper.
//!
//! Encrypted payload:
//! ```ascii
//!  0: IV (16 bytes), freshly random per payload
//! 16: AES-256-CBC ciphertext with PKCS7 padding
//! ```
//!
//! Authenticated payload:
//! ```ascii
//!  0: data
//!  *: HMAC-SHA256 tag over data (32 bytes)
//! ```

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, trace};
use crate::error::{ProtocolViolation, TransportError, TransportResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;
pub const HMAC_TAG_LEN: usize = 32;

fn check_key_len(key: &[u8]) -> TransportResult<()> {
    if key.len() != KEY_LEN {
        return Err(TransportError::Configuration(format!("AES-256 key must be {} bytes, was {}", KEY_LEN, key.len())));
    }
    Ok(())
}

pub fn encrypt(plaintext: &[u8], key: &[u8]) -> TransportResult<Bytes> {
    check_key_len(key)?;

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| TransportError::Configuration(format!("invalid key / IV: {}", e)))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut buf = BytesMut::with_capacity(IV_LEN + ciphertext.len());
    buf.put_slice(&iv);
    buf.put_slice(&ciphertext);
    trace!("encrypted {} bytes to {}", plaintext.len(), buf.len());
    Ok(buf.freeze())
}

pub fn decrypt(data: &[u8], key: &[u8]) -> TransportResult<Bytes> {
    check_key_len(key)?;

    // PKCS7 always adds at least one byte of padding, so there is at least one block
    if data.len() < IV_LEN + BLOCK_LEN || (data.len() - IV_LEN) % BLOCK_LEN != 0 {
        debug!("encrypted payload has invalid length {}", data.len());
        return Err(ProtocolViolation::DecryptionFailed.into());
    }

    let (iv, ciphertext) = data.split_at(IV_LEN);
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| TransportError::Configuration(format!("invalid key / IV: {}", e)))?;
    let plaintext = cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ProtocolViolation::DecryptionFailed)?;

    Ok(plaintext.into())
}

fn new_mac(mac_key: &[u8]) -> TransportResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| TransportError::Configuration(format!("invalid MAC key: {}", e)))
}

pub fn wrap_with_hmac(data: &[u8], mac_key: &[u8]) -> TransportResult<Bytes> {
    let mut mac = new_mac(mac_key)?;
    mac.update(data);
    let tag = mac.finalize().into_bytes();

    let mut buf = BytesMut::with_capacity(data.len() + HMAC_TAG_LEN);
    buf.put_slice(data);
    buf.put_slice(&tag);
    Ok(buf.freeze())
}

/// Returns the data without its tag if (and only if) the tag verifies. The comparison is
///  constant-time.
pub fn unwrap_and_verify<'a>(data: &'a [u8], mac_key: &[u8]) -> TransportResult<&'a [u8]> {
    if data.len() < HMAC_TAG_LEN {
        return Err(ProtocolViolation::HmacVerificationFailed.into());
    }

    let (content, tag) = data.split_at(data.len() - HMAC_TAG_LEN);
    let mut mac = new_mac(mac_key)?;
    mac.update(content);
    mac.verify_slice(tag)
        .map_err(|_| ProtocolViolation::HmacVerificationFailed)?;

    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const KEY: [u8; 32] = [7u8; 32];
    const OTHER_KEY: [u8; 32] = [8u8; 32];

    #[rstest]
    #[case::empty(vec![])]
    #[case::short(b"abc".to_vec())]
    #[case::exact_block(vec![1u8; 16])]
    #[case::multi_block(vec![2u8; 1000])]
    fn test_round_trip(#[case] plaintext: Vec<u8>) {
        let encrypted = encrypt(&plaintext, &KEY).unwrap();
        assert_eq!((encrypted.len() - IV_LEN) % BLOCK_LEN, 0);
        assert!(encrypted.len() > IV_LEN + plaintext.len());
        assert_eq!(decrypt(&encrypted, &KEY).unwrap().as_ref(), plaintext.as_slice());
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let a = encrypt(b"same plaintext", &KEY).unwrap();
        let b = encrypt(b"same plaintext", &KEY).unwrap();
        assert_ne!(&a[..IV_LEN], &b[..IV_LEN]);
        assert_ne!(a, b);
    }

    #[rstest]
    #[case::too_short(16)]
    #[case::too_long(33)]
    #[case::empty(0)]
    fn test_wrong_key_len(#[case] key_len: usize) {
        let key = vec![1u8; key_len];
        assert!(matches!(encrypt(b"x", &key), Err(TransportError::Configuration(_))));
        assert!(matches!(decrypt(&[0u8; 32], &key), Err(TransportError::Configuration(_))));
    }

    #[rstest]
    #[case::empty(0)]
    #[case::only_iv(16)]
    #[case::partial_block(40)]
    fn test_decrypt_invalid_length(#[case] len: usize) {
        assert!(matches!(
            decrypt(&vec![0u8; len], &KEY),
            Err(TransportError::ProtocolViolation(ProtocolViolation::DecryptionFailed))
        ));
    }

    #[test]
    fn test_decrypt_with_wrong_key_does_not_return_plaintext() {
        let encrypted = encrypt(b"secret message that spans blocks", &KEY).unwrap();
        match decrypt(&encrypted, &OTHER_KEY) {
            Ok(decrypted) => assert_ne!(decrypted.as_ref(), b"secret message that spans blocks"),
            Err(e) => assert!(matches!(e, TransportError::ProtocolViolation(ProtocolViolation::DecryptionFailed))),
        }
    }

    #[test]
    fn test_hmac_round_trip() {
        let wrapped = wrap_with_hmac(b"payload", &KEY).unwrap();
        assert_eq!(wrapped.len(), 7 + HMAC_TAG_LEN);
        assert_eq!(unwrap_and_verify(&wrapped, &KEY).unwrap(), b"payload");
    }

    #[test]
    fn test_hmac_empty_data() {
        let wrapped = wrap_with_hmac(b"", &KEY).unwrap();
        assert_eq!(unwrap_and_verify(&wrapped, &KEY).unwrap(), b"");
    }

    #[rstest]
    #[case::flip_data(0)]
    #[case::flip_last_data(6)]
    #[case::flip_tag(7)]
    #[case::flip_last_tag(38)]
    fn test_hmac_tamper(#[case] offset: usize) {
        let mut wrapped = BytesMut::from(wrap_with_hmac(b"payload", &KEY).unwrap().as_ref());
        wrapped[offset] ^= 1;
        assert!(matches!(
            unwrap_and_verify(&wrapped, &KEY),
            Err(TransportError::ProtocolViolation(ProtocolViolation::HmacVerificationFailed))
        ));
    }

    #[test]
    fn test_hmac_wrong_key() {
        let wrapped = wrap_with_hmac(b"payload", &KEY).unwrap();
        assert!(unwrap_and_verify(&wrapped, &OTHER_KEY).is_err());
    }

    #[test]
    fn test_hmac_too_short() {
        assert!(matches!(
            unwrap_and_verify(&[0u8; 31], &KEY),
            Err(TransportError::ProtocolViolation(ProtocolViolation::HmacVerificationFailed))
        ));
    }
}

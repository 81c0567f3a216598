//! Payload protection: compression, encryption, authentication and the key exchange that
//!  produces the keys for them.

pub mod compression;
pub mod encryption;
pub mod key_exchange;
pub mod pipeline;

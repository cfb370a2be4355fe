//! Lightning-style Sphinx onion packet construction and processing.
//!
//! An origin wraps one payload per hop into a single fixed-size [`Onion`].
//! Each hop peels exactly one layer with its static secp256k1 key, learns
//! its own payload and either forwards the remaining onion or finds out it
//! is the final destination. The packet is [`ONION_SIZE`] bytes at every
//! hop, so its size says nothing about the position in the route.
//!
//! ```text
//! [version:1][point:33][hop_payloads:1300][hmac:32] = 1366 bytes
//! ```

pub mod crypto;
pub mod header;
pub mod hop;
pub mod packet;

pub use header::Header;
pub use hop::HopPayload;
pub use packet::{NextHop, Onion};

pub type OnionVersion = u8;

/// The only supported packet version.
pub const VERSION: OnionVersion = 0x00;

/// Compressed secp256k1 public key size.
pub const POINT_SIZE: usize = 33;

/// Size of the layered-encrypted hop payloads region.
pub const HOP_PAYLOADS_SIZE: usize = 1300;

/// HMAC-SHA256 tag size.
pub const HMAC_SIZE: usize = 32;

/// Serialized onion size.
pub const ONION_SIZE: usize = 1 + POINT_SIZE + HOP_PAYLOADS_SIZE + HMAC_SIZE;

/// Largest payload a single-byte length prefix can describe.
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Smallest payload length a hop accepts.
pub const MIN_PAYLOAD_SIZE: usize = 2;

// Keystream length used when peeling: the region plus as many fresh bytes.
pub(crate) const STREAM_SIZE: usize = 2 * HOP_PAYLOADS_SIZE;

pub(crate) type Sha256 = cryptimitives::hash::sha256::Hash;
pub(crate) type HmacSha256 = cryptimitives::hmac::sha256::Hmac;
pub(crate) type ChaCha20 = cryptimitives::stream_cipher::chacha20::StreamCipher;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OnionError {
    #[error("onion must be {} bytes, got {0}", ONION_SIZE)]
    InvalidLength(usize),

    #[error("unsupported onion version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("invalid hmac")]
    IntegrityFailure,

    #[error("payload length {0} is too short")]
    ShortPayload(usize),

    #[error("route has no hops")]
    EmptyRoute,

    #[error("payload length {0} does not fit a single-byte length prefix")]
    PayloadTooLarge(usize),

    #[error("hop payloads need {size} bytes, only {capacity} available")]
    PacketOverflow { size: usize, capacity: usize },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("entropy source failed: {0}")]
    Entropy(String),
}

#[cfg(test)]
mod tests {
    use secp256k1::{Secp256k1, SecretKey};

    use crate::{crypto::generate_session_key, HopPayload, NextHop, Onion, ONION_SIZE};

    #[test]
    fn test_e2e() {
        let secp = Secp256k1::new();
        let max_relays = 5u8;

        let relay_keys: Vec<SecretKey> = (1..=max_relays)
            .map(|i| SecretKey::from_slice(&[i; 32]).unwrap())
            .collect();

        let hops: Vec<HopPayload> = relay_keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                HopPayload::new(
                    key.public_key(&secp),
                    format!("Hello, relay #{}!", i).into_bytes(),
                )
            })
            .collect();

        let session_key = generate_session_key().unwrap();
        let mut onion = Onion::new(session_key, &hops).unwrap();

        for (i, (key, hop)) in relay_keys.iter().zip(&hops).enumerate() {
            let bytes = onion.to_bytes();
            assert_eq!(bytes.len(), ONION_SIZE);

            let received = Onion::from_bytes(&bytes).unwrap();
            let (payload, next) = received.peel(key).unwrap();

            assert_eq!(payload.payload, hop.payload);
            assert_eq!(payload.public_key, key.public_key(&secp));

            match next {
                NextHop::Forward(next_onion) => {
                    assert!(i < hops.len() - 1, "forwarding past the final hop");
                    onion = next_onion;
                }
                NextHop::FinalHop => assert_eq!(i, hops.len() - 1),
            }
        }
    }
}

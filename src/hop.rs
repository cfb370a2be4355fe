//! Per-hop payloads.

use secp256k1::PublicKey;

use crate::{OnionError, HMAC_SIZE, MAX_PAYLOAD_SIZE, MIN_PAYLOAD_SIZE};

/// One hop of a route: who it is and what it receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopPayload {
    /// Static public key of the hop.
    pub public_key: PublicKey,

    /// Opaque data delivered to the hop.
    pub payload: Vec<u8>,
}

impl HopPayload {
    pub fn new(public_key: PublicKey, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            public_key,
            payload: payload.into(),
        }
    }

    /// Size of this hop's layer: length prefix, payload and next HMAC.
    pub fn size(&self) -> usize {
        1 + self.payload.len() + HMAC_SIZE
    }

    /// Encode the plaintext layer `[len][payload][next_hmac]`.
    pub(crate) fn encode_layer(&self, next_hmac: &[u8; HMAC_SIZE]) -> Result<Vec<u8>, OnionError> {
        let len = self.payload.len();

        if len > MAX_PAYLOAD_SIZE {
            return Err(OnionError::PayloadTooLarge(len));
        }

        if len < MIN_PAYLOAD_SIZE {
            return Err(OnionError::ShortPayload(len));
        }

        let mut layer = Vec::with_capacity(self.size());
        layer.push(len as u8);
        layer.extend_from_slice(&self.payload);
        layer.extend_from_slice(next_hmac);

        Ok(layer)
    }
}

#[cfg(test)]
mod tests {
    use secp256k1::{Secp256k1, SecretKey};

    use super::*;

    fn hop(payload: &[u8]) -> HopPayload {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[1; 32]).unwrap();

        HopPayload::new(key.public_key(&secp), payload)
    }

    #[test]
    fn test_size() {
        assert_eq!(hop(b"hi bob").size(), 1 + 6 + 32);
    }

    #[test]
    fn test_encode_layer() {
        let next_hmac = [0xab; HMAC_SIZE];
        let layer = hop(b"hi bob").encode_layer(&next_hmac).unwrap();

        assert_eq!(layer.len(), hop(b"hi bob").size());
        assert_eq!(layer[0], 6);
        assert_eq!(&layer[1..7], b"hi bob");
        assert_eq!(&layer[7..], &next_hmac);
    }

    #[test]
    fn test_payload_bounds() {
        let next_hmac = [0; HMAC_SIZE];

        assert!(hop(&[0; MAX_PAYLOAD_SIZE]).encode_layer(&next_hmac).is_ok());
        assert_eq!(
            hop(&[0; MAX_PAYLOAD_SIZE + 1]).encode_layer(&next_hmac),
            Err(OnionError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
        assert_eq!(
            hop(b"x").encode_layer(&next_hmac),
            Err(OnionError::ShortPayload(1))
        );
    }
}

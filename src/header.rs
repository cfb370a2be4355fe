//! Layered hop payloads region and its HMAC.

use cryptraits::{hmac::Hmac, stream_cipher::StreamCipher};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::{
    crypto::{
        compute_mac, generate_cipher_stream, generate_filler, generate_key, right_shift, xor,
        HopKeys, KeyType, SharedSecret,
    },
    HopPayload, OnionError, HMAC_SIZE, HOP_PAYLOADS_SIZE, MIN_PAYLOAD_SIZE, STREAM_SIZE,
};

/// Encrypted routing part of an onion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Layered-encrypted payloads of this and all later hops.
    pub hop_payloads: [u8; HOP_PAYLOADS_SIZE],

    /// HMAC of hop_payloads, verifiable by the current hop only.
    pub hmac: [u8; HMAC_SIZE],
}

impl Header {
    /// Wrap every hop's payload, innermost (last hop) first.
    pub(crate) fn new<H, SC>(hops: &[HopPayload], hop_keys: &[HopKeys]) -> Result<Self, OnionError>
    where
        H: Hmac,
        SC: StreamCipher,
    {
        Self::validate_header_input(hops)?;
        debug_assert_eq!(hops.len(), hop_keys.len());

        let first = hop_keys.first().ok_or(OnionError::EmptyRoute)?;

        // Start from noise so untouched bytes never show as zeros.
        let pad_key = generate_key::<H>(KeyType::Pad, &first.shared_secret)?;
        let mut hop_payloads = generate_cipher_stream::<SC>(&pad_key, HOP_PAYLOADS_SIZE)?;

        let hop_sizes: Vec<usize> = hops.iter().map(HopPayload::size).collect();
        let filler = generate_filler::<H, SC>(&hop_sizes, hop_keys)?;

        // All-zero next HMAC marks the final hop.
        let mut hmac = [0; HMAC_SIZE];

        for (i, (hop, keys)) in hops.iter().zip(hop_keys).enumerate().rev() {
            let rho_key = generate_key::<H>(KeyType::Rho, &keys.shared_secret)?;
            let mu_key = generate_key::<H>(KeyType::Mu, &keys.shared_secret)?;

            let layer = Zeroizing::new(hop.encode_layer(&hmac)?);

            right_shift(&mut hop_payloads, layer.len());
            hop_payloads[..layer.len()].copy_from_slice(&layer);

            let cipher =
                Zeroizing::new(generate_cipher_stream::<SC>(&rho_key, HOP_PAYLOADS_SIZE)?);
            xor(&mut hop_payloads, &cipher);

            if i == hops.len() - 1 {
                let len = hop_payloads.len() - filler.len();
                hop_payloads[len..].copy_from_slice(&filler);
            }

            hmac = Self::to_hmac(compute_mac::<H>(&mu_key, &hop_payloads)?)?;
        }

        let mut region = [0; HOP_PAYLOADS_SIZE];
        region.copy_from_slice(&hop_payloads);

        Ok(Header {
            hop_payloads: region,
            hmac,
        })
    }

    /// Validate header input data.
    fn validate_header_input(hops: &[HopPayload]) -> Result<(), OnionError> {
        if hops.is_empty() {
            return Err(OnionError::EmptyRoute);
        }

        let size: usize = hops.iter().map(HopPayload::size).sum();

        if size > HOP_PAYLOADS_SIZE {
            Err(OnionError::PacketOverflow {
                size,
                capacity: HOP_PAYLOADS_SIZE,
            })
        } else {
            Ok(())
        }
    }

    fn to_hmac(mac: Vec<u8>) -> Result<[u8; HMAC_SIZE], OnionError> {
        mac.try_into()
            .map_err(|mac: Vec<u8>| OnionError::Crypto(format!("unexpected hmac length {}", mac.len())))
    }

    /// Verify and unwrap one layer.
    ///
    /// Returns this hop's payload and, unless the embedded next HMAC is the
    /// all-zero sentinel, the header to forward.
    pub(crate) fn peel<H, SC>(
        &self,
        shared_secret: &SharedSecret,
    ) -> Result<(Vec<u8>, Option<Self>), OnionError>
    where
        H: Hmac,
        SC: StreamCipher,
    {
        let mu_key = generate_key::<H>(KeyType::Mu, shared_secret)?;
        let hmac = compute_mac::<H>(&mu_key, &self.hop_payloads)?;

        if !bool::from(hmac.as_slice().ct_eq(&self.hmac[..])) {
            tracing::warn!("onion hmac mismatch");
            return Err(OnionError::IntegrityFailure);
        }

        let rho_key = generate_key::<H>(KeyType::Rho, shared_secret)?;
        let cipher = Zeroizing::new(generate_cipher_stream::<SC>(&rho_key, STREAM_SIZE)?);

        // Zero-extend to twice the region: the second half becomes fresh
        // tail bytes for the next hop.
        let mut unwrapped = Zeroizing::new(vec![0; STREAM_SIZE]);
        unwrapped[..HOP_PAYLOADS_SIZE].copy_from_slice(&self.hop_payloads);
        xor(&mut unwrapped, &cipher);

        let payload_len = unwrapped[0] as usize;
        if payload_len < MIN_PAYLOAD_SIZE {
            return Err(OnionError::ShortPayload(payload_len));
        }

        let hmac_start = 1 + payload_len;
        let next_start = hmac_start + HMAC_SIZE;

        let payload = unwrapped[1..hmac_start].to_vec();

        let mut next_hmac = [0; HMAC_SIZE];
        next_hmac.copy_from_slice(&unwrapped[hmac_start..next_start]);

        if next_hmac == [0; HMAC_SIZE] {
            return Ok((payload, None));
        }

        let mut hop_payloads = [0; HOP_PAYLOADS_SIZE];
        hop_payloads.copy_from_slice(&unwrapped[next_start..next_start + HOP_PAYLOADS_SIZE]);

        let next_header = Self {
            hop_payloads,
            hmac: next_hmac,
        };

        Ok((payload, Some(next_header)))
    }
}

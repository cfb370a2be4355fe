//! Onion packet.

use cryptraits::convert::Len;
use secp256k1::{PublicKey, Secp256k1, SecretKey, Signing, Verification};

use crate::{
    crypto::{compute_shared_secret, generate_hop_keys, next_ephemeral_key},
    header::Header,
    ChaCha20, HmacSha256, HopPayload, OnionError, OnionVersion, Sha256, HMAC_SIZE,
    HOP_PAYLOADS_SIZE, ONION_SIZE, POINT_SIZE, VERSION,
};

const POINT_OFFSET: usize = 1;
const HOP_PAYLOADS_OFFSET: usize = POINT_OFFSET + POINT_SIZE;
const HMAC_OFFSET: usize = HOP_PAYLOADS_OFFSET + HOP_PAYLOADS_SIZE;

/// Onion packet, [`ONION_SIZE`] bytes on the wire at every hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Onion {
    /// Onion packet version.
    pub version: OnionVersion,

    /// Compressed ephemeral public key for the current hop.
    pub point: [u8; POINT_SIZE],

    /// Encrypted hop payloads and their HMAC.
    pub header: Header,
}

/// What a hop does after peeling its layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// Send this onion on to the next hop.
    Forward(Onion),

    /// The peeling hop is the destination.
    FinalHop,
}

impl NextHop {
    pub fn is_final(&self) -> bool {
        matches!(self, NextHop::FinalHop)
    }
}

impl Len for Onion {
    const LEN: usize = ONION_SIZE;
}

impl Onion {
    /// Creates a new onion to be sent to the first hop of the route. It takes
    /// the origin's session key and the ordered hops (public key and payload
    /// each) and wraps every payload in its own layer, so each hop can read
    /// only what is meant for it.
    ///
    /// Fails with [`OnionError::EmptyRoute`] for no hops,
    /// [`OnionError::PayloadTooLarge`] for a payload over 255 bytes and
    /// [`OnionError::PacketOverflow`] when the layers exceed the region.
    /// Payloads shorter than 2 bytes are rejected with
    /// [`OnionError::ShortPayload`]: their hop would refuse them on peeling.
    pub fn new(session_key: SecretKey, hops: &[HopPayload]) -> Result<Self, OnionError> {
        Self::new_with_context(&Secp256k1::new(), session_key, hops)
    }

    /// [`Onion::new`] with a caller-owned secp256k1 context.
    pub fn new_with_context<C>(
        secp: &Secp256k1<C>,
        session_key: SecretKey,
        hops: &[HopPayload],
    ) -> Result<Self, OnionError>
    where
        C: Signing + Verification,
    {
        let circuit_pub_keys: Vec<PublicKey> = hops.iter().map(|hop| hop.public_key).collect();
        let hop_keys = generate_hop_keys::<Sha256, _>(secp, &circuit_pub_keys, session_key)?;

        let header = Header::new::<HmacSha256, ChaCha20>(hops, &hop_keys)?;

        tracing::debug!(
            hops = hops.len(),
            used = hops.iter().map(HopPayload::size).sum::<usize>(),
            "constructed onion"
        );

        Ok(Self {
            version: VERSION,
            point: hop_keys[0].ephemeral_public_key.serialize(),
            header,
        })
    }

    /// Decrypt the outer layer with the hop's static key.
    ///
    /// Returns the hop's payload and either the onion to forward or
    /// [`NextHop::FinalHop`].
    pub fn peel(&self, hop_key: &SecretKey) -> Result<(HopPayload, NextHop), OnionError> {
        self.peel_with_context(&Secp256k1::new(), hop_key)
    }

    /// [`Onion::peel`] with a caller-owned secp256k1 context.
    pub fn peel_with_context<C>(
        &self,
        secp: &Secp256k1<C>,
        hop_key: &SecretKey,
    ) -> Result<(HopPayload, NextHop), OnionError>
    where
        C: Signing + Verification,
    {
        if self.version != VERSION {
            return Err(OnionError::UnsupportedVersion(self.version));
        }

        let public_key = PublicKey::from_slice(&self.point)
            .map_err(|e| OnionError::MalformedKey(e.to_string()))?;

        let shared_secret = compute_shared_secret::<Sha256, _>(secp, &public_key, hop_key)?;

        let (payload, next_header) = self
            .header
            .peel::<HmacSha256, ChaCha20>(&shared_secret)?;

        let hop_payload = HopPayload::new(hop_key.public_key(secp), payload);

        let next_header = match next_header {
            Some(next_header) => next_header,
            None => {
                tracing::debug!(len = hop_payload.payload.len(), "peeled final onion layer");
                return Ok((hop_payload, NextHop::FinalHop));
            }
        };

        let next_public_key =
            next_ephemeral_key::<Sha256, _>(secp, &public_key, &shared_secret)?;

        tracing::debug!(len = hop_payload.payload.len(), "peeled onion layer");

        Ok((
            hop_payload,
            NextHop::Forward(Self {
                version: VERSION,
                point: next_public_key.serialize(),
                header: next_header,
            }),
        ))
    }

    pub fn to_bytes(&self) -> [u8; ONION_SIZE] {
        let mut packet = [0; ONION_SIZE];

        packet[0] = self.version;
        packet[POINT_OFFSET..HOP_PAYLOADS_OFFSET].copy_from_slice(&self.point);
        packet[HOP_PAYLOADS_OFFSET..HMAC_OFFSET].copy_from_slice(&self.header.hop_payloads);
        packet[HMAC_OFFSET..].copy_from_slice(&self.header.hmac);

        packet
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    /// Parse the fixed layout. Field values are checked by [`Onion::peel`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OnionError> {
        if bytes.len() != Self::LEN {
            return Err(OnionError::InvalidLength(bytes.len()));
        }

        let mut point = [0; POINT_SIZE];
        point.copy_from_slice(&bytes[POINT_OFFSET..HOP_PAYLOADS_OFFSET]);

        let mut hop_payloads = [0; HOP_PAYLOADS_SIZE];
        hop_payloads.copy_from_slice(&bytes[HOP_PAYLOADS_OFFSET..HMAC_OFFSET]);

        let mut hmac = [0; HMAC_SIZE];
        hmac.copy_from_slice(&bytes[HMAC_OFFSET..]);

        Ok(Self {
            version: bytes[0],
            point,
            header: Header { hop_payloads, hmac },
        })
    }
}

impl TryFrom<&[u8]> for Onion {
    type Error = OnionError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(bytes)
    }
}

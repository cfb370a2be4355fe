use std::fmt::Debug;

use cryptraits::{hash::Hash, hmac::Hmac, stream_cipher::StreamCipher};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing, Verification};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::{OnionError, HOP_PAYLOADS_SIZE, STREAM_SIZE};

/// Key derived from a shared secret, wiped on drop.
pub type DerivedKey = Zeroizing<Vec<u8>>;

/// ChaCha20 nonce, always zero: every key is used for a single stream.
const NONCE: [u8; 12] = [0; 12];

/// Purpose tags for keys derived from a hop's shared secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Hop payloads keystream.
    Rho,
    /// HMAC key.
    Mu,
    /// Initial packet padding, origin side only.
    Pad,
}

impl KeyType {
    pub const fn as_bytes(&self) -> &'static [u8] {
        match self {
            KeyType::Rho => b"rho",
            KeyType::Mu => b"mu",
            KeyType::Pad => b"pad",
        }
    }
}

/// SHA-256 of the compressed ECDH point shared between an ephemeral key and a hop.
#[derive(Clone, Zeroize)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    fn from_digest(digest: Vec<u8>) -> Result<Self, OnionError> {
        let digest = Zeroizing::new(digest);
        let bytes: [u8; 32] = digest
            .as_slice()
            .try_into()
            .map_err(|_| OnionError::Crypto(format!("unexpected digest length {}", digest.len())))?;

        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for SharedSecret {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SharedSecret {}

impl Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.zeroize()
    }
}

/// Per-hop key material computed by the origin.
#[derive(Debug)]
pub struct HopKeys {
    /// Ephemeral public key this hop will find in its onion.
    pub ephemeral_public_key: PublicKey,
    pub shared_secret: SharedSecret,
}

// Generate cipher stream of size num_bytes.
pub(crate) fn generate_cipher_stream<SC>(
    key: &[u8],
    num_bytes: usize,
) -> Result<Vec<u8>, OnionError>
where
    SC: StreamCipher,
{
    let mut cipher = SC::new_from_slices(key, &NONCE)
        .map_err(|e| OnionError::Crypto(format!("{:?}", e)))?;

    let mut out = vec![0; num_bytes];
    cipher
        .apply_keystream(out.as_mut_slice())
        .map_err(|e| OnionError::Crypto(format!("{:?}", e)))?;

    Ok(out)
}

/// Xor slices in-place. Only the common prefix is touched.
pub(crate) fn xor(a: &mut [u8], b: &[u8]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x ^= y;
    }
}

/// Shift `buf` right by `num` bytes, zero-filling the gap at the head.
pub(crate) fn right_shift(buf: &mut [u8], num: usize) {
    let len = buf.len();
    let num = num.min(len);

    buf.copy_within(..len - num, num);
    buf[..num].fill(0);
}

pub(crate) fn compute_mac<H>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, OnionError>
where
    H: Hmac,
{
    let mut hmac =
        H::new_from_slice(key).map_err(|e| OnionError::Crypto(format!("{:?}", e)))?;
    hmac.update(data);

    Ok(hmac.finalize())
}

/// Derive a purpose-specific key: `HMAC(key = tag, message = shared_secret)`.
pub fn generate_key<H>(
    key_type: KeyType,
    secret: &SharedSecret,
) -> Result<DerivedKey, OnionError>
where
    H: Hmac,
{
    compute_mac::<H>(key_type.as_bytes(), secret.as_ref()).map(Zeroizing::new)
}

/// ECDH between `secret` and `public`, hashed over the compressed result.
///
/// The origin calls this with its ephemeral secret and the hop's static key,
/// the hop with its static secret and the ephemeral key from the onion. Both
/// land on the same point.
pub fn compute_shared_secret<HASH, C>(
    secp: &Secp256k1<C>,
    public: &PublicKey,
    secret: &SecretKey,
) -> Result<SharedSecret, OnionError>
where
    HASH: Hash,
    C: Verification,
{
    let point = public
        .mul_tweak(secp, &Scalar::from(*secret))
        .map_err(|e| OnionError::MalformedKey(e.to_string()))?;

    let mut hasher = HASH::new();
    hasher.update(&point.serialize());

    SharedSecret::from_digest(hasher.finalize())
}

// Computes blinding factor used for blinding the ephemeral key at each
// hop. The blinding factor is computed by hashing the concatenation of the
// current ephemeral public key and the shared secret derived for that hop.
pub fn compute_blinding_factor<HASH>(
    public: &PublicKey,
    shared: &SharedSecret,
) -> Result<Scalar, OnionError>
where
    HASH: Hash,
{
    let mut hasher = HASH::new();

    hasher.update(&public.serialize());
    hasher.update(shared.as_ref());

    let digest: [u8; 32] = hasher
        .finalize()
        .try_into()
        .map_err(|_| OnionError::Crypto(String::from("unexpected digest length")))?;

    Scalar::from_be_bytes(digest)
        .map_err(|_| OnionError::MalformedKey(String::from("blinding factor out of range")))
}

/// Run the key schedule forward from the origin's session key.
///
/// Every hop gets its own ephemeral key: the session scalar multiplied by
/// the blinding factors of all preceding hops.
pub fn generate_hop_keys<HASH, C>(
    secp: &Secp256k1<C>,
    circuit_pub_keys: &[PublicKey],
    session_key: SecretKey,
) -> Result<Vec<HopKeys>, OnionError>
where
    HASH: Hash,
    C: Signing + Verification,
{
    if circuit_pub_keys.is_empty() {
        return Err(OnionError::EmptyRoute);
    }

    let mut hop_keys = Vec::with_capacity(circuit_pub_keys.len());
    let mut ephemeral_key = session_key;

    for public in circuit_pub_keys {
        let ephemeral_public_key = ephemeral_key.public_key(secp);
        let shared_secret = compute_shared_secret::<HASH, C>(secp, public, &ephemeral_key)?;
        let blinding_factor =
            compute_blinding_factor::<HASH>(&ephemeral_public_key, &shared_secret)?;

        let next_key = ephemeral_key.mul_tweak(&blinding_factor);
        ephemeral_key.non_secure_erase();

        ephemeral_key = next_key.map_err(|e| OnionError::MalformedKey(e.to_string()))?;

        hop_keys.push(HopKeys {
            ephemeral_public_key,
            shared_secret,
        });
    }

    ephemeral_key.non_secure_erase();

    Ok(hop_keys)
}

/// Blind the ephemeral point a hop received into the one for the next hop.
///
/// The hop never learns the origin's scalar, so the blinding factor is
/// applied to the point instead.
pub fn next_ephemeral_key<HASH, C>(
    secp: &Secp256k1<C>,
    public: &PublicKey,
    shared: &SharedSecret,
) -> Result<PublicKey, OnionError>
where
    HASH: Hash,
    C: Verification,
{
    let blinding_factor = compute_blinding_factor::<HASH>(public, shared)?;

    public
        .mul_tweak(secp, &blinding_factor)
        .map_err(|e| OnionError::MalformedKey(e.to_string()))
}

/// Generate the filler the last layer is sealed with.
///
/// Each hop but the last shifts the region left by its layer size and
/// exposes that many keystream bytes at the tail. The filler reproduces
/// those bytes ahead of time so the HMACs computed at construction match
/// what every later hop receives.
pub(crate) fn generate_filler<H, SC>(
    hop_sizes: &[usize],
    hop_keys: &[HopKeys],
) -> Result<Vec<u8>, OnionError>
where
    H: Hmac,
    SC: StreamCipher,
{
    if hop_sizes.len() != hop_keys.len() {
        return Err(OnionError::Crypto(format!(
            "{} hop sizes for {} hop keys",
            hop_sizes.len(),
            hop_keys.len()
        )));
    }

    let leading = match hop_sizes.split_last() {
        Some((_, leading)) => leading,
        None => return Ok(Vec::new()),
    };

    let filler_size: usize = leading.iter().sum();
    if filler_size > HOP_PAYLOADS_SIZE {
        return Err(OnionError::PacketOverflow {
            size: filler_size,
            capacity: HOP_PAYLOADS_SIZE,
        });
    }
    let mut filler = vec![0; filler_size];
    let mut filler_start = HOP_PAYLOADS_SIZE;

    for (size, keys) in leading.iter().zip(hop_keys) {
        let filler_end = HOP_PAYLOADS_SIZE + size;

        let rho = generate_key::<H>(KeyType::Rho, &keys.shared_secret)?;
        let stream = Zeroizing::new(generate_cipher_stream::<SC>(&rho, STREAM_SIZE)?);

        xor(&mut filler, &stream[filler_start..filler_end]);

        // Cannot underflow: the leading sizes sum to at most the region.
        filler_start -= size;
    }

    tracing::trace!(filler_size, "generated filler");

    Ok(filler)
}

/// Draw a fresh session key from the operating system RNG.
pub fn generate_session_key() -> Result<SecretKey, OnionError> {
    let mut bytes = Zeroizing::new([0u8; 32]);

    loop {
        getrandom::getrandom(&mut *bytes).map_err(|e| OnionError::Entropy(e.to_string()))?;

        // Zero or above the curve order; astronomically rare, draw again.
        if let Ok(key) = SecretKey::from_slice(&*bytes) {
            return Ok(key);
        }
    }
}

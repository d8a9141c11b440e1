//! # Cryptographic Primitives
//!
//! Everything a cluster overlay needs to keep outsiders out and writers
//! honest:
//!
//! - **Payload sealing**: AES-256-GCM under the cluster-wide symmetric
//!   secret. The sealed form is `iv(32) ‖ tag(16) ‖ ciphertext` with the
//!   fixed associated data `"AES256GCM"`. A peer without the secret cannot
//!   read or forge a single datagram.
//! - **Record signatures**: Ed25519 over a fixed context prefix. Ownership
//!   of mutable name records and write authority over a gated cluster are
//!   both proven this way.
//! - **Canonical signable messages**: [`combine`] renders record fields into
//!   one unambiguous byte string so both sides sign the same thing.
//! - **Write tokens**: short-lived keyed hashes bound to (requester ip,
//!   target), handed out on reads and demanded back on writes.
//!
//! ## Domain separation
//!
//! Every signature covers `"CrissCross-DHT" ‖ message`. A signature minted
//! here can never be replayed as, say, a transaction signature in some other
//! protocol sharing the keypair.

use std::net::IpAddr;
use std::time::Duration;

use aes_gcm::aead::generic_array::typenum::U32;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use tokio::time::Instant;

use crate::identity::{NodeId, ID_LEN};

/// Context prefix under which every CrissCross signature is made.
pub const SIGNATURE_CONTEXT: &[u8] = b"CrissCross-DHT";

/// Associated data pinned into every sealed payload.
const SEAL_AAD: &[u8] = b"AES256GCM";

/// IV length of the sealed form. GCM lengthens non-96-bit nonces internally.
pub const IV_LEN: usize = 32;

/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Symmetric cluster secret length.
pub const SECRET_LEN: usize = 32;

/// Ed25519 signature length.
pub const SIG_LEN: usize = 64;

/// Serialized public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

type ClusterCipher = AesGcm<Aes256, U32>;

/// Failures in sealing or opening a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealError {
    /// The cluster secret is not 32 bytes.
    BadSecret,
    /// The sealed payload is shorter than `iv ‖ tag`.
    Truncated,
    /// Authentication failed: wrong secret or tampered bytes.
    OpenFailed,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::BadSecret => write!(f, "cluster secret must be {SECRET_LEN} bytes"),
            SealError::Truncated => write!(f, "sealed payload too short"),
            SealError::OpenFailed => write!(f, "payload authentication failed"),
        }
    }
}

impl std::error::Error for SealError {}

/// Seal `body` under the cluster secret: `iv(32) ‖ tag(16) ‖ ciphertext`.
pub fn seal(secret: &[u8], body: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher = ClusterCipher::new_from_slice(secret).map_err(|_| SealError::BadSecret)?;

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::<U32>::from_slice(&iv);

    let ct_and_tag = cipher
        .encrypt(nonce, Payload { msg: body, aad: SEAL_AAD })
        .map_err(|_| SealError::OpenFailed)?;
    let (ciphertext, tag) = ct_and_tag.split_at(ct_and_tag.len() - TAG_LEN);

    let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Open a sealed payload. Any failure means the datagram is not ours to read.
pub fn open(secret: &[u8], sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(SealError::Truncated);
    }
    let cipher = ClusterCipher::new_from_slice(secret).map_err(|_| SealError::BadSecret)?;

    let (iv, rest) = sealed.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);
    let nonce = Nonce::<U32>::from_slice(iv);

    let mut ct_and_tag = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    ct_and_tag.extend_from_slice(ciphertext);
    ct_and_tag.extend_from_slice(tag);

    cipher
        .decrypt(nonce, Payload { msg: &ct_and_tag, aad: SEAL_AAD })
        .map_err(|_| SealError::OpenFailed)
}

/// Why a signature failed to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature bytes have the wrong length.
    InvalidLength,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
    /// Cryptographic verification failed.
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Sign `msg` under the CrissCross context.
pub fn sign(key: &SigningKey, msg: &[u8]) -> [u8; SIG_LEN] {
    let mut contextual = Vec::with_capacity(SIGNATURE_CONTEXT.len() + msg.len());
    contextual.extend_from_slice(SIGNATURE_CONTEXT);
    contextual.extend_from_slice(msg);
    key.sign(&contextual).to_bytes()
}

/// Verify `sig` over `msg` under the CrissCross context.
pub fn verify(public: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), SignatureError> {
    let key = load_public_key(public)?;
    let sig = Signature::from_slice(sig).map_err(|_| SignatureError::InvalidLength)?;

    let mut contextual = Vec::with_capacity(SIGNATURE_CONTEXT.len() + msg.len());
    contextual.extend_from_slice(SIGNATURE_CONTEXT);
    contextual.extend_from_slice(msg);
    key.verify(&contextual, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Parse a serialized Ed25519 public key.
pub fn load_public_key(bytes: &[u8]) -> Result<VerifyingKey, SignatureError> {
    let arr: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| SignatureError::InvalidPublicKey)
}

/// Render record fields into one canonical signable byte string.
///
/// Each field is emitted as a big-endian `u32` length followed by its bytes,
/// so no field boundary can be shifted without changing the output. Integer
/// fields are rendered with [`int_field`] before being passed in.
pub fn combine(fields: &[&[u8]]) -> Vec<u8> {
    let total: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut out = Vec::with_capacity(total);
    for field in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
    }
    out
}

/// Canonical rendering of an integer field: 8 bytes, big-endian.
pub fn int_field(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Signable message of an immutable value record.
pub fn value_signable(key: &NodeId, value: &[u8], ttl: u64) -> Vec<u8> {
    combine(&[key.as_bytes(), value, &int_field(ttl)])
}

/// Signable message a name record's owner key covers.
pub fn name_owner_signable(name: &NodeId, value: &[u8], generation: u64) -> Vec<u8> {
    combine(&[name.as_bytes(), value, &int_field(generation)])
}

/// Signable message the cluster write key covers on a name record.
pub fn name_cluster_signable(name: &NodeId, value: &[u8], generation: u64, ttl: u64) -> Vec<u8> {
    combine(&[name.as_bytes(), value, &int_field(generation), &int_field(ttl)])
}

/// Derive the record name owned by a public key: `SHA3-256(SHA3-256(key))`.
pub fn name_from_key(public: &[u8]) -> NodeId {
    let mut hasher = Sha3_256::new();
    hasher.update(public);
    let inner: [u8; ID_LEN] = hasher.finalize().into();
    let mut hasher = Sha3_256::new();
    hasher.update(inner);
    NodeId::from_bytes(hasher.finalize().into())
}

/// Write token length on the wire.
pub const TOKEN_LEN: usize = 8;

/// How often the token secret rotates. The previous secret stays valid for
/// one further interval, so a token is honored for 5 to 10 minutes.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(300);

/// Mints and validates the opaque tokens that gate store/announce writes.
///
/// A token is `blake3::keyed_hash(secret, ip ‖ target)` truncated to 8
/// bytes. It proves the requester recently completed a lookup from the same
/// address, without the responder keeping any per-requester state.
pub struct TokenMinter {
    current: [u8; 32],
    previous: [u8; 32],
    rotated_at: Instant,
}

impl TokenMinter {
    pub fn new() -> Self {
        let mut current = [0u8; 32];
        let mut previous = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut current);
        rand::rngs::OsRng.fill_bytes(&mut previous);
        Self {
            current,
            previous,
            rotated_at: Instant::now(),
        }
    }

    fn maybe_rotate(&mut self) {
        if self.rotated_at.elapsed() >= TOKEN_ROTATE_INTERVAL {
            self.rotate();
        }
    }

    pub(crate) fn rotate(&mut self) {
        self.previous = self.current;
        rand::rngs::OsRng.fill_bytes(&mut self.current);
        self.rotated_at = Instant::now();
    }

    fn derive(secret: &[u8; 32], ip: IpAddr, target: &NodeId) -> [u8; TOKEN_LEN] {
        let mut input = Vec::with_capacity(16 + ID_LEN);
        match ip {
            IpAddr::V4(v4) => input.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => input.extend_from_slice(&v6.octets()),
        }
        input.extend_from_slice(target.as_bytes());
        let digest = blake3::keyed_hash(secret, &input);
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&digest.as_bytes()[..TOKEN_LEN]);
        token
    }

    /// Mint a token for a requester address and lookup target.
    pub fn mint(&mut self, ip: IpAddr, target: &NodeId) -> Vec<u8> {
        self.maybe_rotate();
        Self::derive(&self.current, ip, target).to_vec()
    }

    /// Check a token against the current secret and, as a grace period, the
    /// previous one.
    pub fn validate(&mut self, ip: IpAddr, target: &NodeId, token: &[u8]) -> bool {
        self.maybe_rotate();
        if token.len() != TOKEN_LEN {
            return false;
        }
        token == Self::derive(&self.current, ip, target)
            || token == Self::derive(&self.previous, ip, target)
    }
}

impl Default for TokenMinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::gen_node_id;
    use rand::rngs::OsRng;

    fn secret(byte: u8) -> [u8; SECRET_LEN] {
        [byte; SECRET_LEN]
    }

    #[test]
    fn seal_open_round_trip() {
        let key = secret(7);
        let sealed = seal(&key, b"hello overlay").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"hello overlay");
        // Layout: iv, tag, ciphertext.
        assert_eq!(sealed.len(), IV_LEN + TAG_LEN + b"hello overlay".len());
    }

    #[test]
    fn open_rejects_wrong_secret() {
        let sealed = seal(&secret(1), b"payload").unwrap();
        assert_eq!(open(&secret(2), &sealed), Err(SealError::OpenFailed));
    }

    #[test]
    fn open_rejects_tampering() {
        let key = secret(3);
        let mut sealed = seal(&key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(open(&key, &sealed), Err(SealError::OpenFailed));
    }

    #[test]
    fn open_rejects_truncated_input() {
        assert_eq!(open(&secret(0), &[0u8; 10]), Err(SealError::Truncated));
    }

    #[test]
    fn distinct_ivs_per_seal() {
        let key = secret(9);
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
    }

    #[test]
    fn sign_and_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key().to_bytes();
        let sig = sign(&key, b"record");
        assert!(verify(&public, b"record", &sig).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_message_and_key() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key().to_bytes();
        let sig = sign(&key, b"record");

        assert_eq!(
            verify(&public, b"different", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify(&other.verifying_key().to_bytes().as_slice(), b"record", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify(&[0u8; 10], b"record", &sig),
            Err(SignatureError::InvalidPublicKey)
        );
    }

    #[test]
    fn combine_is_unambiguous() {
        // Concatenating fields differently must never collide.
        assert_ne!(combine(&[b"ab", b"c"]), combine(&[b"a", b"bc"]));
        assert_ne!(combine(&[b"abc"]), combine(&[b"ab", b"c"]));
        assert_ne!(combine(&[b"", b"x"]), combine(&[b"x", b""]));
    }

    #[test]
    fn int_field_is_big_endian() {
        assert_eq!(int_field(1), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(int_field(0x0102030405060708), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn name_derivation_is_deterministic() {
        let key = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key().to_bytes();
        assert_eq!(name_from_key(&public), name_from_key(&public));
        let other = SigningKey::generate(&mut OsRng);
        assert_ne!(
            name_from_key(&public),
            name_from_key(&other.verifying_key().to_bytes())
        );
    }

    #[test]
    fn token_mint_and_validate() {
        let mut minter = TokenMinter::new();
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let other_ip: IpAddr = "192.0.2.2".parse().unwrap();
        let target = gen_node_id();

        let token = minter.mint(ip, &target);
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(minter.validate(ip, &target, &token));
        assert!(!minter.validate(other_ip, &target, &token));
        assert!(!minter.validate(ip, &gen_node_id(), &token));
        assert!(!minter.validate(ip, &target, b"short"));
    }

    #[test]
    fn token_survives_one_rotation_only() {
        let mut minter = TokenMinter::new();
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let target = gen_node_id();

        let token = minter.mint(ip, &target);
        minter.rotate();
        assert!(minter.validate(ip, &target, &token), "grace period");
        minter.rotate();
        assert!(!minter.validate(ip, &target, &token), "expired");
    }
}

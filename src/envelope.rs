//! # Cluster Envelope
//!
//! Wire framing around every datagram:
//!
//! ```text
//! 0x30 0x41 ‖ cluster_id(32) ‖ iv(32) ‖ tag(16) ‖ ciphertext
//! ```
//!
//! The cluster id rides in the clear so a receiver can pick the right
//! symmetric secret; everything else is sealed. A datagram that fails any
//! stage (magic, length, unknown cluster, authentication) is dropped
//! without a reply, so the overlay is invisible to anyone without the
//! secret.

use crate::crypto::{self, SealError};
use crate::identity::{NodeId, ID_LEN};

/// ASCII `"0A"`, the two magic bytes opening every datagram.
pub const MAGIC: [u8; 2] = [0x30, 0x41];

/// A cluster identifier. Shares the 32-byte id type with node ids.
pub type ClusterId = NodeId;

/// Minimum length of a datagram that can possibly be one of ours.
const MIN_FRAME_LEN: usize = MAGIC.len() + ID_LEN + crypto::IV_LEN + crypto::TAG_LEN;

/// A parsed-but-still-sealed inbound datagram.
#[derive(Debug)]
pub struct Frame<'a> {
    pub cluster: ClusterId,
    pub sealed: &'a [u8],
}

/// Why an inbound datagram was discarded before decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    TooShort,
    BadMagic,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::TooShort => write!(f, "datagram shorter than frame header"),
            EnvelopeError::BadMagic => write!(f, "datagram does not carry the frame magic"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Build an outbound datagram: magic, cluster header, sealed body.
pub fn frame(cluster: &ClusterId, secret: &[u8], body: &[u8]) -> Result<Vec<u8>, SealError> {
    let sealed = crypto::seal(secret, body)?;
    let mut out = Vec::with_capacity(MAGIC.len() + ID_LEN + sealed.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(cluster.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Split an inbound datagram into cluster header and sealed body.
pub fn parse(datagram: &[u8]) -> Result<Frame<'_>, EnvelopeError> {
    if datagram.len() < MIN_FRAME_LEN {
        return Err(EnvelopeError::TooShort);
    }
    if datagram[..MAGIC.len()] != MAGIC {
        return Err(EnvelopeError::BadMagic);
    }
    let mut cluster = [0u8; ID_LEN];
    cluster.copy_from_slice(&datagram[MAGIC.len()..MAGIC.len() + ID_LEN]);
    Ok(Frame {
        cluster: ClusterId::from_bytes(cluster),
        sealed: &datagram[MAGIC.len() + ID_LEN..],
    })
}

/// Open the sealed body of a parsed frame.
pub fn unseal(frame: &Frame<'_>, secret: &[u8]) -> Result<Vec<u8>, SealError> {
    crypto::open(secret, frame.sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::gen_node_id;

    const SECRET: [u8; 32] = [0x11; 32];

    #[test]
    fn frame_and_unseal_round_trip() {
        let cluster = gen_node_id();
        let datagram = frame(&cluster, &SECRET, b"packet bytes").unwrap();

        assert_eq!(datagram[..2], MAGIC);
        let parsed = parse(&datagram).unwrap();
        assert_eq!(parsed.cluster, cluster);
        assert_eq!(unseal(&parsed, &SECRET).unwrap(), b"packet bytes");
    }

    #[test]
    fn wrong_secret_fails_to_open() {
        let cluster = gen_node_id();
        let datagram = frame(&cluster, &SECRET, b"secret payload").unwrap();
        let parsed = parse(&datagram).unwrap();
        assert!(unseal(&parsed, &[0x22; 32]).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let cluster = gen_node_id();
        let mut datagram = frame(&cluster, &SECRET, b"x").unwrap();
        datagram[0] = 0x31;
        assert_eq!(parse(&datagram).unwrap_err(), EnvelopeError::BadMagic);
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert_eq!(parse(&[0x30, 0x41, 0x00]).unwrap_err(), EnvelopeError::TooShort);
        assert_eq!(parse(&[]).unwrap_err(), EnvelopeError::TooShort);
    }
}

//! Wire protocol for the channel daemon
//!
//! This crate defines the packet types exchanged between channel peers and
//! the binary codec for them. Messages are transport-agnostic: framing is a
//! length prefix over a tagged binary encoding, and everything above this
//! layer (encryption, connection management) belongs to the host transport.
//!
//! ## Wire conventions
//!
//! - All integers are unsigned big-endian, fixed width.
//! - Hashes are 32 bytes, preimages are 32 bytes.
//! - Signatures are a pair of 32-byte scalars.
//! - Public keys are 33-byte compressed SEC encodings.
//! - Locktimes carry an explicit seconds/blocks discriminator.

pub mod codec;
pub mod packets;

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

pub use codec::{decode_frame, decode_pkt, encode_frame, encode_pkt, CodecError, MAX_FRAME_LEN};
pub use packets::{
    AnchorOffer, CloseClearing, CloseSignature, ErrorPkt, OpenAnchor, OpenChannel, OpenCommitSig,
    OpenComplete, Pkt, PktKind, UpdateAddHtlc, UpdateCommit, UpdateFailHtlc, UpdateFulfillHtlc,
    UpdateRevocation,
};

/// A 32-byte hash (SHA256 output).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 chars)
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

/// A 32-byte hash preimage. Never logged in full.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage(pub [u8; 32]);

impl std::fmt::Debug for Preimage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Preimage(..)")
    }
}

/// A 33-byte compressed SEC public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKey(#[serde(with = "BigArray")] pub [u8; 33]);

impl PubKey {
    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 chars)
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for PubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

/// A signature as a pair of 32-byte scalars.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// A locktime with an explicit unit discriminator.
///
/// The channel engine only accepts the `Seconds` variant; `Blocks` is part
/// of the wire format but is refused at the protocol layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locktime {
    /// Seconds since the UNIX epoch (absolute) or a relative delay.
    Seconds(u32),
    /// Block height (absolute) or block count (relative).
    Blocks(u32),
}

impl Locktime {
    /// Return the seconds value, or `None` for the blocks variant.
    pub fn as_seconds(&self) -> Option<u32> {
        match self {
            Locktime::Seconds(s) => Some(*s),
            Locktime::Blocks(_) => None,
        }
    }
}

//! Channel protocol packets
//!
//! One struct per wire message plus the `Pkt` tagged union over them. The
//! set of messages covers the open handshake, steady-state HTLC updates with
//! the commit/revoke dance, and the clearing/mutual-close handshake.
//!
//! Validation here is structural only (field ranges that hold for every
//! channel); anything that depends on channel state or host configuration is
//! checked by the engine.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::{Hash, Locktime, Preimage, PubKey, Signature};

/// Which side will create and broadcast the anchor transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorOffer {
    WillCreateAnchor,
    WontCreateAnchor,
}

/// Request to open a new payment channel.
///
/// Both sides send one; exactly one of them may announce
/// `WillCreateAnchor`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenChannel {
    /// Revocation hash for commitment 0
    pub revocation_hash: Hash,
    /// Revocation hash for commitment 1
    pub next_revocation_hash: Hash,
    /// Key for commitment tx inputs
    pub commit_key: PubKey,
    /// Key for commitment tx outputs
    pub final_key: PubKey,
    /// How long we want the other side's outputs locked (relative)
    pub delay: Locktime,
    /// Commitment fee rate we will use
    pub initial_fee_rate: u64,
    /// Whether we will create the anchor
    pub anchor: AnchorOffer,
    /// Confirmations required before the anchor counts as settled
    pub min_depth: u32,
}

/// Anchor transaction details from the funding side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenAnchor {
    pub txid: Hash,
    pub output_index: u32,
    /// Anchor value in satoshis
    pub amount: u64,
}

/// Our signature on the counterparty's commitment 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenCommitSig {
    pub sig: Signature,
}

/// Open handshake finished on the sending side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenComplete {}

/// Stage a new HTLC on the receiving side's commitment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateAddHtlc {
    /// Unique per offering side, strictly increasing
    pub id: u64,
    pub amount_msat: u64,
    pub rhash: Hash,
    /// Absolute expiry; only the seconds variant is accepted
    pub expiry: Locktime,
    /// Opaque routing blob
    pub route: Vec<u8>,
}

/// Resolve an HTLC with its payment preimage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateFulfillHtlc {
    pub id: u64,
    pub r: Preimage,
}

/// Remove an HTLC, refunding the offerer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateFailHtlc {
    pub id: u64,
    /// Opaque failure reason, carried but not interpreted
    pub reason: Vec<u8>,
}

/// Signature over the receiver's next commitment, covering all staged
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateCommit {
    pub sig: Signature,
}

/// Revoke the previous commitment by revealing its preimage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRevocation {
    pub revocation_preimage: Preimage,
    /// Revocation hash for the commitment after the one just signed
    pub next_revocation_hash: Hash,
}

/// Enter the clearing phase: no new HTLCs, drain existing ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseClearing {
    /// Where the sender wants its close output paid
    pub script_pubkey: Vec<u8>,
}

/// One round of close-fee negotiation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseSignature {
    /// Proposed close fee in satoshis
    pub close_fee: u64,
    /// Signature over the close tx at that fee
    pub sig: Signature,
}

/// Terminal failure notification. The channel is dead on the wire after
/// this; resolution moves on-chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPkt {
    pub problem: String,
}

/// The wire packet union.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Pkt {
    Open(OpenChannel),
    OpenAnchor(OpenAnchor),
    OpenCommitSig(OpenCommitSig),
    OpenComplete(OpenComplete),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    UpdateCommit(UpdateCommit),
    UpdateRevocation(UpdateRevocation),
    CloseClearing(CloseClearing),
    CloseSignature(CloseSignature),
    Error(ErrorPkt),
}

/// Packet discriminant, used for logging and state gating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PktKind {
    Open,
    OpenAnchor,
    OpenCommitSig,
    OpenComplete,
    UpdateAddHtlc,
    UpdateFulfillHtlc,
    UpdateFailHtlc,
    UpdateCommit,
    UpdateRevocation,
    CloseClearing,
    CloseSignature,
    Error,
}

impl PktKind {
    /// Wire name for logging and error strings
    pub fn name(self) -> &'static str {
        match self {
            PktKind::Open => "Open",
            PktKind::OpenAnchor => "OpenAnchor",
            PktKind::OpenCommitSig => "OpenCommitSig",
            PktKind::OpenComplete => "OpenComplete",
            PktKind::UpdateAddHtlc => "UpdateAddHtlc",
            PktKind::UpdateFulfillHtlc => "UpdateFulfillHtlc",
            PktKind::UpdateFailHtlc => "UpdateFailHtlc",
            PktKind::UpdateCommit => "UpdateCommit",
            PktKind::UpdateRevocation => "UpdateRevocation",
            PktKind::CloseClearing => "CloseClearing",
            PktKind::CloseSignature => "CloseSignature",
            PktKind::Error => "Error",
        }
    }
}

impl Pkt {
    pub fn kind(&self) -> PktKind {
        match self {
            Pkt::Open(_) => PktKind::Open,
            Pkt::OpenAnchor(_) => PktKind::OpenAnchor,
            Pkt::OpenCommitSig(_) => PktKind::OpenCommitSig,
            Pkt::OpenComplete(_) => PktKind::OpenComplete,
            Pkt::UpdateAddHtlc(_) => PktKind::UpdateAddHtlc,
            Pkt::UpdateFulfillHtlc(_) => PktKind::UpdateFulfillHtlc,
            Pkt::UpdateFailHtlc(_) => PktKind::UpdateFailHtlc,
            Pkt::UpdateCommit(_) => PktKind::UpdateCommit,
            Pkt::UpdateRevocation(_) => PktKind::UpdateRevocation,
            Pkt::CloseClearing(_) => PktKind::CloseClearing,
            Pkt::CloseSignature(_) => PktKind::CloseSignature,
            Pkt::Error(_) => PktKind::Error,
        }
    }

    /// Structural validation, applied on both encode and decode.
    pub fn validate(&self) -> Result<(), CodecError> {
        match self {
            Pkt::OpenAnchor(a) if a.amount == 0 => {
                Err(CodecError::Malformed("anchor amount must be positive"))
            }
            Pkt::UpdateAddHtlc(u) if u.amount_msat == 0 => {
                Err(CodecError::Malformed("amount_msat must be positive"))
            }
            Pkt::Error(e) if e.problem.is_empty() => {
                Err(CodecError::Malformed("error packet without problem string"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_pkt, encode_pkt};

    #[test]
    fn test_kind_names() {
        let pkt = Pkt::OpenComplete(OpenComplete {});
        assert_eq!(pkt.kind(), PktKind::OpenComplete);
        assert_eq!(pkt.kind().name(), "OpenComplete");
    }

    #[test]
    fn test_zero_amount_add_rejected() {
        let pkt = Pkt::UpdateAddHtlc(UpdateAddHtlc {
            id: 0,
            amount_msat: 0,
            rhash: Hash([1; 32]),
            expiry: Locktime::Seconds(1000),
            route: vec![],
        });
        assert!(pkt.validate().is_err());
        assert!(encode_pkt(&pkt).is_err());
    }

    #[test]
    fn test_empty_error_rejected() {
        let pkt = Pkt::Error(ErrorPkt {
            problem: String::new(),
        });
        assert!(pkt.validate().is_err());
    }

    #[test]
    fn test_open_round_trip() {
        let pkt = Pkt::Open(OpenChannel {
            revocation_hash: Hash([1; 32]),
            next_revocation_hash: Hash([2; 32]),
            commit_key: PubKey([3; 33]),
            final_key: PubKey([4; 33]),
            delay: Locktime::Seconds(3600),
            initial_fee_rate: 5000,
            anchor: AnchorOffer::WillCreateAnchor,
            min_depth: 3,
        });
        let bytes = encode_pkt(&pkt).unwrap();
        assert_eq!(decode_pkt(&bytes).unwrap(), pkt);
    }

    #[test]
    fn test_revocation_round_trip() {
        let pkt = Pkt::UpdateRevocation(UpdateRevocation {
            revocation_preimage: Preimage([9; 32]),
            next_revocation_hash: Hash([8; 32]),
        });
        let bytes = encode_pkt(&pkt).unwrap();
        assert_eq!(decode_pkt(&bytes).unwrap(), pkt);
    }
}

//! Per-peer payment channel engine
//!
//! This crate implements the state machine of one payment channel between
//! two mutually distrustful peers over a Bitcoin-like chain. The parties
//! fund an on-chain anchor, then exchange signed, revocable commitment
//! transactions that redistribute its value, with conditional payments
//! (HTLCs) staged in flight between commitments.
//!
//! ## Update protocol
//!
//! ```text
//! 1. OPEN
//!    A --Open--------------> B        (both directions)
//!    A --OpenAnchor--------> B        (funder only)
//!    A <-OpenCommitSig-----> B        (both directions)
//!    A <-OpenComplete------> B        (after anchor confirms)
//!
//! 2. UPDATE (repeated)
//!    A --UpdateAddHtlc-----> B        (or fulfill/fail)
//!    A --UpdateCommit------> B        (batched by the commit timer)
//!    A <-UpdateRevocation--- B
//!    A <-UpdateCommit------- B        (mirror for our commitment)
//!    A --UpdateRevocation--> B
//!
//! 3. CLOSE
//!    A <-CloseClearing-----> B        (no new adds; HTLCs drain)
//!    A <-CloseSignature----> B        (fee negotiation until equal)
//! ```
//!
//! Every update is first staged, then signed into a new commitment, then
//! locked in by revoking the superseded commitment. Revealing a revocation
//! preimage is what makes cheating with an old commitment punishable, so
//! the engine treats any preimage inconsistency as fatal.
//!
//! The engine is pure protocol: transactions, keys, time and entropy come
//! in through the [`caps`] traits, packets go out through an ordered queue
//! the host transport drains. One engine instance serves one peer and is
//! single-threaded; nothing here blocks.

pub mod caps;
pub mod commit;
pub mod engine;
pub mod fsm;
pub mod persist;
pub mod shachain;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use caps::{
    digest_sign, Clock, CommitTxParams, OsRandomOracle, RandomOracle, SeedSigner, Signer,
    SystemClock, TxBuilder,
};
pub use commit::{apply_changeset, apply_staged, CommitInfo, RawTx, StagingChange};
pub use engine::{Anchor, ChannelEngine, ChannelEvent, Closing, EngineConfig, SideView};
pub use fsm::PeerState;
pub use persist::{ChannelSnapshot, SideSnapshot};
pub use shachain::{derive_from_seed, RevocationLadder};
pub use state::{
    commit_fee_msat, commit_fee_sat, rhash_from_preimage, ChannelHtlc, ChannelState, Side,
    SideState, MAX_HTLCS_PER_SIDE,
};

/// Channel error taxonomy.
///
/// Display strings are stable; they travel in outbound `Error` packets and
/// follow the daemon's established wording. `CannotAfford`/`InsufficientFee`
/// are both affordability failures, and `BadHtlcPreimage`/
/// `BadRevocationPreimage` are both preimage failures; they are split so
/// each surface keeps its own problem string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),

    #[error("Unexpected packet {kind} in state {state:?}")]
    Unexpected { kind: &'static str, state: PeerState },

    #[error("Bad signature")]
    BadSignature,

    #[error("complete preimage incorrect")]
    BadRevocationPreimage,

    #[error("Invalid r for {0}")]
    BadHtlcPreimage(u64),

    #[error("preimage not next in shachain")]
    ShachainBreak,

    #[error("Cannot afford {0} milli-satoshis in your commitment tx")]
    CannotAfford(u64),

    #[error("Insufficient funds for fee")]
    InsufficientFee,

    #[error("Too many HTLCs")]
    TooManyHtlcs,

    #[error("HTLC id {0} clashes")]
    DuplicateId(u64),

    #[error("Did not find HTLC {0}")]
    NotFound(u64),

    #[error("Already removed HTLC {0}")]
    AlreadyRemoved(u64),

    #[error("Empty commit")]
    EmptyCommit,

    #[error("Command invalid in state {0:?}")]
    WrongState(PeerState),
}

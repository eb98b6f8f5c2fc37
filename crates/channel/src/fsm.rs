//! Protocol state machine
//!
//! ```text
//!   Init
//!    |- open() -> OpenWaitForOpen
//!    |               `-> OpenWaitForAnchor
//!    |                      `-> OpenWaitForCommitSig
//!    |                             `-> OpenWaitForComplete
//!    |                                    `-> Normal
//!    |
//!    Normal -> Clearing -> CloseWaitSig -> Closed
//!        \
//!         `-> ErrBreakdown   (terminal; on-chain rescue is the host's job)
//! ```
//!
//! Update packets within `Normal` and `Clearing` mutate the staging buffers
//! and commitment chains without changing state. Any packet a state does
//! not accept is a protocol violation: the engine answers with a terminal
//! `Error` and enters `ErrBreakdown`.

use serde::{Deserialize, Serialize};

use protocol::PktKind;

/// Lifecycle state of one peer's channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Channel object exists, nothing sent yet
    Init,
    /// We sent `Open`, waiting for theirs
    OpenWaitForOpen,
    /// Opens exchanged, waiting for the anchor
    OpenWaitForAnchor,
    /// Anchor known, waiting for their commitment-0 signature
    OpenWaitForCommitSig,
    /// Signature verified, waiting for their `OpenComplete`
    OpenWaitForComplete,
    /// Steady state: HTLC updates and the commit/revoke dance
    Normal,
    /// Close requested, HTLCs draining, no new adds
    Clearing,
    /// Drained; negotiating the close fee
    CloseWaitSig,
    /// Mutual close transaction agreed and signed
    Closed,
    /// Terminal wire failure; resolution moves on-chain
    ErrBreakdown,
}

impl PeerState {
    /// Whether a packet kind is acceptable in this state. `Error` packets
    /// are accepted everywhere and are not routed through this table.
    pub fn accepts(self, kind: PktKind) -> bool {
        use PktKind::*;
        match self {
            PeerState::Init => false,
            PeerState::OpenWaitForOpen => matches!(kind, Open),
            PeerState::OpenWaitForAnchor => matches!(kind, OpenAnchor),
            PeerState::OpenWaitForCommitSig => matches!(kind, OpenCommitSig),
            PeerState::OpenWaitForComplete => matches!(kind, OpenComplete),
            PeerState::Normal => matches!(
                kind,
                UpdateAddHtlc
                    | UpdateFulfillHtlc
                    | UpdateFailHtlc
                    | UpdateCommit
                    | UpdateRevocation
                    | CloseClearing
            ),
            PeerState::Clearing => matches!(
                kind,
                UpdateFulfillHtlc
                    | UpdateFailHtlc
                    | UpdateCommit
                    | UpdateRevocation
                    | CloseClearing
                    | CloseSignature
            ),
            PeerState::CloseWaitSig => matches!(kind, CloseSignature),
            PeerState::Closed | PeerState::ErrBreakdown => false,
        }
    }

    /// Any state from which update traffic is processed.
    pub fn is_live(self) -> bool {
        matches!(self, PeerState::Normal | PeerState::Clearing)
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Closed | PeerState::ErrBreakdown)
    }
}

//! Channel persistence
//!
//! [`ChannelSnapshot`] captures everything a crash-restart needs: both
//! commitment chains, the revocation ladder, counters, anchor metadata and
//! the close negotiation record. Staging states are deliberately absent;
//! they are a pure function of the committed tips and their unacked lists
//! and are replayed on restore.

use serde::{Deserialize, Serialize};

use protocol::{Hash, PubKey};

use crate::commit::{apply_changeset, CommitInfo};
use crate::engine::{Anchor, Closing, SideView};
use crate::fsm::PeerState;
use crate::shachain::RevocationLadder;
use crate::state::Side;
use crate::ChannelError;

/// One side's persisted view: everything in [`SideView`] except the
/// derived staging state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SideSnapshot {
    pub offers_anchor: bool,
    pub commit_key: PubKey,
    pub final_key: PubKey,
    pub locktime_secs: u32,
    pub min_depth: u32,
    pub fee_rate: u64,
    pub initial_revocation_hash: Hash,
    pub next_revocation_hash: Hash,
    pub commit: Option<CommitInfo>,
}

impl SideSnapshot {
    pub fn capture(view: &SideView) -> Self {
        SideSnapshot {
            offers_anchor: view.offers_anchor,
            commit_key: view.commit_key,
            final_key: view.final_key,
            locktime_secs: view.locktime_secs,
            min_depth: view.min_depth,
            fee_rate: view.fee_rate,
            initial_revocation_hash: view.initial_revocation_hash,
            next_revocation_hash: view.next_revocation_hash,
            commit: view.commit.clone(),
        }
    }

    /// Rebuild the live view, replaying the tip's unacked changes to
    /// reconstruct the staging state.
    pub fn rebuild(self, adds_offered_by: Side) -> Result<SideView, ChannelError> {
        let staging = match self.commit.as_ref() {
            Some(tip) => Some(apply_changeset(&tip.state, &tip.unacked, adds_offered_by)?),
            None => None,
        };
        Ok(SideView {
            offers_anchor: self.offers_anchor,
            commit_key: self.commit_key,
            final_key: self.final_key,
            locktime_secs: self.locktime_secs,
            min_depth: self.min_depth,
            fee_rate: self.fee_rate,
            initial_revocation_hash: self.initial_revocation_hash,
            next_revocation_hash: self.next_revocation_hash,
            commit: self.commit,
            staging_cstate: staging,
        })
    }
}

/// Full persisted channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub peer_id: PubKey,
    pub state: PeerState,
    pub htlc_id_counter: u64,
    pub their_next_htlc_id: u64,
    pub anchor: Option<Anchor>,
    pub anchor_depth_ok: bool,
    pub open_complete_sent: bool,
    pub open_complete_received: bool,
    pub closing: Closing,
    pub their_preimages: RevocationLadder,
    pub local: SideSnapshot,
    pub remote: Option<SideSnapshot>,
}

impl ChannelSnapshot {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

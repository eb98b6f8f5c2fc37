//! Commitment chain
//!
//! Each side of a channel carries a chain of [`CommitInfo`] nodes, one per
//! commitment transaction, owned by its tip. The chain only ever grows at
//! the tip; `prev` is the owned link backwards, and nothing points forward.
//!
//! Staged-but-unrevoked changes ride on the tip as [`StagingChange`] values
//! and cross over to the other side's staging state when the commitment that
//! carried them is revoked.

use serde::{Deserialize, Serialize};

use protocol::{Hash, Preimage, Signature};

use crate::state::{ChannelHtlc, ChannelState, Side};
use crate::ChannelError;

/// Opaque transaction bytes produced by the host's transaction builder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTx(pub Vec<u8>);

/// A single staged channel change, waiting to be locked in by the
/// commit/revoke cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StagingChange {
    Add(ChannelHtlc),
    Fulfill { id: u64, preimage: Preimage },
    Fail { id: u64, reason: Vec<u8> },
}

/// One commitment transaction in a side's chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Previous commitment; `None` only for commitment 0
    pub prev: Option<Box<CommitInfo>>,
    /// 0 at open, +1 per commitment
    pub commit_num: u64,
    /// Hash whose preimage retires this commitment
    pub revocation_hash: Hash,
    /// Channel state this commitment encodes
    pub state: ChannelState,
    /// Built commitment transaction
    pub tx: RawTx,
    /// Output permutation from the transaction builder
    pub output_map: Vec<u32>,
    /// The non-owning party's signature authorizing this commitment
    pub remote_sig: Option<Signature>,
    /// Set once the counterparty reveals it; never unset
    pub revocation_preimage: Option<Preimage>,
    /// Changes staged while this commitment was the tip; dropped once the
    /// commitment is revoked
    pub unacked: Vec<StagingChange>,
}

impl CommitInfo {
    /// Whether this commitment has been retired by its revocation preimage.
    pub fn is_revoked(&self) -> bool {
        self.revocation_preimage.is_some()
    }
}

/// Apply one staged change to a state.
///
/// `adds_offered_by` names the side whose additions this changeset carries;
/// fulfills and fails always target the opposite side's HTLCs, since a party
/// only resolves payments offered to it.
pub fn apply_staged(
    state: &ChannelState,
    change: &StagingChange,
    adds_offered_by: Side,
) -> Result<ChannelState, ChannelError> {
    match change {
        StagingChange::Add(htlc) => state.add_htlc(adds_offered_by, htlc.clone()),
        StagingChange::Fulfill { id, preimage } => {
            state.fulfill_htlc(*id, adds_offered_by.other(), preimage)
        }
        StagingChange::Fail { id, .. } => state.fail_htlc(*id, adds_offered_by.other()),
    }
}

/// Apply a whole changeset in order.
pub fn apply_changeset(
    state: &ChannelState,
    changes: &[StagingChange],
    adds_offered_by: Side,
) -> Result<ChannelState, ChannelError> {
    let mut next = state.clone();
    for change in changes {
        next = apply_staged(&next, change, adds_offered_by)?;
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::rhash_from_preimage;

    fn base_state() -> ChannelState {
        ChannelState::initial(1_000_000, 5000, Side::Ours).unwrap()
    }

    fn add(id: u64, amount_msat: u64) -> StagingChange {
        StagingChange::Add(ChannelHtlc {
            id,
            amount_msat,
            rhash: rhash_from_preimage(&Preimage([id as u8; 32])),
            expiry_secs: 2_000_000,
            route: Vec::new(),
        })
    }

    /// A state where the counterparty funds the channel and has one HTLC
    /// (id 9) offered towards us.
    fn state_with_their_htlc() -> ChannelState {
        let state = ChannelState::initial(1_000_000, 5000, Side::Theirs).unwrap();
        state
            .add_htlc(
                Side::Theirs,
                ChannelHtlc {
                    id: 9,
                    amount_msat: 100_000_000,
                    rhash: rhash_from_preimage(&Preimage([9; 32])),
                    expiry_secs: 2_000_000,
                    route: Vec::new(),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_changeset_adds_keep_offerer_side() {
        let state = base_state();
        let next = apply_changeset(&state, &[add(0, 100_000_000)], Side::Ours).unwrap();
        assert_eq!(next.ours.htlcs.len(), 1);
        assert_eq!(next.theirs.htlcs.len(), 0);
        assert_eq!(next.changes, 1);
        assert!(next.is_balanced());
    }

    #[test]
    fn test_changeset_fulfill_targets_other_side() {
        // Our changeset fulfills an HTLC they offered.
        let state = state_with_their_htlc();
        let changes = vec![StagingChange::Fulfill {
            id: 9,
            preimage: Preimage([9; 32]),
        }];
        let next = apply_changeset(&state, &changes, Side::Ours).unwrap();
        assert_eq!(next.ours.pay_msat, 100_000_000);
        assert_eq!(next.htlc_count(), 0);
        assert!(next.is_balanced());
    }

    #[test]
    fn test_changeset_fail_refunds_offerer() {
        let state = state_with_their_htlc();
        let before_theirs = state.theirs.pay_msat;
        let changes = vec![StagingChange::Fail {
            id: 9,
            reason: b"expired".to_vec(),
        }];
        let next = apply_changeset(&state, &changes, Side::Ours).unwrap();
        let fee_delta = state.fee_msat() - next.fee_msat();
        assert_eq!(next.theirs.pay_msat, before_theirs + 100_000_000 + fee_delta);
        assert!(next.is_balanced());
    }

    #[test]
    fn test_changeset_error_leaves_input_alone() {
        let state = base_state();
        let changes = vec![StagingChange::Fail {
            id: 42,
            reason: Vec::new(),
        }];
        assert_eq!(
            apply_changeset(&state, &changes, Side::Ours),
            Err(ChannelError::NotFound(42))
        );
        assert_eq!(state.changes, 0);
    }

    #[test]
    fn test_commit_chain_links() {
        let state = base_state();
        let zero = CommitInfo {
            prev: None,
            commit_num: 0,
            revocation_hash: Hash([0; 32]),
            state: state.clone(),
            tx: RawTx(vec![0]),
            output_map: vec![0, 1],
            remote_sig: None,
            revocation_preimage: None,
            unacked: Vec::new(),
        };
        let one = CommitInfo {
            prev: Some(Box::new(zero)),
            commit_num: 1,
            revocation_hash: Hash([1; 32]),
            state,
            tx: RawTx(vec![1]),
            output_map: vec![0, 1],
            remote_sig: None,
            revocation_preimage: None,
            unacked: Vec::new(),
        };
        assert_eq!(one.prev.as_ref().unwrap().commit_num + 1, one.commit_num);
        assert!(!one.is_revoked());
    }
}

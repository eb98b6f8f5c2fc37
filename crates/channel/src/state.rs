//! Channel state snapshots
//!
//! A [`ChannelState`] is the pure value at the heart of the engine: the
//! balance split and in-flight HTLC sets of one commitment transaction.
//! Operations never mutate their input; they return a fresh state or a typed
//! failure, so a half-applied update can never leak into a commitment.
//!
//! ## Conservation
//!
//! Every state satisfies
//!
//! ```text
//! pay_msat(Ours) + pay_msat(Theirs) + sum(htlc amounts) + commit fee
//!     == 1000 * anchor_satoshis
//! ```
//!
//! The commitment fee is a function of the fee rate and the number of live
//! HTLCs, and the anchor funder's balance absorbs every fee delta.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use protocol::{Hash, Preimage};

use crate::ChannelError;

/// Hard cap on HTLCs offered by one side in one commitment.
pub const MAX_HTLCS_PER_SIDE: usize = 300;

/// Commitment transaction bytecount: fixed skeleton plus per-HTLC output.
const COMMIT_TX_BASE_BYTES: u64 = 338;
const COMMIT_TX_HTLC_BYTES: u64 = 32;

/// Which party of the channel an entity belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Ours,
    Theirs,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Ours => Side::Theirs,
            Side::Theirs => Side::Ours,
        }
    }
}

/// Commitment fee in satoshis for a given fee rate and HTLC count.
///
/// Bytecount times rate per kilobyte, truncated to an even satoshi count.
pub fn commit_fee_sat(fee_rate: u64, num_htlcs: usize) -> u64 {
    let bytes = COMMIT_TX_BASE_BYTES + COMMIT_TX_HTLC_BYTES * num_htlcs as u64;
    bytes * fee_rate / 2000 * 2
}

/// Commitment fee in millisatoshis.
pub fn commit_fee_msat(fee_rate: u64, num_htlcs: usize) -> u64 {
    commit_fee_sat(fee_rate, num_htlcs) * 1000
}

/// SHA256 of a payment preimage.
pub fn rhash_from_preimage(preimage: &Preimage) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(preimage.0);
    Hash(hasher.finalize().into())
}

/// A conditional payment in flight.
///
/// Which side offered it is given by the [`SideState`] that holds it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelHtlc {
    /// Unique per offering side
    pub id: u64,
    pub amount_msat: u64,
    /// SHA256 of the payment preimage
    pub rhash: Hash,
    /// Absolute expiry, seconds since the UNIX epoch
    pub expiry_secs: u32,
    /// Opaque routing blob
    pub route: Vec<u8>,
}

/// One party's slice of a channel state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SideState {
    /// Spendable balance in millisatoshis
    pub pay_msat: u64,
    /// HTLCs offered by this side
    pub htlcs: Vec<ChannelHtlc>,
}

/// Balances and HTLC sets at one commitment point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Total channel value, 1000 x anchor satoshis
    pub anchor_msat: u64,
    /// Fee rate of the commitment this state is for
    pub fee_rate: u64,
    /// The anchor funder; pays the commitment fee
    pub fee_payer: Side,
    pub ours: SideState,
    pub theirs: SideState,
    /// Bumped on every add/fulfill/fail; detects empty commits
    pub changes: u64,
}

impl ChannelState {
    /// The state right after anchor setup: the funder holds everything less
    /// the base commitment fee.
    pub fn initial(
        anchor_satoshis: u64,
        fee_rate: u64,
        fee_payer: Side,
    ) -> Result<Self, ChannelError> {
        let anchor_msat = anchor_satoshis
            .checked_mul(1000)
            .ok_or(ChannelError::Malformed("anchor amount overflows"))?;
        let fee = commit_fee_msat(fee_rate, 0);
        let funder_pay = anchor_msat
            .checked_sub(fee)
            .ok_or(ChannelError::InsufficientFee)?;
        let (ours, theirs) = match fee_payer {
            Side::Ours => (funder_pay, 0),
            Side::Theirs => (0, funder_pay),
        };
        Ok(ChannelState {
            anchor_msat,
            fee_rate,
            fee_payer,
            ours: SideState {
                pay_msat: ours,
                htlcs: Vec::new(),
            },
            theirs: SideState {
                pay_msat: theirs,
                htlcs: Vec::new(),
            },
            changes: 0,
        })
    }

    pub fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Ours => &self.ours,
            Side::Theirs => &self.theirs,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Ours => &mut self.ours,
            Side::Theirs => &mut self.theirs,
        }
    }

    /// Find an HTLC by id within the offering side's set.
    pub fn htlc(&self, offered_by: Side, id: u64) -> Option<&ChannelHtlc> {
        self.side(offered_by).htlcs.iter().find(|h| h.id == id)
    }

    /// HTLCs live in this state, both sides.
    pub fn htlc_count(&self) -> usize {
        self.ours.htlcs.len() + self.theirs.htlcs.len()
    }

    /// Millisatoshis locked in HTLCs, both sides.
    pub fn htlc_total_msat(&self) -> u64 {
        self.ours
            .htlcs
            .iter()
            .chain(self.theirs.htlcs.iter())
            .map(|h| h.amount_msat)
            .sum()
    }

    /// Current commitment fee for this state.
    pub fn fee_msat(&self) -> u64 {
        commit_fee_msat(self.fee_rate, self.htlc_count())
    }

    /// Conservation check: balances, HTLCs and fee account for the whole
    /// anchor.
    pub fn is_balanced(&self) -> bool {
        self.ours.pay_msat + self.theirs.pay_msat + self.htlc_total_msat() + self.fee_msat()
            == self.anchor_msat
    }

    /// Move the fee delta after an HTLC count change to/from the funder.
    fn rebalance_fee(&mut self, old_fee_msat: u64) -> Result<(), ChannelError> {
        let new_fee = self.fee_msat();
        let payer = self.fee_payer;
        let pay = &mut self.side_mut(payer).pay_msat;
        if new_fee >= old_fee_msat {
            let delta = new_fee - old_fee_msat;
            *pay = pay
                .checked_sub(delta)
                .ok_or(ChannelError::CannotAfford(delta))?;
        } else {
            *pay += old_fee_msat - new_fee;
        }
        Ok(())
    }

    /// Stage a new HTLC offered by `offered_by`.
    ///
    /// The offerer's balance covers the amount, the funder's balance covers
    /// the fee increase; either falling short rejects the add.
    pub fn add_htlc(&self, offered_by: Side, htlc: ChannelHtlc) -> Result<Self, ChannelError> {
        if self.side(offered_by).htlcs.len() >= MAX_HTLCS_PER_SIDE {
            return Err(ChannelError::TooManyHtlcs);
        }
        if self.htlc(offered_by, htlc.id).is_some() {
            return Err(ChannelError::DuplicateId(htlc.id));
        }
        let amount = htlc.amount_msat;
        let old_fee = self.fee_msat();
        let mut next = self.clone();
        {
            let side = next.side_mut(offered_by);
            side.pay_msat = side
                .pay_msat
                .checked_sub(amount)
                .ok_or(ChannelError::CannotAfford(amount))?;
            side.htlcs.push(htlc);
        }
        next.rebalance_fee(old_fee)
            .map_err(|_| ChannelError::CannotAfford(amount))?;
        next.changes += 1;
        Ok(next)
    }

    /// Resolve an HTLC with its preimage, crediting the receiving side.
    pub fn fulfill_htlc(
        &self,
        id: u64,
        offered_by: Side,
        preimage: &Preimage,
    ) -> Result<Self, ChannelError> {
        let idx = self
            .side(offered_by)
            .htlcs
            .iter()
            .position(|h| h.id == id)
            .ok_or(ChannelError::NotFound(id))?;
        if rhash_from_preimage(preimage) != self.side(offered_by).htlcs[idx].rhash {
            return Err(ChannelError::BadHtlcPreimage(id));
        }
        let old_fee = self.fee_msat();
        let mut next = self.clone();
        let htlc = next.side_mut(offered_by).htlcs.remove(idx);
        next.side_mut(offered_by.other()).pay_msat += htlc.amount_msat;
        next.rebalance_fee(old_fee)?;
        next.changes += 1;
        Ok(next)
    }

    /// Remove an HTLC, refunding the offering side.
    pub fn fail_htlc(&self, id: u64, offered_by: Side) -> Result<Self, ChannelError> {
        let idx = self
            .side(offered_by)
            .htlcs
            .iter()
            .position(|h| h.id == id)
            .ok_or(ChannelError::NotFound(id))?;
        let old_fee = self.fee_msat();
        let mut next = self.clone();
        let htlc = next.side_mut(offered_by).htlcs.remove(idx);
        next.side_mut(offered_by).pay_msat += htlc.amount_msat;
        next.rebalance_fee(old_fee)?;
        next.changes += 1;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANCHOR_SAT: u64 = 1_000_000;
    const FEE_RATE: u64 = 5000;

    fn htlc(id: u64, amount_msat: u64) -> ChannelHtlc {
        ChannelHtlc {
            id,
            amount_msat,
            rhash: rhash_from_preimage(&Preimage([id as u8; 32])),
            expiry_secs: 2_000_000,
            route: Vec::new(),
        }
    }

    #[test]
    fn test_fee_formula() {
        // 338 bytes * 5000 / 2000, truncated to even: 845 * 2 = 1690 sat.
        assert_eq!(commit_fee_sat(FEE_RATE, 0), 1690);
        assert_eq!(commit_fee_msat(FEE_RATE, 0), 1_690_000);
        // One HTLC adds 32 bytes: 370 * 5000 / 2000 * 2 = 1850 sat.
        assert_eq!(commit_fee_sat(FEE_RATE, 1), 1850);
        // Fee is always even.
        for n in 0..10 {
            assert_eq!(commit_fee_sat(7777, n) % 2, 0);
        }
    }

    #[test]
    fn test_initial_state() {
        let state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        assert_eq!(state.ours.pay_msat, 1_000_000_000 - 1_690_000);
        assert_eq!(state.theirs.pay_msat, 0);
        assert_eq!(state.changes, 0);
        assert!(state.is_balanced());
    }

    #[test]
    fn test_initial_state_anchor_below_fee() {
        // 1 satoshi cannot cover the base fee.
        assert_eq!(
            ChannelState::initial(1, FEE_RATE, Side::Ours),
            Err(ChannelError::InsufficientFee)
        );
    }

    #[test]
    fn test_add_deducts_amount_and_fee() {
        let state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        let next = state.add_htlc(Side::Ours, htlc(0, 100_000_000)).unwrap();
        let fee_delta = commit_fee_msat(FEE_RATE, 1) - commit_fee_msat(FEE_RATE, 0);
        assert_eq!(
            next.ours.pay_msat,
            state.ours.pay_msat - 100_000_000 - fee_delta
        );
        assert_eq!(next.changes, 1);
        assert!(next.is_balanced());
        // Input untouched.
        assert_eq!(state.htlc_count(), 0);
    }

    #[test]
    fn test_add_duplicate_id() {
        let state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        let next = state.add_htlc(Side::Ours, htlc(7, 1000)).unwrap();
        assert_eq!(
            next.add_htlc(Side::Ours, htlc(7, 1000)),
            Err(ChannelError::DuplicateId(7))
        );

        // Ids are scoped to the offering side.
        let both_funded = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Theirs).unwrap();
        let one = both_funded.add_htlc(Side::Theirs, htlc(7, 1000)).unwrap();
        let two = one.fulfill_htlc(7, Side::Theirs, &Preimage([7; 32])).unwrap();
        let staged = two.add_htlc(Side::Theirs, htlc(8, 1000)).unwrap();
        assert!(staged.add_htlc(Side::Ours, htlc(8, 500)).is_ok());
    }

    #[test]
    fn test_add_insufficient_funds() {
        let state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        // Non-funder side has nothing to offer.
        assert_eq!(
            state.add_htlc(Side::Theirs, htlc(0, 1000)),
            Err(ChannelError::CannotAfford(1000))
        );
        // Funder cannot offer more than its balance.
        let too_much = state.ours.pay_msat + 1;
        assert_eq!(
            state.add_htlc(Side::Ours, htlc(0, too_much)),
            Err(ChannelError::CannotAfford(too_much))
        );
    }

    #[test]
    fn test_add_cap() {
        let mut state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        for id in 0..MAX_HTLCS_PER_SIDE as u64 {
            state = state.add_htlc(Side::Ours, htlc(id, 1000)).unwrap();
        }
        assert_eq!(
            state.add_htlc(Side::Ours, htlc(500, 1000)),
            Err(ChannelError::TooManyHtlcs)
        );
        assert!(state.is_balanced());
    }

    #[test]
    fn test_fulfill_credits_receiver() {
        let state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        let staged = state.add_htlc(Side::Ours, htlc(0, 100_000_000)).unwrap();
        let done = staged
            .fulfill_htlc(0, Side::Ours, &Preimage([0; 32]))
            .unwrap();
        assert_eq!(done.theirs.pay_msat, 100_000_000);
        assert_eq!(done.htlc_count(), 0);
        assert_eq!(done.changes, 2);
        assert!(done.is_balanced());
    }

    #[test]
    fn test_fulfill_bad_preimage() {
        let state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        let staged = state.add_htlc(Side::Ours, htlc(0, 1000)).unwrap();
        assert_eq!(
            staged.fulfill_htlc(0, Side::Ours, &Preimage([0xff; 32])),
            Err(ChannelError::BadHtlcPreimage(0))
        );
    }

    #[test]
    fn test_fulfill_not_found() {
        let state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        assert_eq!(
            state.fulfill_htlc(3, Side::Ours, &Preimage([3; 32])),
            Err(ChannelError::NotFound(3))
        );
    }

    #[test]
    fn test_fail_refunds_offerer() {
        let state = ChannelState::initial(ANCHOR_SAT, FEE_RATE, Side::Ours).unwrap();
        let staged = state.add_htlc(Side::Ours, htlc(0, 100_000_000)).unwrap();
        let done = staged.fail_htlc(0, Side::Ours).unwrap();
        // Amount and fee delta both return to the funder-offerer.
        assert_eq!(done.ours.pay_msat, state.ours.pay_msat);
        assert_eq!(done.theirs.pay_msat, 0);
        assert!(done.is_balanced());
    }
}

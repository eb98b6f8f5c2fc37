//! Revocation preimage ladder
//!
//! Revocation preimages form a shachain: a deterministic sequence where the
//! secret at index I can regenerate the secret at index J whenever J's index
//! bits extend I's. Generated in decreasing index order (index
//! `u64::MAX - commit_num`), this lets one party hand over a preimage per
//! revoked commitment while the counterparty stores only O(log N) of them
//! and can still rederive every earlier one.
//!
//! [`RevocationLadder`] is the receiving side: one storage bucket per
//! trailing-zero count, each new preimage checked against everything already
//! stored. [`derive_from_seed`] is the generating side, used by the signer
//! for our own revocation schedule.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ChannelError;

/// One bucket per possible trailing-zero count of a 64-bit index, plus one
/// for index zero itself.
const BUCKETS: usize = 65;

fn sha256(input: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// Derive the secret at `idx` from the root seed by flipping each set index
/// bit from the top and hashing.
pub fn derive_from_seed(seed: &[u8; 32], idx: u64) -> [u8; 32] {
    derive_secret(*seed, 64, idx)
}

/// Derive a descendant secret by flipping the low `bits` bits of `idx` that
/// are set, top-down, hashing after each flip.
fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
    let mut res = secret;
    for i in 0..bits {
        let bitpos = bits - 1 - i;
        if idx & (1u64 << bitpos) != 0 {
            res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
            res = sha256(&res);
        }
    }
    res
}

fn bucket_for(idx: u64) -> usize {
    // trailing_zeros of 0 is 64, which is exactly the last bucket.
    idx.trailing_zeros() as usize
}

/// Compact storage for the counterparty's revocation preimages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevocationLadder {
    /// (secret, index) per trailing-zero bucket
    known: Vec<Option<([u8; 32], u64)>>,
}

impl Default for RevocationLadder {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationLadder {
    pub fn new() -> Self {
        RevocationLadder {
            known: vec![None; BUCKETS],
        }
    }

    /// Smallest index seen so far. Indices decrease over the channel's life,
    /// so this is the most recent preimage.
    pub fn min_seen(&self) -> Option<u64> {
        self.known
            .iter()
            .flatten()
            .map(|&(_, idx)| idx)
            .min()
    }

    /// Store the preimage for `idx`, verifying it rederives every stored
    /// descendant.
    pub fn insert(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), ChannelError> {
        let pos = bucket_for(idx);
        for entry in self.known.iter().take(pos) {
            if let Some((old_secret, old_idx)) = entry {
                if derive_secret(secret, pos as u8, *old_idx) != *old_secret {
                    return Err(ChannelError::ShachainBreak);
                }
            }
        }
        if self.min_seen().is_some_and(|min| min <= idx) {
            // Already derivable from what we hold.
            return Ok(());
        }
        self.known[pos] = Some((secret, idx));
        Ok(())
    }

    /// Rederive the preimage for `idx` if any stored secret covers it.
    pub fn derive(&self, idx: u64) -> Option<[u8; 32]> {
        for (i, entry) in self.known.iter().enumerate() {
            if let Some((secret, stored_idx)) = entry {
                let prefix_mask = if i >= 64 { 0 } else { !((1u64 << i) - 1) };
                if idx & prefix_mask == *stored_idx {
                    return Some(derive_secret(*secret, i as u8, idx));
                }
            }
        }
        None
    }
}

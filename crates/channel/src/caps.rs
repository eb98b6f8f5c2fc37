//! Host capabilities
//!
//! The engine never touches transaction internals, keys or wall clocks
//! directly; everything comes in through the traits here, injected at
//! construction. Keeps protocol logic decoupled from the host's wallet,
//! chain backend and runtime.
//!
//! Reference implementations are included: [`SeedSigner`] derives a
//! deterministic revocation schedule from a 32-byte seed via the shachain
//! generator, [`SystemClock`] reads the system time, and
//! [`OsRandomOracle`] draws from the OS entropy pool.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};

use protocol::{Hash, Preimage, PubKey, Signature};

use crate::commit::RawTx;
use crate::shachain::derive_from_seed;
use crate::state::{ChannelState, Side};

/// Everything the transaction builder needs for one commitment tx.
pub struct CommitTxParams<'a> {
    pub our_final_key: &'a PubKey,
    pub their_final_key: &'a PubKey,
    pub our_locktime_secs: u32,
    pub their_locktime_secs: u32,
    pub anchor_txid: &'a Hash,
    pub anchor_index: u32,
    pub anchor_satoshis: u64,
    /// Revocation hash for the commitment being built
    pub revocation_hash: &'a Hash,
    /// State the commitment encodes
    pub state: &'a ChannelState,
    /// Whose commitment this is (whose outputs are delayed and revocable)
    pub for_side: Side,
}

/// Key material and signing, backed by the host wallet.
///
/// Revocation preimages must follow the shachain rule at index
/// `u64::MAX - commit_num` so the counterparty's ladder accepts them.
pub trait Signer {
    /// Key gating the anchor's 2-of-2
    fn commit_key(&self) -> PubKey;
    /// Key our close output pays to
    fn final_key(&self) -> PubKey;
    /// Sign the counterparty's commitment transaction
    fn sign_their_commit(&self, tx: &RawTx) -> Signature;
    /// Sign a mutual close transaction
    fn sign_mutual_close(&self, tx: &RawTx) -> Signature;
    /// Preimage retiring commitment `commit_num`
    fn revocation_preimage(&self, commit_num: u64) -> Preimage;
    /// Hash the counterparty commits us to for `commit_num`
    fn revocation_hash(&self, commit_num: u64) -> Hash;
}

/// Bitcoin-side transaction construction and signature checking.
pub trait TxBuilder {
    /// Build a commitment transaction and its output permutation map.
    fn create_commit_tx(&self, params: &CommitTxParams<'_>) -> (RawTx, Vec<u32>);

    /// Build the mutual close transaction. `our` and `their` are
    /// (scriptpubkey, amount in msat) pairs; output order must be canonical
    /// so both sides build identical bytes.
    fn create_close_tx(
        &self,
        anchor_txid: &Hash,
        anchor_index: u32,
        anchor_satoshis: u64,
        fee_sat: u64,
        our: (&[u8], u64),
        their: (&[u8], u64),
    ) -> RawTx;

    /// 2-of-2 redeem script over the commit keys; gates the anchor.
    fn redeem_2of2(&self, a: &PubKey, b: &PubKey) -> Vec<u8>;

    /// Single-key redeem script; used for close outputs.
    fn redeem_single(&self, key: &PubKey) -> Vec<u8>;

    /// P2SH scriptpubkey for a redeem script.
    fn p2sh(&self, script: &[u8]) -> Vec<u8>;

    /// Verify `sig` by `key` over `tx` spending the 2-of-2 witness script.
    fn check_commit_sig(
        &self,
        tx: &RawTx,
        witness_script: &[u8],
        key: &PubKey,
        sig: &Signature,
    ) -> bool;
}

/// Time source and one-shot timers.
///
/// `after` only registers the timer; the host invokes
/// `ChannelEngine::trigger_commit` when it fires.
pub trait Clock {
    type Handle;

    /// Seconds since the UNIX epoch
    fn now(&self) -> u64;
    /// Arm a one-shot timer
    fn after(&mut self, delay: Duration) -> Self::Handle;
    /// Disarm a timer; a no-op if it already fired
    fn cancel(&mut self, handle: Self::Handle);
}

/// Entropy source shared across peers.
pub trait RandomOracle {
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

/// OS-backed entropy.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsRandomOracle;

impl RandomOracle for OsRandomOracle {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }
}

/// Wall-clock time with deadline handles.
///
/// `after` hands back the absolute deadline; the host's event loop checks
/// deadlines against `now` and calls back into the engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Handle = u64;

    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn after(&mut self, delay: Duration) -> u64 {
        self.now() + delay.as_secs().max(1)
    }

    fn cancel(&mut self, _handle: u64) {}
}

fn tagged_sha256(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Digest-based stand-in signature, keyed on the signer's public key.
///
/// This is what [`SeedSigner`] produces and what the test transaction
/// builder checks; a production host backs [`Signer`] and
/// [`TxBuilder::check_commit_sig`] with its wallet's ECDSA instead.
pub fn digest_sign(key: &PubKey, tx: &RawTx) -> Signature {
    Signature {
        r: tagged_sha256(b"sig-r", &[&key.0, &tx.0]),
        s: tagged_sha256(b"sig-s", &[&key.0, &tx.0]),
    }
}

/// Deterministic signer over a 32-byte seed.
///
/// The revocation schedule is the shachain sequence rooted at the seed, so
/// a counterparty ladder accepts every preimage in order. Keys are derived
/// from the seed; signatures are the [`digest_sign`] stand-in.
#[derive(Clone)]
pub struct SeedSigner {
    seed: [u8; 32],
    commit_key: PubKey,
    final_key: PubKey,
}

impl SeedSigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let mut commit_key = [0u8; 33];
        commit_key[0] = 0x02;
        commit_key[1..].copy_from_slice(&tagged_sha256(b"commit-key", &[&seed]));
        let mut final_key = [0u8; 33];
        final_key[0] = 0x03;
        final_key[1..].copy_from_slice(&tagged_sha256(b"final-key", &[&seed]));
        SeedSigner {
            seed,
            commit_key: PubKey(commit_key),
            final_key: PubKey(final_key),
        }
    }

    /// Fresh signer with a seed drawn from the oracle.
    pub fn generate(rng: &mut impl RandomOracle) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }
}

impl Signer for SeedSigner {
    fn commit_key(&self) -> PubKey {
        self.commit_key
    }

    fn final_key(&self) -> PubKey {
        self.final_key
    }

    fn sign_their_commit(&self, tx: &RawTx) -> Signature {
        digest_sign(&self.commit_key, tx)
    }

    fn sign_mutual_close(&self, tx: &RawTx) -> Signature {
        digest_sign(&self.commit_key, tx)
    }

    fn revocation_preimage(&self, commit_num: u64) -> Preimage {
        Preimage(derive_from_seed(&self.seed, u64::MAX - commit_num))
    }

    fn revocation_hash(&self, commit_num: u64) -> Hash {
        crate::state::rhash_from_preimage(&self.revocation_preimage(commit_num))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shachain::RevocationLadder;
    use crate::state::rhash_from_preimage;

    #[test]
    fn test_seed_signer_keys_are_stable() {
        let a = SeedSigner::from_seed([1; 32]);
        let b = SeedSigner::from_seed([1; 32]);
        assert_eq!(a.commit_key(), b.commit_key());
        assert_eq!(a.final_key(), b.final_key());
        assert_ne!(a.commit_key(), a.final_key());
        assert_ne!(
            a.commit_key(),
            SeedSigner::from_seed([2; 32]).commit_key()
        );
    }

    #[test]
    fn test_revocation_schedule_feeds_ladder() {
        let signer = SeedSigner::from_seed([9; 32]);
        let mut ladder = RevocationLadder::new();
        for n in 0..50u64 {
            let preimage = signer.revocation_preimage(n);
            assert_eq!(rhash_from_preimage(&preimage), signer.revocation_hash(n));
            ladder.insert(u64::MAX - n, preimage.0).unwrap();
        }
    }

    #[test]
    fn test_digest_sign_is_key_and_tx_bound() {
        let signer = SeedSigner::from_seed([5; 32]);
        let tx = RawTx(vec![1, 2, 3]);
        let sig = signer.sign_their_commit(&tx);
        assert_eq!(sig, digest_sign(&signer.commit_key(), &tx));
        assert_ne!(sig, digest_sign(&signer.commit_key(), &RawTx(vec![9])));
        assert_ne!(sig, digest_sign(&signer.final_key(), &tx));
    }

    #[test]
    fn test_generate_uses_oracle() {
        let mut rng = OsRandomOracle;
        let a = SeedSigner::generate(&mut rng);
        let b = SeedSigner::generate(&mut rng);
        assert_ne!(a.commit_key(), b.commit_key());
    }
}

//! Shared test fixtures: a settable clock, a deterministic transaction
//! builder, and helpers that wire two engines together and pump packets
//! between them.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use protocol::{Hash, PubKey, Signature};

use crate::caps::{digest_sign, Clock, CommitTxParams, SeedSigner, Signer, TxBuilder};
use crate::commit::{apply_changeset, RawTx};
use crate::engine::{ChannelEngine, EngineConfig};
use crate::state::{Side, SideState};

pub type TestEngine = ChannelEngine<SeedSigner, TemplateTxBuilder, ManualClock>;

/// Test clock: shared settable time, timer handles are just counters.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
    seq: u64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        ManualClock {
            now: Rc::new(Cell::new(now)),
            seq: 0,
        }
    }

    pub fn set_now(&self, now: u64) {
        self.now.set(now);
    }
}

impl Clock for ManualClock {
    type Handle = u64;

    fn now(&self) -> u64 {
        self.now.get()
    }

    fn after(&mut self, _delay: Duration) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn cancel(&mut self, _handle: u64) {}
}

/// Deterministic stand-in transaction builder.
///
/// Produces canonical byte templates instead of real transactions: HTLC
/// lists are sorted by id and close outputs by script, so both peers build
/// identical bytes for the same logical transaction regardless of staging
/// order. Signature checking mirrors [`digest_sign`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateTxBuilder;

fn canonical_side(side: &SideState) -> SideState {
    let mut side = side.clone();
    side.htlcs.sort_by_key(|h| h.id);
    side
}

impl TxBuilder for TemplateTxBuilder {
    fn create_commit_tx(&self, p: &CommitTxParams<'_>) -> (RawTx, Vec<u32>) {
        // Serialize owner-side first so both peers agree on the bytes of
        // the same commitment.
        let (owner_final, other_final, owner_lock, other_lock) = match p.for_side {
            Side::Ours => (
                p.our_final_key,
                p.their_final_key,
                p.our_locktime_secs,
                p.their_locktime_secs,
            ),
            Side::Theirs => (
                p.their_final_key,
                p.our_final_key,
                p.their_locktime_secs,
                p.our_locktime_secs,
            ),
        };
        let owner = canonical_side(p.state.side(p.for_side));
        let other = canonical_side(p.state.side(p.for_side.other()));
        let payload = bincode::serialize(&(
            "commit-tx",
            p.anchor_txid,
            p.anchor_index,
            p.anchor_satoshis,
            p.revocation_hash,
            owner_final,
            other_final,
            owner_lock,
            other_lock,
            p.state.fee_rate,
            &owner,
            &other,
        ))
        .expect("commit tx template serializes");
        let outputs = (0..(2 + p.state.htlc_count()) as u32).collect();
        (RawTx(payload), outputs)
    }

    fn create_close_tx(
        &self,
        anchor_txid: &Hash,
        anchor_index: u32,
        anchor_satoshis: u64,
        fee_sat: u64,
        our: (&[u8], u64),
        their: (&[u8], u64),
    ) -> RawTx {
        let (first, second) = if our.0 <= their.0 {
            (our, their)
        } else {
            (their, our)
        };
        RawTx(
            bincode::serialize(&(
                "close-tx",
                anchor_txid,
                anchor_index,
                anchor_satoshis,
                fee_sat,
                first.0,
                first.1,
                second.0,
                second.1,
            ))
            .expect("close tx template serializes"),
        )
    }

    fn redeem_2of2(&self, a: &PubKey, b: &PubKey) -> Vec<u8> {
        let (x, y) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        let mut script = vec![0x52];
        script.extend_from_slice(&x.0);
        script.extend_from_slice(&y.0);
        script.extend_from_slice(&[0x52, 0xae]);
        script
    }

    fn redeem_single(&self, key: &PubKey) -> Vec<u8> {
        let mut script = key.0.to_vec();
        script.push(0xac);
        script
    }

    fn p2sh(&self, script: &[u8]) -> Vec<u8> {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(script);
        let mut out = vec![0xa9, 0x14];
        out.extend_from_slice(&hash[..20]);
        out.push(0x87);
        out
    }

    fn check_commit_sig(
        &self,
        tx: &RawTx,
        _witness_script: &[u8],
        key: &PubKey,
        sig: &Signature,
    ) -> bool {
        *sig == digest_sign(key, tx)
    }
}

/// Deliver queued packets back and forth until both queues drain.
pub fn pump(a: &mut TestEngine, b: &mut TestEngine) {
    loop {
        let mut progressed = false;
        while let Some(pkt) = a.pop_outbound() {
            b.handle_packet(&pkt).expect("b accepts packet");
            progressed = true;
        }
        while let Some(pkt) = b.pop_outbound() {
            a.handle_packet(&pkt).expect("a accepts packet");
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
}

/// Two engines before any packet flows; `a` offers the anchor.
pub fn engine_pair() -> (TestEngine, TestEngine) {
    pair_with_configs(EngineConfig::default(), EngineConfig::default()).0
}

fn pair_with_configs(
    config_a: EngineConfig,
    config_b: EngineConfig,
) -> ((TestEngine, TestEngine), ManualClock) {
    let signer_a = SeedSigner::from_seed([1; 32]);
    let signer_b = SeedSigner::from_seed([2; 32]);
    let id_a = signer_a.commit_key();
    let id_b = signer_b.commit_key();
    let clock = ManualClock::new(1_000_000);
    let a = ChannelEngine::new(id_b, true, config_a, signer_a, TemplateTxBuilder, clock.clone());
    let b = ChannelEngine::new(
        id_a,
        false,
        config_b,
        signer_b,
        TemplateTxBuilder,
        clock.clone(),
    );
    ((a, b), clock)
}

/// Two engines in `Normal` with a settled, confirmed anchor of
/// `anchor_sat` funded by `a`.
pub fn confirmed_pair(anchor_sat: u64) -> (TestEngine, TestEngine) {
    pair_with_clock(anchor_sat, EngineConfig::default(), EngineConfig::default()).0
}

/// Like [`confirmed_pair`] with per-side configs and the shared clock.
pub fn pair_with_clock(
    anchor_sat: u64,
    config_a: EngineConfig,
    config_b: EngineConfig,
) -> ((TestEngine, TestEngine), ManualClock) {
    let ((mut a, mut b), clock) = pair_with_configs(config_a, config_b);
    a.open().expect("a opens");
    b.open().expect("b opens");
    pump(&mut a, &mut b);
    a.provide_anchor(Hash([0xAA; 32]), 0, anchor_sat)
        .expect("anchor provided");
    pump(&mut a, &mut b);
    a.anchor_confirmed();
    b.anchor_confirmed();
    pump(&mut a, &mut b);
    ((a, b), clock)
}

/// Property 7: each side's staging state equals its committed tip plus the
/// tip's unacked changes.
pub fn assert_staging_consistent(engine: &TestEngine) {
    for side in [Side::Ours, Side::Theirs] {
        let tip = engine.commit_tip(side).expect("commitment exists");
        let staging = engine.staging(side).expect("staging exists");
        // Local chains carry their changes, remote chains ours.
        let adds_offered_by = side.other();
        let rebuilt =
            apply_changeset(&tip.state, &tip.unacked, adds_offered_by).expect("unacked replays");
        assert_eq!(&rebuilt, staging, "staging != committed + unacked ({side:?})");
    }
}

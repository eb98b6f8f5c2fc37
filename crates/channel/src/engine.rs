//! Channel engine
//!
//! One [`ChannelEngine`] per peer drives a single channel through its whole
//! life: open handshake, steady-state HTLC updates with the commit/revoke
//! dance, clearing and mutual close. Inbound packets come in through
//! [`ChannelEngine::handle_packet`], application commands through the
//! public methods, and outbound packets leave through an ordered queue the
//! host transport drains.
//!
//! ## Staging discipline
//!
//! Changes we originate apply to the *remote* staging state first (they hit
//! the commitment we sign for the peer) and ride on the remote chain tip's
//! unacked list; they reach our own staging state when the peer revokes.
//! Changes the peer originates mirror that: local staging first, local tip
//! unacked list, crossing over when we send our revocation. A revocation
//! therefore means "these changes are now permanent on both sides".
//!
//! Every error on inbound traffic is terminal: the engine queues an `Error`
//! packet with a stable problem string and the channel can only be resolved
//! on-chain from then on. Errors on local commands are returned to the
//! caller and never touch the wire.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use protocol::packets::{
    AnchorOffer, CloseClearing, CloseSignature, ErrorPkt, OpenAnchor, OpenChannel, OpenCommitSig,
    OpenComplete, Pkt, PktKind, UpdateAddHtlc, UpdateCommit, UpdateFailHtlc, UpdateFulfillHtlc,
    UpdateRevocation,
};
use protocol::{Hash, Locktime, Preimage, PubKey};

use crate::caps::{Clock, CommitTxParams, Signer, TxBuilder};
use crate::commit::{apply_changeset, CommitInfo, RawTx, StagingChange};
use crate::fsm::PeerState;
use crate::persist::{ChannelSnapshot, SideSnapshot};
use crate::shachain::RevocationLadder;
use crate::state::{commit_fee_sat, rhash_from_preimage, ChannelHtlc, ChannelState, Side};
use crate::ChannelError;

/// Host configuration for one channel.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Fee rate we announce for our commitment
    pub commitment_fee_rate: u64,
    /// Lowest counterparty fee rate we accept
    pub commitment_fee_rate_min: u64,
    /// Anchor confirmations we require
    pub anchor_confirms: u32,
    /// Highest min-depth the counterparty may demand
    pub anchor_confirms_max: u32,
    /// Relative locktime we ask for on their outputs (seconds)
    pub rel_locktime_secs: u32,
    /// Longest relative locktime we accept (seconds)
    pub rel_locktime_max: u32,
    /// Batching window between a staged change and the commit it rides in
    pub commit_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            commitment_fee_rate: 5000,
            commitment_fee_rate_min: 1000,
            anchor_confirms: 3,
            anchor_confirms_max: 10,
            rel_locktime_secs: 3600,
            rel_locktime_max: 86400,
            commit_delay: Duration::from_millis(10),
        }
    }
}

/// The settled anchor output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub txid: Hash,
    pub output_index: u32,
    pub satoshis: u64,
    /// 2-of-2 redeem script over both commit keys
    pub witness_script: Vec<u8>,
}

/// One party's view of the channel.
#[derive(Clone, Debug)]
pub struct SideView {
    /// Whether this side creates the anchor
    pub offers_anchor: bool,
    pub commit_key: PubKey,
    pub final_key: PubKey,
    /// Relative locktime this side wants on the other's outputs (seconds)
    pub locktime_secs: u32,
    pub min_depth: u32,
    pub fee_rate: u64,
    /// Revocation hash for commitment 0, held until that commitment exists
    pub initial_revocation_hash: Hash,
    /// Revocation hash for the commitment after the current tip
    pub next_revocation_hash: Hash,
    /// Commitment chain tip; `None` until anchor setup
    pub commit: Option<CommitInfo>,
    /// Committed tip state plus all staged unrevoked changes
    pub staging_cstate: Option<ChannelState>,
}

/// Mutual close negotiation record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Closing {
    /// Our last proposed close fee (satoshis)
    pub our_fee: u64,
    /// Their last proposed close fee, once seen
    pub their_fee: Option<u64>,
    /// Their signature over the close tx at `their_fee`
    pub their_sig: Option<protocol::Signature>,
    pub our_script: Option<Vec<u8>>,
    pub their_script: Option<Vec<u8>>,
}

/// Events emitted by the engine.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    /// Open handshake finished on both sides
    Opened,
    HtlcAdded {
        id: u64,
        offered_by: Side,
        amount_msat: u64,
        rhash: Hash,
    },
    HtlcFulfilled {
        id: u64,
        offered_by: Side,
        preimage: Preimage,
    },
    HtlcFailed {
        id: u64,
        offered_by: Side,
        reason: Vec<u8>,
    },
    /// A commitment chain advanced to a new tip
    CommitmentAdvanced { side: Side, commit_num: u64 },
    ClearingStarted,
    CloseFeeProposed { ours: u64, theirs: Option<u64> },
    /// Mutual close agreed; the host broadcasts `close_tx`
    Closed { close_tx: RawTx },
    /// Terminal failure; on-chain rescue is the host's job
    Breakdown { problem: String },
}

/// Per-peer channel state machine.
pub struct ChannelEngine<S, B, C>
where
    S: Signer,
    B: TxBuilder,
    C: Clock,
{
    peer_id: PubKey,
    config: EngineConfig,
    signer: S,
    txb: B,
    clock: C,

    state: PeerState,
    local: SideView,
    /// Populated by their `Open`
    remote: Option<SideView>,
    anchor: Option<Anchor>,

    /// Counter for our HTLC ids
    htlc_id_counter: u64,
    /// Lowest id we accept from them next (ids strictly increase)
    their_next_htlc_id: u64,

    outpkt: VecDeque<Pkt>,
    commit_timer: Option<C::Handle>,

    anchor_depth_ok: bool,
    open_complete_sent: bool,
    open_complete_received: bool,

    closing: Closing,
    /// Their revocation preimages, kept even after breakdown
    their_preimages: RevocationLadder,

    event_tx: Option<mpsc::UnboundedSender<ChannelEvent>>,
}

impl<S, B, C> ChannelEngine<S, B, C>
where
    S: Signer,
    B: TxBuilder,
    C: Clock,
{
    pub fn new(
        peer_id: PubKey,
        offer_anchor: bool,
        config: EngineConfig,
        signer: S,
        txb: B,
        clock: C,
    ) -> Self {
        let local = SideView {
            offers_anchor: offer_anchor,
            commit_key: signer.commit_key(),
            final_key: signer.final_key(),
            locktime_secs: config.rel_locktime_secs,
            min_depth: config.anchor_confirms,
            fee_rate: config.commitment_fee_rate,
            initial_revocation_hash: signer.revocation_hash(0),
            next_revocation_hash: signer.revocation_hash(1),
            commit: None,
            staging_cstate: None,
        };
        ChannelEngine {
            peer_id,
            config,
            signer,
            txb,
            clock,
            state: PeerState::Init,
            local,
            remote: None,
            anchor: None,
            htlc_id_counter: 0,
            their_next_htlc_id: 0,
            outpkt: VecDeque::new(),
            commit_timer: None,
            anchor_depth_ok: false,
            open_complete_sent: false,
            open_complete_received: false,
            closing: Closing::default(),
            their_preimages: RevocationLadder::new(),
            event_tx: None,
        }
    }

    /// Set event channel for receiving notifications
    pub fn set_event_channel(&mut self, tx: mpsc::UnboundedSender<ChannelEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn peer_id(&self) -> &PubKey {
        &self.peer_id
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        self.anchor.as_ref()
    }

    pub fn closing(&self) -> &Closing {
        &self.closing
    }

    pub fn revocation_ladder(&self) -> &RevocationLadder {
        &self.their_preimages
    }

    /// Committed state at a chain tip. `Ours` is our commitment.
    pub fn committed(&self, side: Side) -> Option<&ChannelState> {
        self.commit_tip(side).map(|ci| &ci.state)
    }

    /// Staging state: committed tip plus unrevoked changes.
    pub fn staging(&self, side: Side) -> Option<&ChannelState> {
        match side {
            Side::Ours => self.local.staging_cstate.as_ref(),
            Side::Theirs => self.remote.as_ref()?.staging_cstate.as_ref(),
        }
    }

    pub fn commit_tip(&self, side: Side) -> Option<&CommitInfo> {
        match side {
            Side::Ours => self.local.commit.as_ref(),
            Side::Theirs => self.remote.as_ref()?.commit.as_ref(),
        }
    }

    /// Next outbound packet, in enqueue order.
    pub fn pop_outbound(&mut self) -> Option<Pkt> {
        self.outpkt.pop_front()
    }

    pub fn outbound_len(&self) -> usize {
        self.outpkt.len()
    }

    fn emit(tx: &Option<mpsc::UnboundedSender<ChannelEvent>>, event: ChannelEvent) {
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    fn queue_pkt(&mut self, pkt: Pkt) {
        // Every outbound packet must survive an encode/decode round trip.
        #[cfg(debug_assertions)]
        {
            let bytes = protocol::encode_pkt(&pkt).expect("outbound packet must encode");
            let back = protocol::decode_pkt(&bytes).expect("outbound packet must decode");
            debug_assert_eq!(back, pkt);
        }
        debug!(pkt = pkt.kind().name(), "queued packet");
        self.outpkt.push_back(pkt);
    }

    fn gate(&self, kind: PktKind) -> Result<(), ChannelError> {
        if self.state.accepts(kind) {
            Ok(())
        } else {
            Err(ChannelError::Unexpected {
                kind: kind.name(),
                state: self.state,
            })
        }
    }

    // ========================================
    // Open handshake
    // ========================================

    /// Send our `Open`. Allowed only once, from `Init`.
    pub fn open(&mut self) -> Result<(), ChannelError> {
        if self.state != PeerState::Init {
            return Err(ChannelError::WrongState(self.state));
        }
        let open = OpenChannel {
            revocation_hash: self.local.initial_revocation_hash,
            next_revocation_hash: self.local.next_revocation_hash,
            commit_key: self.local.commit_key,
            final_key: self.local.final_key,
            delay: Locktime::Seconds(self.local.locktime_secs),
            initial_fee_rate: self.local.fee_rate,
            anchor: if self.local.offers_anchor {
                AnchorOffer::WillCreateAnchor
            } else {
                AnchorOffer::WontCreateAnchor
            },
            min_depth: self.local.min_depth,
        };
        self.state = PeerState::OpenWaitForOpen;
        self.queue_pkt(Pkt::Open(open));
        Ok(())
    }

    pub fn accept_pkt_open(&mut self, o: &OpenChannel) -> Result<(), ChannelError> {
        self.gate(PktKind::Open)?;
        let delay_secs = o
            .delay
            .as_seconds()
            .ok_or(ChannelError::Malformed("Delay in blocks not accepted"))?;
        if delay_secs > self.config.rel_locktime_max {
            return Err(ChannelError::Malformed("Delay too great"));
        }
        if o.min_depth > self.config.anchor_confirms_max {
            return Err(ChannelError::Malformed("min_depth too great"));
        }
        if o.initial_fee_rate < self.config.commitment_fee_rate_min {
            return Err(ChannelError::Malformed("Commitment fee rate too low"));
        }
        let they_offer_anchor = o.anchor == AnchorOffer::WillCreateAnchor;
        if they_offer_anchor == self.local.offers_anchor {
            return Err(ChannelError::Malformed("Only one side can offer anchor"));
        }
        self.remote = Some(SideView {
            offers_anchor: they_offer_anchor,
            commit_key: o.commit_key,
            final_key: o.final_key,
            locktime_secs: delay_secs,
            min_depth: o.min_depth,
            fee_rate: o.initial_fee_rate,
            initial_revocation_hash: o.revocation_hash,
            next_revocation_hash: o.next_revocation_hash,
            commit: None,
            staging_cstate: None,
        });
        self.state = PeerState::OpenWaitForAnchor;
        Ok(())
    }

    /// Supply the anchor we promised to create.
    pub fn provide_anchor(
        &mut self,
        txid: Hash,
        output_index: u32,
        satoshis: u64,
    ) -> Result<(), ChannelError> {
        if self.state != PeerState::OpenWaitForAnchor || !self.local.offers_anchor {
            return Err(ChannelError::WrongState(self.state));
        }
        self.set_anchor(txid, output_index, satoshis);
        if let Err(err) = self.setup_first_commit() {
            self.anchor = None;
            return Err(err);
        }
        self.queue_pkt(Pkt::OpenAnchor(OpenAnchor {
            txid,
            output_index,
            amount: satoshis,
        }));
        self.queue_open_commit_sig();
        self.state = PeerState::OpenWaitForCommitSig;
        Ok(())
    }

    pub fn accept_pkt_anchor(&mut self, a: &OpenAnchor) -> Result<(), ChannelError> {
        self.gate(PktKind::OpenAnchor)?;
        if self.local.offers_anchor {
            return Err(ChannelError::Malformed("anchor from the non-funding side"));
        }
        self.set_anchor(a.txid, a.output_index, a.amount);
        self.setup_first_commit()?;
        self.queue_open_commit_sig();
        self.state = PeerState::OpenWaitForCommitSig;
        Ok(())
    }

    fn set_anchor(&mut self, txid: Hash, output_index: u32, satoshis: u64) {
        let remote = self.remote.as_ref().expect("remote view set after open");
        let witness_script = self.txb.redeem_2of2(&self.local.commit_key, &remote.commit_key);
        self.anchor = Some(Anchor {
            txid,
            output_index,
            satoshis,
            witness_script,
        });
    }

    /// Build both sides' commitment 0 from the anchor value.
    fn setup_first_commit(&mut self) -> Result<(), ChannelError> {
        let funder = if self.local.offers_anchor {
            Side::Ours
        } else {
            Side::Theirs
        };
        let (local_state, remote_state, local_hash, remote_hash) = {
            let remote = self.remote.as_ref().expect("remote view set after open");
            let anchor = self.anchor.as_ref().expect("anchor just set");
            (
                ChannelState::initial(anchor.satoshis, self.local.fee_rate, funder)?,
                ChannelState::initial(anchor.satoshis, remote.fee_rate, funder)?,
                self.local.initial_revocation_hash,
                remote.initial_revocation_hash,
            )
        };
        let (local_tx, local_map) = self
            .txb
            .create_commit_tx(&self.commit_params(Side::Ours, &local_hash, &local_state));
        let (remote_tx, remote_map) =
            self.txb
                .create_commit_tx(&self.commit_params(Side::Theirs, &remote_hash, &remote_state));

        self.local.commit = Some(CommitInfo {
            prev: None,
            commit_num: 0,
            revocation_hash: local_hash,
            state: local_state.clone(),
            tx: local_tx,
            output_map: local_map,
            remote_sig: None,
            revocation_preimage: None,
            unacked: Vec::new(),
        });
        self.local.staging_cstate = Some(local_state);

        let remote = self.remote.as_mut().expect("remote view set after open");
        remote.commit = Some(CommitInfo {
            prev: None,
            commit_num: 0,
            revocation_hash: remote_hash,
            state: remote_state.clone(),
            tx: remote_tx,
            output_map: remote_map,
            remote_sig: None,
            revocation_preimage: None,
            unacked: Vec::new(),
        });
        remote.staging_cstate = Some(remote_state);
        Ok(())
    }

    fn queue_open_commit_sig(&mut self) {
        let sig = {
            let remote = self.remote.as_mut().expect("remote view set after open");
            let ci = remote.commit.as_mut().expect("first commitment built");
            let sig = self.signer.sign_their_commit(&ci.tx);
            ci.remote_sig = Some(sig);
            sig
        };
        self.queue_pkt(Pkt::OpenCommitSig(OpenCommitSig { sig }));
    }

    pub fn accept_pkt_open_commit_sig(&mut self, s: &OpenCommitSig) -> Result<(), ChannelError> {
        self.gate(PktKind::OpenCommitSig)?;
        {
            let anchor = self.anchor.as_ref().expect("anchor set before commit sigs");
            let remote = self.remote.as_ref().expect("remote view set after open");
            let ci = self.local.commit.as_mut().expect("first commitment built");
            if !self
                .txb
                .check_commit_sig(&ci.tx, &anchor.witness_script, &remote.commit_key, &s.sig)
            {
                return Err(ChannelError::BadSignature);
            }
            ci.remote_sig = Some(s.sig);
        }
        self.state = PeerState::OpenWaitForComplete;
        self.maybe_queue_open_complete();
        Ok(())
    }

    /// Chain monitor reports the anchor at the required depth.
    pub fn anchor_confirmed(&mut self) {
        if self.anchor_depth_ok {
            return;
        }
        self.anchor_depth_ok = true;
        info!("anchor reached min depth");
        self.maybe_queue_open_complete();
    }

    fn maybe_queue_open_complete(&mut self) {
        if self.open_complete_sent
            || !self.anchor_depth_ok
            || self.state != PeerState::OpenWaitForComplete
        {
            return;
        }
        let have_sig = self
            .local
            .commit
            .as_ref()
            .is_some_and(|ci| ci.remote_sig.is_some());
        if !have_sig {
            return;
        }
        self.open_complete_sent = true;
        self.queue_pkt(Pkt::OpenComplete(OpenComplete {}));
        self.maybe_finish_open();
    }

    pub fn accept_pkt_open_complete(&mut self) -> Result<(), ChannelError> {
        self.gate(PktKind::OpenComplete)?;
        self.open_complete_received = true;
        self.maybe_finish_open();
        Ok(())
    }

    fn maybe_finish_open(&mut self) {
        if self.state == PeerState::OpenWaitForComplete
            && self.open_complete_sent
            && self.open_complete_received
        {
            self.state = PeerState::Normal;
            info!(peer = %self.peer_id, "channel open complete");
            Self::emit(&self.event_tx, ChannelEvent::Opened);
        }
    }

    // ========================================
    // Steady-state commands
    // ========================================

    /// Offer a new HTLC to the peer. Returns its id.
    pub fn add_htlc(
        &mut self,
        amount_msat: u64,
        expiry: Locktime,
        rhash: Hash,
        route: Vec<u8>,
    ) -> Result<u64, ChannelError> {
        if self.state != PeerState::Normal {
            return Err(ChannelError::WrongState(self.state));
        }
        if amount_msat == 0 {
            return Err(ChannelError::Malformed("Invalid amount_msat"));
        }
        let expiry_secs = expiry
            .as_seconds()
            .ok_or(ChannelError::Malformed("HTLC expiry in blocks not supported!"))?;
        let id = self.htlc_id_counter;
        let htlc = ChannelHtlc {
            id,
            amount_msat,
            rhash,
            expiry_secs,
            route: route.clone(),
        };
        {
            let remote = self.remote.as_mut().expect("remote view set in NORMAL");
            let local_staging = self
                .local
                .staging_cstate
                .as_ref()
                .expect("staging set after anchor setup");
            // The add must be affordable in both commitments before any of
            // it sticks.
            let _ = local_staging.add_htlc(Side::Ours, htlc.clone())?;
            let staging = remote
                .staging_cstate
                .as_mut()
                .expect("staging set after anchor setup");
            *staging = staging.add_htlc(Side::Ours, htlc.clone())?;
            remote
                .commit
                .as_mut()
                .expect("commitment exists in NORMAL")
                .unacked
                .push(StagingChange::Add(htlc));
        }
        self.htlc_id_counter += 1;
        self.remote_changes_pending();
        self.queue_pkt(Pkt::UpdateAddHtlc(UpdateAddHtlc {
            id,
            amount_msat,
            rhash,
            expiry,
            route,
        }));
        Self::emit(
            &self.event_tx,
            ChannelEvent::HtlcAdded {
                id,
                offered_by: Side::Ours,
                amount_msat,
                rhash,
            },
        );
        Ok(id)
    }

    /// Resolve an HTLC the peer offered us.
    pub fn fulfill_htlc(&mut self, id: u64, preimage: Preimage) -> Result<(), ChannelError> {
        if !self.state.is_live() {
            return Err(ChannelError::WrongState(self.state));
        }
        {
            let remote = self.remote.as_mut().expect("remote view set in NORMAL");
            Self::find_committed_htlc(remote, Side::Theirs, id)?;
            let staging = remote
                .staging_cstate
                .as_mut()
                .expect("staging set after anchor setup");
            *staging = staging.fulfill_htlc(id, Side::Theirs, &preimage)?;
            remote
                .commit
                .as_mut()
                .expect("commitment exists in NORMAL")
                .unacked
                .push(StagingChange::Fulfill { id, preimage });
        }
        self.remote_changes_pending();
        self.queue_pkt(Pkt::UpdateFulfillHtlc(UpdateFulfillHtlc { id, r: preimage }));
        Self::emit(
            &self.event_tx,
            ChannelEvent::HtlcFulfilled {
                id,
                offered_by: Side::Theirs,
                preimage,
            },
        );
        Ok(())
    }

    /// Remove an HTLC the peer offered us, refunding them.
    pub fn fail_htlc(&mut self, id: u64, reason: Vec<u8>) -> Result<(), ChannelError> {
        if !self.state.is_live() {
            return Err(ChannelError::WrongState(self.state));
        }
        {
            let remote = self.remote.as_mut().expect("remote view set in NORMAL");
            Self::find_committed_htlc(remote, Side::Theirs, id)?;
            let staging = remote
                .staging_cstate
                .as_mut()
                .expect("staging set after anchor setup");
            *staging = staging.fail_htlc(id, Side::Theirs)?;
            remote
                .commit
                .as_mut()
                .expect("commitment exists in NORMAL")
                .unacked
                .push(StagingChange::Fail {
                    id,
                    reason: reason.clone(),
                });
        }
        self.remote_changes_pending();
        self.queue_pkt(Pkt::UpdateFailHtlc(UpdateFailHtlc {
            id,
            reason: reason.clone(),
        }));
        Self::emit(
            &self.event_tx,
            ChannelEvent::HtlcFailed {
                id,
                offered_by: Side::Theirs,
                reason,
            },
        );
        Ok(())
    }

    /// Fail every received HTLC whose expiry has passed. Returns how many.
    pub fn fail_expired_htlcs(&mut self) -> Result<usize, ChannelError> {
        if !self.state.is_live() {
            return Err(ChannelError::WrongState(self.state));
        }
        let now = self.clock.now();
        let expired: Vec<u64> = {
            let remote = self.remote.as_ref().expect("remote view set in NORMAL");
            let tip = remote.commit.as_ref().expect("commitment exists in NORMAL");
            let staging = remote
                .staging_cstate
                .as_ref()
                .expect("staging set after anchor setup");
            staging
                .side(Side::Theirs)
                .htlcs
                .iter()
                .filter(|h| u64::from(h.expiry_secs) <= now)
                .filter(|h| tip.state.htlc(Side::Theirs, h.id).is_some())
                .map(|h| h.id)
                .collect()
        };
        let count = expired.len();
        for id in expired {
            self.fail_htlc(id, b"expired".to_vec())?;
        }
        Ok(count)
    }

    /// Arm the batching timer for a commit, if not already armed.
    fn remote_changes_pending(&mut self) {
        if self.commit_timer.is_none() {
            let handle = self.clock.after(self.config.commit_delay);
            self.commit_timer = Some(handle);
            debug!("commit timer armed");
        }
    }

    // ========================================
    // Commit / revoke dance
    // ========================================

    /// Sign the peer's next commitment over everything staged.
    ///
    /// Fired by the commit timer; also callable directly. Returns whether a
    /// commit was actually sent: with nothing staged, or with the previous
    /// commitment still unrevoked, this is a no-op (the revocation's
    /// arrival re-arms the timer).
    pub fn trigger_commit(&mut self) -> Result<bool, ChannelError> {
        if let Some(handle) = self.commit_timer.take() {
            self.clock.cancel(handle);
        }
        if !self.state.is_live() {
            return Ok(false);
        }
        let (state, revocation_hash, commit_num) = {
            let remote = self.remote.as_ref().expect("remote view set in NORMAL");
            let tip = remote.commit.as_ref().expect("commitment exists in NORMAL");
            if tip.prev.as_deref().is_some_and(|prev| !prev.is_revoked()) {
                // One commitment in flight per direction.
                return Ok(false);
            }
            let staging = remote
                .staging_cstate
                .as_ref()
                .expect("staging set after anchor setup");
            if staging.changes == tip.state.changes {
                return Ok(false);
            }
            (
                staging.clone(),
                remote.next_revocation_hash,
                tip.commit_num + 1,
            )
        };
        let (tx, output_map) = self
            .txb
            .create_commit_tx(&self.commit_params(Side::Theirs, &revocation_hash, &state));
        let sig = self.signer.sign_their_commit(&tx);
        {
            let remote = self.remote.as_mut().expect("remote view set in NORMAL");
            let prev = remote.commit.take().expect("commitment exists in NORMAL");
            remote.commit = Some(CommitInfo {
                prev: Some(Box::new(prev)),
                commit_num,
                revocation_hash,
                state,
                tx,
                output_map,
                remote_sig: Some(sig),
                revocation_preimage: None,
                unacked: Vec::new(),
            });
        }
        debug!(commit_num, "signing their commitment");
        Self::emit(
            &self.event_tx,
            ChannelEvent::CommitmentAdvanced {
                side: Side::Theirs,
                commit_num,
            },
        );
        self.queue_pkt(Pkt::UpdateCommit(UpdateCommit { sig }));
        Ok(true)
    }

    // ========================================
    // Inbound update handlers
    // ========================================

    fn find_committed_htlc(
        view: &SideView,
        offered_by: Side,
        id: u64,
    ) -> Result<(), ChannelError> {
        let tip = view.commit.as_ref().expect("commitment exists in NORMAL");
        if tip.state.htlc(offered_by, id).is_none() {
            return Err(ChannelError::NotFound(id));
        }
        let staging = view
            .staging_cstate
            .as_ref()
            .expect("staging set after anchor setup");
        if staging.htlc(offered_by, id).is_none() {
            return Err(ChannelError::AlreadyRemoved(id));
        }
        Ok(())
    }

    pub fn accept_pkt_htlc_add(&mut self, u: &UpdateAddHtlc) -> Result<(), ChannelError> {
        self.gate(PktKind::UpdateAddHtlc)?;
        if u.amount_msat == 0 {
            return Err(ChannelError::Malformed("Invalid amount_msat"));
        }
        let expiry_secs = u
            .expiry
            .as_seconds()
            .ok_or(ChannelError::Malformed("HTLC expiry in blocks not supported!"))?;
        if u.id < self.their_next_htlc_id {
            return Err(ChannelError::Malformed("HTLC id not strictly increasing"));
        }
        let htlc = ChannelHtlc {
            id: u.id,
            amount_msat: u.amount_msat,
            rhash: u.rhash,
            expiry_secs,
            route: u.route.clone(),
        };
        {
            let remote = self.remote.as_ref().expect("remote view set in NORMAL");
            let remote_staging = remote
                .staging_cstate
                .as_ref()
                .expect("staging set after anchor setup");
            // Affordability is checked against both current staging states;
            // the add lands in our staging now and crosses into theirs at
            // our revocation.
            let _ = remote_staging.add_htlc(Side::Theirs, htlc.clone())?;
            let staging = self
                .local
                .staging_cstate
                .as_mut()
                .expect("staging set after anchor setup");
            *staging = staging.add_htlc(Side::Theirs, htlc.clone())?;
            self.local
                .commit
                .as_mut()
                .expect("commitment exists in NORMAL")
                .unacked
                .push(StagingChange::Add(htlc));
        }
        self.their_next_htlc_id = u.id.saturating_add(1);
        Self::emit(
            &self.event_tx,
            ChannelEvent::HtlcAdded {
                id: u.id,
                offered_by: Side::Theirs,
                amount_msat: u.amount_msat,
                rhash: u.rhash,
            },
        );
        Ok(())
    }

    pub fn accept_pkt_htlc_fulfill(&mut self, f: &UpdateFulfillHtlc) -> Result<(), ChannelError> {
        self.gate(PktKind::UpdateFulfillHtlc)?;
        Self::find_committed_htlc(&self.local, Side::Ours, f.id)?;
        {
            let staging = self
                .local
                .staging_cstate
                .as_mut()
                .expect("staging set after anchor setup");
            *staging = staging.fulfill_htlc(f.id, Side::Ours, &f.r)?;
            self.local
                .commit
                .as_mut()
                .expect("commitment exists in NORMAL")
                .unacked
                .push(StagingChange::Fulfill {
                    id: f.id,
                    preimage: f.r,
                });
        }
        Self::emit(
            &self.event_tx,
            ChannelEvent::HtlcFulfilled {
                id: f.id,
                offered_by: Side::Ours,
                preimage: f.r,
            },
        );
        Ok(())
    }

    pub fn accept_pkt_htlc_fail(&mut self, f: &UpdateFailHtlc) -> Result<(), ChannelError> {
        self.gate(PktKind::UpdateFailHtlc)?;
        Self::find_committed_htlc(&self.local, Side::Ours, f.id)?;
        {
            let staging = self
                .local
                .staging_cstate
                .as_mut()
                .expect("staging set after anchor setup");
            *staging = staging.fail_htlc(f.id, Side::Ours)?;
            self.local
                .commit
                .as_mut()
                .expect("commitment exists in NORMAL")
                .unacked
                .push(StagingChange::Fail {
                    id: f.id,
                    reason: f.reason.clone(),
                });
        }
        Self::emit(
            &self.event_tx,
            ChannelEvent::HtlcFailed {
                id: f.id,
                offered_by: Side::Ours,
                reason: f.reason.clone(),
            },
        );
        Ok(())
    }

    pub fn accept_pkt_commit(&mut self, c: &UpdateCommit) -> Result<(), ChannelError> {
        self.gate(PktKind::UpdateCommit)?;
        let (state, revocation_hash, commit_num) = {
            let tip = self
                .local
                .commit
                .as_ref()
                .expect("commitment exists in NORMAL");
            let staging = self
                .local
                .staging_cstate
                .as_ref()
                .expect("staging set after anchor setup");
            if staging.changes == tip.state.changes {
                return Err(ChannelError::EmptyCommit);
            }
            (
                staging.clone(),
                self.local.next_revocation_hash,
                tip.commit_num + 1,
            )
        };
        let (tx, output_map) = self
            .txb
            .create_commit_tx(&self.commit_params(Side::Ours, &revocation_hash, &state));
        {
            let anchor = self.anchor.as_ref().expect("anchor set in NORMAL");
            let remote = self.remote.as_ref().expect("remote view set in NORMAL");
            if !self
                .txb
                .check_commit_sig(&tx, &anchor.witness_script, &remote.commit_key, &c.sig)
            {
                return Err(ChannelError::BadSignature);
            }
        }
        let prev = self.local.commit.take().expect("checked above");
        self.local.commit = Some(CommitInfo {
            prev: Some(Box::new(prev)),
            commit_num,
            revocation_hash,
            state,
            tx,
            output_map,
            remote_sig: Some(c.sig),
            revocation_preimage: None,
            unacked: Vec::new(),
        });
        self.local.next_revocation_hash = self.signer.revocation_hash(commit_num + 1);
        debug!(commit_num, "accepted their commitment signature");
        Self::emit(
            &self.event_tx,
            ChannelEvent::CommitmentAdvanced {
                side: Side::Ours,
                commit_num,
            },
        );
        self.queue_revocation()?;
        self.maybe_progress_close();
        Ok(())
    }

    /// Reveal the preimage for the commitment our new tip superseded.
    fn queue_revocation(&mut self) -> Result<(), ChannelError> {
        let (preimage, next_hash, unacked) = {
            let tip = self
                .local
                .commit
                .as_mut()
                .expect("commitment exists in NORMAL");
            let prev = tip
                .prev
                .as_deref_mut()
                .expect("revocation follows a superseding commitment");
            let preimage = self.signer.revocation_preimage(prev.commit_num);
            debug_assert_eq!(
                rhash_from_preimage(&preimage),
                prev.revocation_hash,
                "signer revocation schedule out of sync"
            );
            prev.revocation_preimage = Some(preimage);
            let unacked = std::mem::take(&mut prev.unacked);
            (preimage, self.local.next_revocation_hash, unacked)
        };
        self.queue_pkt(Pkt::UpdateRevocation(UpdateRevocation {
            revocation_preimage: preimage,
            next_revocation_hash: next_hash,
        }));
        // Their changes are acked on both sides now; fold them into the
        // state we build their commitments from.
        if !unacked.is_empty() {
            {
                let remote = self.remote.as_mut().expect("remote view set in NORMAL");
                let staging = remote
                    .staging_cstate
                    .as_mut()
                    .expect("staging set after anchor setup");
                *staging = apply_changeset(staging, &unacked, Side::Theirs)?;
            }
            self.remote_changes_pending();
        }
        Ok(())
    }

    pub fn accept_pkt_revocation(&mut self, r: &UpdateRevocation) -> Result<(), ChannelError> {
        self.gate(PktKind::UpdateRevocation)?;
        let unacked = {
            let remote = self.remote.as_mut().expect("remote view set in NORMAL");
            let tip = remote
                .commit
                .as_mut()
                .ok_or(ChannelError::Malformed("no commitment to revoke"))?;
            let prev = tip
                .prev
                .as_deref_mut()
                .ok_or(ChannelError::Malformed("no commitment to revoke"))?;
            if prev.is_revoked() {
                return Err(ChannelError::Malformed("commitment already revoked"));
            }
            if rhash_from_preimage(&r.revocation_preimage) != prev.revocation_hash {
                return Err(ChannelError::BadRevocationPreimage);
            }
            self.their_preimages
                .insert(u64::MAX - prev.commit_num, r.revocation_preimage.0)?;
            prev.revocation_preimage = Some(r.revocation_preimage);
            let unacked = std::mem::take(&mut prev.unacked);
            remote.next_revocation_hash = r.next_revocation_hash;
            unacked
        };
        // Our changes are acked on both sides now.
        if !unacked.is_empty() {
            let staging = self
                .local
                .staging_cstate
                .as_mut()
                .expect("staging set after anchor setup");
            *staging = apply_changeset(staging, &unacked, Side::Ours)?;
        }
        let behind = {
            let remote = self.remote.as_ref().expect("remote view set in NORMAL");
            let staging = remote
                .staging_cstate
                .as_ref()
                .expect("staging set after anchor setup");
            staging.changes
                != remote
                    .commit
                    .as_ref()
                    .expect("commitment exists in NORMAL")
                    .state
                    .changes
        };
        if behind {
            // A commit was deferred while this revocation was in flight.
            self.remote_changes_pending();
        }
        self.maybe_progress_close();
        Ok(())
    }

    // ========================================
    // Clearing and mutual close
    // ========================================

    /// Stop accepting new HTLCs and start draining towards a mutual close.
    pub fn begin_clearing(&mut self) -> Result<(), ChannelError> {
        if self.state != PeerState::Normal {
            return Err(ChannelError::WrongState(self.state));
        }
        self.start_clearing();
        self.maybe_progress_close();
        Ok(())
    }

    fn start_clearing(&mut self) {
        let redeem = self.txb.redeem_single(&self.local.final_key);
        let script = self.txb.p2sh(&redeem);
        self.closing.our_script = Some(script.clone());
        self.state = PeerState::Clearing;
        info!("entering clearing");
        Self::emit(&self.event_tx, ChannelEvent::ClearingStarted);
        self.queue_pkt(Pkt::CloseClearing(CloseClearing {
            script_pubkey: script,
        }));
    }

    pub fn accept_pkt_close_clearing(&mut self, c: &CloseClearing) -> Result<(), ChannelError> {
        self.gate(PktKind::CloseClearing)?;
        if self.closing.their_script.is_some() {
            return Err(ChannelError::Malformed("duplicate close clearing"));
        }
        self.closing.their_script = Some(c.script_pubkey.clone());
        if self.state == PeerState::Normal {
            self.start_clearing();
        }
        self.maybe_progress_close();
        Ok(())
    }

    /// No HTLC anywhere, nothing staged, nothing awaiting revocation.
    fn htlcs_drained(&self) -> bool {
        let Some(remote) = self.remote.as_ref() else {
            return false;
        };
        let (Some(local_tip), Some(remote_tip)) = (self.local.commit.as_ref(), remote.commit.as_ref())
        else {
            return false;
        };
        let (Some(local_staging), Some(remote_staging)) = (
            self.local.staging_cstate.as_ref(),
            remote.staging_cstate.as_ref(),
        ) else {
            return false;
        };
        local_tip.state.htlc_count() == 0
            && remote_tip.state.htlc_count() == 0
            && local_staging.htlc_count() == 0
            && remote_staging.htlc_count() == 0
            && local_staging.changes == local_tip.state.changes
            && remote_staging.changes == remote_tip.state.changes
            && local_tip.prev.as_deref().map_or(true, CommitInfo::is_revoked)
            && remote_tip.prev.as_deref().map_or(true, CommitInfo::is_revoked)
    }

    fn maybe_progress_close(&mut self) {
        if self.state != PeerState::Clearing {
            return;
        }
        if self.closing.our_script.is_none() || self.closing.their_script.is_none() {
            return;
        }
        if !self.htlcs_drained() {
            return;
        }
        self.state = PeerState::CloseWaitSig;
        info!("channel cleared, negotiating close fee");
        self.closing.our_fee = commit_fee_sat(self.local.fee_rate, 0);
        self.queue_close_signature();
        self.negotiate_close_fee();
    }

    fn build_close_tx(&self, fee_sat: u64) -> RawTx {
        let anchor = self.anchor.as_ref().expect("anchor set before close");
        let our_script = self
            .closing
            .our_script
            .as_deref()
            .expect("our close script derived");
        let their_script = self
            .closing
            .their_script
            .as_deref()
            .expect("their close script recorded");
        let state = &self
            .local
            .commit
            .as_ref()
            .expect("commitment exists before close")
            .state;
        self.txb.create_close_tx(
            &anchor.txid,
            anchor.output_index,
            anchor.satoshis,
            fee_sat,
            (our_script, state.ours.pay_msat),
            (their_script, state.theirs.pay_msat),
        )
    }

    fn queue_close_signature(&mut self) {
        let fee = self.closing.our_fee;
        let tx = self.build_close_tx(fee);
        let sig = self.signer.sign_mutual_close(&tx);
        info!(fee, "offering close fee");
        self.queue_pkt(Pkt::CloseSignature(CloseSignature {
            close_fee: fee,
            sig,
        }));
        Self::emit(
            &self.event_tx,
            ChannelEvent::CloseFeeProposed {
                ours: fee,
                theirs: self.closing.their_fee,
            },
        );
    }

    pub fn accept_pkt_close_signature(&mut self, c: &CloseSignature) -> Result<(), ChannelError> {
        self.gate(PktKind::CloseSignature)?;
        if c.close_fee == 0 {
            return Err(ChannelError::Malformed("Invalid close fee"));
        }
        if self.closing.their_script.is_none() || self.closing.our_script.is_none() {
            return Err(ChannelError::Malformed("close signature before clearing scripts"));
        }
        let tx = self.build_close_tx(c.close_fee);
        let sig_ok = {
            let anchor = self.anchor.as_ref().expect("anchor set before close");
            let remote = self.remote.as_ref().expect("remote view set in NORMAL");
            self.txb
                .check_commit_sig(&tx, &anchor.witness_script, &remote.commit_key, &c.sig)
        };
        if !sig_ok {
            return Err(ChannelError::BadSignature);
        }
        self.closing.their_fee = Some(c.close_fee);
        self.closing.their_sig = Some(c.sig);
        if self.state == PeerState::CloseWaitSig {
            self.negotiate_close_fee();
        }
        Ok(())
    }

    /// Move our fee towards theirs until they match.
    fn negotiate_close_fee(&mut self) {
        let Some(theirs) = self.closing.their_fee else {
            return;
        };
        if theirs == self.closing.our_fee {
            self.finalize_close();
            return;
        }
        let mut fee = (self.closing.our_fee + theirs) / 2;
        fee &= !1;
        if fee == self.closing.our_fee {
            fee = theirs;
        }
        self.closing.our_fee = fee;
        self.queue_close_signature();
        if fee == theirs {
            self.finalize_close();
        }
    }

    fn finalize_close(&mut self) {
        let close_tx = self.build_close_tx(self.closing.our_fee);
        self.state = PeerState::Closed;
        if let Some(handle) = self.commit_timer.take() {
            self.clock.cancel(handle);
        }
        info!(fee = self.closing.our_fee, "mutual close complete");
        Self::emit(&self.event_tx, ChannelEvent::Closed { close_tx });
    }

    // ========================================
    // Failure paths
    // ========================================

    pub fn accept_pkt_error(&mut self, e: &ErrorPkt) {
        warn!(problem = %e.problem, "peer sent error");
        if let Some(handle) = self.commit_timer.take() {
            self.clock.cancel(handle);
        }
        self.state = PeerState::ErrBreakdown;
        Self::emit(
            &self.event_tx,
            ChannelEvent::Breakdown {
                problem: e.problem.clone(),
            },
        );
    }

    fn breakdown(&mut self, problem: String) {
        error!(%problem, "protocol failure, channel breakdown");
        if let Some(handle) = self.commit_timer.take() {
            self.clock.cancel(handle);
        }
        self.queue_pkt(Pkt::Error(ErrorPkt {
            problem: problem.clone(),
        }));
        self.state = PeerState::ErrBreakdown;
        Self::emit(&self.event_tx, ChannelEvent::Breakdown { problem });
    }

    /// Host-requested shutdown: emit a final `Error`, drop the commitment
    /// chains, keep the revocation ladder for on-chain defense.
    pub fn shutdown(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.breakdown(reason.to_string());
        self.local.commit = None;
        self.local.staging_cstate = None;
        if let Some(remote) = self.remote.as_mut() {
            remote.commit = None;
            remote.staging_cstate = None;
        }
    }

    /// Chain monitor saw a commitment transaction on-chain. The channel is
    /// over; rescue (including punishment via the ladder) is the host's
    /// job.
    pub fn commit_published(&mut self, _tx: &RawTx) {
        if self.state == PeerState::ErrBreakdown {
            return;
        }
        warn!("commitment transaction observed on-chain");
        if let Some(handle) = self.commit_timer.take() {
            self.clock.cancel(handle);
        }
        self.state = PeerState::ErrBreakdown;
        Self::emit(
            &self.event_tx,
            ChannelEvent::Breakdown {
                problem: "commitment published".into(),
            },
        );
    }

    // ========================================
    // Packet dispatch
    // ========================================

    /// Process one inbound packet in receipt order.
    ///
    /// On error the outbound `Error` packet is already queued, the state is
    /// `ErrBreakdown`, and the error is returned for the host's benefit.
    pub fn handle_packet(&mut self, pkt: &Pkt) -> Result<(), ChannelError> {
        debug!(pkt = pkt.kind().name(), state = ?self.state, "processing packet");
        if let Pkt::Error(e) = pkt {
            self.accept_pkt_error(e);
            return Ok(());
        }
        let result = match pkt {
            Pkt::Open(o) => self.accept_pkt_open(o),
            Pkt::OpenAnchor(a) => self.accept_pkt_anchor(a),
            Pkt::OpenCommitSig(s) => self.accept_pkt_open_commit_sig(s),
            Pkt::OpenComplete(_) => self.accept_pkt_open_complete(),
            Pkt::UpdateAddHtlc(u) => self.accept_pkt_htlc_add(u),
            Pkt::UpdateFulfillHtlc(f) => self.accept_pkt_htlc_fulfill(f),
            Pkt::UpdateFailHtlc(f) => self.accept_pkt_htlc_fail(f),
            Pkt::UpdateCommit(c) => self.accept_pkt_commit(c),
            Pkt::UpdateRevocation(r) => self.accept_pkt_revocation(r),
            Pkt::CloseClearing(c) => self.accept_pkt_close_clearing(c),
            Pkt::CloseSignature(c) => self.accept_pkt_close_signature(c),
            Pkt::Error(_) => Ok(()),
        };
        if let Err(err) = &result {
            self.breakdown(err.to_string());
        }
        result
    }

    fn commit_params<'a>(
        &'a self,
        for_side: Side,
        revocation_hash: &'a Hash,
        state: &'a ChannelState,
    ) -> CommitTxParams<'a> {
        let remote = self.remote.as_ref().expect("remote view set after open");
        let anchor = self.anchor.as_ref().expect("anchor set");
        CommitTxParams {
            our_final_key: &self.local.final_key,
            their_final_key: &remote.final_key,
            our_locktime_secs: self.local.locktime_secs,
            their_locktime_secs: remote.locktime_secs,
            anchor_txid: &anchor.txid,
            anchor_index: anchor.output_index,
            anchor_satoshis: anchor.satoshis,
            revocation_hash,
            state,
            for_side,
        }
    }

    // ========================================
    // Persistence
    // ========================================

    /// Capture everything a crash-restart needs. Staging states are not
    /// persisted; they are replayed from the unacked lists on restore.
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            peer_id: self.peer_id,
            state: self.state,
            htlc_id_counter: self.htlc_id_counter,
            their_next_htlc_id: self.their_next_htlc_id,
            anchor: self.anchor.clone(),
            anchor_depth_ok: self.anchor_depth_ok,
            open_complete_sent: self.open_complete_sent,
            open_complete_received: self.open_complete_received,
            closing: self.closing.clone(),
            their_preimages: self.their_preimages.clone(),
            local: SideSnapshot::capture(&self.local),
            remote: self.remote.as_ref().map(SideSnapshot::capture),
        }
    }

    /// Rebuild an engine from a snapshot, replaying unacked changes onto
    /// the committed tips to reconstruct the staging states.
    pub fn restore(
        snap: ChannelSnapshot,
        config: EngineConfig,
        signer: S,
        txb: B,
        clock: C,
    ) -> Result<Self, ChannelError> {
        // Local chain unacked lists carry their changes, remote chain ours.
        let local = snap.local.rebuild(Side::Theirs)?;
        let remote = match snap.remote {
            Some(side) => Some(side.rebuild(Side::Ours)?),
            None => None,
        };
        let mut engine = ChannelEngine {
            peer_id: snap.peer_id,
            config,
            signer,
            txb,
            clock,
            state: snap.state,
            local,
            remote,
            anchor: snap.anchor,
            htlc_id_counter: snap.htlc_id_counter,
            their_next_htlc_id: snap.their_next_htlc_id,
            outpkt: VecDeque::new(),
            commit_timer: None,
            anchor_depth_ok: snap.anchor_depth_ok,
            open_complete_sent: snap.open_complete_sent,
            open_complete_received: snap.open_complete_received,
            closing: snap.closing,
            their_preimages: snap.their_preimages,
            event_tx: None,
        };
        let behind = engine.remote.as_ref().is_some_and(|remote| {
            match (remote.staging_cstate.as_ref(), remote.commit.as_ref()) {
                (Some(staging), Some(tip)) => staging.changes != tip.state.changes,
                _ => false,
            }
        });
        if behind && engine.state.is_live() {
            engine.remote_changes_pending();
        }
        Ok(engine)
    }
}

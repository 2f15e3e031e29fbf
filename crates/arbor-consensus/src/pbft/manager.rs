use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, info, warn};

use arbor_core::config::PbftConfig;
use arbor_core::constants::{
    BLOCK_REBROADCAST_STEP, MAX_LAMBDA_MS, MAX_STEPS, NEXT_VOTES_BROADCAST_STEP,
};
use arbor_core::dpos::DposQuery;
use arbor_core::error::ArborError;
use arbor_core::pbft_block::{PbftBlock, PeriodData};
use arbor_core::types::{
    BlockHash, Hash, Period, Round, Signature, StepId, TxHash, NULL_BLOCK_HASH,
};
use arbor_core::vote::{Vote, VoteType};
use arbor_crypto::{content_hash, keccak256, sortition_weight, vrf_prove, KeyPair};
use arbor_dag::DagBlockManager;
use arbor_pool::{RecentlyFinalized, TransactionPool};
use arbor_storage::DbStorage;

use crate::chain::PbftChain;
use crate::period_queue::PeriodDataQueue;
use crate::pbft::step::Step;
use crate::vote_manager::{vote_sortition_input, TwoTPlusOneVotedBlockType, VoteManager};

/// How the consensus engines reach their peers; implemented by the network
/// layer, stubbed in tests.
pub trait ConsensusOutbound: Send + Sync {
    fn gossip_vote(&self, vote: &Vote);
    fn gossip_pbft_block(&self, block: &PbftBlock);
    fn gossip_votes_bundle(&self, votes: &[Arc<Vote>]);
    fn gossip_dag_block(&self, _block: &arbor_core::dag_block::DagBlock) {}
}

/// Outbound sink that drops everything (single-node and test operation).
pub struct NullOutbound;

impl ConsensusOutbound for NullOutbound {
    fn gossip_vote(&self, _vote: &Vote) {}
    fn gossip_pbft_block(&self, _block: &PbftBlock) {}
    fn gossip_votes_bundle(&self, _votes: &[Arc<Vote>]) {}
}

/// Mutable per-round state of the agreement loop.
struct RoundCtx {
    period: Period,
    round: Round,
    step: Step,
    step_ran: bool,
    round_start: Instant,
    lambda: Duration,
    backoff_multiple: u64,
    own_starting_value: BlockHash,
    /// 2t+1 soft-voted value observed this round.
    soft_voted_block: BlockHash,
    /// What this node last soft-voted, across rounds.
    last_soft_voted_value: BlockHash,
    soft_wait_started: Option<Instant>,
    last_cert_voted_value: BlockHash,
    next_voted_soft_value: bool,
    next_voted_null: bool,
    prev_round_next_voted_value: BlockHash,
    prev_round_next_voted_null: bool,
    /// PBFT block proposed by this node in the current period.
    proposed_block: Option<BlockHash>,
    next_votes_broadcasted: bool,
}

impl RoundCtx {
    fn new(period: Period, lambda: Duration) -> Self {
        Self {
            period,
            round: 1,
            step: Step::Propose,
            step_ran: false,
            round_start: Instant::now(),
            lambda,
            backoff_multiple: 1,
            own_starting_value: NULL_BLOCK_HASH,
            soft_voted_block: NULL_BLOCK_HASH,
            last_soft_voted_value: NULL_BLOCK_HASH,
            soft_wait_started: None,
            last_cert_voted_value: NULL_BLOCK_HASH,
            next_voted_soft_value: false,
            next_voted_null: false,
            prev_round_next_voted_value: NULL_BLOCK_HASH,
            prev_round_next_voted_null: false,
            proposed_block: None,
            next_votes_broadcasted: false,
        }
    }

    fn elapsed(&self) -> Duration {
        self.round_start.elapsed()
    }
}

/// The five-step Byzantine agreement engine.
///
/// Runs as one dedicated blocking thread: each wake-up absorbs synced
/// periods, advances the round if a next-vote supermajority appeared,
/// commits on a cert supermajority, then runs the current step when its
/// window is due and sleeps on a condition variable until the next boundary
/// or an incoming-message nudge.
pub struct PbftManager {
    cfg: PbftConfig,
    keypair: Arc<KeyPair>,
    dpos: Arc<dyn DposQuery>,
    vote_mgr: Arc<VoteManager>,
    chain: Arc<PbftChain>,
    period_queue: Arc<PeriodDataQueue>,
    dag: Arc<DagBlockManager>,
    pool: Arc<TransactionPool>,
    final_chain: Arc<crate::final_chain::FinalChain>,
    recently_finalized: Arc<RecentlyFinalized>,
    outbound: Arc<dyn ConsensusOutbound>,
    storage: Arc<DbStorage>,
    ctx: Mutex<RoundCtx>,
    cv: Condvar,
    cv_guard: Mutex<()>,
    stopped: AtomicBool,
}

const FIELD_ROUND: &str = "pbft_round";
const FIELD_STEP: &str = "pbft_step";
const FIELD_PERIOD: &str = "pbft_period";

impl PbftManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: PbftConfig,
        keypair: Arc<KeyPair>,
        dpos: Arc<dyn DposQuery>,
        vote_mgr: Arc<VoteManager>,
        chain: Arc<PbftChain>,
        period_queue: Arc<PeriodDataQueue>,
        dag: Arc<DagBlockManager>,
        pool: Arc<TransactionPool>,
        final_chain: Arc<crate::final_chain::FinalChain>,
        recently_finalized: Arc<RecentlyFinalized>,
        outbound: Arc<dyn ConsensusOutbound>,
        storage: Arc<DbStorage>,
    ) -> Self {
        let lambda = Duration::from_millis(cfg.lambda_ms_min);
        let period = final_chain.last_period() + 1;
        Self {
            cfg,
            keypair,
            dpos,
            vote_mgr,
            chain,
            period_queue,
            dag,
            pool,
            final_chain,
            recently_finalized,
            outbound,
            storage,
            ctx: Mutex::new(RoundCtx::new(period, lambda)),
            cv: Condvar::new(),
            cv_guard: Mutex::new(()),
            stopped: AtomicBool::new(true),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Restore round/step from storage, then spawn the agreement thread.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.initialize();
        self.stopped.store(false, Ordering::Release);
        let pm = Arc::clone(self);
        std::thread::Builder::new()
            .name("pbft".into())
            .spawn(move || pm.run())
            .expect("spawning the pbft thread cannot fail")
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    /// Wake the loop after new votes/blocks arrived.
    pub fn notify(&self) {
        self.cv.notify_all();
    }

    fn initialize(&self) {
        let mut ctx = self.ctx.lock();
        ctx.period = self.final_chain.last_period() + 1;
        if let Ok(Some(round)) = self.storage.get_manager_field(FIELD_ROUND) {
            if let Ok(Some(period)) = self.storage.get_manager_field(FIELD_PERIOD) {
                if period == ctx.period && round > 1 {
                    ctx.round = round;
                    // Mid-round resume lands in the finishing phases; the
                    // early steps of the stored round already passed.
                    let step = self
                        .storage
                        .get_manager_field(FIELD_STEP)
                        .ok()
                        .flatten()
                        .unwrap_or(1)
                        .max(4);
                    ctx.step = Step::from_id(step);
                    let (value, null) = self
                        .vote_mgr
                        .next_voted_values(ctx.period, ctx.round.saturating_sub(1));
                    ctx.prev_round_next_voted_value = value.unwrap_or(NULL_BLOCK_HASH);
                    ctx.prev_round_next_voted_null = null;
                }
            }
        }
        self.vote_mgr.set_current(ctx.period, ctx.round);
        self.persist_coords(&ctx);
        info!(period = ctx.period, round = ctx.round, step = ctx.step.id(), "agreement engine initialized");
    }

    fn persist_coords(&self, ctx: &RoundCtx) {
        let _ = self.storage.save_manager_field(FIELD_PERIOD, ctx.period);
        let _ = self.storage.save_manager_field(FIELD_ROUND, ctx.round);
        let _ = self.storage.save_manager_field(FIELD_STEP, ctx.step.id());
    }

    pub fn period(&self) -> Period {
        self.ctx.lock().period
    }

    pub fn round(&self) -> Round {
        self.ctx.lock().round
    }

    pub fn step_id(&self) -> StepId {
        self.ctx.lock().step.id()
    }

    fn run(&self) {
        while !self.stopped.load(Ordering::Acquire) {
            self.push_synced_blocks_into_chain();

            let sleep = {
                let mut ctx = self.ctx.lock();
                // Commit strictly before advancing: a cert supermajority
                // must never be lost to a simultaneous next-vote bundle.
                if let Err(e) = self.try_commit(&mut ctx) {
                    if !e.is_recoverable() {
                        warn!(error = %e, "fatal error during commit");
                        break;
                    }
                    debug!(error = %e, "commit attempt failed");
                }
                self.advance_round_if_voted(&mut ctx);
                self.tick(&mut ctx)
            };

            let mut guard = self.cv_guard.lock();
            if !self.stopped.load(Ordering::Acquire) {
                self.cv.wait_for(&mut guard, sleep);
            }
        }
        info!("agreement engine stopped");
    }

    /// Run the current step if its window is due and hand over to the next
    /// one at its boundary. Returns how long the loop may sleep.
    fn tick(&self, ctx: &mut RoundCtx) -> Duration {
        let elapsed = ctx.elapsed();
        let lambda = ctx.lambda;

        match ctx.step {
            Step::Propose => {
                if !ctx.step_ran {
                    self.run_propose(ctx);
                    ctx.step_ran = true;
                }
                if elapsed >= ctx.step.end_offset(lambda) {
                    self.enter_step(ctx, Step::Filter);
                    return Duration::ZERO;
                }
            }
            Step::Filter => {
                if elapsed >= 2 * lambda && !ctx.step_ran {
                    self.run_filter(ctx);
                    ctx.step_ran = true;
                }
                if elapsed >= ctx.step.end_offset(lambda) {
                    self.enter_step(ctx, Step::Certify);
                    return Duration::ZERO;
                }
            }
            Step::Certify => {
                if elapsed >= 2 * lambda {
                    self.run_certify(ctx);
                }
                if elapsed >= ctx.step.end_offset(lambda) {
                    self.enter_step(ctx, Step::Finish(4));
                    return Duration::ZERO;
                }
            }
            Step::Finish(id) => {
                self.run_finish(ctx, id);
                self.enter_step(ctx, Step::Polling(id + 1));
                return Duration::ZERO;
            }
            Step::Polling(id) => {
                self.run_polling(ctx, id);
                if elapsed >= ctx.step.end_offset(lambda) {
                    self.finish_polling(ctx);
                    self.enter_step(ctx, Step::Finish(id + 1));
                    return Duration::ZERO;
                }
            }
        }

        let boundary = ctx.step.end_offset(lambda);
        let until_boundary = boundary.saturating_sub(elapsed);
        until_boundary.min(lambda / 4).max(Duration::from_millis(1))
    }

    fn enter_step(&self, ctx: &mut RoundCtx, step: Step) {
        ctx.step = step;
        ctx.step_ran = false;
        let id = step.id();
        let _ = self.storage.save_manager_field(FIELD_STEP, id);

        // Exponential backoff past the step budget, with a random extra
        // multiplier so stalled validators desynchronize.
        if id > MAX_STEPS && ctx.backoff_multiple < 8 {
            ctx.backoff_multiple *= 2;
            let extra = rand::thread_rng().gen_range(0..=(id - MAX_STEPS));
            let ms = (self.cfg.lambda_ms_min * (ctx.backoff_multiple + extra)).min(MAX_LAMBDA_MS);
            ctx.lambda = Duration::from_millis(ms);
            debug!(step = id, lambda_ms = ms, "step budget exceeded, backing off lambda");
        }
    }

    // ── Step bodies ──────────────────────────────────────────────────────────

    fn run_propose(&self, ctx: &mut RoundCtx) {
        if ctx.round == 1 {
            // Nothing to propose in round 1; consensus reaches round 2 by
            // next-voting null.
            return;
        }

        if self.give_up_next_voted_block(ctx) {
            if ctx.proposed_block.is_none() {
                match self.propose_pbft_block(ctx) {
                    Ok(Some(hash)) => ctx.proposed_block = Some(hash),
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "pbft block proposal failed"),
                }
            }
            if let Some(hash) = ctx.proposed_block {
                ctx.own_starting_value = hash;
                let weight = self.place_vote(ctx, hash, Step::Propose);
                if weight > 0 {
                    info!(block = %hash, round = ctx.round, weight, "proposing own value");
                }
            }
        } else if !ctx.prev_round_next_voted_value.is_zero() {
            ctx.own_starting_value = ctx.prev_round_next_voted_value;
            if let Some(block) = self.unfinalized_block(&ctx.own_starting_value) {
                let weight = self.place_vote(ctx, ctx.own_starting_value, Step::Propose);
                if weight > 0 {
                    info!(
                        block = %ctx.own_starting_value,
                        round = ctx.round,
                        "re-proposing previous round's next-voted value"
                    );
                    self.outbound.gossip_pbft_block(&block);
                }
            } else {
                debug!(block = %ctx.own_starting_value, "next-voted block not yet held");
            }
        }
    }

    fn run_filter(&self, ctx: &mut RoundCtx) {
        if self.give_up_next_voted_block(ctx) {
            let leader = self.identify_leader_block(ctx);
            if !leader.is_zero() {
                ctx.own_starting_value = leader;
                let weight = self.place_vote(ctx, leader, Step::Filter);
                self.update_last_soft_voted_value(ctx, leader);
                if weight > 0 {
                    info!(block = %leader, round = ctx.round, weight, "soft voting leader block");
                }
            }
        } else if !ctx.prev_round_next_voted_value.is_zero() {
            let value = ctx.prev_round_next_voted_value;
            let weight = self.place_vote(ctx, value, Step::Filter);
            self.update_last_soft_voted_value(ctx, value);
            if weight > 0 {
                info!(block = %value, round = ctx.round, "soft voting previous round's value");
            }
        }
    }

    fn run_certify(&self, ctx: &mut RoundCtx) {
        if !ctx.last_cert_voted_value.is_zero() {
            return; // already locked this round
        }
        self.update_soft_voted_block(ctx);
        if ctx.soft_voted_block.is_zero() {
            return;
        }
        if !self.compare_blocks_and_reward_votes(&ctx.soft_voted_block) {
            return;
        }
        let executed = self.chain.last_block_hash() == ctx.soft_voted_block;
        let valid_unverified = self
            .chain
            .get_unverified(&ctx.soft_voted_block)
            .map(|b| self.chain.check_block_validation(&b).is_ok())
            .unwrap_or(false);
        if !executed && !valid_unverified {
            debug!(block = %ctx.soft_voted_block, "soft-voted block not yet verifiable");
            return;
        }

        ctx.last_cert_voted_value = ctx.soft_voted_block;
        let weight = self.place_vote(ctx, ctx.last_cert_voted_value, Step::Certify);
        if weight > 0 {
            info!(block = %ctx.last_cert_voted_value, round = ctx.round, weight, "cert voting");
        }
    }

    fn run_finish(&self, ctx: &mut RoundCtx, step_id: StepId) {
        if !ctx.last_cert_voted_value.is_zero() {
            let value = ctx.last_cert_voted_value;
            let weight = self.place_vote(ctx, value, Step::Finish(step_id));
            if weight > 0 {
                debug!(block = %value, step = step_id, "next voting cert-voted value");
            }
            if step_id % BLOCK_REBROADCAST_STEP == 0 {
                if let Some(block) = self.unfinalized_block(&value) {
                    self.outbound.gossip_pbft_block(&block);
                }
            }
            return;
        }

        let give_up_soft = ctx.own_starting_value == ctx.prev_round_next_voted_value
            && self.give_up_soft_voted_block(ctx)
            && !self.compare_blocks_and_reward_votes(&ctx.own_starting_value);

        if ctx.round >= 2 && (self.give_up_next_voted_block(ctx) || give_up_soft) {
            let weight = self.place_vote(ctx, NULL_BLOCK_HASH, Step::Finish(step_id));
            if weight > 0 {
                debug!(step = step_id, "next voting null");
            }
        } else {
            if ctx.own_starting_value != ctx.prev_round_next_voted_value
                && !ctx.prev_round_next_voted_value.is_zero()
                && !self.chain.find_block_in_chain(&ctx.prev_round_next_voted_value)
                && (ctx.own_starting_value.is_zero()
                    || self.compare_blocks_and_reward_votes(&ctx.prev_round_next_voted_value))
            {
                debug!(
                    from = %ctx.own_starting_value,
                    to = %ctx.prev_round_next_voted_value,
                    "adopting previous round's next-voted value"
                );
                ctx.own_starting_value = ctx.prev_round_next_voted_value;
            }
            let value = ctx.own_starting_value;
            let weight = self.place_vote(ctx, value, Step::Finish(step_id));
            if weight > 0 {
                debug!(block = %value, step = step_id, "next voting own starting value");
            }
            if step_id % BLOCK_REBROADCAST_STEP == 0 {
                if let Some(block) = self.unfinalized_block(&value) {
                    self.outbound.gossip_pbft_block(&block);
                }
            }
        }
    }

    fn run_polling(&self, ctx: &mut RoundCtx, step_id: StepId) {
        self.update_soft_voted_block(ctx);

        if !ctx.soft_voted_block.is_zero() {
            if let Some(bundle) =
                self.vote_mgr
                    .get_votes_bundle(ctx.period, ctx.round, 2, &ctx.soft_voted_block)
            {
                self.outbound.gossip_votes_bundle(&bundle.votes);
            }
        }

        let give_up_soft = ctx.last_cert_voted_value.is_zero()
            && ctx.last_soft_voted_value == ctx.prev_round_next_voted_value
            && self.give_up_soft_voted_block(ctx)
            && !self.compare_blocks_and_reward_votes(&ctx.soft_voted_block);

        if !ctx.next_voted_soft_value && !ctx.soft_voted_block.is_zero() && !give_up_soft {
            let weight = self.place_vote(ctx, ctx.soft_voted_block, Step::Polling(step_id));
            if weight > 0 {
                debug!(block = %ctx.soft_voted_block, step = step_id, "next voting soft value");
                ctx.next_voted_soft_value = true;
            }
        }

        if !ctx.next_voted_null
            && ctx.round >= 2
            && (give_up_soft || self.give_up_next_voted_block(ctx))
        {
            let weight = self.place_vote(ctx, NULL_BLOCK_HASH, Step::Polling(step_id));
            if weight > 0 {
                debug!(step = step_id, "next voting null in polling");
                ctx.next_voted_null = true;
            }
        }

        if step_id > MAX_STEPS
            && (step_id - MAX_STEPS) % NEXT_VOTES_BROADCAST_STEP == 0
            && !ctx.next_votes_broadcasted
        {
            let votes = self
                .vote_mgr
                .get_round_votes(ctx.period, ctx.round.saturating_sub(1));
            if !votes.is_empty() {
                warn!(round = ctx.round, step = step_id, "re-broadcasting previous round next votes");
                self.outbound.gossip_votes_bundle(&votes);
                ctx.next_votes_broadcasted = true;
            }
        }
    }

    fn finish_polling(&self, ctx: &mut RoundCtx) {
        ctx.next_voted_soft_value = false;
        ctx.next_voted_null = false;
        ctx.next_votes_broadcasted = false;
    }

    // ── Round / period transitions ───────────────────────────────────────────

    fn advance_round_if_voted(&self, ctx: &mut RoundCtx) {
        // A next-vote supermajority in any round at or past ours moves us to
        // the round after it.
        if let Some(r) = self
            .vote_mgr
            .round_with_next_votes_bundle(ctx.period, ctx.round.saturating_sub(1))
        {
            if r >= ctx.round {
                self.move_to_round(ctx, r + 1);
            }
        }
    }

    fn move_to_round(&self, ctx: &mut RoundCtx, new_round: Round) {
        debug_assert!(new_round > ctx.round);
        let (value, null) = self.vote_mgr.next_voted_values(ctx.period, new_round - 1);
        ctx.prev_round_next_voted_value = value.unwrap_or(NULL_BLOCK_HASH);
        ctx.prev_round_next_voted_null = null;

        info!(period = ctx.period, round = new_round, "moving to round");
        ctx.round = new_round;
        ctx.step = Step::Propose;
        ctx.step_ran = false;
        ctx.round_start = Instant::now();
        ctx.lambda = Duration::from_millis(self.cfg.lambda_ms_min);
        ctx.backoff_multiple = 1;
        ctx.own_starting_value = NULL_BLOCK_HASH;
        ctx.soft_voted_block = NULL_BLOCK_HASH;
        ctx.soft_wait_started = None;
        ctx.last_cert_voted_value = NULL_BLOCK_HASH;
        ctx.next_voted_soft_value = false;
        ctx.next_voted_null = false;
        ctx.next_votes_broadcasted = false;

        self.vote_mgr.set_current(ctx.period, ctx.round);
        self.vote_mgr
            .cleanup_round(ctx.period, new_round.saturating_sub(1));
        self.persist_coords(ctx);
    }

    fn advance_period(&self, ctx: &mut RoundCtx) {
        ctx.period += 1;
        ctx.round = 1;
        ctx.step = Step::Propose;
        ctx.step_ran = false;
        ctx.round_start = Instant::now();
        ctx.lambda = Duration::from_millis(self.cfg.lambda_ms_min);
        ctx.backoff_multiple = 1;
        ctx.own_starting_value = NULL_BLOCK_HASH;
        ctx.soft_voted_block = NULL_BLOCK_HASH;
        ctx.soft_wait_started = None;
        ctx.last_cert_voted_value = NULL_BLOCK_HASH;
        ctx.next_voted_soft_value = false;
        ctx.next_voted_null = false;
        ctx.prev_round_next_voted_value = NULL_BLOCK_HASH;
        ctx.prev_round_next_voted_null = false;
        ctx.proposed_block = None;
        ctx.next_votes_broadcasted = false;

        self.vote_mgr.set_current(ctx.period, ctx.round);
        self.vote_mgr.cleanup_votes_below_period(ctx.period.saturating_sub(1));
        self.chain.cleanup_unverified(ctx.period.saturating_sub(1));
        self.persist_coords(ctx);
    }

    /// Finalize as soon as any cert-voted value reaches 2t+1, in whatever
    /// round of the current period it happened.
    fn try_commit(&self, ctx: &mut RoundCtx) -> Result<(), ArborError> {
        let Some((round, block_hash, step)) =
            self.vote_mgr.cert_voted_block_in_period(ctx.period)
        else {
            return Ok(());
        };
        if block_hash.is_zero() || self.chain.find_block_in_chain(&block_hash) {
            return Ok(());
        }
        let Some(block) = self.unfinalized_block(&block_hash) else {
            debug!(block = %block_hash, "cert-voted block not yet held, waiting");
            return Ok(());
        };
        let Some(bundle) = self.vote_mgr.get_votes_bundle(ctx.period, round, step, &block_hash)
        else {
            return Ok(());
        };

        info!(period = ctx.period, block = %block_hash, "cert-vote supermajority, finalizing");
        let cert_votes: Vec<Vote> = bundle.votes.iter().map(|v| (**v).clone()).collect();
        self.finalize_block(block, cert_votes)?;

        self.advance_period(ctx);
        Ok(())
    }

    fn finalize_block(&self, block: PbftBlock, cert_votes: Vec<Vote>) -> Result<(), ArborError> {
        let mut period_data = PeriodData::new(block.clone());
        period_data.previous_cert_votes = self
            .vote_mgr
            .get_reward_votes()
            .iter()
            .filter(|v| block.reward_votes.contains(&v.hash))
            .map(|v| (**v).clone())
            .collect();

        if !block.anchor_hash.is_zero() {
            let dag_blocks = self.dag.finalize(&block.anchor_hash)?;
            let mut seen: HashSet<TxHash> = HashSet::new();
            for dag_block in &dag_blocks {
                for tx_hash in &dag_block.transactions {
                    if !seen.insert(*tx_hash) {
                        continue;
                    }
                    // Already finalized in an earlier period: excluded from
                    // the order commitment, so excluded here too.
                    if self.storage.transaction_finalized(tx_hash) {
                        continue;
                    }
                    if let Some(tx) = self.pool.get(tx_hash) {
                        period_data.transactions.push(tx);
                    } else {
                        return Err(ArborError::UnknownAncestor(format!(
                            "finalizing unknown transaction {tx_hash}"
                        )));
                    }
                }
            }
            period_data.dag_blocks = dag_blocks;
        }

        self.final_chain.finalize(&period_data, &cert_votes)?;
        self.chain.push_finalized(block.clone())?;

        let tx_hashes: Vec<TxHash> = period_data.transactions.iter().map(|t| t.hash).collect();
        self.pool.remove_on_commit(&tx_hashes);
        self.recently_finalized.mark_finalized(tx_hashes);

        let votes: Vec<Arc<Vote>> = cert_votes.into_iter().map(Arc::new).collect();
        self.vote_mgr
            .reset_reward_votes(block.period, votes.first().map(|v| v.round).unwrap_or(1), block.hash, votes);
        Ok(())
    }

    /// Drain the sync queue into the chain.
    pub fn push_synced_blocks_into_chain(&self) {
        while self.period_queue.size() > 0 {
            let expected = self.chain.size() + 1;
            let Some((period_data, cert_votes, peer)) = self.period_queue.pop() else {
                return;
            };
            if period_data.period() != expected {
                debug!(
                    period = period_data.period(),
                    expected, "dropping out-of-sequence synced period"
                );
                continue;
            }
            match self.apply_synced_period(period_data, cert_votes) {
                Ok(()) => {
                    let mut ctx = self.ctx.lock();
                    self.advance_period(&mut ctx);
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "synced period rejected");
                    return;
                }
            }
        }
    }

    fn apply_synced_period(
        &self,
        period_data: PeriodData,
        cert_votes: Vec<Vote>,
    ) -> Result<(), ArborError> {
        let block = &period_data.pbft_block;
        self.chain.check_block_validation(block)?;

        // Order commitment must match the carried content.
        let expected_order = if block.anchor_hash.is_zero() {
            NULL_BLOCK_HASH
        } else {
            let dag_order: Vec<BlockHash> = period_data.dag_blocks.iter().map(|b| b.hash).collect();
            if dag_order.last() != Some(&block.anchor_hash) {
                return Err(ArborError::MalformedInput(
                    "anchor is not the last ordered dag block".into(),
                ));
            }
            let tx_order: Vec<TxHash> = period_data.transactions.iter().map(|t| t.hash).collect();
            content_hash(&(&dag_order, &tx_order))
        };
        if expected_order != block.order_hash {
            return Err(ArborError::InvalidProof("order hash mismatch".into()));
        }

        // The carried cert votes must independently reach 2t+1.
        let threshold = self.vote_mgr.two_t_plus_one(block.period)?;
        let mut total = 0u64;
        let mut voters = HashSet::new();
        for vote in &cert_votes {
            let mut v = vote.clone();
            if v.vote_type != VoteType::Cert || v.block_hash != block.hash || v.period != block.period
            {
                return Err(ArborError::MalformedInput("foreign cert vote".into()));
            }
            self.vote_mgr.verify_vote(&mut v)?;
            if voters.insert(v.voter) {
                total += v.weight.unwrap_or(0);
            }
        }
        if total < threshold {
            return Err(ArborError::InvalidProof(format!(
                "cert votes weigh {total}, need {threshold}"
            )));
        }

        self.dag.apply_synced_period(
            (!block.anchor_hash.is_zero()).then_some(block.anchor_hash),
            &period_data.dag_blocks,
        );
        self.final_chain.finalize(&period_data, &cert_votes)?;
        self.chain.push_finalized(block.clone())?;

        let tx_hashes: Vec<TxHash> = period_data.transactions.iter().map(|t| t.hash).collect();
        self.pool.remove_on_commit(&tx_hashes);
        self.recently_finalized.mark_finalized(tx_hashes);

        let votes: Vec<Arc<Vote>> = cert_votes.into_iter().map(Arc::new).collect();
        self.vote_mgr.reset_reward_votes(
            block.period,
            votes.first().map(|v| v.round).unwrap_or(1),
            block.hash,
            votes,
        );
        info!(period = block.period, block = %block.hash, "synced period applied");
        Ok(())
    }

    // ── Gossip entry points (called by the network handlers) ─────────────────

    /// Verify and index a vote arriving from a peer.
    pub fn handle_incoming_vote(&self, mut vote: Vote) -> Result<(), ArborError> {
        self.vote_mgr.verify_vote(&mut vote)?;
        self.vote_mgr.add_verified_vote(vote.clone())?;
        self.storage.save_verified_vote(&vote)?;
        self.notify();
        Ok(())
    }

    /// Stage a proposed PBFT block arriving from a peer.
    pub fn handle_incoming_pbft_block(&self, block: PbftBlock) -> Result<(), ArborError> {
        let proposer = arbor_crypto::recover_address(
            &keccak256(&block.body_bytes()),
            &block.signature,
        )?;
        if proposer != block.proposer {
            return Err(ArborError::InvalidProof("proposer signature mismatch".into()));
        }
        if keccak256(&block.hashed_bytes()) != block.hash {
            return Err(ArborError::MalformedInput("pbft block hash mismatch".into()));
        }
        if block.period <= self.chain.size() {
            return Err(ArborError::StaleEpoch {
                period: block.period,
            });
        }
        if !self.chain.push_unverified(block) {
            return Err(ArborError::Duplicate("pbft block".into()));
        }
        self.notify();
        Ok(())
    }

    /// Queue a synced period from a peer.
    pub fn handle_period_data(
        &self,
        period_data: PeriodData,
        peer: String,
        cert_votes: Vec<Vote>,
    ) -> Result<(), ArborError> {
        let accepted =
            self.period_queue
                .push(period_data, peer, self.chain.size(), cert_votes);
        if !accepted {
            return Err(ArborError::FutureEpoch {
                period: self.period_queue.period() + 1,
            });
        }
        self.notify();
        Ok(())
    }

    // ── Voting internals ─────────────────────────────────────────────────────

    fn generate_vote(&self, ctx: &RoundCtx, block_hash: BlockHash, step: Step) -> Vote {
        let mut vote = Vote {
            hash: Hash::default(),
            period: ctx.period,
            round: ctx.round,
            step: step.id(),
            vote_type: step.vote_type(),
            block_hash,
            vrf: Default::default(),
            signature: Signature::default(),
            voter: self.keypair.address,
            weight: None,
        };
        vote.vrf = vrf_prove(
            &self.keypair,
            &vote_sortition_input(vote.period, vote.round, vote.step),
        );
        vote.signature = self.keypair.sign_hash(&keccak256(&vote.body_bytes()));
        vote.hash = keccak256(&vote.hashed_bytes());
        vote
    }

    /// Generate, weigh, store, index and gossip one own vote. Returns the
    /// weight (zero = lost the lottery, nothing happened).
    fn place_vote(&self, ctx: &RoundCtx, block_hash: BlockHash, step: Step) -> u64 {
        let vote = self.generate_vote(ctx, block_hash, step);
        let stake_period = vote.period.saturating_sub(1);
        let (stake, total) = match (
            self.dpos.stake_at(stake_period, &self.keypair.address),
            self.dpos.total_stake_at(stake_period),
        ) {
            (Ok(s), Ok(t)) => (s, t),
            _ => return 0,
        };
        let threshold = match self
            .vote_mgr
            .sortition_threshold(vote.period, vote.vote_type)
        {
            Ok(t) => t,
            Err(_) => return 0,
        };
        let weight = sortition_weight(&vote.vrf.output, stake, total, threshold);
        if weight == 0 {
            return 0;
        }
        let mut vote = vote;
        vote.weight = Some(weight);

        if let Err(e) = self.storage.save_own_vote(&vote) {
            warn!(error = %e, "failed to persist own vote");
            return 0;
        }
        let _ = self.storage.save_verified_vote(&vote);
        match self.vote_mgr.add_verified_vote(vote.clone()) {
            Ok(_) => {
                self.outbound.gossip_vote(&vote);
                weight
            }
            Err(ArborError::Duplicate(_)) => 0,
            Err(e) => {
                debug!(error = %e, "own vote rejected");
                0
            }
        }
    }

    /// Deterministic leader election over this round's proposal votes: the
    /// minimum of `H(vrf_output ∥ voter ∥ i)` across each vote's weight.
    fn identify_leader_block(&self, ctx: &RoundCtx) -> BlockHash {
        let votes = self.vote_mgr.get_proposal_votes(ctx.period, ctx.round);
        let mut best: Option<(Hash, BlockHash)> = None;
        for vote in votes {
            if vote.round != ctx.round || vote.step != 1 || vote.vote_type != VoteType::Propose {
                continue;
            }
            if vote.block_hash.is_zero() {
                continue;
            }
            if self.chain.find_block_in_chain(&vote.block_hash) {
                continue;
            }
            if vote.block_hash == ctx.last_soft_voted_value && self.give_up_soft_voted_block(ctx) {
                continue;
            }
            let candidate = lowest_voter_index_hash(&vote);
            match &best {
                Some((low, _)) if candidate >= *low => {}
                _ => best = Some((candidate, vote.block_hash)),
            }
        }
        best.map(|(_, block)| block).unwrap_or(NULL_BLOCK_HASH)
    }

    fn update_last_soft_voted_value(&self, ctx: &mut RoundCtx, value: BlockHash) {
        if value != ctx.last_soft_voted_value {
            ctx.soft_wait_started = Some(Instant::now());
        }
        ctx.last_soft_voted_value = value;
    }

    fn update_soft_voted_block(&self, ctx: &mut RoundCtx) {
        if !ctx.soft_voted_block.is_zero() {
            return;
        }
        if let Some((block, _step)) = self.vote_mgr.two_t_plus_one_voted_block(
            ctx.period,
            ctx.round,
            TwoTPlusOneVotedBlockType::SoftVotedBlock,
        ) {
            ctx.soft_voted_block = block;
            if ctx.soft_wait_started.is_none() {
                ctx.soft_wait_started = Some(Instant::now());
            }
        }
    }

    // ── Give-up rules ────────────────────────────────────────────────────────

    fn give_up_soft_voted_block(&self, ctx: &RoundCtx) -> bool {
        if ctx.last_soft_voted_value.is_zero() {
            return false;
        }
        match ctx.soft_wait_started {
            Some(started) => started.elapsed() > 2 * ctx.lambda,
            None => false,
        }
    }

    fn give_up_next_voted_block(&self, ctx: &RoundCtx) -> bool {
        if !ctx.last_cert_voted_value.is_zero() {
            return false;
        }
        if ctx.prev_round_next_voted_value.is_zero() {
            // Round 1 lands here as well.
            return true;
        }
        if ctx.prev_round_next_voted_null {
            return true;
        }
        if self
            .chain
            .find_block_in_chain(&ctx.prev_round_next_voted_value)
        {
            return true;
        }
        if let Some(block) = self.unfinalized_block(&ctx.prev_round_next_voted_value) {
            if self.chain.check_block_validation(&block).is_err() {
                return true;
            }
        }
        false
    }

    fn unfinalized_block(&self, hash: &BlockHash) -> Option<PbftBlock> {
        self.chain.get_unverified(hash)
    }

    /// A proposed block is certifiable once every DAG block it orders is
    /// held, the order commitment matches and its reward votes are known.
    pub fn compare_blocks_and_reward_votes(&self, block_hash: &BlockHash) -> bool {
        let Some(block) = self.unfinalized_block(block_hash) else {
            return false;
        };
        if !self.vote_mgr.has_reward_votes(&block.reward_votes) {
            return false;
        }
        if block.anchor_hash.is_zero() {
            return block.order_hash == NULL_BLOCK_HASH;
        }
        let Some(dag_order) = self.dag.dag_order(&block.anchor_hash) else {
            return false;
        };
        let Some(tx_order) = self.transaction_order(&dag_order) else {
            return false;
        };
        content_hash(&(&dag_order, &tx_order)) == block.order_hash
    }

    /// Deduplicated, not-yet-finalized transaction order under a DAG order.
    fn transaction_order(&self, dag_order: &[BlockHash]) -> Option<Vec<TxHash>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for hash in dag_order {
            let blk = self.dag.get_block(hash)?;
            for tx in blk.transactions {
                if seen.insert(tx) && !self.storage.transaction_finalized(&tx) {
                    out.push(tx);
                }
            }
        }
        Some(out)
    }

    // ── Block proposal ───────────────────────────────────────────────────────

    /// Build and stage a new PBFT block for this period, if this node wins
    /// the proposal lottery. Returns its hash.
    fn propose_pbft_block(&self, ctx: &RoundCtx) -> Result<Option<BlockHash>, ArborError> {
        // Proposal lottery first: no weight, no block.
        let input = vote_sortition_input(ctx.period, ctx.round, 1);
        let vrf = vrf_prove(&self.keypair, &input);
        let stake_period = ctx.period.saturating_sub(1);
        let stake = self.dpos.stake_at(stake_period, &self.keypair.address)?;
        let total = self.dpos.total_stake_at(stake_period)?;
        let threshold = self
            .vote_mgr
            .sortition_threshold(ctx.period, VoteType::Propose)?;
        if sortition_weight(&vrf.output, stake, total, threshold) == 0 {
            return Ok(None);
        }

        let last_block_hash = self.chain.last_block_hash();
        let last_anchor = self.last_period_anchor();

        let ghost = self.dag.ghost_path(&last_anchor);
        if ghost.len() <= 1 {
            return self.generate_pbft_block(ctx, last_block_hash, NULL_BLOCK_HASH, NULL_BLOCK_HASH);
        }

        let mut anchor = if (ghost.len() as u64) <= self.cfg.dag_blocks_size {
            let move_back = self.cfg.ghost_path_move_back as usize;
            let mut idx = if ghost.len() < move_back + 1 {
                0
            } else {
                ghost.len() - 1 - move_back
            };
            while idx < ghost.len() - 1 && ghost[idx] == last_anchor {
                idx += 1;
            }
            ghost[idx]
        } else {
            ghost[self.cfg.dag_blocks_size as usize - 1]
        };

        if anchor == last_anchor || anchor == self.dag.genesis_hash() {
            return self.generate_pbft_block(ctx, last_block_hash, NULL_BLOCK_HASH, NULL_BLOCK_HASH);
        }

        let mut dag_order = self
            .dag
            .dag_order(&anchor)
            .ok_or_else(|| ArborError::UnknownAncestor(format!("anchor {anchor}")))?;

        // Clip the order at the gas cap, dropping whole blocks from the
        // tail, then re-anchor at the closest ordered block still on the
        // ghost path.
        let mut included = 0usize;
        let mut total_gas = 0u64;
        for hash in &dag_order {
            let blk = self
                .dag
                .get_block(hash)
                .ok_or_else(|| ArborError::UnknownAncestor(format!("ordered block {hash}")))?;
            let weight = blk.total_gas_estimation();
            if total_gas + weight > self.cfg.gas_limit {
                break;
            }
            total_gas += weight;
            included += 1;
        }
        if included == 0 {
            return self.generate_pbft_block(ctx, last_block_hash, NULL_BLOCK_HASH, NULL_BLOCK_HASH);
        }
        if included < dag_order.len() {
            let clipped = &dag_order[..included];
            let new_anchor = clipped
                .iter()
                .rev()
                .find(|h| ghost.contains(h))
                .copied()
                .unwrap_or(ghost[1]);
            anchor = new_anchor;
            dag_order = self
                .dag
                .dag_order(&anchor)
                .ok_or_else(|| ArborError::UnknownAncestor(format!("anchor {anchor}")))?;
        }

        let tx_order = self
            .transaction_order(&dag_order)
            .ok_or_else(|| ArborError::UnknownAncestor("ordered dag block missing".into()))?;
        let order_hash = content_hash(&(&dag_order, &tx_order));
        self.generate_pbft_block(ctx, last_block_hash, anchor, order_hash)
    }

    fn generate_pbft_block(
        &self,
        ctx: &RoundCtx,
        prev_hash: BlockHash,
        anchor: BlockHash,
        order_hash: Hash,
    ) -> Result<Option<BlockHash>, ArborError> {
        let mut block = PbftBlock {
            hash: Hash::default(),
            period: ctx.period,
            prev_block_hash: prev_hash,
            anchor_hash: anchor,
            order_hash,
            proposer: self.keypair.address,
            reward_votes: self.vote_mgr.reward_vote_hashes(),
            timestamp: chrono::Utc::now().timestamp(),
            signature: Signature::default(),
        };
        block.signature = self.keypair.sign_hash(&keccak256(&block.body_bytes()));
        block.hash = keccak256(&block.hashed_bytes());

        self.chain.push_unverified(block.clone());
        self.outbound.gossip_pbft_block(&block);
        debug!(block = %block.hash, period = ctx.period, anchor = %anchor, "generated pbft block");
        Ok(Some(block.hash))
    }

    fn last_period_anchor(&self) -> BlockHash {
        let mut hash = self.chain.last_block_hash();
        while !hash.is_zero() {
            let Some(block) = self.chain.get_block_in_chain(&hash) else {
                break;
            };
            if !block.anchor_hash.is_zero() {
                return block.anchor_hash;
            }
            hash = block.prev_block_hash;
        }
        self.dag.genesis_hash()
    }
}

/// Min over `i ∈ [1, weight]` of `H(vrf_output ∥ voter ∥ i)`.
fn lowest_voter_index_hash(vote: &Vote) -> Hash {
    let weight = vote.weight.unwrap_or(1).max(1);
    let mut lowest: Option<Hash> = None;
    for i in 1..=weight {
        let mut bytes = Vec::with_capacity(60);
        bytes.extend_from_slice(vote.vrf.output.as_bytes());
        bytes.extend_from_slice(vote.voter.as_bytes());
        bytes.extend_from_slice(&i.to_be_bytes());
        let h = keccak256(&bytes);
        if lowest.map(|low| h < low).unwrap_or(true) {
            lowest = Some(h);
        }
    }
    lowest.expect("weight is at least one")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::final_chain::{FinalChain, HashFoldExecutor};
    use arbor_core::config::{DagGenesisConfig, VdfConfig};
    use arbor_core::dpos::StakeTable;
    use arbor_core::types::VrfProof;

    struct Harness {
        pm: Arc<PbftManager>,
        final_chain: Arc<FinalChain>,
        dir: std::path::PathBuf,
    }

    fn single_node_harness(lambda_ms: u64) -> Harness {
        let dir = std::env::temp_dir().join(format!("arbor_pbft_{}", rand::random::<u32>()));
        let storage = Arc::new(DbStorage::open(&dir).unwrap());
        let keypair = Arc::new(KeyPair::generate());
        let dpos: Arc<dyn DposQuery> = Arc::new(StakeTable::single(keypair.address, 100));

        let cfg = PbftConfig {
            committee_size: 1,
            number_of_proposers: 1,
            dag_blocks_size: 100,
            ghost_path_move_back: 0,
            lambda_ms_min: lambda_ms,
            gas_limit: 10_000_000,
        };

        let pool = Arc::new(TransactionPool::new(1000));
        let vdf_cfg = VdfConfig {
            difficulty_min: 0,
            difficulty_max: 1,
            difficulty_stale: 2,
            threshold_selection: 0xFFFF,
            threshold_vdf_omit: 0x8000,
            lambda_bound: 16,
        };
        let dag = Arc::new(DagBlockManager::new(
            &DagGenesisConfig::default(),
            vdf_cfg,
            10_000_000,
            1024,
            Arc::clone(&dpos),
            Arc::clone(&pool) as Arc<dyn arbor_dag::TxAvailability>,
        ));
        let vote_mgr = Arc::new(VoteManager::new(1, 1, Arc::clone(&dpos), None));
        let chain = Arc::new(PbftChain::new());
        let final_chain = Arc::new(
            FinalChain::new(Arc::clone(&storage), Arc::new(HashFoldExecutor::new(2)), 100).unwrap(),
        );
        let pm = Arc::new(PbftManager::new(
            cfg,
            keypair,
            dpos,
            vote_mgr,
            chain,
            Arc::new(PeriodDataQueue::new()),
            dag,
            pool,
            Arc::clone(&final_chain),
            Arc::new(RecentlyFinalized::new(100)),
            Arc::new(NullOutbound),
            storage,
        ));
        Harness {
            pm,
            final_chain,
            dir,
        }
    }

    #[test]
    fn single_validator_finalizes_periods() {
        let h = single_node_harness(10);
        let handle = h.pm.start();

        let deadline = Instant::now() + Duration::from_secs(20);
        while h.final_chain.last_period() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        h.pm.stop();
        let _ = handle.join();

        assert!(
            h.final_chain.last_period() >= 2,
            "expected at least two finalized periods, got {}",
            h.final_chain.last_period()
        );
        // chain linkage
        let b1 = h.pm.chain.get_block_by_period(1).unwrap();
        let b2 = h.pm.chain.get_block_by_period(2).unwrap();
        assert_eq!(b2.prev_block_hash, b1.hash);
        assert_eq!(b1.prev_block_hash, NULL_BLOCK_HASH);

        let _ = std::fs::remove_dir_all(&h.dir);
    }

    #[test]
    fn leader_election_picks_min_index_hash() {
        let h = single_node_harness(1000);
        let ctx = RoundCtx::new(1, Duration::from_millis(1000));

        // Three hand-rolled proposal votes with distinct lottery outputs.
        let mut votes = Vec::new();
        for tag in 1u8..=3 {
            let kp = KeyPair::generate();
            let mut vote = Vote {
                hash: Hash::from_bytes([tag; 32]),
                period: 1,
                round: 1,
                step: 1,
                vote_type: VoteType::Propose,
                block_hash: BlockHash::from_bytes([tag * 10; 32]),
                vrf: VrfProof {
                    output: keccak256(&[tag]),
                    proof: vec![tag],
                },
                signature: Signature(vec![0; 65]),
                voter: kp.address,
                weight: Some(2),
            };
            vote.hash = keccak256(&vote.hashed_bytes());
            votes.push(vote);
        }

        let expected = votes
            .iter()
            .min_by_key(|v| lowest_voter_index_hash(v))
            .unwrap()
            .block_hash;

        // Bypass signature verification: seed the index directly.
        for v in &votes {
            h.pm.vote_mgr.add_verified_vote(v.clone()).unwrap();
        }
        let leader = h.pm.identify_leader_block(&ctx);
        assert_eq!(leader, expected);

        let _ = std::fs::remove_dir_all(&h.dir);
    }

    #[test]
    fn null_anchor_block_passes_comparison() {
        let h = single_node_harness(1000);
        let ctx = RoundCtx::new(1, Duration::from_millis(1000));
        let hash = h
            .pm
            .generate_pbft_block(&ctx, NULL_BLOCK_HASH, NULL_BLOCK_HASH, NULL_BLOCK_HASH)
            .unwrap()
            .unwrap();
        assert!(h.pm.compare_blocks_and_reward_votes(&hash));

        let _ = std::fs::remove_dir_all(&h.dir);
    }

    #[test]
    fn round_one_gives_up_and_next_votes_null() {
        let h = single_node_harness(1000);
        let ctx = RoundCtx::new(1, Duration::from_millis(1000));
        assert!(h.pm.give_up_next_voted_block(&ctx));

        let _ = std::fs::remove_dir_all(&h.dir);
    }
}

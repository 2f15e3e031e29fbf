use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use arbor_core::constants::REWARD_VOTE_ROUND_SLACK;
use arbor_core::dpos::DposQuery;
use arbor_core::error::ArborError;
use arbor_core::types::{Address, BlockHash, Hash, Period, Round, StepId, VoteHash};
use arbor_core::vote::{Vote, VoteType};
use arbor_crypto::{content_hash, keccak256, recover_address, sortition_weight, vrf_verify};
use arbor_storage::DbStorage;

/// Which 2t+1 witness set a vote completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TwoTPlusOneVotedBlockType {
    SoftVotedBlock,
    CertVotedBlock,
    NextVotedBlock,
    NextVotedNullBlock,
}

/// A 2t+1 witness set for one `(period, round, step, block)` coordinate.
#[derive(Clone)]
pub struct VotesBundle {
    pub block_hash: BlockHash,
    pub step: StepId,
    pub weight: u64,
    pub votes: Vec<Arc<Vote>>,
}

/// Evidence of a slashable double vote.
#[derive(Clone)]
pub struct DoubleVoteProof {
    pub first: Arc<Vote>,
    pub second: Arc<Vote>,
}

#[derive(Default)]
struct BlockVotes {
    weight: u64,
    votes: HashMap<Address, Arc<Vote>>,
}

#[derive(Default)]
struct StepVotes {
    per_block: HashMap<BlockHash, BlockVotes>,
}

#[derive(Default)]
struct RoundVotes {
    steps: BTreeMap<StepId, StepVotes>,
    /// Voted hashes per (step, voter), for double-vote detection.
    unique_voters: HashMap<(StepId, Address), Vec<BlockHash>>,
    /// First completed witness set per type.
    two_t_plus_one: HashMap<TwoTPlusOneVotedBlockType, (BlockHash, StepId)>,
    /// Highest step where next votes for one value reached t+1; drives the
    /// exponential backoff.
    network_t_plus_one_step: StepId,
}

struct PeriodVotes {
    rounds: RwLock<BTreeMap<Round, Arc<Mutex<RoundVotes>>>>,
}

struct RewardVotes {
    period: Period,
    round: Round,
    block_hash: BlockHash,
    votes: HashMap<VoteHash, Arc<Vote>>,
}

/// Indexes verified votes and aggregates them into 2t+1 witness sets.
///
/// Locking is two-level: a coarse read-write lock over the period map, and
/// one fine lock per (period, round) guarding the actual vote indices.
pub struct VoteManager {
    committee_size: u64,
    number_of_proposers: u64,
    dpos: Arc<dyn DposQuery>,
    storage: Option<Arc<DbStorage>>,
    verified: RwLock<BTreeMap<Period, Arc<PeriodVotes>>>,
    current: Mutex<(Period, Round)>,
    reward: Mutex<Option<RewardVotes>>,
    double_votes: Mutex<Vec<DoubleVoteProof>>,
}

/// Lottery input of a vote: period, round and step (the vote type is implied
/// by the step). The voted block hash is deliberately excluded so the output
/// is one draw per step, not per value.
pub fn vote_sortition_input(period: Period, round: Round, step: StepId) -> Hash {
    content_hash(&(period, round, step))
}

impl VoteManager {
    pub fn new(
        committee_size: u64,
        number_of_proposers: u64,
        dpos: Arc<dyn DposQuery>,
        storage: Option<Arc<DbStorage>>,
    ) -> Self {
        Self {
            committee_size,
            number_of_proposers,
            dpos,
            storage,
            verified: RwLock::new(BTreeMap::new()),
            current: Mutex::new((1, 1)),
            reward: Mutex::new(None),
            double_votes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_current(&self, period: Period, round: Round) {
        *self.current.lock() = (period, round);
    }

    /// Expected total vote weight for a step.
    pub fn sortition_threshold(&self, period: Period, vote_type: VoteType) -> Result<u64, ArborError> {
        let total = self.dpos.total_stake_at(period.saturating_sub(1))?;
        let base = match vote_type {
            VoteType::Propose => self.number_of_proposers,
            _ => self.committee_size,
        };
        Ok(base.min(total.max(1)))
    }

    /// Byzantine supermajority: 2·⌊(n−1)/3⌋ + 1 over the effective count.
    pub fn two_t_plus_one(&self, period: Period) -> Result<u64, ArborError> {
        let n = self.sortition_threshold(period, VoteType::Soft)?;
        Ok(2 * ((n - 1) / 3) + 1)
    }

    /// Full verification of an incoming vote: recovery, integrity, lottery
    /// proof and weight. Fills in `voter` and `weight`.
    pub fn verify_vote(&self, vote: &mut Vote) -> Result<(), ArborError> {
        let voter = recover_address(&keccak256(&vote.body_bytes()), &vote.signature)?;
        vote.voter = voter;

        if keccak256(&vote.hashed_bytes()) != vote.hash {
            return Err(ArborError::MalformedInput("vote hash mismatch".into()));
        }

        let input = vote_sortition_input(vote.period, vote.round, vote.step);
        vrf_verify(&vote.vrf, &input, &voter)?;

        let stake_period = vote.period.saturating_sub(1);
        let stake = self.dpos.stake_at(stake_period, &voter)?;
        let total = self.dpos.total_stake_at(stake_period)?;
        let threshold = self.sortition_threshold(vote.period, vote.vote_type)?;
        let weight = sortition_weight(&vote.vrf.output, stake, total, threshold);
        if weight == 0 {
            return Err(ArborError::InvalidProof(format!(
                "zero-weight vote from {voter}"
            )));
        }
        vote.weight = Some(weight);
        Ok(())
    }

    /// Index a verified vote. Returns the witness set the vote completed, if
    /// any. Double votes are rejected and recorded as slashing evidence.
    pub fn add_verified_vote(
        &self,
        vote: Vote,
    ) -> Result<Option<(TwoTPlusOneVotedBlockType, BlockHash, StepId)>, ArborError> {
        let weight = vote
            .weight
            .ok_or_else(|| ArborError::MalformedInput("unweighted vote".into()))?;
        let vote = Arc::new(vote);

        let (current_period, current_round) = *self.current.lock();
        if vote.period < current_period {
            // Old votes only matter as late reward votes.
            if self.is_valid_reward_vote(&vote) {
                self.add_reward_vote(Arc::clone(&vote));
                return Ok(None);
            }
            return Err(ArborError::StaleEpoch {
                period: vote.period,
            });
        }

        let round_votes = self.round_entry(vote.period, vote.round);
        let mut rv = round_votes.lock();

        // Duplicate-voter detection.
        let voter_key = (vote.step, vote.voter);
        let prior = rv
            .unique_voters
            .get(&voter_key)
            .cloned()
            .unwrap_or_default();
        if prior.contains(&vote.block_hash) {
            return Err(ArborError::Duplicate(format!("vote {}", vote.hash)));
        }
        if !prior.is_empty() {
            // A second value by the same voter at the same coordinate is
            // slashable, except an odd step may legitimately pair one
            // concrete value with one null vote.
            let odd_step_exception = vote.step % 2 == 1
                && prior.len() == 1
                && (prior[0].is_zero() != vote.block_hash.is_zero());
            if !odd_step_exception {
                let first = rv
                    .steps
                    .get(&vote.step)
                    .and_then(|s| s.per_block.get(&prior[0]))
                    .and_then(|b| b.votes.get(&vote.voter))
                    .cloned();
                if let Some(first) = first {
                    warn!(voter = %vote.voter, step = vote.step, "double vote detected");
                    if let Some(storage) = &self.storage {
                        let _ = storage.save_double_vote_proof(&first, &vote);
                    }
                    self.double_votes.lock().push(DoubleVoteProof {
                        first,
                        second: Arc::clone(&vote),
                    });
                }
                return Err(ArborError::Duplicate(format!(
                    "double vote by {}",
                    vote.voter
                )));
            }
        }
        rv.unique_voters
            .entry(voter_key)
            .or_default()
            .push(vote.block_hash);

        let total_weight = {
            let step_votes = rv.steps.entry(vote.step).or_default();
            let block_votes = step_votes.per_block.entry(vote.block_hash).or_default();
            block_votes.votes.insert(vote.voter, Arc::clone(&vote));
            block_votes.weight += weight;
            block_votes.weight
        };

        debug!(vote = %vote, weight, total_weight, "verified vote added");

        let two_t_plus_one = self.two_t_plus_one(vote.period)?;
        let t_plus_one = (two_t_plus_one - 1) / 2 + 1;

        if vote.vote_type == VoteType::Next
            && total_weight >= t_plus_one
            && vote.step > rv.network_t_plus_one_step
        {
            rv.network_t_plus_one_step = vote.step;
        }

        if total_weight < two_t_plus_one {
            return Ok(None);
        }

        let bundle_type = match vote.vote_type {
            VoteType::Propose => return Ok(None),
            VoteType::Soft => TwoTPlusOneVotedBlockType::SoftVotedBlock,
            VoteType::Cert => TwoTPlusOneVotedBlockType::CertVotedBlock,
            VoteType::Next if vote.is_null_vote() => TwoTPlusOneVotedBlockType::NextVotedNullBlock,
            VoteType::Next => TwoTPlusOneVotedBlockType::NextVotedBlock,
        };

        if rv.two_t_plus_one.contains_key(&bundle_type) {
            return Ok(None);
        }
        rv.two_t_plus_one
            .insert(bundle_type, (vote.block_hash, vote.step));

        // Persist the first witness set for the live coordinate. Cert votes
        // are saved with the finalized block instead.
        if bundle_type != TwoTPlusOneVotedBlockType::CertVotedBlock
            && vote.period == current_period
            && vote.round == current_round
        {
            if let Some(storage) = &self.storage {
                let votes: Vec<Vote> = rv
                    .steps
                    .get(&vote.step)
                    .and_then(|s| s.per_block.get(&vote.block_hash))
                    .map(|b| b.votes.values().map(|v| (**v).clone()).collect())
                    .unwrap_or_default();
                storage.replace_two_t_plus_one_votes(bundle_type_tag(bundle_type), &votes)?;
            }
        }

        Ok(Some((bundle_type, vote.block_hash, vote.step)))
    }

    fn round_entry(&self, period: Period, round: Round) -> Arc<Mutex<RoundVotes>> {
        let period_votes = {
            let verified = self.verified.read();
            verified.get(&period).cloned()
        };
        let period_votes = match period_votes {
            Some(p) => p,
            None => {
                let mut verified = self.verified.write();
                Arc::clone(verified.entry(period).or_insert_with(|| {
                    Arc::new(PeriodVotes {
                        rounds: RwLock::new(BTreeMap::new()),
                    })
                }))
            }
        };

        let existing = {
            let rounds = period_votes.rounds.read();
            rounds.get(&round).cloned()
        };
        match existing {
            Some(r) => r,
            None => {
                let mut rounds = period_votes.rounds.write();
                Arc::clone(rounds.entry(round).or_default())
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// All step-1 proposal votes of a round.
    pub fn get_proposal_votes(&self, period: Period, round: Round) -> Vec<Arc<Vote>> {
        let rv = self.round_entry(period, round);
        let rv = rv.lock();
        let mut out = Vec::new();
        if let Some(step) = rv.steps.get(&1) {
            for block in step.per_block.values() {
                out.extend(block.votes.values().cloned());
            }
        }
        out
    }

    /// The witness set at `(period, round, step, block)` once it reached 2t+1.
    pub fn get_votes_bundle(
        &self,
        period: Period,
        round: Round,
        step: StepId,
        block_hash: &BlockHash,
    ) -> Option<VotesBundle> {
        let threshold = self.two_t_plus_one(period).ok()?;
        let rv = self.round_entry(period, round);
        let rv = rv.lock();
        let block = rv.steps.get(&step)?.per_block.get(block_hash)?;
        if block.weight < threshold {
            return None;
        }
        Some(VotesBundle {
            block_hash: *block_hash,
            step,
            weight: block.weight,
            votes: block.votes.values().cloned().collect(),
        })
    }

    pub fn two_t_plus_one_voted_block(
        &self,
        period: Period,
        round: Round,
        bundle_type: TwoTPlusOneVotedBlockType,
    ) -> Option<(BlockHash, StepId)> {
        let rv = self.round_entry(period, round);
        let rv = rv.lock();
        rv.two_t_plus_one.get(&bundle_type).copied()
    }

    /// Any cert-vote supermajority in this period, newest round first. The
    /// commit path scans the whole period so a round advance cannot outrun
    /// a finalization.
    pub fn cert_voted_block_in_period(
        &self,
        period: Period,
    ) -> Option<(Round, BlockHash, StepId)> {
        let period_votes = self.verified.read().get(&period).cloned()?;
        let rounds = period_votes.rounds.read();
        for (round, entry) in rounds.iter().rev() {
            let rv = entry.lock();
            if let Some((hash, step)) = rv
                .two_t_plus_one
                .get(&TwoTPlusOneVotedBlockType::CertVotedBlock)
            {
                return Some((*round, *hash, *step));
            }
        }
        None
    }

    /// Highest round above `round` holding a 2t+1 next-vote bundle; drives
    /// round advancement.
    pub fn round_with_next_votes_bundle(&self, period: Period, round: Round) -> Option<Round> {
        let period_votes = self.verified.read().get(&period).cloned()?;
        let rounds = period_votes.rounds.read();
        for (r, entry) in rounds.iter().rev() {
            if *r <= round {
                break;
            }
            let rv = entry.lock();
            if rv
                .two_t_plus_one
                .contains_key(&TwoTPlusOneVotedBlockType::NextVotedBlock)
                || rv
                    .two_t_plus_one
                    .contains_key(&TwoTPlusOneVotedBlockType::NextVotedNullBlock)
            {
                return Some(*r);
            }
        }
        None
    }

    /// What the given round next-voted with 2t+1, for the round hand-over:
    /// a concrete value, and/or null.
    pub fn next_voted_values(&self, period: Period, round: Round) -> (Option<BlockHash>, bool) {
        let rv = self.round_entry(period, round);
        let rv = rv.lock();
        let concrete = rv
            .two_t_plus_one
            .get(&TwoTPlusOneVotedBlockType::NextVotedBlock)
            .map(|(h, _)| *h);
        let null = rv
            .two_t_plus_one
            .contains_key(&TwoTPlusOneVotedBlockType::NextVotedNullBlock);
        (concrete, null)
    }

    pub fn network_t_plus_one_step(&self, period: Period, round: Round) -> StepId {
        let rv = self.round_entry(period, round);
        let rv = rv.lock();
        rv.network_t_plus_one_step
    }

    /// Every verified vote of a round, for vote-bundle sync replies.
    pub fn get_round_votes(&self, period: Period, round: Round) -> Vec<Arc<Vote>> {
        let rv = self.round_entry(period, round);
        let rv = rv.lock();
        let mut out = Vec::new();
        for step in rv.steps.values() {
            for block in step.per_block.values() {
                out.extend(block.votes.values().cloned());
            }
        }
        out
    }

    // ── Retention ────────────────────────────────────────────────────────────

    /// Drop indexed votes for periods strictly below `period`.
    pub fn cleanup_votes_below_period(&self, period: Period) {
        let mut verified = self.verified.write();
        *verified = verified.split_off(&period);
    }

    /// Drop rounds strictly below `round` within `period`.
    pub fn cleanup_round(&self, period: Period, round: Round) {
        let verified = self.verified.read();
        if let Some(period_votes) = verified.get(&period) {
            let mut rounds = period_votes.rounds.write();
            *rounds = rounds.split_off(&round);
        }
    }

    // ── Reward votes ─────────────────────────────────────────────────────────

    /// Replace the reward-vote set with the cert votes that finalized the
    /// block at `period`.
    pub fn reset_reward_votes(
        &self,
        period: Period,
        round: Round,
        block_hash: BlockHash,
        votes: Vec<Arc<Vote>>,
    ) {
        let mut reward = self.reward.lock();
        *reward = Some(RewardVotes {
            period,
            round,
            block_hash,
            votes: votes.into_iter().map(|v| (v.hash, v)).collect(),
        });
    }

    /// Late cert votes for the just-finalized block stay acceptable for a
    /// bounded number of rounds.
    pub fn is_valid_reward_vote(&self, vote: &Vote) -> bool {
        let reward = self.reward.lock();
        let Some(reward) = reward.as_ref() else {
            return false;
        };
        vote.vote_type == VoteType::Cert
            && vote.block_hash == reward.block_hash
            && vote.period == reward.period
            && vote.round <= reward.round + REWARD_VOTE_ROUND_SLACK
    }

    fn add_reward_vote(&self, vote: Arc<Vote>) {
        let mut reward = self.reward.lock();
        if let Some(reward) = reward.as_mut() {
            reward.votes.entry(vote.hash).or_insert(vote);
        }
    }

    pub fn get_reward_votes(&self) -> Vec<Arc<Vote>> {
        self.reward
            .lock()
            .as_ref()
            .map(|r| r.votes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reward_vote_hashes(&self) -> Vec<VoteHash> {
        let mut hashes: Vec<VoteHash> = self
            .reward
            .lock()
            .as_ref()
            .map(|r| r.votes.keys().copied().collect())
            .unwrap_or_default();
        hashes.sort();
        hashes
    }

    /// Whether every hash is a known reward vote (block verification).
    pub fn has_reward_votes(&self, hashes: &[VoteHash]) -> bool {
        let reward = self.reward.lock();
        match reward.as_ref() {
            Some(r) => hashes.iter().all(|h| r.votes.contains_key(h)),
            None => hashes.is_empty(),
        }
    }

    pub fn double_vote_proofs(&self) -> Vec<DoubleVoteProof> {
        self.double_votes.lock().clone()
    }
}

fn bundle_type_tag(t: TwoTPlusOneVotedBlockType) -> u8 {
    match t {
        TwoTPlusOneVotedBlockType::SoftVotedBlock => 0,
        TwoTPlusOneVotedBlockType::CertVotedBlock => 1,
        TwoTPlusOneVotedBlockType::NextVotedBlock => 2,
        TwoTPlusOneVotedBlockType::NextVotedNullBlock => 3,
    }
}

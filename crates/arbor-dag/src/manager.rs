use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use arbor_core::config::{DagGenesisConfig, VdfConfig};
use arbor_core::constants::MAX_LEVELS_PER_PERIOD;
use arbor_core::dag_block::DagBlock;
use arbor_core::dpos::DposQuery;
use arbor_core::error::ArborError;
use arbor_core::types::{BlockHash, GasAmount, Hash, Level, Period, Signature, TxHash};
use arbor_crypto::{keccak256, recover_address, verify_vdf};

use crate::graph::{Dag, DagFrontier};

/// Where the manager checks that a block's transactions are obtainable.
pub trait TxAvailability: Send + Sync {
    fn all_known(&self, hashes: &[TxHash]) -> bool;
}

impl TxAvailability for arbor_pool::TransactionPool {
    fn all_known(&self, hashes: &[TxHash]) -> bool {
        arbor_pool::TransactionPool::all_known(self, hashes)
    }
}

/// Build the chain's first DAG block from the genesis config.
pub fn genesis_block(cfg: &DagGenesisConfig) -> DagBlock {
    let mut blk = DagBlock {
        hash: BlockHash::default(),
        pivot: cfg.pivot,
        tips: Vec::new(),
        level: cfg.level,
        transactions: Vec::new(),
        gas_estimations: Vec::new(),
        timestamp: cfg.timestamp,
        vdf: Default::default(),
        signature: Signature::default(),
    };
    blk.hash = keccak256(&blk.hashed_bytes());
    blk
}

struct DagState {
    dag: Dag,
    /// Non-finalized blocks plus genesis, by hash.
    blocks: HashMap<BlockHash, DagBlock>,
    /// Level index over the non-finalized region.
    non_finalized: BTreeMap<Level, HashSet<BlockHash>>,
    /// Levels of finalized blocks, kept so late children can still attach.
    finalized_levels: HashMap<BlockHash, Level>,
    /// Root of the current ghost traversal (the last finalized anchor).
    last_anchor: BlockHash,
    max_level: Level,
}

struct Queues {
    /// Verified blocks awaiting admission, lowest level first.
    verified: BTreeMap<Level, VecDeque<DagBlock>>,
    verified_count: usize,
}

/// Validates, queues and admits incoming DAG blocks.
///
/// `push_unverified` runs the stateless checks (signature, sortition proof,
/// gas cap, eligibility) and rejects hard failures forever; the admission
/// worker then attaches blocks lowest level first once their pivot and tips
/// are present, re-queuing the rest. Admission is serialized behind one
/// write lock; queries share a read lock.
pub struct DagBlockManager {
    state: RwLock<DagState>,
    queues: Mutex<Queues>,
    queue_cv: Condvar,
    invalid: Mutex<HashSet<BlockHash>>,
    vdf_cfg: VdfConfig,
    block_gas_limit: GasAmount,
    max_queue_size: usize,
    dpos: Arc<dyn DposQuery>,
    txs: Arc<dyn TxAvailability>,
    genesis: BlockHash,
}

impl DagBlockManager {
    pub fn new(
        genesis_cfg: &DagGenesisConfig,
        vdf_cfg: VdfConfig,
        block_gas_limit: GasAmount,
        max_queue_size: usize,
        dpos: Arc<dyn DposQuery>,
        txs: Arc<dyn TxAvailability>,
    ) -> Self {
        let genesis = genesis_block(genesis_cfg);
        let genesis_hash = genesis.hash;
        let mut blocks = HashMap::new();
        blocks.insert(genesis_hash, genesis);
        Self {
            state: RwLock::new(DagState {
                dag: Dag::new(genesis_hash),
                blocks,
                non_finalized: BTreeMap::new(),
                finalized_levels: HashMap::new(),
                last_anchor: genesis_hash,
                max_level: 0,
            }),
            queues: Mutex::new(Queues {
                verified: BTreeMap::new(),
                verified_count: 0,
            }),
            queue_cv: Condvar::new(),
            invalid: Mutex::new(HashSet::new()),
            vdf_cfg,
            block_gas_limit,
            max_queue_size,
            dpos,
            txs,
            genesis: genesis_hash,
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis
    }

    /// Period a proposal at `level` belongs to.
    pub fn proposal_period(&self, level: Level) -> Period {
        level / MAX_LEVELS_PER_PERIOD
    }

    /// Seed of the sortition lottery for `level`, derived from the chain
    /// identity and the proposal period so every node agrees on it.
    pub fn period_seed(&self, level: Level) -> Hash {
        let period = self.proposal_period(level);
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(self.genesis.as_bytes());
        bytes.extend_from_slice(&period.to_be_bytes());
        keccak256(&bytes)
    }

    /// Stateless verification: signature, sortition binding, declared
    /// difficulty, gas cap and proposer eligibility.
    pub fn verify_block(&self, blk: &DagBlock) -> Result<(), ArborError> {
        if blk.pivot.is_zero() {
            return Err(ArborError::MalformedInput("zero pivot".into()));
        }
        if blk.transactions.len() != blk.gas_estimations.len() {
            return Err(ArborError::MalformedInput(
                "gas estimations do not match transactions".into(),
            ));
        }
        if blk.total_gas_estimation() > self.block_gas_limit {
            return Err(ArborError::InvalidProof(format!(
                "block gas {} above cap {}",
                blk.total_gas_estimation(),
                self.block_gas_limit
            )));
        }

        let proposer = recover_address(&keccak256(&blk.body_bytes()), &blk.signature)?;

        let period = self.proposal_period(blk.level);
        if !self.dpos.is_eligible(period, &proposer)? {
            return Err(ArborError::InvalidProof(format!(
                "proposer {proposer} not eligible at period {period}"
            )));
        }

        if blk.vdf.level != blk.level {
            return Err(ArborError::InvalidProof("sortition level mismatch".into()));
        }
        let seed = self.period_seed(blk.level);
        verify_vdf(&self.vdf_cfg, &blk.vdf, &blk.pivot, &seed, &proposer)?;

        Ok(())
    }

    /// Accept a block from gossip or the local proposer.
    ///
    /// Hard verification failures poison the hash forever; soft conditions
    /// (unknown parents or transactions) leave the block queued for the
    /// admission worker.
    pub fn push_unverified(&self, blk: DagBlock) -> Result<(), ArborError> {
        let hash = blk.hash;

        if self.invalid.lock().contains(&hash) {
            return Err(ArborError::InvalidProof(format!(
                "block {hash} previously rejected"
            )));
        }
        {
            let state = self.state.read();
            if state.blocks.contains_key(&hash) || state.finalized_levels.contains_key(&hash) {
                return Err(ArborError::Duplicate(format!("dag block {hash}")));
            }
        }
        {
            let queues = self.queues.lock();
            if queues.verified_count >= self.max_queue_size {
                return Err(ArborError::QueueFull("dag block queue".into()));
            }
        }

        let expected = keccak256(&blk.hashed_bytes());
        if expected != hash {
            self.invalid.lock().insert(hash);
            return Err(ArborError::MalformedInput("block hash mismatch".into()));
        }

        match self.verify_block(&blk) {
            Ok(()) => {}
            // Eligibility horizon not reached: keep the block queued and let
            // the admission worker pick it up once the chain catches up.
            Err(ArborError::FutureEpoch { .. }) => {}
            Err(e) => {
                self.invalid.lock().insert(hash);
                warn!(block = %hash, error = %e, "dropping invalid dag block");
                return Err(e);
            }
        }

        let mut queues = self.queues.lock();
        queues.verified.entry(blk.level).or_default().push_back(blk);
        queues.verified_count += 1;
        self.queue_cv.notify_all();
        Ok(())
    }

    /// Whether every parent of `blk` is already admitted (or finalized).
    pub fn pivot_and_tips_valid(&self, blk: &DagBlock) -> bool {
        let state = self.state.read();
        blk.parents().all(|p| {
            state.dag.has_vertex(p) || state.finalized_levels.contains_key(p)
        })
    }

    /// Pop the lowest-level verified block, optionally gated to `level_gate`.
    pub fn pop_verified(&self, level_gate: Option<Level>) -> Option<DagBlock> {
        let mut queues = self.queues.lock();
        let level = *queues.verified.keys().next()?;
        if level_gate.is_some_and(|gate| level > gate) {
            return None;
        }
        let bucket = queues.verified.get_mut(&level)?;
        let blk = bucket.pop_front();
        if bucket.is_empty() {
            queues.verified.remove(&level);
        }
        if blk.is_some() {
            queues.verified_count -= 1;
        }
        blk
    }

    /// Attach every queued block whose parents are present, lowest level
    /// first. Returns the admitted blocks in admission order.
    pub fn admit_ready(&self) -> Vec<DagBlock> {
        let mut admitted = Vec::new();
        loop {
            let mut progressed = false;
            let pending: Vec<DagBlock> = {
                let mut queues = self.queues.lock();
                let mut out = Vec::new();
                for (_, bucket) in queues.verified.iter_mut() {
                    out.extend(bucket.drain(..));
                }
                queues.verified.clear();
                queues.verified_count = 0;
                out
            };
            if pending.is_empty() {
                break;
            }

            let mut requeue = Vec::new();
            for blk in pending {
                if !self.pivot_and_tips_valid(&blk) {
                    requeue.push(blk);
                    continue;
                }
                match self.attach(&blk) {
                    Ok(true) => {
                        admitted.push(blk);
                        progressed = true;
                    }
                    Ok(false) => requeue.push(blk),
                    Err(e) => {
                        self.invalid.lock().insert(blk.hash);
                        warn!(block = %blk.hash, error = %e, "dag block failed admission");
                    }
                }
            }

            {
                let mut queues = self.queues.lock();
                for blk in requeue {
                    queues.verified.entry(blk.level).or_default().push_back(blk);
                    queues.verified_count += 1;
                }
            }
            if !progressed {
                break;
            }
        }
        admitted
    }

    /// Worker entry: block until something can be admitted or `stop` is set.
    pub fn wait_and_admit(&self, stop: &AtomicBool, timeout: Duration) -> Vec<DagBlock> {
        loop {
            if stop.load(Ordering::Acquire) {
                return Vec::new();
            }
            let admitted = self.admit_ready();
            if !admitted.is_empty() {
                return admitted;
            }
            let mut queues = self.queues.lock();
            self.queue_cv.wait_for(&mut queues, timeout);
            drop(queues);
            if stop.load(Ordering::Acquire) {
                return Vec::new();
            }
        }
    }

    /// Wake any worker blocked in `wait_and_admit`.
    pub fn notify(&self) {
        self.queue_cv.notify_all();
    }

    fn attach(&self, blk: &DagBlock) -> Result<bool, ArborError> {
        let mut state = self.state.write();

        // Level rule needs every parent level; parents are known by now.
        let mut max_parent_level = 0;
        for p in blk.parents() {
            let level = state
                .blocks
                .get(p)
                .map(|b| b.level)
                .or_else(|| state.finalized_levels.get(p).copied());
            match level {
                Some(l) => max_parent_level = max_parent_level.max(l),
                None => return Ok(false),
            }
        }
        if blk.level != max_parent_level + 1 {
            return Err(ArborError::InvalidProof(format!(
                "level {} != 1 + max parent level {}",
                blk.level, max_parent_level
            )));
        }

        if !self.txs.all_known(&blk.transactions) {
            return Ok(false);
        }

        // A pivot that was finalized away can no longer join the tree.
        if !state.dag.has_vertex(&blk.pivot) {
            debug!(block = %blk.hash, "pivot finalized before admission, discarding");
            return Err(ArborError::StaleEpoch {
                period: self.proposal_period(blk.level),
            });
        }

        let live_tips: Vec<BlockHash> = blk
            .tips
            .iter()
            .filter(|t| state.dag.has_vertex(t))
            .copied()
            .collect();
        if !state.dag.add_vertex(blk.hash, blk.pivot, &live_tips) {
            return Err(ArborError::Duplicate(format!("dag vertex {}", blk.hash)));
        }

        state.blocks.insert(blk.hash, blk.clone());
        state
            .non_finalized
            .entry(blk.level)
            .or_default()
            .insert(blk.hash);
        state.max_level = state.max_level.max(blk.level);
        debug!(block = %blk.hash, level = blk.level, "dag block admitted");
        Ok(true)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get_block(&self, hash: &BlockHash) -> Option<DagBlock> {
        self.state.read().blocks.get(hash).cloned()
    }

    pub fn has_block(&self, hash: &BlockHash) -> bool {
        let state = self.state.read();
        state.blocks.contains_key(hash) || state.finalized_levels.contains_key(hash)
    }

    pub fn max_level(&self) -> Level {
        self.state.read().max_level
    }

    pub fn non_finalized_count(&self) -> usize {
        self.state.read().non_finalized.values().map(|s| s.len()).sum()
    }

    /// Blocks at levels within `[from, to]`, for serving DAG sync requests.
    pub fn blocks_in_level_range(&self, from: Level, to: Level) -> Vec<DagBlock> {
        let state = self.state.read();
        let mut out = Vec::new();
        for (_, hashes) in state.non_finalized.range(from..=to) {
            let mut level_blocks: Vec<&BlockHash> = hashes.iter().collect();
            level_blocks.sort();
            for h in level_blocks {
                if let Some(b) = state.blocks.get(h) {
                    out.push(b.clone());
                }
            }
        }
        out
    }

    /// The frontier a new proposal should extend: ghost pivot plus the other
    /// leaves as tips.
    pub fn frontier(&self) -> DagFrontier {
        let state = self.state.read();
        let ghost = state.dag.ghost_path(&state.last_anchor);
        let pivot = *ghost.last().unwrap_or(&state.last_anchor);
        let tips = state
            .dag
            .leaves()
            .into_iter()
            .filter(|l| *l != pivot)
            .collect();
        DagFrontier { pivot, tips }
    }

    pub fn ghost_path(&self, from: &BlockHash) -> Vec<BlockHash> {
        self.state.read().dag.ghost_path(from)
    }

    /// Ghost path from the last finalized anchor.
    pub fn ghost_path_from_anchor(&self) -> Vec<BlockHash> {
        let state = self.state.read();
        state.dag.ghost_path(&state.last_anchor)
    }

    /// Deterministic order of the non-finalized ancestors of `anchor`.
    pub fn dag_order(&self, anchor: &BlockHash) -> Option<Vec<BlockHash>> {
        let state = self.state.read();
        state.dag.compute_order(anchor, &state.non_finalized)
    }

    /// Level of a live (or genesis) block.
    pub fn block_level(&self, hash: &BlockHash) -> Option<Level> {
        let state = self.state.read();
        state
            .blocks
            .get(hash)
            .map(|b| b.level)
            .or_else(|| state.finalized_levels.get(hash).copied())
    }

    /// Absorb a synced, already-finalized period: its DAG blocks become
    /// finalized history and the anchor (if any) roots the next traversal.
    pub fn apply_synced_period(&self, anchor: Option<BlockHash>, blocks: &[DagBlock]) {
        let mut state = self.state.write();
        let hashes: Vec<BlockHash> = blocks.iter().map(|b| b.hash).collect();
        state.dag.erase(&hashes);
        for blk in blocks {
            state.blocks.remove(&blk.hash);
            state.finalized_levels.insert(blk.hash, blk.level);
            if let Some(set) = state.non_finalized.get_mut(&blk.level) {
                set.remove(&blk.hash);
                if set.is_empty() {
                    state.non_finalized.remove(&blk.level);
                }
            }
            state.max_level = state.max_level.max(blk.level);
        }
        if let Some(anchor) = anchor {
            state.dag.ensure_root(anchor);
            state.last_anchor = anchor;
        }
    }

    /// Finalize the ancestors of `anchor`: returns them in order and erases
    /// them from the in-memory DAG (the anchor stays as the new ghost root).
    pub fn finalize(&self, anchor: &BlockHash) -> Result<Vec<DagBlock>, ArborError> {
        let mut state = self.state.write();
        let order = state
            .dag
            .compute_order(anchor, &state.non_finalized)
            .ok_or_else(|| ArborError::UnknownAncestor(format!("anchor {anchor}")))?;

        let mut blocks = Vec::with_capacity(order.len());
        for h in &order {
            let blk = state
                .blocks
                .get(h)
                .cloned()
                .ok_or_else(|| ArborError::UnknownAncestor(format!("ordered block {h}")))?;
            blocks.push(blk);
        }

        // Erase everything ordered except the anchor, which roots the next
        // ghost traversal; the previous root can go now.
        let erase: Vec<BlockHash> = order.iter().filter(|h| *h != anchor).copied().collect();
        let old_root = state.last_anchor;
        state.dag.erase(&erase);
        if old_root != *anchor {
            state.dag.erase(&[old_root]);
        }

        for blk in &blocks {
            state.blocks.remove(&blk.hash);
            state.finalized_levels.insert(blk.hash, blk.level);
            if let Some(set) = state.non_finalized.get_mut(&blk.level) {
                set.remove(&blk.hash);
                if set.is_empty() {
                    state.non_finalized.remove(&blk.level);
                }
            }
        }
        // Anchor block itself is finalized but must stay addressable as the
        // ghost root; keep its entry in `blocks` until the next anchor.
        if let Some(anchor_blk) = blocks.iter().find(|b| b.hash == *anchor) {
            state.blocks.insert(*anchor, anchor_blk.clone());
        }
        state.last_anchor = *anchor;

        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::dpos::StakeTable;
    use arbor_crypto::{solve_vdf, vrf_prove, KeyPair};

    struct AllKnown;
    impl TxAvailability for AllKnown {
        fn all_known(&self, _hashes: &[TxHash]) -> bool {
            true
        }
    }

    fn test_vdf_cfg() -> VdfConfig {
        VdfConfig {
            difficulty_min: 0,
            difficulty_max: 1,
            difficulty_stale: 2,
            threshold_selection: 0xFFFF,
            threshold_vdf_omit: 0x8000,
            lambda_bound: 16,
        }
    }

    fn manager_with_key() -> (DagBlockManager, KeyPair) {
        let kp = KeyPair::generate();
        let dpos = Arc::new(StakeTable::single(kp.address, 100));
        let mgr = DagBlockManager::new(
            &DagGenesisConfig::default(),
            test_vdf_cfg(),
            10_000_000,
            1024,
            dpos,
            Arc::new(AllKnown),
        );
        (mgr, kp)
    }

    fn make_block(
        mgr: &DagBlockManager,
        kp: &KeyPair,
        pivot: BlockHash,
        tips: Vec<BlockHash>,
        level: Level,
    ) -> DagBlock {
        let seed = mgr.period_seed(level);
        let vrf = vrf_prove(kp, &arbor_crypto::vdf::vdf_input(level, &seed));
        let vdf = solve_vdf(&test_vdf_cfg(), level, vrf, &pivot);
        let mut blk = DagBlock {
            hash: BlockHash::default(),
            pivot,
            tips,
            level,
            transactions: Vec::new(),
            gas_estimations: Vec::new(),
            timestamp: 1_700_000_000,
            vdf,
            signature: Signature::default(),
        };
        blk.signature = kp.sign_hash(&keccak256(&blk.body_bytes()));
        blk.hash = keccak256(&blk.hashed_bytes());
        blk
    }

    #[test]
    fn admits_in_level_order() {
        let (mgr, kp) = manager_with_key();
        let g = mgr.genesis_hash();
        let a = make_block(&mgr, &kp, g, vec![], 1);
        let b = make_block(&mgr, &kp, a.hash, vec![], 2);

        // push child first: it must wait for its parent
        mgr.push_unverified(b.clone()).unwrap();
        assert!(mgr.admit_ready().is_empty());

        mgr.push_unverified(a.clone()).unwrap();
        let admitted = mgr.admit_ready();
        let hashes: Vec<BlockHash> = admitted.iter().map(|b| b.hash).collect();
        assert_eq!(hashes, vec![a.hash, b.hash]);
        assert_eq!(mgr.max_level(), 2);
    }

    #[test]
    fn duplicate_push_rejected() {
        let (mgr, kp) = manager_with_key();
        let g = mgr.genesis_hash();
        let a = make_block(&mgr, &kp, g, vec![], 1);
        mgr.push_unverified(a.clone()).unwrap();
        mgr.admit_ready();
        assert!(matches!(
            mgr.push_unverified(a),
            Err(ArborError::Duplicate(_))
        ));
    }

    #[test]
    fn wrong_level_is_invalid_forever() {
        let (mgr, kp) = manager_with_key();
        let g = mgr.genesis_hash();
        let bad = make_block(&mgr, &kp, g, vec![], 5);
        let bad_hash = bad.hash;
        mgr.push_unverified(bad).unwrap();
        assert!(mgr.admit_ready().is_empty());
        // admission found the level rule violated and poisoned the hash
        assert!(mgr.invalid.lock().contains(&bad_hash));
    }

    #[test]
    fn tampered_signature_rejected_at_push() {
        let (mgr, kp) = manager_with_key();
        let g = mgr.genesis_hash();
        let mut blk = make_block(&mgr, &kp, g, vec![], 1);
        // re-sign with a non-eligible key, keeping the hash consistent
        let outsider = KeyPair::generate();
        blk.signature = outsider.sign_hash(&keccak256(&blk.body_bytes()));
        blk.hash = keccak256(&blk.hashed_bytes());
        assert!(mgr.push_unverified(blk).is_err());
    }

    #[test]
    fn frontier_follows_heaviest_branch() {
        let (mgr, kp) = manager_with_key();
        let g = mgr.genesis_hash();
        let a = make_block(&mgr, &kp, g, vec![], 1);
        mgr.push_unverified(a.clone()).unwrap();
        mgr.admit_ready();

        let f = mgr.frontier();
        assert_eq!(f.pivot, a.hash);
        assert!(f.tips.is_empty());
    }

    #[test]
    fn finalize_erases_ordered_region() {
        let (mgr, kp) = manager_with_key();
        let g = mgr.genesis_hash();
        let a = make_block(&mgr, &kp, g, vec![], 1);
        let b = make_block(&mgr, &kp, a.hash, vec![], 2);
        mgr.push_unverified(a.clone()).unwrap();
        mgr.push_unverified(b.clone()).unwrap();
        mgr.admit_ready();

        let finalized = mgr.finalize(&b.hash).unwrap();
        let hashes: Vec<BlockHash> = finalized.iter().map(|b| b.hash).collect();
        assert_eq!(hashes, vec![a.hash, b.hash]);
        assert_eq!(mgr.non_finalized_count(), 0);
        // the anchor roots the next frontier
        assert_eq!(mgr.frontier().pivot, b.hash);
    }

    #[test]
    fn queue_full_is_backpressure() {
        let kp = KeyPair::generate();
        let dpos = Arc::new(StakeTable::single(kp.address, 100));
        let mgr = DagBlockManager::new(
            &DagGenesisConfig::default(),
            test_vdf_cfg(),
            10_000_000,
            1,
            dpos,
            Arc::new(AllKnown),
        );
        let g = mgr.genesis_hash();
        let a = make_block(&mgr, &kp, g, vec![], 1);
        let b = make_block(&mgr, &kp, a.hash, vec![], 2);
        mgr.push_unverified(b).unwrap();
        assert!(matches!(
            mgr.push_unverified(a),
            Err(ArborError::QueueFull(_))
        ));
    }
}

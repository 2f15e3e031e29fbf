use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use arbor_core::config::{BlockProposerConfig, VdfConfig};
use arbor_core::constants::{MIN_PROPOSAL_DELAY_MS, PROPOSER_MAX_RETRIES};
use arbor_core::dag_block::DagBlock;
use arbor_core::dpos::DposQuery;
use arbor_core::error::ArborError;
use arbor_core::transaction::Transaction;
use arbor_core::types::{GasAmount, Level, Signature, TxHash};
use arbor_crypto::vdf::{draw_difficulty, is_stale_difficulty, solve_vdf, vdf_input};
use arbor_crypto::{keccak256, vrf_prove, KeyPair};
use arbor_pool::TransactionPool;

use crate::manager::DagBlockManager;

#[derive(Default)]
struct ProposeState {
    last_propose_level: Level,
    num_tries: u32,
    last_successful_level: Option<Level>,
}

/// Periodic DAG block proposer.
///
/// Every tick it takes the frontier, checks its own sortition eligibility,
/// solves the delay puzzle and packs its transaction shard into a new block.
/// One proposal per level; stale sortition draws are retried a bounded
/// number of times and then abandoned until the frontier advances.
pub struct BlockProposer {
    cfg: BlockProposerConfig,
    vdf_cfg: VdfConfig,
    block_gas_limit: GasAmount,
    dag: Arc<DagBlockManager>,
    pool: Arc<TransactionPool>,
    dpos: Arc<dyn DposQuery>,
    keypair: Arc<KeyPair>,
    syncing: Arc<AtomicBool>,
    stopped: AtomicBool,
    state: Mutex<ProposeState>,
    proposed_blocks: AtomicU64,
}

impl BlockProposer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: BlockProposerConfig,
        vdf_cfg: VdfConfig,
        block_gas_limit: GasAmount,
        dag: Arc<DagBlockManager>,
        pool: Arc<TransactionPool>,
        dpos: Arc<dyn DposQuery>,
        keypair: Arc<KeyPair>,
        syncing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            vdf_cfg,
            block_gas_limit,
            dag,
            pool,
            dpos,
            keypair,
            syncing,
            stopped: AtomicBool::new(true),
            state: Mutex::new(ProposeState::default()),
            proposed_blocks: AtomicU64::new(0),
        }
    }

    pub fn proposed_blocks(&self) -> u64 {
        self.proposed_blocks.load(Ordering::Relaxed)
    }

    /// Spawn the proposal loop on its own thread.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.stopped.store(false, Ordering::Release);
        info!("block proposer started");
        let proposer = Arc::clone(self);
        std::thread::spawn(move || {
            while !proposer.stopped.load(Ordering::Acquire) {
                if !proposer.syncing.load(Ordering::Acquire) {
                    if let Err(e) = proposer.propose_once() {
                        debug!(error = %e, "proposal attempt failed");
                    }
                }
                std::thread::sleep(Duration::from_millis(MIN_PROPOSAL_DELAY_MS));
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// One proposal attempt. Returns the proposed block, if any.
    pub fn propose_once(&self) -> Result<Option<DagBlock>, ArborError> {
        if self.pool.is_empty() {
            return Ok(None);
        }

        let frontier = self.dag.frontier();
        let mut level = 0;
        for parent in std::iter::once(&frontier.pivot).chain(frontier.tips.iter()) {
            match self.dag.block_level(parent) {
                Some(l) => level = level.max(l),
                None => return Ok(None),
            }
        }
        let propose_level = level + 1;

        let period = self.dag.proposal_period(propose_level);
        if !self.dpos.is_eligible(period, &self.keypair.address)? {
            trace!(level = propose_level, "not an eligible proposer at this level");
            return Ok(None);
        }

        {
            let state = self.state.lock();
            if state.last_successful_level == Some(propose_level) {
                return Ok(None);
            }
        }

        let seed = self.dag.period_seed(propose_level);
        let vrf = vrf_prove(&self.keypair, &vdf_input(propose_level, &seed));
        let difficulty = draw_difficulty(&self.vdf_cfg, &vrf.output);
        if is_stale_difficulty(&self.vdf_cfg, difficulty) {
            let mut state = self.state.lock();
            if propose_level != state.last_propose_level {
                state.last_propose_level = propose_level;
                state.num_tries = 0;
            }
            if state.num_tries < PROPOSER_MAX_RETRIES {
                state.num_tries += 1;
                debug!(
                    level = propose_level,
                    tries = state.num_tries,
                    "stale sortition draw, holding off"
                );
            }
            return Ok(None);
        }

        let vdf = solve_vdf(&self.vdf_cfg, propose_level, vrf, &frontier.pivot);

        // Solving takes real time; a moved frontier invalidates the proof.
        if self.dag.frontier().pivot != frontier.pivot {
            debug!(level = propose_level, "frontier moved while solving, dropping proof");
            return Ok(None);
        }

        let Some((transactions, gas_estimations, packed_hashes)) = self.pack_shard() else {
            return Ok(None);
        };

        let mut blk = DagBlock {
            hash: Default::default(),
            pivot: frontier.pivot,
            tips: frontier.tips,
            level: propose_level,
            transactions,
            gas_estimations,
            timestamp: chrono::Utc::now().timestamp(),
            vdf,
            signature: Signature::default(),
        };
        blk.signature = self.keypair.sign_hash(&keccak256(&blk.body_bytes()));
        blk.hash = keccak256(&blk.hashed_bytes());

        if let Err(e) = self.dag.push_unverified(blk.clone()) {
            self.pool.release(&packed_hashes);
            return Err(e);
        }
        self.dag.notify();

        {
            let mut state = self.state.lock();
            state.last_propose_level = propose_level;
            state.last_successful_level = Some(propose_level);
            state.num_tries = 0;
        }
        self.proposed_blocks.fetch_add(1, Ordering::Relaxed);
        info!(
            block = %blk.hash,
            level = propose_level,
            txs = blk.transactions.len(),
            "proposed dag block"
        );
        Ok(Some(blk))
    }

    /// Reserve pool transactions, keep this proposer's shard, clip the tail
    /// past the gas cap. Returns hashes, estimations and the reserved set.
    fn pack_shard(&self) -> Option<(Vec<TxHash>, Vec<GasAmount>, Vec<TxHash>)> {
        let packed = self.pool.pack(self.cfg.transaction_limit);
        if packed.is_empty() {
            return None;
        }
        let packed_hashes: Vec<TxHash> = packed.iter().map(|t| t.hash).collect();

        let mut keep = Vec::new();
        let mut drop_back = Vec::new();
        for tx in packed {
            if shard_of(&tx, self.cfg.total_shards) == self.cfg.shard % self.cfg.total_shards.max(1)
            {
                keep.push(tx);
            } else {
                drop_back.push(tx.hash);
            }
        }
        self.pool.release(&drop_back);

        if keep.is_empty() {
            trace!("no transactions in this proposer's shard");
            return None;
        }

        // Gas-cap clipping drops the tail of the packed list.
        let mut hashes = Vec::new();
        let mut estimations = Vec::new();
        let mut total: GasAmount = 0;
        let mut clipped = Vec::new();
        for tx in keep {
            let estimate = tx.gas_limit;
            if total + estimate > self.block_gas_limit {
                clipped.push(tx.hash);
                continue;
            }
            total += estimate;
            hashes.push(tx.hash);
            estimations.push(estimate);
        }
        self.pool.release(&clipped);

        if hashes.is_empty() {
            return None;
        }
        Some((hashes, estimations, packed_hashes))
    }
}

fn shard_of(tx: &Transaction, total_shards: u64) -> u64 {
    if total_shards <= 1 {
        return 0;
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&tx.sender.as_bytes()[..8]);
    u64::from_be_bytes(prefix) % total_shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::config::DagGenesisConfig;
    use arbor_core::dpos::StakeTable;
    use arbor_core::types::Address;

    fn never_stale_cfg() -> VdfConfig {
        VdfConfig {
            difficulty_min: 0,
            difficulty_max: 1,
            difficulty_stale: 2,
            threshold_selection: 0xFFFF,
            threshold_vdf_omit: 0x8000,
            lambda_bound: 16,
        }
    }

    fn sample_tx(nonce: u64, id: u8) -> Transaction {
        Transaction {
            hash: TxHash::from_bytes([id; 32]),
            nonce,
            value: 1,
            gas_limit: 21_000,
            gas_price: 1,
            receiver: Some(Address::from_bytes([9; 20])),
            payload: Vec::new(),
            signature: Signature(vec![0; 65]),
            sender: Address::from_bytes([1; 20]),
        }
    }

    fn build_proposer() -> (Arc<BlockProposer>, Arc<DagBlockManager>, Arc<TransactionPool>) {
        let kp = Arc::new(KeyPair::generate());
        let dpos: Arc<dyn DposQuery> = Arc::new(StakeTable::single(kp.address, 100));
        let pool = Arc::new(TransactionPool::new(1000));
        let dag = Arc::new(DagBlockManager::new(
            &DagGenesisConfig::default(),
            never_stale_cfg(),
            10_000_000,
            1024,
            Arc::clone(&dpos),
            Arc::clone(&pool) as Arc<dyn crate::manager::TxAvailability>,
        ));
        let proposer = Arc::new(BlockProposer::new(
            BlockProposerConfig::default(),
            never_stale_cfg(),
            10_000_000,
            Arc::clone(&dag),
            Arc::clone(&pool),
            dpos,
            kp,
            Arc::new(AtomicBool::new(false)),
        ));
        (proposer, dag, pool)
    }

    #[test]
    fn proposes_packed_block_into_manager() {
        let (proposer, dag, pool) = build_proposer();
        pool.insert(sample_tx(0, 1));
        pool.insert(sample_tx(1, 2));

        let blk = proposer.propose_once().unwrap().expect("block proposed");
        assert_eq!(blk.level, 1);
        assert_eq!(blk.transactions.len(), 2);
        assert_eq!(proposer.proposed_blocks(), 1);

        let admitted = dag.admit_ready();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].hash, blk.hash);
    }

    #[test]
    fn one_proposal_per_level() {
        let (proposer, _dag, pool) = build_proposer();
        pool.insert(sample_tx(0, 1));
        assert!(proposer.propose_once().unwrap().is_some());

        pool.insert(sample_tx(1, 2));
        // frontier has not advanced, so the same level is suppressed
        assert!(proposer.propose_once().unwrap().is_none());
    }

    #[test]
    fn empty_pool_skips_proposal() {
        let (proposer, _dag, _pool) = build_proposer();
        assert!(proposer.propose_once().unwrap().is_none());
    }

    #[test]
    fn gas_cap_clips_packed_tail() {
        let kp = Arc::new(KeyPair::generate());
        let dpos: Arc<dyn DposQuery> = Arc::new(StakeTable::single(kp.address, 100));
        let pool = Arc::new(TransactionPool::new(1000));
        let dag = Arc::new(DagBlockManager::new(
            &DagGenesisConfig::default(),
            never_stale_cfg(),
            30_000,
            1024,
            Arc::clone(&dpos),
            Arc::clone(&pool) as Arc<dyn crate::manager::TxAvailability>,
        ));
        let proposer = BlockProposer::new(
            BlockProposerConfig::default(),
            never_stale_cfg(),
            30_000, // fits a single 21k transaction
            dag,
            Arc::clone(&pool),
            dpos,
            kp,
            Arc::new(AtomicBool::new(false)),
        );
        pool.insert(sample_tx(0, 1));
        pool.insert(sample_tx(1, 2));

        let blk = proposer.propose_once().unwrap().expect("block proposed");
        assert_eq!(blk.transactions.len(), 1);
        assert_eq!(blk.total_gas_estimation(), 21_000);
        // the clipped transaction is packable again
        assert_eq!(pool.pack(10).len(), 1);
    }
}

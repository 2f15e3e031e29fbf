use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use arbor_consensus::{
    ConsensusOutbound, FinalChain, HashFoldExecutor, PbftChain, PbftManager, PeriodDataQueue,
    VoteManager,
};
use arbor_core::config::NodeConfig;
use arbor_core::constants::{MAX_POOL_SIZE, RECENTLY_FINALIZED_PERIODS};
use arbor_core::dpos::{DposConfig, DposQuery, StakeTable, ValidatorStake};
use arbor_core::error::ArborError;
use arbor_crypto::KeyPair;
use arbor_dag::{BlockProposer, DagBlockManager, TxAvailability};
use arbor_pool::{RecentlyFinalized, TransactionPool};
use arbor_storage::{apply_migrations, default_migrations, DbStorage};

/// Snapshot cadence in periods.
const SNAPSHOT_EVERY: u64 = 100;

/// Conflict-map stripe exponent used by the stand-in executor.
const EXECUTOR_STRIPES_EXP: u32 = 4;

/// Transaction availability as the engines see it: pending in the pool,
/// already finalized, or freshly finalized and still in the re-gossip cache.
struct NodeTxLookup {
    pool: Arc<TransactionPool>,
    storage: Arc<DbStorage>,
    recently_finalized: Arc<RecentlyFinalized>,
}

impl TxAvailability for NodeTxLookup {
    fn all_known(&self, hashes: &[arbor_core::types::TxHash]) -> bool {
        hashes.iter().all(|h| {
            self.pool.contains(h)
                || self.recently_finalized.contains(h)
                || self.storage.transaction_finalized(h)
        })
    }
}

/// The single owning root of every long-lived subsystem.
///
/// Children hold `Arc`s handed out here; nothing points back up. Dropping
/// the node after `stop()` tears the whole process state down.
pub struct Node {
    pub config: NodeConfig,
    pub storage: Arc<DbStorage>,
    pub pool: Arc<TransactionPool>,
    pub recently_finalized: Arc<RecentlyFinalized>,
    pub dag: Arc<DagBlockManager>,
    pub vote_mgr: Arc<VoteManager>,
    pub chain: Arc<PbftChain>,
    pub period_queue: Arc<PeriodDataQueue>,
    pub final_chain: Arc<FinalChain>,
    pub pbft: Arc<PbftManager>,
    pub proposer: Arc<BlockProposer>,
    pub syncing: Arc<AtomicBool>,
    outbound: Arc<dyn ConsensusOutbound>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open storage, run migrations and wire every subsystem together.
    /// `consensus_key` is the node's lottery/voting identity.
    pub fn build(
        config: NodeConfig,
        data_dir: &Path,
        consensus_key: KeyPair,
        outbound: Arc<dyn ConsensusOutbound>,
    ) -> Result<Self, ArborError> {
        config.validate()?;
        let keypair = Arc::new(consensus_key);

        let storage = Arc::new(DbStorage::open(data_dir)?);
        apply_migrations(&storage, &default_migrations())?;

        // Single-node devnets run without a configured delegation table;
        // the local validator then stakes alone.
        let dpos_cfg = if config.chain_config.dpos.validators.is_empty() {
            DposConfig {
                validators: vec![ValidatorStake {
                    address: keypair.address,
                    stake: 1,
                }],
                eligibility_min: 1,
            }
        } else {
            config.chain_config.dpos.clone()
        };
        let dpos: Arc<dyn DposQuery> = Arc::new(StakeTable::from_config(&dpos_cfg));

        let pool = Arc::new(TransactionPool::new(MAX_POOL_SIZE));
        let recently_finalized = Arc::new(RecentlyFinalized::new(
            RECENTLY_FINALIZED_PERIODS
                * config.chain_config.pbft.committee_size as usize
                * config.test_params.block_proposer.transaction_limit,
        ));

        let tx_lookup = Arc::new(NodeTxLookup {
            pool: Arc::clone(&pool),
            storage: Arc::clone(&storage),
            recently_finalized: Arc::clone(&recently_finalized),
        });

        let dag = Arc::new(DagBlockManager::new(
            &config.chain_config.dag_genesis_block,
            config.chain_config.vdf.clone(),
            config.chain_config.pbft.gas_limit,
            MAX_POOL_SIZE,
            Arc::clone(&dpos),
            tx_lookup as Arc<dyn TxAvailability>,
        ));

        let vote_mgr = Arc::new(VoteManager::new(
            config.chain_config.pbft.committee_size,
            config.chain_config.pbft.number_of_proposers,
            Arc::clone(&dpos),
            Some(Arc::clone(&storage)),
        ));

        let chain = Arc::new(PbftChain::new());
        let period_queue = Arc::new(PeriodDataQueue::new());
        let final_chain = Arc::new(FinalChain::new(
            Arc::clone(&storage),
            Arc::new(HashFoldExecutor::new(EXECUTOR_STRIPES_EXP)),
            SNAPSHOT_EVERY,
        )?);

        // Rebuild the in-memory chain index from storage.
        for period in 1..=final_chain.last_period() {
            if let Some(block) = storage.get_pbft_block_by_period(period)? {
                chain.push_finalized(block)?;
            }
        }

        let syncing = Arc::new(AtomicBool::new(false));

        let pbft = Arc::new(PbftManager::new(
            config.chain_config.pbft.clone(),
            Arc::clone(&keypair),
            Arc::clone(&dpos),
            Arc::clone(&vote_mgr),
            Arc::clone(&chain),
            Arc::clone(&period_queue),
            Arc::clone(&dag),
            Arc::clone(&pool),
            Arc::clone(&final_chain),
            Arc::clone(&recently_finalized),
            Arc::clone(&outbound),
            Arc::clone(&storage),
        ));

        let proposer = Arc::new(BlockProposer::new(
            config.test_params.block_proposer.clone(),
            config.chain_config.vdf.clone(),
            config.chain_config.pbft.gas_limit,
            Arc::clone(&dag),
            Arc::clone(&pool),
            Arc::clone(&dpos),
            Arc::clone(&keypair),
            Arc::clone(&syncing),
        ));

        Ok(Self {
            config,
            storage,
            pool,
            recently_finalized,
            dag,
            vote_mgr,
            chain,
            period_queue,
            final_chain,
            pbft,
            proposer,
            syncing,
            outbound,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        })
    }

    /// Spawn the engine threads: PBFT loop, DAG admission worker and, unless
    /// running as a pure boot node, the block proposer.
    pub fn start(&mut self, propose: bool) {
        info!(genesis = %self.dag.genesis_hash(), "node starting");

        self.threads.push(self.pbft.start());
        if propose {
            self.threads.push(self.proposer.start());
        }

        let dag = Arc::clone(&self.dag);
        let stop = Arc::clone(&self.stop);
        let outbound = Arc::clone(&self.outbound);
        let pbft = Arc::clone(&self.pbft);
        self.threads.push(
            std::thread::Builder::new()
                .name("dag-admit".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let admitted = dag.wait_and_admit(&stop, Duration::from_millis(100));
                        for block in &admitted {
                            outbound.gossip_dag_block(block);
                        }
                        if !admitted.is_empty() {
                            pbft.notify();
                        }
                    }
                })
                .expect("spawning the dag worker cannot fail"),
        );
    }

    /// Signal every engine and join their threads.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.proposer.stop();
        self.pbft.stop();
        self.dag.notify();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        let _ = self.storage.flush();
        info!("node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}

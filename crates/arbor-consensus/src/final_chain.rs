use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use arbor_concur::ConflictDetector;
use arbor_core::dag_block::DagBlock;
use arbor_core::error::ArborError;
use arbor_core::pbft_block::PeriodData;
use arbor_core::transaction::{Receipt, Transaction, TransactionLocation};
use arbor_core::types::{Address, BlockHash, Hash, Period, Timestamp, NULL_BLOCK_HASH};
use arbor_core::vote::Vote;
use arbor_crypto::keccak256;
use arbor_storage::db::FinalChainMeta;
use arbor_storage::migration::tx_count_field;
use arbor_storage::DbStorage;

/// One period's worth of work handed to the execution layer.
pub struct ExecutionBatch<'a> {
    pub period: Period,
    pub anchor: BlockHash,
    pub dag_blocks: &'a [DagBlock],
    pub transactions: &'a [Transaction],
    pub proposer: Address,
    pub timestamp: Timestamp,
}

pub struct ExecutionOutput {
    pub state_root: Hash,
    pub receipts: Vec<Receipt>,
}

/// The external state machine consensus drives. The real node plugs an EVM
/// in here; tests and the default build use [`HashFoldExecutor`].
pub trait StateExecutor: Send + Sync {
    fn execute(&self, batch: &ExecutionBatch) -> Result<ExecutionOutput, ArborError>;
}

/// Deterministic stand-in executor.
///
/// Classifies transactions with the conflict detector (balance-cell writes
/// of sender and receiver), then folds every transaction hash into a running
/// state root. The parallel/serial split does not change the result, only
/// mirrors how a real executor would schedule the batch.
pub struct HashFoldExecutor {
    stripe_exponent: u32,
}

impl HashFoldExecutor {
    pub fn new(stripe_exponent: u32) -> Self {
        Self { stripe_exponent }
    }
}

fn balance_slot() -> Hash {
    keccak256(b"balance")
}

impl StateExecutor for HashFoldExecutor {
    fn execute(&self, batch: &ExecutionBatch) -> Result<ExecutionOutput, ArborError> {
        let detector = ConflictDetector::new(self.stripe_exponent);
        let slot = balance_slot();

        let mut parallel = 0usize;
        for tx in batch.transactions {
            let sender_ok = detector.store(tx.sender, slot, tx.hash);
            let receiver_ok = match tx.receiver {
                Some(receiver) => detector.store(receiver, slot, tx.hash),
                None => true,
            };
            if sender_ok && receiver_ok {
                parallel += 1;
            }
        }
        debug!(
            period = batch.period,
            parallel,
            total = batch.transactions.len(),
            "conflict classification"
        );

        // Per-sender nonces must strictly increase within the batch; a
        // violating transaction burns its gas with a failed receipt.
        let mut last_nonce: std::collections::HashMap<Address, u64> = std::collections::HashMap::new();

        let mut state_root = keccak256(batch.anchor.as_bytes());
        let mut receipts = Vec::with_capacity(batch.transactions.len());
        let mut cumulative = 0u64;
        for tx in batch.transactions {
            let nonce_ok = match last_nonce.get(&tx.sender) {
                Some(prev) => tx.nonce > *prev,
                None => true,
            };
            if nonce_ok {
                last_nonce.insert(tx.sender, tx.nonce);
            }

            let mut bytes = Vec::with_capacity(64);
            bytes.extend_from_slice(state_root.as_bytes());
            bytes.extend_from_slice(tx.hash.as_bytes());
            state_root = keccak256(&bytes);

            cumulative += tx.gas_limit;
            receipts.push(Receipt {
                tx_hash: tx.hash,
                status_ok: nonce_ok,
                gas_used: tx.gas_limit,
                cumulative_gas_used: cumulative,
            });
        }

        Ok(ExecutionOutput {
            state_root,
            receipts,
        })
    }
}

/// Irreversible chain state: executes committed periods and persists every
/// artifact of a period in one atomic batch.
pub struct FinalChain {
    storage: Arc<DbStorage>,
    executor: Arc<dyn StateExecutor>,
    snapshot_every: u64,
    tip: RwLock<Option<FinalChainMeta>>,
}

impl FinalChain {
    pub fn new(
        storage: Arc<DbStorage>,
        executor: Arc<dyn StateExecutor>,
        snapshot_every: u64,
    ) -> Result<Self, ArborError> {
        let tip = storage.get_final_chain_meta()?;
        Ok(Self {
            storage,
            executor,
            snapshot_every: snapshot_every.max(1),
            tip: RwLock::new(tip),
        })
    }

    pub fn last_period(&self) -> Period {
        self.tip.read().as_ref().map(|m| m.period).unwrap_or(0)
    }

    pub fn last_block_hash(&self) -> BlockHash {
        self.tip
            .read()
            .as_ref()
            .map(|m| m.block_hash)
            .unwrap_or(NULL_BLOCK_HASH)
    }

    pub fn last_state_root(&self) -> Hash {
        self.tip
            .read()
            .as_ref()
            .map(|m| m.state_root)
            .unwrap_or_default()
    }

    /// Execute a committed period and write the whole of it atomically:
    /// block, votes, DAG blocks, transactions, receipts, indices and tip.
    pub fn finalize(
        &self,
        period_data: &PeriodData,
        cert_votes: &[Vote],
    ) -> Result<FinalChainMeta, ArborError> {
        let period = period_data.period();
        let block = &period_data.pbft_block;

        let batch_input = ExecutionBatch {
            period,
            anchor: block.anchor_hash,
            dag_blocks: &period_data.dag_blocks,
            transactions: &period_data.transactions,
            proposer: block.proposer,
            timestamp: block.timestamp,
        };
        let output = self.executor.execute(&batch_input)?;

        let mut batch = self.storage.batch();
        batch.put_period_data(period_data)?;
        batch.put_pbft_block_by_period(block)?;
        for dag_block in &period_data.dag_blocks {
            batch.put_dag_block(dag_block)?;
        }
        for (position, tx) in period_data.transactions.iter().enumerate() {
            batch.put_transaction(tx)?;
            batch.put_transaction_location(
                &tx.hash,
                &TransactionLocation {
                    period,
                    position: position as u32,
                },
            )?;
        }
        for receipt in &output.receipts {
            batch.put_receipt(receipt)?;
        }
        let cert_votes: Vec<Vote> = cert_votes.to_vec();
        batch.put_cert_votes(period, &cert_votes)?;
        batch.put_manager_field(&tx_count_field(period), period_data.transactions.len() as u64)?;

        let meta = FinalChainMeta {
            period,
            block_hash: block.hash,
            state_root: output.state_root,
        };
        batch.put_final_chain_meta(&meta)?;
        self.storage.commit_batch(batch)?;

        *self.tip.write() = Some(meta.clone());

        if period % self.snapshot_every == 0 {
            self.storage.flush()?;
            info!(period, "state snapshot flushed");
        }

        Ok(meta)
    }

    pub fn storage(&self) -> &Arc<DbStorage> {
        &self.storage
    }
}

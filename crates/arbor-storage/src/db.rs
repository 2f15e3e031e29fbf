use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use arbor_core::dag_block::DagBlock;
use arbor_core::error::ArborError;
use arbor_core::pbft_block::{PbftBlock, PeriodData};
use arbor_core::transaction::{Receipt, Transaction, TransactionLocation};
use arbor_core::types::{BlockHash, Hash, Period, TxHash};
use arbor_core::vote::Vote;

/// Logical column families.
///
/// All columns share one sled keyspace, with the column tag as a one-byte
/// key prefix, so a whole period commits in a single atomic `sled::Batch`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Column {
    DagBlocks = 0,
    PeriodData = 1,
    Transactions = 2,
    Receipts = 3,
    VerifiedVotes = 4,
    OwnVotes = 5,
    TwoTPlusOneVotes = 6,
    PbftManagerStatus = 7,
    PbftBlockByPeriod = 8,
    PeriodByPbftBlock = 9,
    TransactionLocation = 10,
    FinalChainMeta = 11,
    Migrations = 12,
    DoubleVoteProofs = 13,
}

fn col_key(col: Column, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(col as u8);
    out.extend_from_slice(key);
    out
}

fn enc<T: Serialize>(value: &T) -> Result<Vec<u8>, ArborError> {
    bincode::serialize(value).map_err(|e| ArborError::Serialization(e.to_string()))
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ArborError> {
    bincode::deserialize(bytes).map_err(|e| ArborError::Serialization(e.to_string()))
}

/// Buffered multi-column update, applied atomically.
pub struct DbBatch {
    inner: sled::Batch,
}

impl DbBatch {
    fn put_raw(&mut self, col: Column, key: &[u8], value: Vec<u8>) {
        self.inner.insert(col_key(col, key), value);
    }

    pub fn put<T: Serialize>(&mut self, col: Column, key: &[u8], value: &T) -> Result<(), ArborError> {
        self.put_raw(col, key, enc(value)?);
        Ok(())
    }

    pub fn remove(&mut self, col: Column, key: &[u8]) {
        self.inner.remove(col_key(col, key));
    }

    // ── Typed helpers for the period-commit batch ────────────────────────────

    pub fn put_period_data(&mut self, data: &PeriodData) -> Result<(), ArborError> {
        self.put(Column::PeriodData, &data.period().to_be_bytes(), data)
    }

    pub fn put_dag_block(&mut self, blk: &DagBlock) -> Result<(), ArborError> {
        self.put(Column::DagBlocks, blk.hash.as_bytes(), blk)
    }

    pub fn put_transaction(&mut self, tx: &Transaction) -> Result<(), ArborError> {
        self.put(Column::Transactions, tx.hash.as_bytes(), tx)
    }

    pub fn put_transaction_location(
        &mut self,
        hash: &TxHash,
        loc: &TransactionLocation,
    ) -> Result<(), ArborError> {
        self.put(Column::TransactionLocation, hash.as_bytes(), loc)
    }

    pub fn put_receipt(&mut self, receipt: &Receipt) -> Result<(), ArborError> {
        self.put(Column::Receipts, receipt.tx_hash.as_bytes(), receipt)
    }

    pub fn put_pbft_block_by_period(&mut self, block: &PbftBlock) -> Result<(), ArborError> {
        self.put(Column::PbftBlockByPeriod, &block.period.to_be_bytes(), block)?;
        self.put(
            Column::PeriodByPbftBlock,
            block.hash.as_bytes(),
            &block.period,
        )
    }

    pub fn put_cert_votes(&mut self, period: Period, votes: &[Vote]) -> Result<(), ArborError> {
        let mut key = vec![CERT_VOTES_TAG];
        key.extend_from_slice(&period.to_be_bytes());
        self.put(Column::TwoTPlusOneVotes, &key, &votes.to_vec())
    }

    pub fn put_final_chain_meta(&mut self, meta: &FinalChainMeta) -> Result<(), ArborError> {
        self.put(Column::FinalChainMeta, META_LAST_BLOCK, meta)
    }

    pub fn put_manager_field(&mut self, field: &str, value: u64) -> Result<(), ArborError> {
        self.put(Column::PbftManagerStatus, field.as_bytes(), &value)
    }
}

/// Bundle-type tag reserved for cert votes in the 2t+1 column.
const CERT_VOTES_TAG: u8 = 1;

/// Key of the chain-tip record in the final-chain metadata column.
const META_LAST_BLOCK: &[u8] = b"last_block";

/// Chain-tip record of the final chain.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FinalChainMeta {
    pub period: Period,
    pub block_hash: BlockHash,
    pub state_root: Hash,
}

/// Persistent column store backed by sled.
pub struct DbStorage {
    _db: sled::Db,
    tree: sled::Tree,
}

impl DbStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArborError> {
        let db = sled::open(path).map_err(|e| ArborError::Storage(e.to_string()))?;
        let tree = db
            .open_tree("columns")
            .map_err(|e| ArborError::Storage(e.to_string()))?;
        Ok(Self { _db: db, tree })
    }

    pub fn batch(&self) -> DbBatch {
        DbBatch {
            inner: sled::Batch::default(),
        }
    }

    /// Apply a buffered batch atomically.
    pub fn commit_batch(&self, batch: DbBatch) -> Result<(), ArborError> {
        self.tree
            .apply_batch(batch.inner)
            .map_err(|e| ArborError::Storage(e.to_string()))
    }

    pub fn flush(&self) -> Result<(), ArborError> {
        self.tree
            .flush()
            .map(|_| ())
            .map_err(|e| ArborError::Storage(e.to_string()))
    }

    fn get_raw(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>, ArborError> {
        self.tree
            .get(col_key(col, key))
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(|e| ArborError::Storage(e.to_string()))
    }

    fn put_raw(&self, col: Column, key: &[u8], value: Vec<u8>) -> Result<(), ArborError> {
        self.tree
            .insert(col_key(col, key), value)
            .map(|_| ())
            .map_err(|e| ArborError::Storage(e.to_string()))
    }

    pub fn get<T: DeserializeOwned>(&self, col: Column, key: &[u8]) -> Result<Option<T>, ArborError> {
        match self.get_raw(col, key)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, col: Column, key: &[u8], value: &T) -> Result<(), ArborError> {
        self.put_raw(col, key, enc(value)?)
    }

    /// All `(key, value)` pairs of one column, key prefix stripped.
    pub fn iter_column<T: DeserializeOwned>(
        &self,
        col: Column,
    ) -> Result<Vec<(Vec<u8>, T)>, ArborError> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix([col as u8]) {
            let (key, value) = item.map_err(|e| ArborError::Storage(e.to_string()))?;
            out.push((key[1..].to_vec(), dec(&value)?));
        }
        Ok(out)
    }

    // ── DAG blocks ───────────────────────────────────────────────────────────

    pub fn get_dag_block(&self, hash: &BlockHash) -> Result<Option<DagBlock>, ArborError> {
        self.get(Column::DagBlocks, hash.as_bytes())
    }

    pub fn dag_block_known(&self, hash: &BlockHash) -> bool {
        matches!(self.get_dag_block(hash), Ok(Some(_)))
    }

    // ── Period data / PBFT blocks ────────────────────────────────────────────

    pub fn get_period_data(&self, period: Period) -> Result<Option<PeriodData>, ArborError> {
        self.get(Column::PeriodData, &period.to_be_bytes())
    }

    pub fn get_pbft_block_by_period(&self, period: Period) -> Result<Option<PbftBlock>, ArborError> {
        self.get(Column::PbftBlockByPeriod, &period.to_be_bytes())
    }

    pub fn get_period_by_pbft_block(&self, hash: &BlockHash) -> Result<Option<Period>, ArborError> {
        self.get(Column::PeriodByPbftBlock, hash.as_bytes())
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    pub fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>, ArborError> {
        self.get(Column::Transactions, hash.as_bytes())
    }

    pub fn transaction_finalized(&self, hash: &TxHash) -> bool {
        matches!(
            self.get::<TransactionLocation>(Column::TransactionLocation, hash.as_bytes()),
            Ok(Some(_))
        )
    }

    pub fn get_transaction_location(
        &self,
        hash: &TxHash,
    ) -> Result<Option<TransactionLocation>, ArborError> {
        self.get(Column::TransactionLocation, hash.as_bytes())
    }

    pub fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>, ArborError> {
        self.get(Column::Receipts, hash.as_bytes())
    }

    // ── Votes ────────────────────────────────────────────────────────────────

    pub fn save_verified_vote(&self, vote: &Vote) -> Result<(), ArborError> {
        self.put(Column::VerifiedVotes, vote.hash.as_bytes(), vote)
    }

    pub fn save_own_vote(&self, vote: &Vote) -> Result<(), ArborError> {
        self.put(Column::OwnVotes, vote.hash.as_bytes(), vote)
    }

    pub fn own_votes(&self) -> Result<Vec<Vote>, ArborError> {
        Ok(self
            .iter_column::<Vote>(Column::OwnVotes)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Replace the stored 2t+1 bundle for a bundle-type tag.
    pub fn replace_two_t_plus_one_votes(&self, tag: u8, votes: &[Vote]) -> Result<(), ArborError> {
        self.put(Column::TwoTPlusOneVotes, &[tag], &votes.to_vec())
    }

    pub fn get_two_t_plus_one_votes(&self, tag: u8) -> Result<Vec<Vote>, ArborError> {
        Ok(self
            .get::<Vec<Vote>>(Column::TwoTPlusOneVotes, &[tag])?
            .unwrap_or_default())
    }

    pub fn get_cert_votes(&self, period: Period) -> Result<Vec<Vote>, ArborError> {
        let mut key = vec![CERT_VOTES_TAG];
        key.extend_from_slice(&period.to_be_bytes());
        Ok(self
            .get::<Vec<Vote>>(Column::TwoTPlusOneVotes, &key)?
            .unwrap_or_default())
    }

    /// Persist slashing evidence, keyed by the offending (second) vote.
    pub fn save_double_vote_proof(&self, first: &Vote, second: &Vote) -> Result<(), ArborError> {
        self.put(
            Column::DoubleVoteProofs,
            second.hash.as_bytes(),
            &(first.clone(), second.clone()),
        )
    }

    pub fn double_vote_proofs(&self) -> Result<Vec<(Vote, Vote)>, ArborError> {
        Ok(self
            .iter_column::<(Vote, Vote)>(Column::DoubleVoteProofs)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    // ── PBFT manager status ──────────────────────────────────────────────────

    pub fn save_manager_field(&self, field: &str, value: u64) -> Result<(), ArborError> {
        self.put(Column::PbftManagerStatus, field.as_bytes(), &value)
    }

    pub fn get_manager_field(&self, field: &str) -> Result<Option<u64>, ArborError> {
        self.get(Column::PbftManagerStatus, field.as_bytes())
    }

    // ── Final chain meta ─────────────────────────────────────────────────────

    pub fn get_final_chain_meta(&self) -> Result<Option<FinalChainMeta>, ArborError> {
        self.get(Column::FinalChainMeta, META_LAST_BLOCK)
    }

    // ── Migrations ───────────────────────────────────────────────────────────

    pub fn migration_applied(&self, id: &str) -> Result<bool, ArborError> {
        Ok(self.get::<u32>(Column::Migrations, id.as_bytes())?.is_some())
    }

    pub fn record_migration(&self, id: &str, db_version: u32) -> Result<(), ArborError> {
        self.put(Column::Migrations, id.as_bytes(), &db_version)
    }

    /// Max declared version across applied migrations.
    pub fn db_version(&self) -> Result<u32, ArborError> {
        Ok(self
            .iter_column::<u32>(Column::Migrations)?
            .into_iter()
            .map(|(_, v)| v)
            .max()
            .unwrap_or(0))
    }

}

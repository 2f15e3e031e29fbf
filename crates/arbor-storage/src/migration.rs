use tracing::info;

use arbor_core::error::ArborError;
use arbor_core::pbft_block::PeriodData;
use arbor_core::transaction::TransactionLocation;
use arbor_core::types::Period;

use crate::db::{Column, DbStorage, FinalChainMeta};

/// One idempotent schema/data migration.
///
/// Migrations are identified by a string id, declare the db version they
/// bring the store to, and run inside a single batch. Applied ids are
/// recorded and skipped on later startups.
pub trait Migration: Send + Sync {
    fn id(&self) -> &'static str;
    fn db_version(&self) -> u32;
    fn apply(&self, db: &DbStorage) -> Result<(), ArborError>;
}

/// Run every not-yet-applied migration in declaration order. Engines must
/// not start before this returns.
pub fn apply_migrations(db: &DbStorage, migrations: &[Box<dyn Migration>]) -> Result<(), ArborError> {
    for m in migrations {
        if db.migration_applied(m.id())? {
            continue;
        }
        info!(id = m.id(), version = m.db_version(), "applying migration");
        m.apply(db)?;
        db.record_migration(m.id(), m.db_version())?;
    }
    db.flush()?;
    Ok(())
}

/// The migrations every node runs at startup.
pub fn default_migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(FinalChainMetaRebuild),
        Box::new(TransactionLocationBackfill),
        Box::new(PeriodDataTxCount),
    ]
}

/// Rebuild the final-chain tip record from the per-period block index.
/// Repairs stores written before the tip column existed.
pub struct FinalChainMetaRebuild;

impl Migration for FinalChainMetaRebuild {
    fn id(&self) -> &'static str {
        "final_chain_meta_rebuild"
    }

    fn db_version(&self) -> u32 {
        1
    }

    fn apply(&self, db: &DbStorage) -> Result<(), ArborError> {
        if db.get_final_chain_meta()?.is_some() {
            return Ok(());
        }
        let blocks = db.iter_column::<arbor_core::pbft_block::PbftBlock>(Column::PbftBlockByPeriod)?;
        let Some((_, tip)) = blocks.into_iter().max_by_key(|(_, b)| b.period) else {
            return Ok(());
        };
        let mut batch = db.batch();
        batch.put_final_chain_meta(&FinalChainMeta {
            period: tip.period,
            block_hash: tip.hash,
            state_root: Default::default(),
        })?;
        db.commit_batch(batch)
    }
}

/// Backfill per-transaction locations from stored period data. Early stores
/// only wrote the period data blob.
pub struct TransactionLocationBackfill;

impl Migration for TransactionLocationBackfill {
    fn id(&self) -> &'static str {
        "transaction_location_backfill"
    }

    fn db_version(&self) -> u32 {
        2
    }

    fn apply(&self, db: &DbStorage) -> Result<(), ArborError> {
        let periods = db.iter_column::<PeriodData>(Column::PeriodData)?;
        let mut batch = db.batch();
        for (_, data) in periods {
            let period = data.period();
            for (position, tx) in data.transactions.iter().enumerate() {
                if db.get_transaction_location(&tx.hash)?.is_some() {
                    continue;
                }
                batch.put_transaction_location(
                    &tx.hash,
                    &TransactionLocation {
                        period,
                        position: position as u32,
                    },
                )?;
            }
        }
        db.commit_batch(batch)
    }
}

/// Record per-period transaction counts under the manager-status column so
/// sync responses can size batches without deserializing period data.
pub struct PeriodDataTxCount;

impl Migration for PeriodDataTxCount {
    fn id(&self) -> &'static str {
        "period_data_tx_count"
    }

    fn db_version(&self) -> u32 {
        3
    }

    fn apply(&self, db: &DbStorage) -> Result<(), ArborError> {
        let periods = db.iter_column::<PeriodData>(Column::PeriodData)?;
        let mut batch = db.batch();
        for (_, data) in periods {
            let field = tx_count_field(data.period());
            batch.put_manager_field(&field, data.transactions.len() as u64)?;
        }
        db.commit_batch(batch)
    }
}

pub fn tx_count_field(period: Period) -> String {
    format!("tx_count_{period}")
}

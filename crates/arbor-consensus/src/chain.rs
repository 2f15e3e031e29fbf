use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use arbor_core::error::ArborError;
use arbor_core::pbft_block::PbftBlock;
use arbor_core::types::{BlockHash, Period, NULL_BLOCK_HASH};

struct ChainInner {
    /// Finalized blocks, keyed by period (1-based, contiguous).
    by_period: BTreeMap<Period, PbftBlock>,
    period_by_hash: HashMap<BlockHash, Period>,
    /// Proposed blocks not yet finalized, by hash.
    unverified: HashMap<BlockHash, PbftBlock>,
}

/// Append-only store of finalized PBFT blocks plus a staging area for
/// proposals that have not been certified yet.
pub struct PbftChain {
    inner: RwLock<ChainInner>,
}

impl PbftChain {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ChainInner {
                by_period: BTreeMap::new(),
                period_by_hash: HashMap::new(),
                unverified: HashMap::new(),
            }),
        }
    }

    /// Number of finalized blocks; also the latest finalized period.
    pub fn size(&self) -> Period {
        self.inner.read().by_period.len() as Period
    }

    pub fn last_block_hash(&self) -> BlockHash {
        let inner = self.inner.read();
        inner
            .by_period
            .values()
            .next_back()
            .map(|b| b.hash)
            .unwrap_or(NULL_BLOCK_HASH)
    }

    pub fn last_block(&self) -> Option<PbftBlock> {
        self.inner.read().by_period.values().next_back().cloned()
    }

    pub fn get_block_by_period(&self, period: Period) -> Option<PbftBlock> {
        self.inner.read().by_period.get(&period).cloned()
    }

    pub fn find_block_in_chain(&self, hash: &BlockHash) -> bool {
        self.inner.read().period_by_hash.contains_key(hash)
    }

    pub fn get_block_in_chain(&self, hash: &BlockHash) -> Option<PbftBlock> {
        let inner = self.inner.read();
        let period = inner.period_by_hash.get(hash)?;
        inner.by_period.get(period).cloned()
    }

    /// A proposal is pushable into the chain when it extends the tip exactly.
    pub fn check_block_validation(&self, block: &PbftBlock) -> Result<(), ArborError> {
        let expected_period = self.size() + 1;
        if block.period != expected_period {
            if block.period <= self.size() {
                return Err(ArborError::StaleEpoch {
                    period: block.period,
                });
            }
            return Err(ArborError::FutureEpoch {
                period: block.period,
            });
        }
        let expected_prev = self.last_block_hash();
        if block.prev_block_hash != expected_prev {
            return Err(ArborError::MalformedInput(format!(
                "previous hash {} does not extend chain tip {}",
                block.prev_block_hash, expected_prev
            )));
        }
        Ok(())
    }

    /// Append a certified block. The caller has already validated it.
    pub fn push_finalized(&self, block: PbftBlock) -> Result<(), ArborError> {
        self.check_block_validation(&block)?;
        let mut inner = self.inner.write();
        inner.unverified.remove(&block.hash);
        inner.period_by_hash.insert(block.hash, block.period);
        debug!(period = block.period, block = %block.hash, "pbft block finalized");
        inner.by_period.insert(block.period, block);
        Ok(())
    }

    // ── Unverified proposals ─────────────────────────────────────────────────

    pub fn push_unverified(&self, block: PbftBlock) -> bool {
        let mut inner = self.inner.write();
        if inner.period_by_hash.contains_key(&block.hash)
            || inner.unverified.contains_key(&block.hash)
        {
            return false;
        }
        inner.unverified.insert(block.hash, block);
        true
    }

    pub fn get_unverified(&self, hash: &BlockHash) -> Option<PbftBlock> {
        self.inner.read().unverified.get(hash).cloned()
    }

    /// Drop proposals at or below `period`; they can never finalize now.
    pub fn cleanup_unverified(&self, period: Period) {
        let mut inner = self.inner.write();
        inner.unverified.retain(|_, b| b.period > period);
    }
}

impl Default for PbftChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::types::{Address, Hash, Signature};

    fn block(period: Period, prev: BlockHash, tag: u8) -> PbftBlock {
        PbftBlock {
            hash: BlockHash::from_bytes([tag; 32]),
            period,
            prev_block_hash: prev,
            anchor_hash: NULL_BLOCK_HASH,
            order_hash: Hash::default(),
            proposer: Address::from_bytes([1; 20]),
            reward_votes: Vec::new(),
            timestamp: 0,
            signature: Signature(vec![0; 65]),
        }
    }

    #[test]
    fn chain_links_periods() {
        let chain = PbftChain::new();
        assert_eq!(chain.size(), 0);
        assert_eq!(chain.last_block_hash(), NULL_BLOCK_HASH);

        let b1 = block(1, NULL_BLOCK_HASH, 1);
        chain.push_finalized(b1.clone()).unwrap();
        let b2 = block(2, b1.hash, 2);
        chain.push_finalized(b2.clone()).unwrap();

        assert_eq!(chain.size(), 2);
        assert_eq!(chain.last_block_hash(), b2.hash);
        assert!(chain.find_block_in_chain(&b1.hash));
        assert_eq!(chain.get_block_by_period(1).unwrap().hash, b1.hash);
    }

    #[test]
    fn rejects_period_gaps_and_stale_blocks() {
        let chain = PbftChain::new();
        let b1 = block(1, NULL_BLOCK_HASH, 1);
        chain.push_finalized(b1.clone()).unwrap();

        assert!(matches!(
            chain.push_finalized(block(3, b1.hash, 3)),
            Err(ArborError::FutureEpoch { period: 3 })
        ));
        assert!(matches!(
            chain.push_finalized(block(1, NULL_BLOCK_HASH, 4)),
            Err(ArborError::StaleEpoch { period: 1 })
        ));
    }

    #[test]
    fn rejects_wrong_previous_hash() {
        let chain = PbftChain::new();
        let b1 = block(1, NULL_BLOCK_HASH, 1);
        chain.push_finalized(b1).unwrap();
        let wrong = block(2, BlockHash::from_bytes([9; 32]), 2);
        assert!(matches!(
            chain.push_finalized(wrong),
            Err(ArborError::MalformedInput(_))
        ));
    }

    #[test]
    fn unverified_staging_deduplicates() {
        let chain = PbftChain::new();
        let b = block(1, NULL_BLOCK_HASH, 1);
        assert!(chain.push_unverified(b.clone()));
        assert!(!chain.push_unverified(b.clone()));
        assert_eq!(chain.get_unverified(&b.hash).unwrap().period, 1);

        chain.push_finalized(b.clone()).unwrap();
        // finalization consumed the staged copy
        assert!(chain.get_unverified(&b.hash).is_none());
        assert!(!chain.push_unverified(b));
    }
}

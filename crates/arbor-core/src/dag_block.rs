use serde::{Deserialize, Serialize};

use crate::types::{BlockHash, GasAmount, Hash, Level, Signature, Timestamp, TxHash, VrfProof};

/// Verifiable-delay puzzle attached to every DAG block proposal.
///
/// The VRF half binds the proposer to the lottery input `(level, period
/// seed)`; the delay half is a sequential Keccak chain over the VRF output
/// and the pivot hash, with evenly spaced checkpoints so verification only
/// re-walks a sampled segment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VdfSortition {
    /// Level the puzzle was solved for.
    pub level: Level,
    /// Lottery output + proof over `(level, period_seed)`.
    pub vrf: VrfProof,
    /// Difficulty drawn from the VRF output (0 = delay omitted).
    pub difficulty: u16,
    /// Final state of the hash chain.
    pub solution: Hash,
    /// Evenly spaced intermediate states, oldest first.
    pub checkpoints: Vec<Hash>,
}

/// A block proposal in the DAG.
///
/// The pivot is mandatory and non-zero for everything but genesis; tips are
/// additional parents. A DAG block is immutable once admitted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DagBlock {
    /// Derived identifier (Keccak of body + signature).
    pub hash: BlockHash,

    /// Heaviest-chain parent.
    pub pivot: BlockHash,

    /// Additional parents, ordered as proposed.
    pub tips: Vec<BlockHash>,

    /// 1 + max(level(pivot), levels(tips)).
    pub level: Level,

    /// Packed transactions, in execution order.
    pub transactions: Vec<TxHash>,

    /// Per-transaction gas estimate, parallel to `transactions`.
    pub gas_estimations: Vec<GasAmount>,

    /// Proposal wall-clock time (UTC seconds).
    pub timestamp: Timestamp,

    /// Delay-function proof gating this proposal.
    pub vdf: VdfSortition,

    /// Proposer signature over the body bytes.
    pub signature: Signature,
}

/// Signed portion of a DAG block (everything except `hash` and `signature`).
#[derive(Serialize)]
pub struct DagBlockBody<'a> {
    pub pivot: &'a BlockHash,
    pub tips: &'a Vec<BlockHash>,
    pub level: Level,
    pub transactions: &'a Vec<TxHash>,
    pub gas_estimations: &'a Vec<GasAmount>,
    pub timestamp: Timestamp,
    pub vdf: &'a VdfSortition,
}

impl DagBlock {
    pub fn body(&self) -> DagBlockBody<'_> {
        DagBlockBody {
            pivot: &self.pivot,
            tips: &self.tips,
            level: self.level,
            transactions: &self.transactions,
            gas_estimations: &self.gas_estimations,
            timestamp: self.timestamp,
            vdf: &self.vdf,
        }
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        bincode::serialize(&self.body()).expect("body serialization is infallible")
    }

    pub fn hashed_bytes(&self) -> Vec<u8> {
        let mut bytes = self.body_bytes();
        bytes.extend_from_slice(self.signature.as_bytes());
        bytes
    }

    /// All parents: pivot first, then tips.
    pub fn parents(&self) -> impl Iterator<Item = &BlockHash> {
        std::iter::once(&self.pivot).chain(self.tips.iter())
    }

    /// Sum of the per-transaction gas estimations.
    pub fn total_gas_estimation(&self) -> GasAmount {
        self.gas_estimations.iter().sum()
    }

    pub fn is_genesis(&self) -> bool {
        self.pivot.is_zero() && self.level == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> DagBlock {
        DagBlock {
            hash: BlockHash::from_bytes([5; 32]),
            pivot: BlockHash::from_bytes([1; 32]),
            tips: vec![BlockHash::from_bytes([2; 32])],
            level: 4,
            transactions: vec![TxHash::from_bytes([7; 32]), TxHash::from_bytes([8; 32])],
            gas_estimations: vec![21_000, 40_000],
            timestamp: 1_700_000_000,
            vdf: VdfSortition::default(),
            signature: Signature(vec![0; 65]),
        }
    }

    #[test]
    fn serialize_round_trip() {
        let blk = sample_block();
        let bytes = bincode::serialize(&blk).unwrap();
        let back: DagBlock = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, blk);
    }

    #[test]
    fn parents_pivot_first() {
        let blk = sample_block();
        let parents: Vec<_> = blk.parents().copied().collect();
        assert_eq!(parents[0], blk.pivot);
        assert_eq!(parents.len(), 2);
    }

    #[test]
    fn gas_estimation_sum() {
        assert_eq!(sample_block().total_gas_estimation(), 61_000);
    }
}

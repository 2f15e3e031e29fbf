use serde::{Deserialize, Serialize};

use crate::dag_block::DagBlock;
use crate::transaction::Transaction;
use crate::types::{Address, BlockHash, Hash, Period, Signature, Timestamp, VoteHash};
use crate::vote::Vote;

/// A finalized-chain block: one per period once certified.
///
/// The anchor names the DAG vertex whose non-finalized ancestors this block
/// finalizes; `order_hash` commits to their deterministic ordering and to the
/// resulting transaction order. Reward votes are the cert votes that
/// finalized the *previous* block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PbftBlock {
    /// Derived identifier (Keccak of body + signature).
    pub hash: BlockHash,

    pub period: Period,

    /// Hash of the block at period − 1 (zero for the first block).
    pub prev_block_hash: BlockHash,

    /// Finalized DAG anchor; `NULL_BLOCK_HASH` when no new DAG blocks exist.
    pub anchor_hash: BlockHash,

    /// Commitment over the DAG block order and the transaction order.
    pub order_hash: Hash,

    pub proposer: Address,

    /// Cert-vote hashes for the previous finalized block.
    pub reward_votes: Vec<VoteHash>,

    /// Proposal wall-clock time (UTC seconds).
    pub timestamp: Timestamp,

    /// Proposer signature over the body bytes.
    pub signature: Signature,
}

/// Signed portion of a PBFT block.
#[derive(Serialize)]
pub struct PbftBlockBody<'a> {
    pub period: Period,
    pub prev_block_hash: &'a BlockHash,
    pub anchor_hash: &'a BlockHash,
    pub order_hash: &'a Hash,
    pub proposer: &'a Address,
    pub reward_votes: &'a Vec<VoteHash>,
    pub timestamp: Timestamp,
}

impl PbftBlock {
    pub fn body(&self) -> PbftBlockBody<'_> {
        PbftBlockBody {
            period: self.period,
            prev_block_hash: &self.prev_block_hash,
            anchor_hash: &self.anchor_hash,
            order_hash: &self.order_hash,
            proposer: &self.proposer,
            reward_votes: &self.reward_votes,
            timestamp: self.timestamp,
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
}

/// Everything one period carries: the PBFT block, the cert votes proving the
/// previous block, the DAG blocks it finalizes and their transactions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeriodData {
    pub pbft_block: PbftBlock,
    pub previous_cert_votes: Vec<Vote>,
    pub dag_blocks: Vec<DagBlock>,
    pub transactions: Vec<Transaction>,
}

impl PeriodData {
    pub fn new(pbft_block: PbftBlock) -> Self {
        Self {
            pbft_block,
            previous_cert_votes: Vec::new(),
            dag_blocks: Vec::new(),
            transactions: Vec::new(),
        }
    }

    pub fn period(&self) -> Period {
        self.pbft_block.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pbft_block() -> PbftBlock {
        PbftBlock {
            hash: BlockHash::from_bytes([1; 32]),
            period: 12,
            prev_block_hash: BlockHash::from_bytes([2; 32]),
            anchor_hash: BlockHash::from_bytes([3; 32]),
            order_hash: Hash::from_bytes([4; 32]),
            proposer: Address::from_bytes([5; 20]),
            reward_votes: vec![VoteHash::from_bytes([6; 32])],
            timestamp: 1_700_000_123,
            signature: Signature(vec![0; 65]),
        }
    }

    #[test]
    fn serialize_round_trip() {
        let blk = sample_pbft_block();
        let bytes = bincode::serialize(&blk).unwrap();
        let back: PbftBlock = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, blk);
    }

    #[test]
    fn period_data_round_trip() {
        let pd = PeriodData::new(sample_pbft_block());
        let bytes = bincode::serialize(&pd).unwrap();
        let back: PeriodData = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, pd);
        assert_eq!(back.period(), 12);
    }
}

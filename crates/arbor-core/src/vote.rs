use serde::{Deserialize, Serialize};

use crate::types::{Address, BlockHash, Period, Round, Signature, StepId, VoteHash, VrfProof};

/// The four typed votes of the agreement protocol.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoteType {
    /// Step 1: propose a new block for the period.
    Propose,
    /// Step 2: back the elected leader block.
    Soft,
    /// Step 3: lock onto a verified block.
    Cert,
    /// Steps ≥ 4: carry the round's outcome forward.
    Next,
}

/// A single weighted vote.
///
/// The signed message covers period, round, step, type and block hash — not
/// the VRF proof — and the voter address is implicit via signature recovery.
/// `weight` is computed during verification and never serialized.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    /// Derived identifier (Keccak of body + vrf + signature).
    pub hash: VoteHash,

    pub period: Period,
    pub round: Round,
    pub step: StepId,
    pub vote_type: VoteType,

    /// Voted value; `NULL_BLOCK_HASH` for null votes.
    pub block_hash: BlockHash,

    /// Per-round lottery proof; determines the vote weight.
    pub vrf: VrfProof,

    /// Recoverable signature over the body bytes.
    pub signature: Signature,

    /// Voter recovered from `signature`; filled in at verification.
    pub voter: Address,

    /// Sortition weight; `None` until verified.
    #[serde(skip)]
    pub weight: Option<u64>,
}

/// Signed portion of a vote. Deliberately excludes the VRF proof so the
/// lottery bytes cannot be grafted onto a different voter's signature.
#[derive(Serialize)]
pub struct VoteBody {
    pub period: Period,
    pub round: Round,
    pub step: StepId,
    pub vote_type: VoteType,
    pub block_hash: BlockHash,
}

impl Vote {
    pub fn body(&self) -> VoteBody {
        VoteBody {
            period: self.period,
            round: self.round,
            step: self.step,
            vote_type: self.vote_type,
            block_hash: self.block_hash,
        }
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        bincode::serialize(&self.body()).expect("body serialization is infallible")
    }

    /// Canonical bytes hashed to produce `hash`.
    pub fn hashed_bytes(&self) -> Vec<u8> {
        let mut bytes = self.body_bytes();
        bytes.extend_from_slice(&self.vrf.output.0);
        bytes.extend_from_slice(&self.vrf.proof);
        bytes.extend_from_slice(self.signature.as_bytes());
        bytes
    }

    pub fn is_null_vote(&self) -> bool {
        self.block_hash.is_zero()
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vote {:?} {:?} p{} r{} s{} -> {:?}",
            self.hash, self.vote_type, self.period, self.round, self.step, self.block_hash
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NULL_BLOCK_HASH;

    fn sample_vote() -> Vote {
        Vote {
            hash: VoteHash::from_bytes([4; 32]),
            period: 3,
            round: 2,
            step: 2,
            vote_type: VoteType::Soft,
            block_hash: BlockHash::from_bytes([6; 32]),
            vrf: VrfProof {
                output: BlockHash::from_bytes([8; 32]),
                proof: vec![1, 2, 3],
            },
            signature: Signature(vec![0; 65]),
            voter: Address::from_bytes([2; 20]),
            weight: Some(3),
        }
    }

    #[test]
    fn serialize_round_trip_drops_weight() {
        let vote = sample_vote();
        let bytes = bincode::serialize(&vote).unwrap();
        let back: Vote = bincode::deserialize(&bytes).unwrap();
        // weight is local state, everything else survives
        assert_eq!(back.weight, None);
        assert_eq!(back.hash, vote.hash);
        assert_eq!(back.body_bytes(), vote.body_bytes());
    }

    #[test]
    fn signed_bytes_exclude_vrf() {
        let mut vote = sample_vote();
        let signed_before = vote.body_bytes();
        let hashed_before = vote.hashed_bytes();
        vote.vrf.proof = vec![9, 9, 9];
        assert_eq!(vote.body_bytes(), signed_before);
        // ... but the vote hash still commits to the vrf bytes
        assert_ne!(vote.hashed_bytes(), hashed_before);
    }

    #[test]
    fn null_vote_detection() {
        let mut vote = sample_vote();
        assert!(!vote.is_null_vote());
        vote.block_hash = NULL_BLOCK_HASH;
        assert!(vote.is_null_vote());
    }
}

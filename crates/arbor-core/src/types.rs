use serde::{Deserialize, Serialize};
use std::fmt;

/// Token balance. u128 covers the full supply with room to spare.
pub type Balance = u128;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// Transaction sequence number per sender (monotonically increasing).
pub type Nonce = u64;

/// DAG block level: 1 + max level of pivot and tips.
pub type Level = u64;

/// Finalized-chain period number. Period 0 is the genesis head.
pub type Period = u64;

/// PBFT round counter, reset to 1 at every new period.
pub type Round = u64;

/// PBFT step counter within a round (1 = propose, 2 = filter, ...).
pub type StepId = u64;

/// Gas units, used both for limits and estimations.
pub type GasAmount = u64;

/// Engine-facing peer identifier (the transport's peer id, stringified).
pub type PeerTag = String;

// ── Hash ─────────────────────────────────────────────────────────────────────

/// 32-byte Keccak-256 digest over the canonical bincode encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

/// Hash of a DAG or PBFT block.
pub type BlockHash = Hash;

/// Hash of a transaction.
pub type TxHash = Hash;

/// Hash of a vote.
pub type VoteHash = Hash;

/// The all-zero hash. Stands for "no block" in votes and anchors.
pub const NULL_BLOCK_HASH: Hash = Hash([0u8; 32]);

impl Hash {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}…)", &self.to_hex()[..16])
    }
}

// ── Address ──────────────────────────────────────────────────────────────────

/// 20-byte account address: low 20 bytes of Keccak-256 of the public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_bytes(b: [u8; 20]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{}…)", &self.to_hex()[..8])
    }
}

// ── Signature ─────────────────────────────────────────────────────────────────

/// 65-byte recoverable ECDSA signature (r ∥ s ∥ v).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}b)", self.0.len())
    }
}

// ── VrfProof ─────────────────────────────────────────────────────────────────

/// Output of the per-round VRF lottery together with its proof bytes.
///
/// The proof is a deterministic signature over the lottery input; verifiers
/// recompute `output = keccak(proof)` after checking the signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VrfProof {
    pub output: Hash,
    pub proof: Vec<u8>,
}

impl fmt::Debug for VrfProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfProof({:?})", self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip() {
        let h = Hash::from_bytes([0xAB; 32]);
        assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
    }

    #[test]
    fn null_hash_is_zero() {
        assert!(NULL_BLOCK_HASH.is_zero());
        assert!(!Hash::from_bytes([1; 32]).is_zero());
    }

    #[test]
    fn address_hex_rejects_bad_length() {
        assert!(Address::from_hex("0011").is_err());
        let a = Address::from_bytes([7; 20]);
        assert_eq!(Address::from_hex(&a.to_hex()).unwrap(), a);
    }
}

use serde::{Deserialize, Serialize};

use crate::types::{Address, Balance, GasAmount, Nonce, Signature, TxHash};

/// A signed transfer/contract-call transaction.
///
/// `hash` is Keccak-256 of the canonical bincode serialization of the body
/// plus the signature. The sender address is not part of the wire form
/// proper — it is recovered from the signature over the body bytes and cached
/// here after verification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Unique identifier (derived, see above).
    pub hash: TxHash,

    /// Monotonically increasing per-sender counter (replay protection).
    pub nonce: Nonce,

    /// Transferred amount.
    pub value: Balance,

    /// Gas the sender allows this transaction to burn.
    pub gas_limit: GasAmount,

    /// Price per gas unit.
    pub gas_price: u64,

    /// Destination account. `None` creates a contract.
    pub receiver: Option<Address>,

    /// Call data / contract init code.
    pub payload: Vec<u8>,

    /// Recoverable signature over the body bytes.
    pub signature: Signature,

    /// Sender recovered from `signature`; filled in at verification.
    pub sender: Address,
}

/// The fields covered by the signature (and by sender recovery).
/// Excludes `hash`, `signature` and the cached `sender`.
#[derive(Serialize)]
pub struct TransactionBody<'a> {
    pub nonce: Nonce,
    pub value: Balance,
    pub gas_limit: GasAmount,
    pub gas_price: u64,
    pub receiver: &'a Option<Address>,
    pub payload: &'a Vec<u8>,
}

impl Transaction {
    pub fn body(&self) -> TransactionBody<'_> {
        TransactionBody {
            nonce: self.nonce,
            value: self.value,
            gas_limit: self.gas_limit,
            gas_price: self.gas_price,
            receiver: &self.receiver,
            payload: &self.payload,
        }
    }

    /// Canonical bytes signed by the sender.
    pub fn body_bytes(&self) -> Vec<u8> {
        bincode::serialize(&self.body()).expect("body serialization is infallible")
    }

    /// Canonical bytes hashed to produce `hash` (body plus signature).
    pub fn hashed_bytes(&self) -> Vec<u8> {
        let mut bytes = self.body_bytes();
        bytes.extend_from_slice(self.signature.as_bytes());
        bytes
    }
}

/// Execution outcome of one finalized transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub status_ok: bool,
    pub gas_used: GasAmount,
    pub cumulative_gas_used: GasAmount,
}

/// Where a finalized transaction ended up.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionLocation {
    pub period: u64,
    pub position: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            hash: TxHash::from_bytes([1; 32]),
            nonce: 7,
            value: 1_000,
            gas_limit: 21_000,
            gas_price: 2,
            receiver: Some(Address::from_bytes([9; 20])),
            payload: vec![0xDE, 0xAD],
            signature: Signature(vec![0u8; 65]),
            sender: Address::from_bytes([3; 20]),
        }
    }

    #[test]
    fn serialize_round_trip() {
        let tx = sample_tx();
        let bytes = bincode::serialize(&tx).unwrap();
        let back: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn body_excludes_signature() {
        let mut tx = sample_tx();
        let before = tx.body_bytes();
        tx.signature = Signature(vec![0xFF; 65]);
        assert_eq!(tx.body_bytes(), before);
        assert_ne!(tx.hashed_bytes(), before);
    }
}

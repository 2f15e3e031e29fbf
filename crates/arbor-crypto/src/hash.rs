use arbor_core::types::Hash;
use serde::Serialize;
use sha3::{Digest, Keccak256};

/// Keccak-256 of raw bytes.
pub fn keccak256(data: &[u8]) -> Hash {
    let digest = Keccak256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Hash(out)
}

/// Keccak-256 over the canonical bincode encoding of `value`.
///
/// This is the single content-hash used for transactions, blocks, votes and
/// the order commitment; persistence uses the same encoding.
pub fn content_hash<T: Serialize>(value: &T) -> Hash {
    let bytes = bincode::serialize(value).expect("canonical serialization is infallible");
    keccak256(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_known_vector() {
        // keccak256("") — the well-known empty-input digest
        assert_eq!(
            keccak256(b"").to_hex(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash(&(1u64, "abc"));
        let b = content_hash(&(1u64, "abc"));
        let c = content_hash(&(2u64, "abc"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

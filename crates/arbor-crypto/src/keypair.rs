use arbor_core::error::ArborError;
use arbor_core::types::{Address, Hash, Signature};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use zeroize::Zeroize;

use crate::hash::keccak256;

/// A secp256k1 keypair with its derived 20-byte address.
///
/// Secret bytes are wiped on drop. The same scheme serves both the account
/// wallet and the consensus (lottery) identity; which key a node uses where
/// is decided by the wallet layer.
pub struct KeyPair {
    secret: [u8; 32],
    pub address: Address,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        loop {
            let secret: [u8; 32] = rand::random();
            if let Ok(kp) = Self::from_secret_bytes(secret) {
                return kp;
            }
        }
    }

    /// Restore from raw secret bytes. Fails on out-of-range scalars.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Result<Self, ArborError> {
        let signing_key = SigningKey::from_bytes(&secret.into())
            .map_err(|e| ArborError::InvalidProof(format!("bad secret key: {e}")))?;
        let address = address_from_verifying_key(signing_key.verifying_key());
        Ok(Self { secret, address })
    }

    /// Restore from a hex-encoded secret.
    pub fn from_secret_hex(s: &str) -> Result<Self, ArborError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| ArborError::MalformedInput(format!("bad secret hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(ArborError::MalformedInput("secret must be 32 bytes".into()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Self::from_secret_bytes(arr)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    /// Uncompressed public key bytes (65, leading 0x04).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        let signing_key = self.signing_key();
        signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Sign a 32-byte prehash, producing a 65-byte recoverable signature.
    ///
    /// Signing is deterministic (RFC 6979), which the VRF layer relies on.
    pub fn sign_hash(&self, message: &Hash) -> Signature {
        let signing_key = self.signing_key();
        let (sig, recid) = signing_key
            .sign_prehash_recoverable(message.as_bytes())
            .expect("signing with a valid key is infallible");
        let mut bytes = sig.to_bytes().to_vec();
        bytes.push(recid.to_byte());
        Signature(bytes)
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret.into()).expect("secret validated at construction")
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ address: {} }}", self.address)
    }
}

/// Recover the signer address of a 65-byte recoverable signature.
pub fn recover_address(message: &Hash, signature: &Signature) -> Result<Address, ArborError> {
    let bytes = signature.as_bytes();
    if bytes.len() != 65 {
        return Err(ArborError::InvalidProof(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let sig = EcdsaSignature::from_slice(&bytes[..64])
        .map_err(|e| ArborError::InvalidProof(format!("bad signature encoding: {e}")))?;
    let recid = RecoveryId::from_byte(bytes[64])
        .ok_or_else(|| ArborError::InvalidProof("bad recovery id".into()))?;
    let key = VerifyingKey::recover_from_prehash(message.as_bytes(), &sig, recid)
        .map_err(|e| ArborError::InvalidProof(format!("recovery failed: {e}")))?;
    Ok(address_from_verifying_key(&key))
}

/// Check that `signature` over `message` recovers to `expected`.
pub fn verify_signature(message: &Hash, signature: &Signature, expected: &Address) -> bool {
    matches!(recover_address(message, signature), Ok(addr) if addr == *expected)
}

fn address_from_verifying_key(key: &VerifyingKey) -> Address {
    // Low 20 bytes of keccak over the uncompressed point, tag byte stripped.
    let encoded = key.to_encoded_point(false);
    let digest = keccak256(&encoded.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[12..]);
    Address(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_recover_round_trip() {
        let kp = KeyPair::generate();
        let msg = keccak256(b"hello");
        let sig = kp.sign_hash(&msg);
        assert_eq!(recover_address(&msg, &sig).unwrap(), kp.address);
        assert!(verify_signature(&msg, &sig, &kp.address));
    }

    #[test]
    fn wrong_message_recovers_other_address() {
        let kp = KeyPair::generate();
        let sig = kp.sign_hash(&keccak256(b"one"));
        let other = keccak256(b"two");
        assert!(!verify_signature(&other, &sig, &kp.address));
    }

    #[test]
    fn secret_hex_round_trip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&kp.secret_hex()).unwrap();
        assert_eq!(restored.address, kp.address);
    }

    #[test]
    fn signing_is_deterministic() {
        let kp = KeyPair::generate();
        let msg = keccak256(b"vrf input");
        assert_eq!(kp.sign_hash(&msg), kp.sign_hash(&msg));
    }

    #[test]
    fn truncated_signature_rejected() {
        let msg = keccak256(b"x");
        let err = recover_address(&msg, &Signature(vec![0u8; 10]));
        assert!(matches!(err, Err(ArborError::InvalidProof(_))));
    }
}

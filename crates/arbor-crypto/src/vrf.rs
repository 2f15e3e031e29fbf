//! Verifiable random function built on deterministic ECDSA.
//!
//! The proof is the voter's RFC 6979 signature over the lottery input; the
//! output is Keccak-256 of the proof bytes. Anyone can verify by recovering
//! the signer address from the proof and recomputing the output. Uniqueness
//! holds because deterministic signing admits exactly one signature per
//! (key, input) pair.

use arbor_core::error::ArborError;
use arbor_core::types::{Address, Hash, Signature, VrfProof};

use crate::hash::keccak256;
use crate::keypair::{recover_address, KeyPair};

/// Produce the lottery proof for `input`.
pub fn vrf_prove(keypair: &KeyPair, input: &Hash) -> VrfProof {
    let sig = keypair.sign_hash(input);
    let output = keccak256(sig.as_bytes());
    VrfProof {
        output,
        proof: sig.0,
    }
}

/// Verify `proof` against `input` and the claimed `prover` address.
pub fn vrf_verify(proof: &VrfProof, input: &Hash, prover: &Address) -> Result<(), ArborError> {
    let sig = Signature(proof.proof.clone());
    let recovered = recover_address(input, &sig)?;
    if recovered != *prover {
        return Err(ArborError::InvalidProof(format!(
            "vrf proof signed by {recovered}, expected {prover}"
        )));
    }
    if keccak256(&proof.proof) != proof.output {
        return Err(ArborError::InvalidProof("vrf output mismatch".into()));
    }
    Ok(())
}

/// Stake-weighted lottery draw.
///
/// `threshold` is the expected total weight across all voters for the step
/// (the proposer count for propose votes, the committee size otherwise). A
/// voter's weight is its proportional share of the threshold, with the
/// fractional remainder resolved by a uniform draw from the VRF output.
/// Zero-stake voters always draw zero.
pub fn sortition_weight(vrf_output: &Hash, stake: u64, total_stake: u64, threshold: u64) -> u64 {
    if stake == 0 || total_stake == 0 || threshold == 0 {
        return 0;
    }
    let threshold = threshold.min(total_stake);
    let expected = stake as u128 * threshold as u128;
    let base = (expected / total_stake as u128) as u64;
    let remainder = expected % total_stake as u128;

    let mut draw_bytes = [0u8; 8];
    draw_bytes.copy_from_slice(&vrf_output.as_bytes()[..8]);
    let draw = u64::from_be_bytes(draw_bytes) as u128 % total_stake as u128;

    base + u64::from(draw < remainder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prove_verify_round_trip() {
        let kp = KeyPair::generate();
        let input = keccak256(b"round 3 step 1");
        let proof = vrf_prove(&kp, &input);
        vrf_verify(&proof, &input, &kp.address).unwrap();
    }

    #[test]
    fn proof_rejected_for_other_prover() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let input = keccak256(b"input");
        let proof = vrf_prove(&kp, &input);
        assert!(vrf_verify(&proof, &input, &other.address).is_err());
    }

    #[test]
    fn tampered_output_rejected() {
        let kp = KeyPair::generate();
        let input = keccak256(b"input");
        let mut proof = vrf_prove(&kp, &input);
        proof.output = keccak256(b"something else");
        assert!(vrf_verify(&proof, &input, &kp.address).is_err());
    }

    #[test]
    fn whole_stake_takes_whole_threshold() {
        let out = keccak256(b"any");
        assert_eq!(sortition_weight(&out, 100, 100, 5), 5);
    }

    #[test]
    fn zero_stake_draws_zero() {
        let out = keccak256(b"any");
        assert_eq!(sortition_weight(&out, 0, 100, 5), 0);
        assert_eq!(sortition_weight(&out, 10, 0, 5), 0);
    }

    #[test]
    fn proportional_base_weight() {
        let out = keccak256(b"any");
        // 40% stake of threshold 10 => at least 4
        let w = sortition_weight(&out, 40, 100, 10);
        assert!(w == 4 || w == 5, "weight {w} outside proportional bounds");
    }
}

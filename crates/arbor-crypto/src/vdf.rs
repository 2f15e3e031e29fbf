//! Verifiable delay puzzle gating DAG block proposals.
//!
//! Solving walks a sequential Keccak chain whose length grows exponentially
//! with the difficulty drawn from the proposer's VRF output. The solver
//! records evenly spaced checkpoints; verification re-walks one sampled
//! segment plus the tail instead of the whole chain.

use arbor_core::config::VdfConfig;
use arbor_core::dag_block::VdfSortition;
use arbor_core::error::ArborError;
use arbor_core::types::{Address, BlockHash, Hash, Level, VrfProof};

use crate::hash::keccak256;
use crate::vrf::vrf_verify;

/// Number of intermediate states recorded by the solver.
const NUM_CHECKPOINTS: u64 = 16;

/// Hard ceiling on the difficulty exponent so iteration counts stay in u64.
const MAX_DIFFICULTY_BITS: u16 = 24;

/// Lottery input for level-gated proposals: `(level, period seed)`.
pub fn vdf_input(level: Level, period_seed: &Hash) -> Hash {
    let mut bytes = Vec::with_capacity(40);
    bytes.extend_from_slice(&level.to_be_bytes());
    bytes.extend_from_slice(period_seed.as_bytes());
    keccak256(&bytes)
}

/// Draw the puzzle difficulty from the VRF output.
///
/// A 16-bit selector from the output picks the stale band, the omit band or
/// a value in `[difficulty_min, difficulty_max]`.
pub fn draw_difficulty(cfg: &VdfConfig, vrf_output: &Hash) -> u16 {
    let selector = u16::from_be_bytes([vrf_output.as_bytes()[0], vrf_output.as_bytes()[1]]);
    if selector >= cfg.threshold_selection {
        return cfg.difficulty_stale;
    }
    if selector < cfg.threshold_vdf_omit {
        return 0;
    }
    let span = cfg.difficulty_max - cfg.difficulty_min + 1;
    cfg.difficulty_min + selector % span
}

/// Whether `difficulty` is the stale draw a proposer should not submit.
pub fn is_stale_difficulty(cfg: &VdfConfig, difficulty: u16) -> bool {
    difficulty == cfg.difficulty_stale && difficulty > cfg.difficulty_max
}

fn iterations(cfg: &VdfConfig, difficulty: u16) -> u64 {
    if difficulty == 0 {
        return 0;
    }
    cfg.lambda_bound << difficulty.min(MAX_DIFFICULTY_BITS)
}

fn chain_seed(vrf_output: &Hash, pivot: &BlockHash) -> Hash {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(vrf_output.as_bytes());
    bytes.extend_from_slice(pivot.as_bytes());
    keccak256(&bytes)
}

fn walk(mut state: Hash, steps: u64) -> Hash {
    for _ in 0..steps {
        state = keccak256(state.as_bytes());
    }
    state
}

/// Solve the delay puzzle for a drawn VRF proof.
///
/// Runs Θ(iterations); callers are expected to re-check the DAG frontier
/// afterwards since it may have moved while solving.
pub fn solve_vdf(cfg: &VdfConfig, level: Level, vrf: VrfProof, pivot: &BlockHash) -> VdfSortition {
    let difficulty = draw_difficulty(cfg, &vrf.output);
    let total = iterations(cfg, difficulty);
    let seed = chain_seed(&vrf.output, pivot);

    if total == 0 {
        return VdfSortition {
            level,
            vrf,
            difficulty,
            solution: seed,
            checkpoints: Vec::new(),
        };
    }

    let seg = total / NUM_CHECKPOINTS;
    let mut checkpoints = Vec::new();
    let mut state = seed;
    if seg > 0 {
        for _ in 0..NUM_CHECKPOINTS {
            state = walk(state, seg);
            checkpoints.push(state);
        }
    }
    // Tail left over by integer division.
    let done = seg * checkpoints.len() as u64;
    let solution = walk(state, total - done);

    VdfSortition {
        level,
        vrf,
        difficulty,
        solution,
        checkpoints,
    }
}

/// Verify a delay proof against the proposer and the period seed.
///
/// Deterministic: re-derives the lottery input, checks the VRF binding and
/// the declared difficulty, then re-walks one checkpoint segment chosen by
/// the solution bytes plus the chain tail.
pub fn verify_vdf(
    cfg: &VdfConfig,
    vdf: &VdfSortition,
    pivot: &BlockHash,
    period_seed: &Hash,
    proposer: &Address,
) -> Result<(), ArborError> {
    let input = vdf_input(vdf.level, period_seed);
    vrf_verify(&vdf.vrf, &input, proposer)?;

    let expected_difficulty = draw_difficulty(cfg, &vdf.vrf.output);
    if expected_difficulty != vdf.difficulty {
        return Err(ArborError::InvalidProof(format!(
            "declared difficulty {} does not match drawn {}",
            vdf.difficulty, expected_difficulty
        )));
    }

    let total = iterations(cfg, vdf.difficulty);
    let seed = chain_seed(&vdf.vrf.output, pivot);

    if total == 0 {
        if vdf.solution != seed || !vdf.checkpoints.is_empty() {
            return Err(ArborError::InvalidProof("omitted delay has a solution".into()));
        }
        return Ok(());
    }

    let seg = total / NUM_CHECKPOINTS;
    if seg == 0 {
        // Chain shorter than the checkpoint grid: re-walk it whole.
        if !vdf.checkpoints.is_empty() || walk(seed, total) != vdf.solution {
            return Err(ArborError::InvalidProof("short delay chain mismatch".into()));
        }
        return Ok(());
    }

    if vdf.checkpoints.len() as u64 != NUM_CHECKPOINTS {
        return Err(ArborError::InvalidProof(format!(
            "expected {} checkpoints, got {}",
            NUM_CHECKPOINTS,
            vdf.checkpoints.len()
        )));
    }

    // Sampled segment, selected by the solution so the solver cannot choose it.
    let k = (vdf.solution.as_bytes()[0] as u64 % NUM_CHECKPOINTS) as usize;
    let start = if k == 0 { seed } else { vdf.checkpoints[k - 1] };
    if walk(start, seg) != vdf.checkpoints[k] {
        return Err(ArborError::InvalidProof(format!("checkpoint {k} mismatch")));
    }

    // Tail from the last checkpoint to the solution.
    let tail = total - seg * NUM_CHECKPOINTS;
    let last = vdf.checkpoints[NUM_CHECKPOINTS as usize - 1];
    if walk(last, tail) != vdf.solution {
        return Err(ArborError::InvalidProof("solution tail mismatch".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::KeyPair;
    use crate::vrf::vrf_prove;

    fn test_cfg() -> VdfConfig {
        VdfConfig {
            difficulty_min: 1,
            difficulty_max: 4,
            difficulty_stale: 6,
            threshold_selection: 0xF000,
            threshold_vdf_omit: 0x0100,
            lambda_bound: 64,
        }
    }

    fn solve_for(kp: &KeyPair, cfg: &VdfConfig, level: Level) -> (VdfSortition, Hash, BlockHash) {
        let seed = keccak256(b"period seed");
        let pivot = keccak256(b"pivot");
        let vrf = vrf_prove(kp, &vdf_input(level, &seed));
        (solve_vdf(cfg, level, vrf, &pivot), seed, pivot)
    }

    #[test]
    fn solve_verify_round_trip() {
        let kp = KeyPair::generate();
        let cfg = test_cfg();
        let (vdf, seed, pivot) = solve_for(&kp, &cfg, 3);
        verify_vdf(&cfg, &vdf, &pivot, &seed, &kp.address).unwrap();
    }

    #[test]
    fn wrong_pivot_rejected() {
        let kp = KeyPair::generate();
        let cfg = test_cfg();
        let (vdf, seed, _) = solve_for(&kp, &cfg, 3);
        let other_pivot = keccak256(b"other pivot");
        if vdf.difficulty > 0 {
            assert!(verify_vdf(&cfg, &vdf, &other_pivot, &seed, &kp.address).is_err());
        }
    }

    #[test]
    fn tampered_solution_rejected() {
        let kp = KeyPair::generate();
        let cfg = test_cfg();
        let (mut vdf, seed, pivot) = solve_for(&kp, &cfg, 3);
        vdf.solution = keccak256(b"forged");
        assert!(verify_vdf(&cfg, &vdf, &pivot, &seed, &kp.address).is_err());
    }

    #[test]
    fn declared_difficulty_must_match_draw() {
        let kp = KeyPair::generate();
        let cfg = test_cfg();
        let (mut vdf, seed, pivot) = solve_for(&kp, &cfg, 3);
        vdf.difficulty += 1;
        assert!(verify_vdf(&cfg, &vdf, &pivot, &seed, &kp.address).is_err());
    }

    #[test]
    fn difficulty_draw_stays_in_bounds() {
        let cfg = test_cfg();
        for i in 0u8..64 {
            let out = keccak256(&[i]);
            let d = draw_difficulty(&cfg, &out);
            assert!(
                d == 0 || d == cfg.difficulty_stale || (d >= cfg.difficulty_min && d <= cfg.difficulty_max),
                "difficulty {d} outside every band"
            );
        }
    }

    #[test]
    fn stale_detection_only_flags_stale_band() {
        let cfg = test_cfg();
        assert!(is_stale_difficulty(&cfg, cfg.difficulty_stale));
        assert!(!is_stale_difficulty(&cfg, cfg.difficulty_max));
        assert!(!is_stale_difficulty(&cfg, 0));
    }
}

//! Cross-crate ordering scenarios: ghost-path tie-breaks and the
//! finalized-position guarantee, driven through the real block pipeline.

use std::sync::Arc;

use arbor_core::config::{DagGenesisConfig, VdfConfig};
use arbor_core::dag_block::DagBlock;
use arbor_core::dpos::{DposQuery, StakeTable};
use arbor_core::types::{BlockHash, Level, Signature, TxHash};
use arbor_crypto::vdf::{solve_vdf, vdf_input};
use arbor_crypto::{keccak256, vrf_prove, KeyPair};
use arbor_dag::{DagBlockManager, TxAvailability};

struct AllKnown;
impl TxAvailability for AllKnown {
    fn all_known(&self, _hashes: &[TxHash]) -> bool {
        true
    }
}

fn vdf_cfg() -> VdfConfig {
    VdfConfig {
        difficulty_min: 0,
        difficulty_max: 1,
        difficulty_stale: 2,
        threshold_selection: 0xFFFF,
        threshold_vdf_omit: 0x8000,
        lambda_bound: 16,
    }
}

fn build_manager() -> (Arc<DagBlockManager>, KeyPair) {
    let kp = KeyPair::generate();
    let dpos: Arc<dyn DposQuery> = Arc::new(StakeTable::single(kp.address, 100));
    let mgr = Arc::new(DagBlockManager::new(
        &DagGenesisConfig::default(),
        vdf_cfg(),
        10_000_000,
        1024,
        dpos,
        Arc::new(AllKnown),
    ));
    (mgr, kp)
}

fn make_block(
    mgr: &DagBlockManager,
    kp: &KeyPair,
    pivot: BlockHash,
    tips: Vec<BlockHash>,
    level: Level,
    salt: i64,
) -> DagBlock {
    let seed = mgr.period_seed(level);
    let vrf = vrf_prove(kp, &vdf_input(level, &seed));
    let vdf = solve_vdf(&vdf_cfg(), level, vrf, &pivot);
    let mut blk = DagBlock {
        hash: BlockHash::default(),
        pivot,
        tips,
        level,
        transactions: Vec::new(),
        gas_estimations: Vec::new(),
        timestamp: 1_700_000_000 + salt,
        vdf,
        signature: Signature::default(),
    };
    blk.signature = kp.sign_hash(&keccak256(&blk.body_bytes()));
    blk.hash = keccak256(&blk.hashed_bytes());
    blk
}

fn admit(mgr: &DagBlockManager, blk: &DagBlock) {
    mgr.push_unverified(blk.clone()).unwrap();
    let admitted = mgr.admit_ready();
    assert!(
        admitted.iter().any(|b| b.hash == blk.hash),
        "block {} not admitted",
        blk.hash
    );
}

#[test]
fn sibling_tie_break_flips_with_subtree_weight() {
    let (mgr, kp) = build_manager();
    let genesis = mgr.genesis_hash();

    let a = make_block(&mgr, &kp, genesis, vec![], 1, 1);
    let b = make_block(&mgr, &kp, genesis, vec![], 1, 2);
    admit(&mgr, &a);
    admit(&mgr, &b);

    let (small, big) = if a.hash < b.hash { (&a, &b) } else { (&b, &a) };

    // Equal weights: the smaller hash wins the pivot.
    let ghost = mgr.ghost_path(&genesis);
    assert_eq!(ghost, vec![genesis, small.hash]);
    assert_eq!(mgr.frontier().pivot, small.hash);

    // Give the larger sibling a child; its subtree now outweighs.
    let child = make_block(&mgr, &kp, big.hash, vec![], 2, 3);
    admit(&mgr, &child);

    let ghost = mgr.ghost_path(&genesis);
    assert_eq!(ghost, vec![genesis, big.hash, child.hash]);
}

#[test]
fn finalized_positions_match_order_at_commit_time() {
    let (mgr, kp) = build_manager();
    let genesis = mgr.genesis_hash();

    let a = make_block(&mgr, &kp, genesis, vec![], 1, 1);
    let b = make_block(&mgr, &kp, genesis, vec![], 1, 2);
    admit(&mgr, &a);
    admit(&mgr, &b);
    let c = make_block(&mgr, &kp, a.hash, vec![b.hash], 2, 3);
    admit(&mgr, &c);

    let order_before = mgr.dag_order(&c.hash).unwrap();
    let finalized = mgr.finalize(&c.hash).unwrap();
    let finalized_hashes: Vec<BlockHash> = finalized.iter().map(|b| b.hash).collect();

    // Every finalized block appears exactly once, at the position the
    // pre-commit ordering assigned.
    assert_eq!(finalized_hashes, order_before);
    assert_eq!(finalized_hashes.len(), 3);
    assert_eq!(*finalized_hashes.last().unwrap(), c.hash);

    // Nothing non-finalized remains.
    assert_eq!(mgr.non_finalized_count(), 0);
}

#[test]
fn new_blocks_extend_the_finalized_anchor() {
    let (mgr, kp) = build_manager();
    let genesis = mgr.genesis_hash();

    let a = make_block(&mgr, &kp, genesis, vec![], 1, 1);
    admit(&mgr, &a);
    mgr.finalize(&a.hash).unwrap();

    // The anchor roots the next frontier; a child of it is admissible.
    assert_eq!(mgr.frontier().pivot, a.hash);
    let b = make_block(&mgr, &kp, a.hash, vec![], 2, 2);
    admit(&mgr, &b);
    assert_eq!(mgr.frontier().pivot, b.hash);
}

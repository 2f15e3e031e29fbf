use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use arbor_core::types::{BlockHash, PeerTag, Period, Round, TxHash, VoteHash};

/// Insertion-ordered set with a fixed capacity; oldest entries fall out.
pub struct BoundedSet<T> {
    set: HashSet<T>,
    order: VecDeque<T>,
    cap: usize,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Returns false when the value was already present.
    pub fn insert(&mut self, value: T) -> bool {
        if !self.set.insert(value.clone()) {
            return false;
        }
        self.order.push_back(value);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        self.set.contains(value)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

const KNOWN_VOTES_CAP: usize = 20_000;
const KNOWN_BLOCKS_CAP: usize = 10_000;
const KNOWN_TXS_CAP: usize = 100_000;

/// What this node knows about one connected peer.
pub struct PeerState {
    known_votes: Mutex<BoundedSet<VoteHash>>,
    known_dag_blocks: Mutex<BoundedSet<BlockHash>>,
    known_pbft_blocks: Mutex<BoundedSet<BlockHash>>,
    known_txs: Mutex<BoundedSet<TxHash>>,
    period: AtomicU64,
    round: AtomicU64,
    syncing: AtomicBool,
    vote_bundles_received: AtomicU64,
}

impl PeerState {
    pub fn new() -> Self {
        Self {
            known_votes: Mutex::new(BoundedSet::new(KNOWN_VOTES_CAP)),
            known_dag_blocks: Mutex::new(BoundedSet::new(KNOWN_BLOCKS_CAP)),
            known_pbft_blocks: Mutex::new(BoundedSet::new(KNOWN_BLOCKS_CAP)),
            known_txs: Mutex::new(BoundedSet::new(KNOWN_TXS_CAP)),
            period: AtomicU64::new(0),
            round: AtomicU64::new(1),
            syncing: AtomicBool::new(false),
            vote_bundles_received: AtomicU64::new(0),
        }
    }

    /// Record a vote hash; false when the peer already knew it.
    pub fn mark_vote_known(&self, hash: &VoteHash) -> bool {
        self.known_votes.lock().insert(*hash)
    }

    pub fn knows_vote(&self, hash: &VoteHash) -> bool {
        self.known_votes.lock().contains(hash)
    }

    pub fn mark_dag_block_known(&self, hash: &BlockHash) -> bool {
        self.known_dag_blocks.lock().insert(*hash)
    }

    pub fn knows_dag_block(&self, hash: &BlockHash) -> bool {
        self.known_dag_blocks.lock().contains(hash)
    }

    pub fn mark_pbft_block_known(&self, hash: &BlockHash) -> bool {
        self.known_pbft_blocks.lock().insert(*hash)
    }

    pub fn knows_pbft_block(&self, hash: &BlockHash) -> bool {
        self.known_pbft_blocks.lock().contains(hash)
    }

    pub fn mark_tx_known(&self, hash: &TxHash) -> bool {
        self.known_txs.lock().insert(*hash)
    }

    pub fn knows_tx(&self, hash: &TxHash) -> bool {
        self.known_txs.lock().contains(hash)
    }

    pub fn update_status(&self, period: Period, round: Round, syncing: bool) {
        self.period.store(period, Ordering::Release);
        self.round.store(round, Ordering::Release);
        self.syncing.store(syncing, Ordering::Release);
    }

    pub fn period(&self) -> Period {
        self.period.load(Ordering::Acquire)
    }

    pub fn round(&self) -> Round {
        self.round.load(Ordering::Acquire)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn record_vote_bundle(&self) {
        self.vote_bundles_received.fetch_add(1, Ordering::AcqRel);
    }

    pub fn vote_bundles_received(&self) -> u64 {
        self.vote_bundles_received.load(Ordering::Acquire)
    }
}

impl Default for PeerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of connected peers plus the broadcast filter rules.
pub struct PeerTable {
    peers: RwLock<HashMap<PeerTag, Arc<PeerState>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, peer: PeerTag) -> Arc<PeerState> {
        let mut peers = self.peers.write();
        Arc::clone(peers.entry(peer).or_insert_with(|| Arc::new(PeerState::new())))
    }

    pub fn remove(&self, peer: &PeerTag) {
        self.peers.write().remove(peer);
    }

    pub fn get(&self, peer: &PeerTag) -> Option<Arc<PeerState>> {
        self.peers.read().get(peer).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn tags(&self) -> Vec<PeerTag> {
        self.peers.read().keys().cloned().collect()
    }

    /// Peers that have not seen this vote yet; marks it known on selection.
    pub fn vote_targets(&self, hash: &VoteHash) -> Vec<PeerTag> {
        let peers = self.peers.read();
        peers
            .iter()
            .filter(|(_, state)| state.mark_vote_known(hash))
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Peers eligible for a next-vote bundle: at a round at or below ours
    /// and with fewer bundles than we have pushed them so far.
    pub fn bundle_targets(&self, our_round: Round, max_bundles: u64) -> Vec<PeerTag> {
        let peers = self.peers.read();
        peers
            .iter()
            .filter(|(_, state)| {
                state.round() <= our_round && state.vote_bundles_received() < max_bundles
            })
            .map(|(tag, state)| {
                state.record_vote_bundle();
                tag.clone()
            })
            .collect()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> VoteHash {
        VoteHash::from_bytes([n; 32])
    }

    #[test]
    fn bounded_set_evicts_oldest() {
        let mut set = BoundedSet::new(2);
        assert!(set.insert(1));
        assert!(!set.insert(1));
        assert!(set.insert(2));
        assert!(set.insert(3));
        assert!(!set.contains(&1), "oldest entry evicted");
        assert!(set.contains(&3));
    }

    #[test]
    fn vote_targets_skip_knowing_peers() {
        let table = PeerTable::new();
        let a = table.register("a".into());
        table.register("b".into());

        a.mark_vote_known(&h(1));
        let targets = table.vote_targets(&h(1));
        assert_eq!(targets, vec!["b".to_string()]);

        // now both know it
        assert!(table.vote_targets(&h(1)).is_empty());
    }

    #[test]
    fn bundle_targets_respect_round_and_count() {
        let table = PeerTable::new();
        let ahead = table.register("ahead".into());
        let behind = table.register("behind".into());
        ahead.update_status(5, 9, false);
        behind.update_status(5, 2, false);

        let targets = table.bundle_targets(4, 10);
        assert_eq!(targets, vec!["behind".to_string()]);
        assert_eq!(behind.vote_bundles_received(), 1);
    }

    #[test]
    fn status_updates_visible() {
        let table = PeerTable::new();
        let p = table.register("p".into());
        p.update_status(7, 3, true);
        assert_eq!(p.period(), 7);
        assert_eq!(p.round(), 3);
        assert!(p.is_syncing());
        table.remove(&"p".to_string());
        assert!(table.get(&"p".to_string()).is_none());
    }
}

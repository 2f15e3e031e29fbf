use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use arbor_core::constants::{MAX_POOL_SIZE, POOL_DELETE_STEP};
use arbor_core::transaction::Transaction;
use arbor_core::types::TxHash;

/// Bounded pending-transaction pool.
///
/// Hash-keyed; duplicate inserts are rejected. Packing reserves the returned
/// transactions so concurrent proposers never double-pack; reservations are
/// released on proposal failure and dropped on commit. When the pool
/// overflows, the oldest unreserved entries are evicted in chunks.
pub struct TransactionPool {
    inner: Mutex<Inner>,
    max_size: usize,
    delete_step: usize,
}

struct Inner {
    txs: HashMap<TxHash, Transaction>,
    /// Insertion order, oldest first; drives eviction.
    arrival: VecDeque<TxHash>,
    reserved: HashSet<TxHash>,
}

impl TransactionPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                txs: HashMap::new(),
                arrival: VecDeque::new(),
                reserved: HashSet::new(),
            }),
            max_size,
            delete_step: POOL_DELETE_STEP,
        }
    }

    /// Insert a verified transaction. Returns false on duplicate hash.
    pub fn insert(&self, tx: Transaction) -> bool {
        let mut inner = self.inner.lock();
        if inner.txs.contains_key(&tx.hash) {
            return false;
        }
        inner.arrival.push_back(tx.hash);
        inner.txs.insert(tx.hash, tx);

        if inner.txs.len() > self.max_size {
            self.evict(&mut inner);
        }
        true
    }

    pub fn get(&self, hash: &TxHash) -> Option<Transaction> {
        self.inner.lock().txs.get(hash).cloned()
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner.lock().txs.contains_key(hash)
    }

    /// Whether every given hash is present.
    pub fn all_known(&self, hashes: &[TxHash]) -> bool {
        let inner = self.inner.lock();
        hashes.iter().all(|h| inner.txs.contains_key(h))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve up to `limit` unreserved transactions for packing, ordered by
    /// (sender, nonce) so per-sender sequences stay intact.
    pub fn pack(&self, limit: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let mut picked: Vec<Transaction> = inner
            .txs
            .values()
            .filter(|tx| !inner.reserved.contains(&tx.hash))
            .cloned()
            .collect();
        picked.sort_by(|a, b| {
            (a.sender, a.nonce, a.hash).cmp(&(b.sender, b.nonce, b.hash))
        });
        picked.truncate(limit);
        for tx in &picked {
            inner.reserved.insert(tx.hash);
        }
        picked
    }

    /// Release reservations after a failed proposal.
    pub fn release(&self, hashes: &[TxHash]) {
        let mut inner = self.inner.lock();
        for h in hashes {
            inner.reserved.remove(h);
        }
    }

    /// Remove finalized transactions and their reservations.
    pub fn remove_on_commit(&self, hashes: &[TxHash]) {
        let mut inner = self.inner.lock();
        let Inner {
            txs,
            arrival,
            reserved,
        } = &mut *inner;
        for h in hashes {
            txs.remove(h);
            reserved.remove(h);
        }
        arrival.retain(|h| txs.contains_key(h));
    }

    fn evict(&self, inner: &mut Inner) {
        let mut evicted = 0usize;
        let mut kept_back = VecDeque::new();
        while evicted < self.delete_step {
            let Some(h) = inner.arrival.pop_front() else {
                break;
            };
            if inner.reserved.contains(&h) {
                kept_back.push_back(h);
                continue;
            }
            if inner.txs.remove(&h).is_some() {
                evicted += 1;
            }
        }
        // Reserved entries skipped during the sweep stay oldest-first.
        while let Some(h) = kept_back.pop_back() {
            inner.arrival.push_front(h);
        }
        debug!(evicted, pool_size = inner.txs.len(), "transaction pool overflow sweep");
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(MAX_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::types::{Address, Signature};

    fn tx(sender: u8, nonce: u64, id: u8) -> Transaction {
        Transaction {
            hash: TxHash::from_bytes([id; 32]),
            nonce,
            value: 1,
            gas_limit: 21_000,
            gas_price: 1,
            receiver: Some(Address::from_bytes([9; 20])),
            payload: Vec::new(),
            signature: Signature(vec![0; 65]),
            sender: Address::from_bytes([sender; 20]),
        }
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let pool = TransactionPool::new(100);
        assert!(pool.insert(tx(1, 0, 1)));
        let before = pool.len();
        assert!(!pool.insert(tx(1, 0, 1)));
        assert_eq!(pool.len(), before);
    }

    #[test]
    fn pack_reserves_and_orders_by_sender_nonce() {
        let pool = TransactionPool::new(100);
        pool.insert(tx(2, 1, 10));
        pool.insert(tx(1, 1, 11));
        pool.insert(tx(1, 0, 12));

        let packed = pool.pack(10);
        assert_eq!(packed.len(), 3);
        assert_eq!(packed[0].sender, Address::from_bytes([1; 20]));
        assert_eq!(packed[0].nonce, 0);
        assert_eq!(packed[1].nonce, 1);

        // Everything is reserved now.
        assert!(pool.pack(10).is_empty());

        pool.release(&[TxHash::from_bytes([12; 32])]);
        let repacked = pool.pack(10);
        assert_eq!(repacked.len(), 1);
        assert_eq!(repacked[0].hash, TxHash::from_bytes([12; 32]));
    }

    #[test]
    fn remove_on_commit_drops_reservations() {
        let pool = TransactionPool::new(100);
        pool.insert(tx(1, 0, 1));
        let packed = pool.pack(10);
        assert_eq!(packed.len(), 1);
        pool.remove_on_commit(&[packed[0].hash]);
        assert!(pool.is_empty());
        // a later re-insert of the same hash is a fresh entry
        assert!(pool.insert(tx(1, 0, 1)));
        assert_eq!(pool.pack(10).len(), 1);
    }

    #[test]
    fn overflow_evicts_oldest_unreserved() {
        let pool = TransactionPool {
            inner: Mutex::new(Inner {
                txs: HashMap::new(),
                arrival: VecDeque::new(),
                reserved: HashSet::new(),
            }),
            max_size: 10,
            delete_step: 4,
        };
        for i in 0..11u8 {
            pool.insert(tx(1, i as u64, i + 1));
        }
        assert_eq!(pool.len(), 11 - 4);
        // the oldest entries are gone
        assert!(!pool.contains(&TxHash::from_bytes([1; 32])));
        assert!(pool.contains(&TxHash::from_bytes([11; 32])));
    }
}

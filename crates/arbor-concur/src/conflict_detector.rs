use arbor_core::types::{Address, Hash, TxHash};

use crate::sharded_map::ShardedMap;

/// Access mode recorded for a memory cell within one proposal cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStatus {
    Read,
    Shared,
    Write,
}

/// One storage cell: a contract address plus a slot.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConflictKey {
    pub contract: Address,
    pub slot: Hash,
}

/// Last-touching transaction and how it touched the cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictValue {
    pub tx: TxHash,
    pub status: ConflictStatus,
}

/// Best-effort parallel-safety classifier for transactions in one proposal
/// cycle.
///
/// `load`/`store` return false when the access conflicts with another
/// transaction. A lost CAS race may report a conflict that does not exist
/// (serial execution is always safe), but a reported "no conflict" is
/// reliable because every promotion goes through a compare-and-swap.
pub struct ConflictDetector {
    cells: ShardedMap<ConflictKey, ConflictValue>,
}

impl ConflictDetector {
    pub fn new(stripe_exponent: u32) -> Self {
        Self {
            cells: ShardedMap::new(stripe_exponent),
        }
    }

    /// Record a read of `(contract, slot)` by `tx`.
    pub fn load(&self, contract: Address, slot: Hash, tx: TxHash) -> bool {
        let key = ConflictKey { contract, slot };
        match self.cells.get(&key) {
            // First touch: claim the cell as read. Losing the race is a
            // conflict (possibly a false one).
            None => self.cells.compare_and_swap(
                key,
                None,
                ConflictValue {
                    tx,
                    status: ConflictStatus::Read,
                },
            ),
            Some(old) if old.tx == tx => true,
            Some(old) => match old.status {
                ConflictStatus::Shared => true,
                ConflictStatus::Write => false,
                ConflictStatus::Read => {
                    // Promote read → shared; the original reader stays on
                    // record as the first toucher.
                    self.cells.try_update(
                        &key,
                        &old,
                        ConflictValue {
                            tx: old.tx,
                            status: ConflictStatus::Shared,
                        },
                    )
                }
            },
        }
    }

    /// Record a write of `(contract, slot)` by `tx`.
    pub fn store(&self, contract: Address, slot: Hash, tx: TxHash) -> bool {
        let key = ConflictKey { contract, slot };
        match self.cells.get(&key) {
            None => self.cells.compare_and_swap(
                key,
                None,
                ConflictValue {
                    tx,
                    status: ConflictStatus::Write,
                },
            ),
            Some(old) => match old.status {
                // A lone read — ours or foreign — is overtaken by the write.
                ConflictStatus::Read => self.cells.try_update(
                    &key,
                    &old,
                    ConflictValue {
                        tx,
                        status: ConflictStatus::Write,
                    },
                ),
                ConflictStatus::Write => old.tx == tx,
                ConflictStatus::Shared => false,
            },
        }
    }

    /// Forget everything; called between proposal cycles.
    pub fn reset(&self) {
        self.cells.clear();
    }

    pub fn cell_count(&self) -> u64 {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(n: u8) -> TxHash {
        TxHash::from_bytes([n; 32])
    }

    fn cell() -> (Address, Hash) {
        (Address::from_bytes([1; 20]), Hash::from_bytes([2; 32]))
    }

    #[test]
    fn load_store_load_sequence() {
        let det = ConflictDetector::new(2);
        let (c, s) = cell();

        assert!(det.load(c, s, tx(1)), "first load claims the cell");
        // T2's store overtakes the lone read...
        assert!(det.store(c, s, tx(2)));
        // ...so T1's next read hits a foreign write and conflicts.
        assert!(!det.load(c, s, tx(1)));
    }

    #[test]
    fn absent_store_then_foreign_load_conflicts() {
        let det = ConflictDetector::new(2);
        let (c, s) = cell();
        assert!(det.store(c, s, tx(2)), "first store claims the cell");
        assert!(!det.load(c, s, tx(1)), "load against foreign write conflicts");
        assert!(det.load(c, s, tx(2)), "owner may re-read its own write");
    }

    #[test]
    fn two_readers_promote_to_shared() {
        let det = ConflictDetector::new(2);
        let (c, s) = cell();
        assert!(det.load(c, s, tx(1)));
        assert!(det.load(c, s, tx(2)), "second reader promotes to shared");
        assert!(det.load(c, s, tx(3)), "shared cell accepts more readers");
        // The first toucher can no longer upgrade to a write.
        assert!(!det.store(c, s, tx(1)));
        assert!(!det.store(c, s, tx(3)));
    }

    #[test]
    fn owner_upgrades_own_read_to_write() {
        let det = ConflictDetector::new(2);
        let (c, s) = cell();
        assert!(det.load(c, s, tx(1)));
        assert!(det.store(c, s, tx(1)), "sole reader may upgrade");
        assert!(det.store(c, s, tx(1)), "writer may rewrite");
        assert!(!det.load(c, s, tx(2)));
    }

    #[test]
    fn reset_clears_cells() {
        let det = ConflictDetector::new(2);
        let (c, s) = cell();
        assert!(det.store(c, s, tx(1)));
        det.reset();
        assert_eq!(det.cell_count(), 0);
        assert!(det.store(c, s, tx(2)), "cell reclaimed after reset");
    }
}

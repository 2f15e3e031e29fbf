use std::collections::VecDeque;

use parking_lot::RwLock;

use arbor_core::pbft_block::{PbftBlock, PeriodData};
use arbor_core::types::{PeerTag, Period};
use arbor_core::vote::Vote;

struct QueueInner {
    period: Period,
    queue: VecDeque<(PeriodData, PeerTag)>,
    /// Cert votes for the newest queued block; every older block takes its
    /// cert votes from the entry behind it.
    last_block_cert_votes: Vec<Vote>,
}

/// FIFO buffer of synced periods awaiting insertion into the chain.
///
/// A block's cert votes travel inside the *next* block (as its
/// previous-block votes), so `pop` pairs the oldest entry with the votes
/// carried by its successor; the newest entry's votes live in a dedicated
/// slot until that successor arrives.
pub struct PeriodDataQueue {
    inner: RwLock<QueueInner>,
}

impl PeriodDataQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(QueueInner {
                period: 0,
                queue: VecDeque::new(),
                last_block_cert_votes: Vec::new(),
            }),
        }
    }

    pub fn period(&self) -> Period {
        self.inner.read().period
    }

    /// Entries ready to pop: a block counts only when its cert votes are
    /// available (from the next entry or the dedicated slot).
    pub fn size(&self) -> usize {
        let inner = self.inner.read();
        if !inner.last_block_cert_votes.is_empty() || inner.queue.is_empty() {
            inner.queue.len()
        } else {
            inner.queue.len() - 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().queue.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.period = 0;
        inner.queue.clear();
        inner.last_block_cert_votes.clear();
    }

    /// Accept the next period in sequence; anything else is rejected.
    /// A chain that jumped past the queued range flushes the queue first.
    pub fn push(
        &self,
        period_data: PeriodData,
        peer: PeerTag,
        chain_size: Period,
        cert_votes: Vec<Vote>,
    ) -> bool {
        let period = period_data.period();
        let mut inner = self.inner.write();
        if period != inner.period.max(chain_size) + 1 {
            return false;
        }
        if chain_size > inner.period && !inner.queue.is_empty() {
            inner.queue.clear();
        }
        inner.period = period;
        inner.queue.push_back((period_data, peer));
        inner.last_block_cert_votes = cert_votes;
        true
    }

    /// Oldest entry plus the cert votes proving its block.
    pub fn pop(&self) -> Option<(PeriodData, Vec<Vote>, PeerTag)> {
        let mut inner = self.inner.write();
        let (data, peer) = inner.queue.pop_front()?;
        let votes = match inner.queue.front() {
            Some((next, _)) => next.previous_cert_votes.clone(),
            None => inner.last_block_cert_votes.clone(),
        };
        Some((data, votes, peer))
    }

    pub fn last_block(&self) -> Option<PbftBlock> {
        self.inner
            .read()
            .queue
            .back()
            .map(|(data, _)| data.pbft_block.clone())
    }
}

impl Default for PeriodDataQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::types::{Address, BlockHash, Hash, Signature, VrfProof, NULL_BLOCK_HASH};
    use arbor_core::vote::VoteType;

    fn pbft_block(period: Period, tag: u8) -> PbftBlock {
        PbftBlock {
            hash: BlockHash::from_bytes([tag; 32]),
            period,
            prev_block_hash: NULL_BLOCK_HASH,
            anchor_hash: NULL_BLOCK_HASH,
            order_hash: Hash::default(),
            proposer: Address::from_bytes([1; 20]),
            reward_votes: Vec::new(),
            timestamp: 0,
            signature: Signature(vec![0; 65]),
        }
    }

    fn cert_vote(period: Period, tag: u8) -> Vote {
        Vote {
            hash: Hash::from_bytes([tag; 32]),
            period,
            round: 1,
            step: 3,
            vote_type: VoteType::Cert,
            block_hash: BlockHash::from_bytes([tag; 32]),
            vrf: VrfProof::default(),
            signature: Signature(vec![0; 65]),
            voter: Address::from_bytes([2; 20]),
            weight: Some(1),
        }
    }

    fn period_data(period: Period, tag: u8, prev_votes: Vec<Vote>) -> PeriodData {
        let mut pd = PeriodData::new(pbft_block(period, tag));
        pd.previous_cert_votes = prev_votes;
        pd
    }

    #[test]
    fn gap_rejection_and_cert_vote_pairing() {
        let queue = PeriodDataQueue::new();
        let chain_size = 10;

        assert!(
            !queue.push(period_data(12, 12, vec![]), "peer-a".into(), chain_size, vec![]),
            "period 12 rejected while 11 is expected"
        );
        assert!(queue.push(
            period_data(11, 11, vec![]),
            "peer-a".into(),
            chain_size,
            vec![cert_vote(11, 0xB1)]
        ));
        // Period 12 carries period 11's cert votes in its previous slot.
        assert!(queue.push(
            period_data(12, 12, vec![cert_vote(11, 0xB1)]),
            "peer-a".into(),
            chain_size,
            vec![cert_vote(12, 0xB2)]
        ));

        let (data, votes, peer) = queue.pop().unwrap();
        assert_eq!(data.period(), 11);
        assert_eq!(peer, "peer-a");
        // votes for period 11 came from the period-12 entry
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].period, 11);
    }

    #[test]
    fn last_entry_votes_come_from_dedicated_slot() {
        let queue = PeriodDataQueue::new();
        assert!(queue.push(
            period_data(1, 1, vec![]),
            "p".into(),
            0,
            vec![cert_vote(1, 0xC1)]
        ));
        let (data, votes, _) = queue.pop().unwrap();
        assert_eq!(data.period(), 1);
        assert_eq!(votes[0].period, 1);
    }

    #[test]
    fn size_counts_only_blocks_with_votes() {
        let queue = PeriodDataQueue::new();
        queue.push(period_data(1, 1, vec![]), "p".into(), 0, vec![]);
        // the only entry has no cert votes anywhere yet
        assert_eq!(queue.size(), 0);
        queue.push(
            period_data(2, 2, vec![cert_vote(1, 0xC1)]),
            "p".into(),
            0,
            vec![],
        );
        // entry 1's votes are now inside entry 2, entry 2's are still missing
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn chain_jump_clears_stale_entries() {
        let queue = PeriodDataQueue::new();
        queue.push(period_data(1, 1, vec![]), "p".into(), 0, vec![]);
        queue.push(period_data(2, 2, vec![]), "p".into(), 0, vec![]);
        // chain advanced to 5 elsewhere; next pushable period is 6
        assert!(!queue.push(period_data(3, 3, vec![]), "p".into(), 5, vec![]));
        assert!(queue.push(period_data(6, 6, vec![]), "p".into(), 5, vec![]));
        // the jump flushed periods 1 and 2
        assert_eq!(queue.last_block().unwrap().period, 6);
        let (data, _, _) = queue.pop().unwrap();
        assert_eq!(data.period(), 6);
    }
}

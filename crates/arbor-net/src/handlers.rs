use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use arbor_consensus::PbftManager;
use arbor_core::error::ArborError;
use arbor_core::transaction::Transaction;
use arbor_core::types::{BlockHash, PeerTag};
use arbor_crypto::{keccak256, recover_address};
use arbor_dag::DagBlockManager;
use arbor_pool::{RecentlyFinalized, TransactionPool};
use arbor_storage::DbStorage;

use crate::message::NetMessage;
use crate::peer::PeerTable;

/// Typed inbound packet handlers driving the engines.
///
/// `handle` returns the replies owed to the sending peer; a
/// `MalformedInput` error tells the caller to disconnect that peer.
pub struct GossipHandlers {
    genesis: BlockHash,
    dag: Arc<DagBlockManager>,
    pool: Arc<TransactionPool>,
    recently_finalized: Arc<RecentlyFinalized>,
    pbft: Arc<PbftManager>,
    storage: Arc<DbStorage>,
    peers: Arc<PeerTable>,
    syncing: Arc<AtomicBool>,
    sync_level_size: u64,
}

impl GossipHandlers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        genesis: BlockHash,
        dag: Arc<DagBlockManager>,
        pool: Arc<TransactionPool>,
        recently_finalized: Arc<RecentlyFinalized>,
        pbft: Arc<PbftManager>,
        storage: Arc<DbStorage>,
        peers: Arc<PeerTable>,
        syncing: Arc<AtomicBool>,
        sync_level_size: u64,
    ) -> Self {
        Self {
            genesis,
            dag,
            pool,
            recently_finalized,
            pbft,
            storage,
            peers,
            syncing,
            sync_level_size,
        }
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Dispatch one inbound message. `Err(MalformedInput)` means the peer
    /// must be disconnected; every other error was already absorbed.
    pub fn handle(
        &self,
        peer_tag: &PeerTag,
        msg: NetMessage,
    ) -> Result<Vec<NetMessage>, ArborError> {
        let peer = self.peers.register(peer_tag.clone());
        trace!(peer = %peer_tag, kind = msg.kind(), "inbound packet");

        match msg {
            NetMessage::Status {
                genesis,
                period,
                round,
                syncing,
            } => {
                if genesis != self.genesis {
                    return Err(ArborError::MalformedInput(format!(
                        "peer on foreign chain {genesis}"
                    )));
                }
                peer.update_status(period, round, syncing);

                // Fall behind by more than one period: start pulling.
                let our_period = self.pbft.period();
                if period > our_period {
                    self.syncing.store(true, Ordering::Release);
                    return Ok(vec![NetMessage::GetPbftSync {
                        from_period: our_period,
                    }]);
                }
                self.syncing.store(false, Ordering::Release);
                Ok(Vec::new())
            }

            NetMessage::Transaction(tx) => {
                peer.mark_tx_known(&tx.hash);
                self.accept_transaction(*tx)?;
                Ok(Vec::new())
            }

            NetMessage::DagBlock(blk) => {
                peer.mark_dag_block_known(&blk.hash);
                let level = blk.level;
                match self.dag.push_unverified(*blk) {
                    Ok(()) => {
                        self.dag.notify();
                    }
                    Err(ArborError::MalformedInput(e)) => {
                        return Err(ArborError::MalformedInput(e));
                    }
                    Err(ArborError::Duplicate(_)) => {}
                    Err(e) => debug!(error = %e, "dag block not accepted"),
                }
                // A block far past our frontier means we miss history.
                let max_level = self.dag.max_level();
                if level > max_level + self.sync_level_size {
                    return Ok(vec![NetMessage::GetDagSync {
                        from_level: max_level + 1,
                        to_level: level,
                    }]);
                }
                Ok(Vec::new())
            }

            NetMessage::GetDagSync {
                from_level,
                to_level,
            } => {
                let to = to_level.min(from_level + self.sync_level_size);
                let blocks = self.dag.blocks_in_level_range(from_level, to);
                let mut transactions = Vec::new();
                for blk in &blocks {
                    for tx_hash in &blk.transactions {
                        if let Some(tx) = self.pool.get(tx_hash) {
                            transactions.push(tx);
                        } else if let Some(tx) = self.storage.get_transaction(tx_hash)? {
                            transactions.push(tx);
                        }
                    }
                }
                if blocks.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![NetMessage::DagSync {
                    blocks,
                    transactions,
                }])
            }

            NetMessage::DagSync {
                blocks,
                transactions,
            } => {
                for tx in transactions {
                    if let Err(e) = self.accept_transaction(tx) {
                        debug!(error = %e, "synced transaction rejected");
                    }
                }
                for blk in blocks {
                    peer.mark_dag_block_known(&blk.hash);
                    match self.dag.push_unverified(blk) {
                        Ok(()) | Err(ArborError::Duplicate(_)) => {}
                        Err(e) => debug!(error = %e, "synced dag block rejected"),
                    }
                }
                self.dag.notify();
                Ok(Vec::new())
            }

            NetMessage::Vote(vote) => {
                peer.mark_vote_known(&vote.hash);
                match self.pbft.handle_incoming_vote(*vote) {
                    Ok(()) | Err(ArborError::Duplicate(_)) | Err(ArborError::StaleEpoch { .. }) => {
                        Ok(Vec::new())
                    }
                    Err(ArborError::MalformedInput(e)) => Err(ArborError::MalformedInput(e)),
                    Err(e) => {
                        debug!(error = %e, "vote dropped");
                        Ok(Vec::new())
                    }
                }
            }

            NetMessage::VotesSync { votes } => {
                if votes.is_empty() {
                    return Err(ArborError::MalformedInput("empty vote bundle".into()));
                }
                let (period, round) = (votes[0].period, votes[0].round);
                if votes.iter().any(|v| v.period != period || v.round != round) {
                    return Err(ArborError::MalformedInput(
                        "vote bundle mixes rounds".into(),
                    ));
                }
                peer.record_vote_bundle();
                for vote in votes {
                    peer.mark_vote_known(&vote.hash);
                    match self.pbft.handle_incoming_vote(vote) {
                        Ok(())
                        | Err(ArborError::Duplicate(_))
                        | Err(ArborError::StaleEpoch { .. }) => {}
                        Err(ArborError::MalformedInput(e)) => {
                            return Err(ArborError::MalformedInput(e))
                        }
                        Err(e) => debug!(error = %e, "bundle vote dropped"),
                    }
                }
                Ok(Vec::new())
            }

            NetMessage::PbftBlock(block) => {
                peer.mark_pbft_block_known(&block.hash);
                match self.pbft.handle_incoming_pbft_block(*block) {
                    Ok(()) | Err(ArborError::Duplicate(_)) | Err(ArborError::StaleEpoch { .. }) => {
                        Ok(Vec::new())
                    }
                    Err(ArborError::MalformedInput(e)) => Err(ArborError::MalformedInput(e)),
                    Err(e) => {
                        debug!(error = %e, "pbft block dropped");
                        Ok(Vec::new())
                    }
                }
            }

            NetMessage::GetPbftSync { from_period } => {
                let mut replies = Vec::new();
                let mut period = from_period.max(1);
                let limit = period + self.sync_level_size;
                while period < limit {
                    let Some(data) = self.storage.get_period_data(period)? else {
                        break;
                    };
                    let cert_votes = self.storage.get_cert_votes(period)?;
                    replies.push(NetMessage::PbftSync {
                        period_data: Box::new(data),
                        cert_votes,
                    });
                    period += 1;
                }
                Ok(replies)
            }

            NetMessage::PbftSync {
                period_data,
                cert_votes,
            } => {
                match self
                    .pbft
                    .handle_period_data(*period_data, peer_tag.clone(), cert_votes)
                {
                    Ok(()) => {}
                    Err(e) => debug!(error = %e, "synced period not queued"),
                }
                Ok(Vec::new())
            }
        }
    }

    /// Drop a disconnected or misbehaving peer.
    pub fn disconnect(&self, peer_tag: &PeerTag) {
        warn!(peer = %peer_tag, "disconnecting peer");
        self.peers.remove(peer_tag);
    }

    fn accept_transaction(&self, tx: Transaction) -> Result<(), ArborError> {
        if self.recently_finalized.contains(&tx.hash) {
            return Ok(());
        }
        if keccak256(&tx.hashed_bytes()) != tx.hash {
            return Err(ArborError::MalformedInput("transaction hash mismatch".into()));
        }
        let sender = recover_address(&keccak256(&tx.body_bytes()), &tx.signature)?;
        if sender != tx.sender {
            return Err(ArborError::MalformedInput(
                "transaction sender mismatch".into(),
            ));
        }
        if self.storage.transaction_finalized(&tx.hash) {
            return Ok(());
        }
        self.pool.insert(tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_consensus::{FinalChain, HashFoldExecutor, NullOutbound, PbftChain, PeriodDataQueue, VoteManager};
    use arbor_core::config::{DagGenesisConfig, PbftConfig, VdfConfig};
    use arbor_core::dpos::{DposQuery, StakeTable};
    use arbor_core::types::Signature;
    use arbor_crypto::KeyPair;

    struct Stack {
        handlers: GossipHandlers,
        pool: Arc<TransactionPool>,
        keypair: Arc<KeyPair>,
        dir: std::path::PathBuf,
    }

    fn build_stack() -> Stack {
        let dir = std::env::temp_dir().join(format!("arbor_net_{}", rand::random::<u32>()));
        let storage = Arc::new(DbStorage::open(&dir).unwrap());
        let keypair = Arc::new(KeyPair::generate());
        let dpos: Arc<dyn DposQuery> = Arc::new(StakeTable::single(keypair.address, 100));
        let pool = Arc::new(TransactionPool::new(1000));
        let vdf_cfg = VdfConfig {
            difficulty_min: 0,
            difficulty_max: 1,
            difficulty_stale: 2,
            threshold_selection: 0xFFFF,
            threshold_vdf_omit: 0x8000,
            lambda_bound: 16,
        };
        let dag = Arc::new(DagBlockManager::new(
            &DagGenesisConfig::default(),
            vdf_cfg,
            10_000_000,
            1024,
            Arc::clone(&dpos),
            Arc::clone(&pool) as Arc<dyn arbor_dag::TxAvailability>,
        ));
        let vote_mgr = Arc::new(VoteManager::new(1, 1, Arc::clone(&dpos), None));
        let final_chain = Arc::new(
            FinalChain::new(Arc::clone(&storage), Arc::new(HashFoldExecutor::new(2)), 100).unwrap(),
        );
        let recently_finalized = Arc::new(RecentlyFinalized::new(100));
        let pbft = Arc::new(PbftManager::new(
            PbftConfig {
                committee_size: 1,
                number_of_proposers: 1,
                dag_blocks_size: 100,
                ghost_path_move_back: 0,
                lambda_ms_min: 1000,
                gas_limit: 10_000_000,
            },
            Arc::clone(&keypair),
            dpos,
            vote_mgr,
            Arc::new(PbftChain::new()),
            Arc::new(PeriodDataQueue::new()),
            Arc::clone(&dag),
            Arc::clone(&pool),
            final_chain,
            Arc::clone(&recently_finalized),
            Arc::new(NullOutbound),
            Arc::clone(&storage),
        ));
        let genesis = dag.genesis_hash();
        let handlers = GossipHandlers::new(
            genesis,
            dag,
            Arc::clone(&pool),
            recently_finalized,
            pbft,
            storage,
            Arc::new(PeerTable::new()),
            Arc::new(AtomicBool::new(false)),
            25,
        );
        Stack {
            handlers,
            pool,
            keypair,
            dir,
        }
    }

    fn signed_tx(kp: &KeyPair, nonce: u64) -> Transaction {
        let mut tx = Transaction {
            hash: Default::default(),
            nonce,
            value: 10,
            gas_limit: 21_000,
            gas_price: 1,
            receiver: None,
            payload: Vec::new(),
            signature: Signature::default(),
            sender: kp.address,
        };
        tx.signature = kp.sign_hash(&keccak256(&tx.body_bytes()));
        tx.hash = keccak256(&tx.hashed_bytes());
        tx
    }

    #[test]
    fn status_on_foreign_chain_disconnects() {
        let stack = build_stack();
        let result = stack.handlers.handle(
            &"peer".to_string(),
            NetMessage::Status {
                genesis: BlockHash::from_bytes([0xBA; 32]),
                period: 1,
                round: 1,
                syncing: false,
            },
        );
        assert!(matches!(result, Err(ArborError::MalformedInput(_))));
        let _ = std::fs::remove_dir_all(&stack.dir);
    }

    #[test]
    fn ahead_peer_triggers_pbft_sync_request() {
        let stack = build_stack();
        let replies = stack
            .handlers
            .handle(
                &"peer".to_string(),
                NetMessage::Status {
                    genesis: stack.handlers.genesis,
                    period: 50,
                    round: 1,
                    syncing: false,
                },
            )
            .unwrap();
        assert!(matches!(
            replies.as_slice(),
            [NetMessage::GetPbftSync { from_period: 1 }]
        ));
        let _ = std::fs::remove_dir_all(&stack.dir);
    }

    #[test]
    fn valid_transaction_lands_in_pool() {
        let stack = build_stack();
        let tx = signed_tx(&stack.keypair, 0);
        let hash = tx.hash;
        stack
            .handlers
            .handle(&"peer".to_string(), NetMessage::Transaction(Box::new(tx)))
            .unwrap();
        assert!(stack.pool.contains(&hash));
        let _ = std::fs::remove_dir_all(&stack.dir);
    }

    #[test]
    fn tampered_transaction_disconnects() {
        let stack = build_stack();
        let mut tx = signed_tx(&stack.keypair, 0);
        tx.value = 999; // body no longer matches hash/signature
        let result = stack
            .handlers
            .handle(&"peer".to_string(), NetMessage::Transaction(Box::new(tx)));
        assert!(matches!(result, Err(ArborError::MalformedInput(_))));
        let _ = std::fs::remove_dir_all(&stack.dir);
    }

    #[test]
    fn empty_vote_bundle_disconnects() {
        let stack = build_stack();
        let result = stack
            .handlers
            .handle(&"peer".to_string(), NetMessage::VotesSync { votes: Vec::new() });
        assert!(matches!(result, Err(ArborError::MalformedInput(_))));
        let _ = std::fs::remove_dir_all(&stack.dir);
    }

    #[test]
    fn peer_bookkeeping_tracks_status() {
        let stack = build_stack();
        stack
            .handlers
            .handle(
                &"peer".to_string(),
                NetMessage::Status {
                    genesis: stack.handlers.genesis,
                    period: 1,
                    round: 3,
                    syncing: true,
                },
            )
            .unwrap();
        let peer = stack.handlers.peers().get(&"peer".to_string()).unwrap();
        assert_eq!(peer.round(), 3);
        assert!(peer.is_syncing());
        let _ = std::fs::remove_dir_all(&stack.dir);
    }
}

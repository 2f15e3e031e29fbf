use serde::{Deserialize, Serialize};

use arbor_core::dag_block::DagBlock;
use arbor_core::pbft_block::{PbftBlock, PeriodData};
use arbor_core::transaction::Transaction;
use arbor_core::types::{BlockHash, Level, Period, Round};
use arbor_core::vote::Vote;

/// Dispatch tier of an inbound packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketPriority {
    /// Consensus votes: never starved.
    High = 0,
    /// Blocks and transactions.
    Mid = 1,
    /// Syncing and status chatter.
    Low = 2,
}

/// Messages exchanged over the gossip network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetMessage {
    /// Periodic peer summary.
    Status {
        genesis: BlockHash,
        period: Period,
        round: Round,
        syncing: bool,
    },

    /// A single signed transaction.
    Transaction(Box<Transaction>),

    /// A new DAG block proposal.
    DagBlock(Box<DagBlock>),

    /// Request non-finalized DAG blocks in a level window.
    GetDagSync { from_level: Level, to_level: Level },

    /// Level-ordered DAG blocks plus the transactions they reference.
    DagSync {
        blocks: Vec<DagBlock>,
        transactions: Vec<Transaction>,
    },

    /// A single consensus vote.
    Vote(Box<Vote>),

    /// Vote bundle from a prior round (catch-up aid).
    VotesSync { votes: Vec<Vote> },

    /// A proposed (not yet finalized) PBFT block.
    PbftBlock(Box<PbftBlock>),

    /// Request finalized periods starting at `from_period`.
    GetPbftSync { from_period: Period },

    /// One finalized period with the votes proving it.
    PbftSync {
        period_data: Box<PeriodData>,
        cert_votes: Vec<Vote>,
    },
}

impl NetMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("message serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn priority(&self) -> PacketPriority {
        match self {
            NetMessage::Vote(_) | NetMessage::VotesSync { .. } => PacketPriority::High,
            NetMessage::Transaction(_) | NetMessage::DagBlock(_) | NetMessage::PbftBlock(_) => {
                PacketPriority::Mid
            }
            NetMessage::Status { .. }
            | NetMessage::GetDagSync { .. }
            | NetMessage::DagSync { .. }
            | NetMessage::GetPbftSync { .. }
            | NetMessage::PbftSync { .. } => PacketPriority::Low,
        }
    }

    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NetMessage::Status { .. } => "status",
            NetMessage::Transaction(_) => "transaction",
            NetMessage::DagBlock(_) => "dag_block",
            NetMessage::GetDagSync { .. } => "get_dag_sync",
            NetMessage::DagSync { .. } => "dag_sync",
            NetMessage::Vote(_) => "vote",
            NetMessage::VotesSync { .. } => "votes_sync",
            NetMessage::PbftBlock(_) => "pbft_block",
            NetMessage::GetPbftSync { .. } => "get_pbft_sync",
            NetMessage::PbftSync { .. } => "pbft_sync",
        }
    }
}

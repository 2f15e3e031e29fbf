pub mod chain;
pub mod final_chain;
pub mod pbft;
pub mod period_queue;
pub mod vote_manager;

pub use chain::PbftChain;
pub use final_chain::{ExecutionBatch, ExecutionOutput, FinalChain, HashFoldExecutor, StateExecutor};
pub use pbft::manager::{ConsensusOutbound, NullOutbound, PbftManager};
pub use pbft::step::Step;
pub use period_queue::PeriodDataQueue;
pub use vote_manager::{TwoTPlusOneVotedBlockType, VoteManager};

pub mod graph;
pub mod manager;
pub mod proposer;

pub use graph::{Dag, DagFrontier};
pub use manager::{DagBlockManager, TxAvailability};
pub use proposer::BlockProposer;

pub mod config;
pub mod constants;
pub mod dag_block;
pub mod dpos;
pub mod error;
pub mod pbft_block;
pub mod transaction;
pub mod types;
pub mod vote;

pub use config::NodeConfig;
pub use error::ArborError;
pub use types::{Address, BlockHash, Hash, TxHash, VoteHash, NULL_BLOCK_HASH};

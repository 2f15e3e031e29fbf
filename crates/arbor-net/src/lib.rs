pub mod config;
pub mod handlers;
pub mod message;
pub mod network;
pub mod peer;
pub mod priority_pool;

pub use config::NetConfig;
pub use handlers::GossipHandlers;
pub use message::{NetMessage, PacketPriority};
pub use network::{GossipOutbound, Network, NetworkHandle};
pub use peer::{PeerState, PeerTable};
pub use priority_pool::PriorityThreadPool;

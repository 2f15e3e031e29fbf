use arbor_core::config::{ChainId, NetworkConfig};

/// Transport-level settings derived from the node's network config section.
#[derive(Clone, Debug)]
pub struct NetConfig {
    pub listen_addr: String,
    pub boot_nodes: Vec<String>,
    pub protocol_version: String,
    pub topic: String,
    pub ideal_peer_count: usize,
    pub max_peer_count: usize,
    pub sync_level_size: u64,
}

impl NetConfig {
    pub fn from_node_config(cfg: &NetworkConfig, chain: ChainId) -> Self {
        let chain_tag = match chain {
            ChainId::Main => "main",
            ChainId::Testnet => "testnet",
            ChainId::Devnet => "devnet",
        };
        Self {
            listen_addr: format!("/ip4/0.0.0.0/tcp/{}", cfg.network_tcp_port),
            boot_nodes: cfg.network_boot_nodes.clone(),
            protocol_version: format!("/arbor/{chain_tag}/1.0.0"),
            topic: format!("arbor-{chain_tag}"),
            ideal_peer_count: cfg.network_ideal_peer_count,
            max_peer_count: cfg.network_max_peer_count,
            sync_level_size: cfg.network_sync_level_size,
        }
    }
}

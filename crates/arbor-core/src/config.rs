use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_BLOCK_GAS_LIMIT;
use crate::error::ArborError;
use crate::types::{GasAmount, Hash, Level, Timestamp};

/// Which public network the node joins.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Main,
    Testnet,
    #[default]
    Devnet,
}

impl std::str::FromStr for ChainId {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(ChainId::Main),
            "testnet" => Ok(ChainId::Testnet),
            "devnet" => Ok(ChainId::Devnet),
            other => Err(ArborError::Config(format!("unknown chain: {other}"))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub network_tcp_port: u16,
    pub network_udp_port: u16,
    pub network_ideal_peer_count: usize,
    pub network_max_peer_count: usize,
    #[serde(default)]
    pub network_boot_nodes: Vec<String>,
    /// Levels per DAG sync response batch.
    pub network_sync_level_size: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_tcp_port: 10002,
            network_udp_port: 10002,
            network_ideal_peer_count: 10,
            network_max_peer_count: 50,
            network_boot_nodes: Vec::new(),
            network_sync_level_size: 25,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcConfig {
    pub http_port: u16,
    pub ws_port: u16,
    pub threads_num: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            http_port: 7777,
            ws_port: 8777,
            threads_num: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockProposerConfig {
    /// Which transaction shard this proposer packs (`sender mod total_shards`).
    pub shard: u64,
    /// How many shards the sender space is split into.
    #[serde(default = "default_total_shards")]
    pub total_shards: u64,
    /// Max transactions pulled from the pool per proposal.
    pub transaction_limit: usize,
}

fn default_total_shards() -> u64 {
    1
}

impl Default for BlockProposerConfig {
    fn default() -> Self {
        Self {
            shard: 0,
            total_shards: 1,
            transaction_limit: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TestParams {
    #[serde(default)]
    pub block_proposer: BlockProposerConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PbftConfig {
    /// Expected committee weight per agreement step.
    pub committee_size: u64,
    /// Expected proposer weight for the propose step.
    pub number_of_proposers: u64,
    /// Max DAG blocks one PBFT block may finalize.
    pub dag_blocks_size: u64,
    /// Anchor walk-back along the ghost path, for slow peers.
    pub ghost_path_move_back: u64,
    /// Base lambda (ms) of the step timer.
    pub lambda_ms_min: u64,
    /// Per-PBFT-block gas cap.
    pub gas_limit: GasAmount,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            committee_size: 5,
            number_of_proposers: 20,
            dag_blocks_size: 100,
            ghost_path_move_back: 1,
            lambda_ms_min: 500,
            gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VdfConfig {
    pub difficulty_min: u16,
    pub difficulty_max: u16,
    /// Difficulty assigned when the selector lands in the stale band.
    pub difficulty_stale: u16,
    /// 16-bit selector bound above which the stale difficulty is drawn.
    pub threshold_selection: u16,
    /// 16-bit selector bound below which the delay is omitted entirely.
    pub threshold_vdf_omit: u16,
    /// Iterations multiplier of the hash chain (per difficulty bit).
    pub lambda_bound: u64,
}

impl Default for VdfConfig {
    fn default() -> Self {
        Self {
            difficulty_min: 1,
            difficulty_max: 8,
            difficulty_stale: 10,
            threshold_selection: 0xE000,
            threshold_vdf_omit: 0x0400,
            lambda_bound: 100,
        }
    }
}

/// Payload of the very first DAG block, fixed by the chain config.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DagGenesisConfig {
    pub pivot: Hash,
    pub level: Level,
    pub timestamp: Timestamp,
}

impl Default for DagGenesisConfig {
    fn default() -> Self {
        Self {
            pivot: Hash::default(),
            level: 0,
            timestamp: 1_704_067_200, // 2024-01-01 00:00:00 UTC
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChainConfig {
    #[serde(default)]
    pub pbft: PbftConfig,
    #[serde(default)]
    pub vdf: VdfConfig,
    #[serde(default)]
    pub dag_genesis_block: DagGenesisConfig,
    /// Genesis delegation state; stands in for the on-chain contract.
    #[serde(default)]
    pub dpos: crate::dpos::DposConfig,
}

/// Top-level node configuration, loaded from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub chain: ChainId,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub test_params: TestParams,
    #[serde(default)]
    pub chain_config: ChainConfig,
}

impl NodeConfig {
    /// Built-in parameters of the public chains. A config file overrides
    /// everything; this is the zero-config starting point.
    pub fn for_chain(chain: ChainId) -> Self {
        let mut cfg = NodeConfig {
            chain,
            ..Default::default()
        };
        match chain {
            ChainId::Devnet => {
                cfg.chain_config.pbft = PbftConfig {
                    committee_size: 1000,
                    number_of_proposers: 20,
                    dag_blocks_size: 50,
                    ghost_path_move_back: 0,
                    lambda_ms_min: 666,
                    gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
                };
                cfg.chain_config.vdf = VdfConfig {
                    difficulty_min: 16,
                    difficulty_max: 18,
                    difficulty_stale: 19,
                    threshold_selection: 0xBFFD,
                    threshold_vdf_omit: 0x6BF7,
                    lambda_bound: 100,
                };
            }
            ChainId::Testnet => {
                cfg.chain_config.pbft = PbftConfig {
                    committee_size: 1000,
                    number_of_proposers: 20,
                    dag_blocks_size: 100,
                    ghost_path_move_back: 1,
                    lambda_ms_min: 1500,
                    gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
                };
                cfg.chain_config.vdf = VdfConfig {
                    difficulty_min: 16,
                    difficulty_max: 21,
                    difficulty_stale: 22,
                    threshold_selection: 0xBFFD,
                    threshold_vdf_omit: 0x6BF7,
                    lambda_bound: 100,
                };
            }
            ChainId::Main => {
                cfg.chain_config.pbft = PbftConfig {
                    committee_size: 1000,
                    number_of_proposers: 20,
                    dag_blocks_size: 100,
                    ghost_path_move_back: 1,
                    lambda_ms_min: 1500,
                    gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
                };
                cfg.chain_config.vdf = VdfConfig {
                    difficulty_min: 16,
                    difficulty_max: 21,
                    difficulty_stale: 23,
                    threshold_selection: 0xBFFD,
                    threshold_vdf_omit: 0x6BF7,
                    lambda_bound: 1500,
                };
            }
        }
        cfg
    }

    pub fn parse_json(json: &str) -> Result<Self, ArborError> {
        let cfg: NodeConfig =
            serde_json::from_str(json).map_err(|e| ArborError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn write_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("config serialization is infallible")
    }

    pub fn validate(&self) -> Result<(), ArborError> {
        let pbft = &self.chain_config.pbft;
        if pbft.committee_size == 0 {
            return Err(ArborError::Config("committee_size must be > 0".into()));
        }
        if pbft.number_of_proposers == 0 {
            return Err(ArborError::Config("number_of_proposers must be > 0".into()));
        }
        if pbft.lambda_ms_min == 0 {
            return Err(ArborError::Config("lambda_ms_min must be > 0".into()));
        }
        let vdf = &self.chain_config.vdf;
        if vdf.difficulty_min > vdf.difficulty_max {
            return Err(ArborError::Config(
                "vdf difficulty_min must not exceed difficulty_max".into(),
            ));
        }
        if vdf.difficulty_stale < vdf.difficulty_max {
            return Err(ArborError::Config(
                "vdf difficulty_stale must be at least difficulty_max".into(),
            ));
        }
        if self.network.network_max_peer_count < self.network.network_ideal_peer_count {
            return Err(ArborError::Config(
                "max_peer_count must be at least ideal_peer_count".into(),
            ));
        }
        if self.rpc.threads_num == 0 {
            return Err(ArborError::Config("rpc threads_num must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_is_identity() {
        let cfg = NodeConfig::default();
        let json = cfg.write_json();
        let back = NodeConfig::parse_json(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn missing_sections_take_defaults() {
        let cfg = NodeConfig::parse_json("{}").unwrap();
        assert_eq!(cfg.chain_config.pbft.lambda_ms_min, 500);
        assert_eq!(cfg.network.network_sync_level_size, 25);
    }

    #[test]
    fn zero_committee_rejected() {
        let json = r#"{"chain_config": {"pbft": {
            "committee_size": 0, "number_of_proposers": 20, "dag_blocks_size": 100,
            "ghost_path_move_back": 1, "lambda_ms_min": 500, "gas_limit": 1000000
        }}}"#;
        assert!(matches!(
            NodeConfig::parse_json(json),
            Err(ArborError::Config(_))
        ));
    }

    #[test]
    fn chain_id_parses() {
        use std::str::FromStr;
        assert_eq!(ChainId::from_str("testnet").unwrap(), ChainId::Testnet);
        assert!(ChainId::from_str("moonnet").is_err());
    }

    #[test]
    fn chain_presets_validate_and_round_trip() {
        for chain in [ChainId::Main, ChainId::Testnet, ChainId::Devnet] {
            let cfg = NodeConfig::for_chain(chain);
            cfg.validate().unwrap();
            assert_eq!(NodeConfig::parse_json(&cfg.write_json()).unwrap(), cfg);
        }
        // devnet runs the quickest rounds
        assert!(
            NodeConfig::for_chain(ChainId::Devnet).chain_config.pbft.lambda_ms_min
                < NodeConfig::for_chain(ChainId::Main).chain_config.pbft.lambda_ms_min
        );
    }
}

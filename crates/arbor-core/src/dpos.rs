use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ArborError;
use crate::types::{Address, Period};

/// One staked validator in the genesis delegation state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatorStake {
    pub address: Address,
    pub stake: u64,
}

/// Genesis delegation table carried in the chain config.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DposConfig {
    #[serde(default)]
    pub validators: Vec<ValidatorStake>,
    /// Minimum stake for proposal/vote eligibility.
    #[serde(default)]
    pub eligibility_min: u64,
}

/// Stake lookup at a given period.
///
/// Consensus always asks about period − 1 relative to what it is voting on;
/// implementations may answer `FutureEpoch` when asked past their horizon.
pub trait DposQuery: Send + Sync {
    fn stake_at(&self, period: Period, address: &Address) -> Result<u64, ArborError>;

    fn total_stake_at(&self, period: Period) -> Result<u64, ArborError>;

    fn is_eligible(&self, period: Period, address: &Address) -> Result<bool, ArborError>;
}

/// Delegation state fixed at genesis.
///
/// Stands in for the on-chain delegation contract: every period answers with
/// the same table.
pub struct StakeTable {
    stakes: HashMap<Address, u64>,
    total: u64,
    eligibility_min: u64,
}

impl StakeTable {
    pub fn from_config(cfg: &DposConfig) -> Self {
        let mut stakes = HashMap::new();
        let mut total = 0u64;
        for v in &cfg.validators {
            total += v.stake;
            stakes.insert(v.address, v.stake);
        }
        Self {
            stakes,
            total,
            eligibility_min: cfg.eligibility_min.max(1),
        }
    }

    pub fn single(address: Address, stake: u64) -> Self {
        Self::from_config(&DposConfig {
            validators: vec![ValidatorStake { address, stake }],
            eligibility_min: 1,
        })
    }
}

impl DposQuery for StakeTable {
    fn stake_at(&self, _period: Period, address: &Address) -> Result<u64, ArborError> {
        Ok(self.stakes.get(address).copied().unwrap_or(0))
    }

    fn total_stake_at(&self, _period: Period) -> Result<u64, ArborError> {
        Ok(self.total)
    }

    fn is_eligible(&self, period: Period, address: &Address) -> Result<bool, ArborError> {
        Ok(self.stake_at(period, address)? >= self.eligibility_min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stake_and_eligibility() {
        let a = Address::from_bytes([1; 20]);
        let b = Address::from_bytes([2; 20]);
        let table = StakeTable::from_config(&DposConfig {
            validators: vec![
                ValidatorStake { address: a, stake: 60 },
                ValidatorStake { address: b, stake: 40 },
            ],
            eligibility_min: 50,
        });
        assert_eq!(table.stake_at(1, &a).unwrap(), 60);
        assert_eq!(table.total_stake_at(1).unwrap(), 100);
        assert!(table.is_eligible(1, &a).unwrap());
        assert!(!table.is_eligible(1, &b).unwrap());
        assert_eq!(table.stake_at(1, &Address::from_bytes([9; 20])).unwrap(), 0);
    }
}

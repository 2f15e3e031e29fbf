//! Protocol constants shared across the consensus engines.

use crate::types::{GasAmount, Level};

// ── DAG ──────────────────────────────────────────────────────────────────────

/// Maximum tip references per DAG block (in addition to the pivot).
pub const MAX_TIPS_PER_BLOCK: usize = 16;

/// Levels the DAG admission worker will hold a block for before asking peers
/// for the missing history.
pub const MAX_LEVELS_PER_PERIOD: Level = 100;

// ── Block proposer ───────────────────────────────────────────────────────────

/// Sleep between proposal attempts (ms).
pub const MIN_PROPOSAL_DELAY_MS: u64 = 100;

/// VDF retries at one level before giving up until the next level.
pub const PROPOSER_MAX_RETRIES: u32 = 5;

// ── Transaction pool ─────────────────────────────────────────────────────────

/// Default pool capacity.
pub const MAX_POOL_SIZE: usize = 200_000;

/// Evicted entries per overflow pass.
pub const POOL_DELETE_STEP: usize = 100;

/// Periods a finalized transaction hash stays in the re-gossip filter,
/// multiplied by the committee size.
pub const RECENTLY_FINALIZED_PERIODS: usize = 10;

// ── PBFT ─────────────────────────────────────────────────────────────────────

/// Steps before lambda starts doubling.
pub const MAX_STEPS: u64 = 13;

/// Upper bound for the backed-off lambda (ms).
pub const MAX_LAMBDA_MS: u64 = 60_000;

/// Rounds of slack for late cert votes on the previous finalized block.
pub const REWARD_VOTE_ROUND_SLACK: u64 = 100;

/// Finish steps between PBFT block re-broadcasts.
pub const BLOCK_REBROADCAST_STEP: u64 = 20;

/// Polling steps past MAX_STEPS between next-vote bundle broadcasts.
pub const NEXT_VOTES_BROADCAST_STEP: u64 = 100;

// ── Gas ──────────────────────────────────────────────────────────────────────

/// Fallback per-block gas cap when the chain config does not override it.
pub const DEFAULT_BLOCK_GAS_LIMIT: GasAmount = 10_000_000;

pub mod conflict_detector;
pub mod sharded_map;

pub use conflict_detector::{ConflictDetector, ConflictStatus};
pub use sharded_map::ShardedMap;

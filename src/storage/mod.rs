//! Storage layer abstraction.
//!
//! Three seams, each with interchangeable backends:
//! - **Hash store**: posts and their perceptual hashes (`SQLite`, in-memory)
//! - **Rebuild lock**: TTL mutual exclusion between workers (`SQLite`, Redis, in-memory)
//! - **Build log**: audit record per index rebuild (`SQLite`, in-memory)

// Dropping connection guards slightly earlier has no benefit here.
#![allow(clippy::significant_drop_tightening)]

pub mod memory;
pub mod redis;
pub mod resilience;
pub mod sqlite;
pub mod traits;

pub use memory::{MemoryBuildLog, MemoryHashStore, MemoryLockService};
pub use self::redis::RedisLockService;
pub use resilience::{ResilientHashStore, StoreResilienceConfig};
pub use sqlite::{SqliteHashStore, SqliteLockService};
pub use traits::{BuildLog, HashPage, HashStore, LockService, LockToken};

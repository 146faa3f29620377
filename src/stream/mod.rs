//! Partitioned stream source.
//!
//! Cooperating workers share a consumer group. Each partition is claimed
//! through a TTL lock, read from its checkpointed position and released once
//! the whole batch is acknowledged.
//!
//! - **StreamJobSource**: the `JobSource` implementation
//! - **LockProvider**: TTL locks with owner-checked release
//! - **CheckpointStore**: short-term positions over long-term markers
//! - **PartitionLister** / **PartitionReader**: the log itself
//!
//! Redis backs the log, the locks and the short-term positions; long-term
//! markers live in SQLite. Every seam has an in-memory double.

pub mod checkpoint;
pub mod keys;
pub mod lister;
pub mod lock;
pub mod reader;
pub mod source;

pub use checkpoint::{
    CheckpointStore, InMemoryLongTermStore, InMemoryShortTermStore, LongTermStore,
    RedisShortTermStore, ShortTermStore, SqliteMarkerStore,
};
pub use keys::KeyHelper;
pub use lister::{PartitionLister, RedisPartitionLister, StaticPartitionLister};
pub use lock::{DistributedLock, InMemoryLockProvider, LockProvider, RedisLockProvider, ReleaseOutcome};
pub use reader::{InMemoryPartitionReader, PartitionRead, PartitionReader, RedisStreamReader};
pub use source::StreamJobSource;

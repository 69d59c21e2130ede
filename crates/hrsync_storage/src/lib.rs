pub mod repository;

pub use repository::{CorruptRow, QueueScan, SqliteQueueStore, StorageConfig};

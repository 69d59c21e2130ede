pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod policy;
pub mod record;
pub mod scheduler;
pub mod store;

pub use connectivity::spawn_connectivity_listener;
pub use engine::TransferSyncEngine;
pub use error::{StoreError, SyncError};
pub use events::{RemovalReason, SyncEvent};
pub use policy::{EngineConfig, RetryPolicy};
pub use record::{QueueStats, SyncRunSummary, TransferRecord, TransferStatus};
pub use scheduler::spawn_drain_loop;
pub use store::{MemoryQueueStore, QueueStore};

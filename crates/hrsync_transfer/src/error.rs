use hrsync_contract::RecordId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("engine is offline")]
    Offline,
    #[error("a drain is already in progress")]
    AlreadyInProgress,
    #[error("queue is full ({capacity} records)")]
    QueueFull { capacity: usize },
    #[error("record {0} is already queued")]
    DuplicateRecord(RecordId),
    #[error("record {0} was already applied")]
    AlreadyApplied(RecordId),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("record {0} is being submitted")]
    RecordInFlight(RecordId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("queue store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt queue record {record_id}: {reason}")]
    Corrupt { record_id: RecordId, reason: String },
    #[error("failed to serialize queue record: {0}")]
    Serialization(#[from] serde_json::Error),
}

use hrsync_contract::RecordId;
use serde::{Deserialize, Serialize};

use crate::record::{SyncRunSummary, TransferStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Completed,
    Cancelled,
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Enqueued {
        record_id: RecordId,
        priority: i32,
    },
    StatusChanged {
        record_id: RecordId,
        status: TransferStatus,
        attempts: u32,
        last_error: Option<String>,
    },
    Removed {
        record_id: RecordId,
        reason: RemovalReason,
    },
    DrainCompleted {
        summary: SyncRunSummary,
    },
    ConnectivityChanged {
        online: bool,
    },
}

impl SyncEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            SyncEvent::Enqueued { .. } => "transfer.enqueued",
            SyncEvent::StatusChanged { .. } => "transfer.status.changed",
            SyncEvent::Removed { .. } => "transfer.removed",
            SyncEvent::DrainCompleted { .. } => "sync.drain.completed",
            SyncEvent::ConnectivityChanged { .. } => "sync.connectivity.changed",
        }
    }
}

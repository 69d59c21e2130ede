use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use hrsync_contract::RecordId;
use serde::{Deserialize, Serialize};

use crate::policy::RetryPolicy;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl TransferStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// `seq` is the insertion sequence. It breaks priority ties and is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord<P> {
    pub id: RecordId,
    pub seq: u64,
    pub priority: i32,
    pub payload: P,
    pub status: TransferStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl<P> TransferRecord<P> {
    pub fn new(id: RecordId, seq: u64, priority: i32, payload: P) -> Self {
        let now = Utc::now();
        Self {
            id,
            seq,
            priority,
            payload,
            status: TransferStatus::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
            updated_at: now,
            last_attempt_at: None,
        }
    }

    pub fn queue_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.status, TransferStatus::Pending | TransferStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    // subset of `failed`
    pub exhausted: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn from_records<P>(records: &[TransferRecord<P>], retry: &RetryPolicy) -> Self {
        let mut stats = QueueStats {
            total: records.len(),
            ..QueueStats::default()
        };
        for record in records {
            match record.status {
                TransferStatus::Pending => stats.pending += 1,
                TransferStatus::InFlight => stats.in_flight += 1,
                TransferStatus::Failed => {
                    stats.failed += 1;
                    if retry.is_exhausted(record.attempts) {
                        stats.exhausted += 1;
                    }
                }
                TransferStatus::Completed => {}
            }
        }
        stats
    }
}

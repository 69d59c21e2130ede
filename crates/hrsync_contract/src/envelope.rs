use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MessageId = String;
pub type RecordId = String;
pub type IdempotencyKey = String;

pub const SUBMISSION_CONTENT_TYPE: &str = "application/msgpack";

// `idempotency_key` is the queue record id and stays the same across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSubmission<P>
where
    P: Serialize,
{
    pub message_id: MessageId,
    pub idempotency_key: IdempotencyKey,
    pub attempt: u32,
    pub priority: i32,
    pub sent_at: DateTime<Utc>,
    pub content_type: String,
    pub payload: P,
}

impl<P> TransferSubmission<P>
where
    P: Serialize,
{
    pub fn new(record_id: &str, attempt: u32, priority: i32, payload: P) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            idempotency_key: record_id.to_string(),
            attempt,
            priority,
            sent_at: Utc::now(),
            content_type: SUBMISSION_CONTENT_TYPE.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferAck {
    pub idempotency_key: IdempotencyKey,
    pub receipt_id: String,
    pub accepted_at: DateTime<Utc>,
    pub duplicate: bool,
}

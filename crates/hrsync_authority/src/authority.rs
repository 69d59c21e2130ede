use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use hrsync_contract::{
    decode_canonical, encode_canonical, CodecError, IdempotencyKey, QueuePayload, TransferAck,
    TransferSubmission,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("transfer authority unreachable")]
    Unreachable,
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

#[async_trait]
pub trait RemoteTransferAuthority<P>: Send + Sync
where
    P: QueuePayload,
{
    async fn submit(&self, submission: TransferSubmission<P>) -> Result<TransferAck, AuthorityError>;

    async fn probe(&self) -> Result<(), AuthorityError>;
}

#[derive(Debug, Clone)]
struct AcceptedTransfer {
    ack: TransferAck,
    payload: Vec<u8>,
}

#[derive(Debug)]
pub struct InMemoryTransferAuthority {
    reachable: AtomicBool,
    accepted: RwLock<HashMap<IdempotencyKey, AcceptedTransfer>>,
}

impl Default for InMemoryTransferAuthority {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InMemoryTransferAuthority {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            accepted: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub async fn accepted_count(&self) -> usize {
        self.accepted.read().await.len()
    }

    pub async fn receipt_for(&self, key: &str) -> Option<TransferAck> {
        self.accepted
            .read()
            .await
            .get(key)
            .map(|accepted| accepted.ack.clone())
    }

    pub async fn accepted_payload<T>(&self, key: &str) -> Result<Option<T>, CodecError>
    where
        T: DeserializeOwned,
    {
        match self.accepted.read().await.get(key) {
            Some(accepted) => decode_canonical(&accepted.payload).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<P> RemoteTransferAuthority<P> for InMemoryTransferAuthority
where
    P: QueuePayload,
{
    async fn submit(&self, submission: TransferSubmission<P>) -> Result<TransferAck, AuthorityError> {
        if !self.is_reachable() {
            return Err(AuthorityError::Unreachable);
        }
        if submission.idempotency_key.trim().is_empty() {
            return Err(AuthorityError::InvalidSubmission(
                "idempotency_key cannot be empty".to_string(),
            ));
        }

        let payload = encode_canonical(&submission.payload)
            .map_err(|err| AuthorityError::InvalidSubmission(err.to_string()))?;

        let mut accepted = self.accepted.write().await;
        if let Some(previous) = accepted.get(&submission.idempotency_key) {
            if previous.payload != payload {
                warn!(
                    idempotency_key = %submission.idempotency_key,
                    attempt = submission.attempt,
                    "idempotency key reused with a different payload"
                );
                return Err(AuthorityError::Rejected(format!(
                    "idempotency key {} already used for a different transfer",
                    submission.idempotency_key
                )));
            }
            debug!(
                idempotency_key = %submission.idempotency_key,
                attempt = submission.attempt,
                "replaying receipt for already accepted transfer"
            );
            return Ok(TransferAck {
                duplicate: true,
                ..previous.ack.clone()
            });
        }

        let ack = TransferAck {
            idempotency_key: submission.idempotency_key.clone(),
            receipt_id: Uuid::now_v7().to_string(),
            accepted_at: Utc::now(),
            duplicate: false,
        };
        info!(
            idempotency_key = %submission.idempotency_key,
            attempt = submission.attempt,
            bytes = payload.len(),
            "transfer accepted"
        );
        accepted.insert(
            submission.idempotency_key,
            AcceptedTransfer {
                ack: ack.clone(),
                payload,
            },
        );
        Ok(ack)
    }

    async fn probe(&self) -> Result<(), AuthorityError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(AuthorityError::Unreachable)
        }
    }
}

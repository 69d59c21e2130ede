use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hrsync_contract::{QueuePayload, RecordId};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::record::TransferRecord;

// Writes must be durable when they return: the engine moves on to the next
// record only after the previous update has landed.
#[async_trait]
pub trait QueueStore<P>: Send + Sync
where
    P: QueuePayload,
{
    async fn load(&self) -> Result<Vec<TransferRecord<P>>, StoreError>;

    async fn upsert(&self, record: &TransferRecord<P>) -> Result<(), StoreError>;

    async fn remove(&self, record_id: &str) -> Result<(), StoreError>;

    // Removes the record and remembers its id as applied, atomically.
    async fn complete(&self, record_id: &str, receipt_id: &str) -> Result<(), StoreError>;

    async fn was_completed(&self, record_id: &str) -> Result<bool, StoreError>;
}

// Sharing one instance between engines stands in for a restart against the
// same on-disk queue.
#[derive(Debug)]
pub struct MemoryQueueStore<P> {
    records: RwLock<HashMap<RecordId, TransferRecord<P>>>,
    completed: RwLock<HashSet<RecordId>>,
    fail_writes: AtomicBool,
    fail_completions: AtomicBool,
}

impl<P> Default for MemoryQueueStore<P> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashSet::new()),
            fail_writes: AtomicBool::new(false),
            fail_completions: AtomicBool::new(false),
        }
    }
}

impl<P> MemoryQueueStore<P>
where
    P: QueuePayload,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_completions(&self, fail: bool) {
        self.fail_completions.store(fail, Ordering::SeqCst);
    }

    pub async fn get(&self, record_id: &str) -> Option<TransferRecord<P>> {
        self.records.read().await.get(record_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<P> QueueStore<P> for MemoryQueueStore<P>
where
    P: QueuePayload,
{
    async fn load(&self) -> Result<Vec<TransferRecord<P>>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn upsert(&self, record: &TransferRecord<P>) -> Result<(), StoreError> {
        self.check_writable()?;
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, record_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.records.write().await.remove(record_id);
        Ok(())
    }

    async fn complete(&self, record_id: &str, _receipt_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        if self.fail_completions.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("completions disabled".to_string()));
        }
        let mut records = self.records.write().await;
        self.completed.write().await.insert(record_id.to_string());
        records.remove(record_id);
        Ok(())
    }

    async fn was_completed(&self, record_id: &str) -> Result<bool, StoreError> {
        Ok(self.completed.read().await.contains(record_id))
    }
}

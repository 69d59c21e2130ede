use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hrsync_authority::{AuthorityError, RemoteTransferAuthority};
use hrsync_contract::{QueuePayload, RecordId, TransferAck, TransferSubmission};
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::events::{RemovalReason, SyncEvent};
use crate::policy::EngineConfig;
use crate::record::{QueueStats, SyncRunSummary, TransferRecord, TransferStatus};
use crate::store::QueueStore;

const INTERRUPTED_REASON: &str = "interrupted before acknowledgement";

/// Offline-first queue of pending transfers, reconciled against a remote
/// authority one record at a time.
///
/// Every record change is written to the store first and then swapped into
/// memory as a whole record, so snapshots never see a half-updated record.
pub struct TransferSyncEngine<P>
where
    P: QueuePayload,
{
    config: EngineConfig,
    store: Arc<dyn QueueStore<P>>,
    authority: Arc<dyn RemoteTransferAuthority<P>>,
    queue: RwLock<Vec<TransferRecord<P>>>,
    next_seq: AtomicU64,
    online: AtomicBool,
    draining: AtomicBool,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P> TransferSyncEngine<P>
where
    P: QueuePayload,
{
    // In-flight records left by a crash become failures, retried under the
    // same idempotency key.
    pub async fn open(
        config: EngineConfig,
        store: Arc<dyn QueueStore<P>>,
        authority: Arc<dyn RemoteTransferAuthority<P>>,
    ) -> Result<Self, SyncError> {
        let mut records = store.load().await?;

        let mut recovered = 0usize;
        for record in records
            .iter_mut()
            .filter(|record| record.status == TransferStatus::InFlight)
        {
            record.status = TransferStatus::Failed;
            record.last_error = Some(INTERRUPTED_REASON.to_string());
            record.updated_at = Utc::now();
            store.upsert(record).await?;
            recovered += 1;
        }

        let mut stale = Vec::new();
        records.retain(|record| {
            let keep = record.status != TransferStatus::Completed;
            if !keep {
                stale.push(record.id.clone());
            }
            keep
        });
        for record_id in &stale {
            store.remove(record_id).await?;
        }

        records.sort_by(TransferRecord::queue_order);
        let next_seq = records.iter().map(|record| record.seq).max().map_or(1, |seq| seq + 1);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        info!(
            records = records.len(),
            recovered,
            purged = stale.len(),
            "transfer queue loaded"
        );

        Ok(Self {
            online: AtomicBool::new(config.start_online),
            config,
            store,
            authority,
            queue: RwLock::new(records),
            next_seq: AtomicU64::new(next_seq),
            draining: AtomicBool::new(false),
            last_sync: RwLock::new(None),
            events,
            wake: Notify::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn enqueue(
        &self,
        payload: P,
        priority: Option<i32>,
    ) -> Result<TransferRecord<P>, SyncError> {
        self.enqueue_with_id(Uuid::now_v7().to_string(), payload, priority)
            .await
    }

    /// Ids are never reused: one that was already applied remotely is refused,
    /// since the authority would replay the old receipt instead of applying it.
    pub async fn enqueue_with_id(
        &self,
        record_id: impl Into<RecordId>,
        payload: P,
        priority: Option<i32>,
    ) -> Result<TransferRecord<P>, SyncError> {
        let record_id = record_id.into();
        if record_id.trim().is_empty() {
            return Err(SyncError::InvalidPayload(
                "record id cannot be empty".to_string(),
            ));
        }
        payload
            .validate()
            .map_err(|err| SyncError::InvalidPayload(err.0))?;

        let mut queue = self.queue.write().await;
        if queue.iter().any(|existing| existing.id == record_id) {
            return Err(SyncError::DuplicateRecord(record_id));
        }
        if self.store.was_completed(&record_id).await? {
            return Err(SyncError::AlreadyApplied(record_id));
        }
        if queue.len() >= self.config.max_queue_size {
            warn!(capacity = self.config.max_queue_size, "transfer queue is full");
            return Err(SyncError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = TransferRecord::new(record_id, seq, priority.unwrap_or(0), payload);
        self.store.upsert(&record).await?;

        let position = queue.partition_point(|existing| existing.queue_order(&record).is_lt());
        queue.insert(position, record.clone());
        drop(queue);

        info!(
            record_id = %record.id,
            priority = record.priority,
            seq,
            "transfer enqueued"
        );
        self.emit(SyncEvent::Enqueued {
            record_id: record.id.clone(),
            priority: record.priority,
        });
        self.request_drain();
        Ok(record)
    }

    /// One pass over every due record, highest priority first. Remote
    /// failures stay on the record; only the offline and busy preconditions
    /// and store failures end the pass with an error.
    pub async fn drain(&self) -> Result<SyncRunSummary, SyncError> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        let _busy = DrainGuard::acquire(&self.draining).ok_or(SyncError::AlreadyInProgress)?;

        let started = Utc::now();
        let batch: Vec<RecordId> = self
            .queue
            .read()
            .await
            .iter()
            .filter(|record| self.config.retry.is_due(*record, started))
            .map(|record| record.id.clone())
            .collect();
        debug!(due = batch.len(), "drain started");

        let mut summary = SyncRunSummary::default();
        for record_id in batch {
            let Some(submission) = self.begin_attempt(&record_id, started).await? else {
                continue;
            };
            summary.attempted += 1;

            match self.authority.submit(submission).await {
                Ok(ack) => {
                    self.complete(&record_id, &ack).await?;
                    summary.succeeded += 1;
                }
                Err(err) => {
                    self.fail(&record_id, &err).await?;
                    summary.failed += 1;
                    summary.last_error = Some(err.to_string());
                }
            }
        }

        summary.remaining = self
            .queue
            .read()
            .await
            .iter()
            .filter(|record| record.is_waiting())
            .count();
        *self.last_sync.write().await = Some(Utc::now());

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            remaining = summary.remaining,
            "drain finished"
        );
        self.emit(SyncEvent::DrainCompleted {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Coming back online spawns a drain unless one is already running.
    /// Must be called inside a tokio runtime.
    pub fn on_connectivity_change(
        self: &Arc<Self>,
        is_online: bool,
    ) -> Option<JoinHandle<Result<SyncRunSummary, SyncError>>> {
        let was_online = self.online.swap(is_online, Ordering::SeqCst);
        if was_online != is_online {
            info!(online = is_online, "connectivity changed");
            self.emit(SyncEvent::ConnectivityChanged { online: is_online });
        }

        if !is_online || was_online || self.is_draining() {
            return None;
        }

        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            let outcome = engine.drain().await;
            if let Err(err) = &outcome {
                debug!(error = %err, "reconnect drain skipped");
            }
            outcome
        }))
    }

    pub async fn snapshot(&self) -> Vec<TransferRecord<P>> {
        self.queue.read().await.clone()
    }

    pub async fn get(&self, record_id: &str) -> Option<TransferRecord<P>> {
        self.queue
            .read()
            .await
            .iter()
            .find(|record| record.id == record_id)
            .cloned()
    }

    pub async fn stats(&self) -> QueueStats {
        let queue = self.queue.read().await;
        QueueStats {
            last_sync: *self.last_sync.read().await,
            ..QueueStats::from_records(&queue, &self.config.retry)
        }
    }

    // Wakes the drain loop, if one runs. The permit is kept until it does.
    fn request_drain(&self) {
        if self.is_online() {
            self.wake.notify_one();
        }
    }

    pub(crate) async fn drain_requested(&self) {
        self.wake.notified().await;
    }

    pub async fn remove(&self, record_id: &str) -> Result<TransferRecord<P>, SyncError> {
        let mut queue = self.queue.write().await;
        let position = queue
            .iter()
            .position(|record| record.id == record_id)
            .ok_or_else(|| SyncError::NotFound(record_id.to_string()))?;
        if queue[position].status == TransferStatus::InFlight {
            return Err(SyncError::RecordInFlight(record_id.to_string()));
        }

        self.store.remove(record_id).await?;
        let record = queue.remove(position);
        drop(queue);

        info!(record_id = %record.id, "transfer cancelled");
        self.emit(SyncEvent::Removed {
            record_id: record.id.clone(),
            reason: RemovalReason::Cancelled,
        });
        Ok(record)
    }

    // Exhausted records get a fresh budget too.
    pub async fn retry_failed(&self) -> Result<usize, SyncError> {
        let mut queue = self.queue.write().await;
        let mut reset = 0usize;
        for slot in queue
            .iter_mut()
            .filter(|record| record.status == TransferStatus::Failed)
        {
            let mut updated = slot.clone();
            updated.status = TransferStatus::Pending;
            updated.attempts = 0;
            updated.last_error = None;
            updated.last_attempt_at = None;
            updated.updated_at = Utc::now();
            self.store.upsert(&updated).await?;
            *slot = updated;
            reset += 1;
            self.emit_status(slot);
        }
        drop(queue);

        if reset > 0 {
            info!(reset, "failed transfers requeued");
            self.request_drain();
        }
        Ok(reset)
    }

    pub async fn discard_failed(&self) -> Result<usize, SyncError> {
        self.discard_where(|_, record| record.status == TransferStatus::Failed)
            .await
    }

    pub async fn discard_exhausted(&self) -> Result<usize, SyncError> {
        self.discard_where(|config, record| {
            record.status == TransferStatus::Failed
                && config.retry.is_exhausted(record.attempts)
        })
        .await
    }

    async fn discard_where<F>(&self, matches: F) -> Result<usize, SyncError>
    where
        F: Fn(&EngineConfig, &TransferRecord<P>) -> bool,
    {
        let mut queue = self.queue.write().await;
        let doomed: Vec<RecordId> = queue
            .iter()
            .filter(|record| matches(&self.config, record))
            .map(|record| record.id.clone())
            .collect();

        for record_id in &doomed {
            self.store.remove(record_id).await?;
            queue.retain(|record| &record.id != record_id);
            self.emit(SyncEvent::Removed {
                record_id: record_id.clone(),
                reason: RemovalReason::Discarded,
            });
        }
        drop(queue);

        if !doomed.is_empty() {
            info!(discarded = doomed.len(), "failed transfers discarded");
        }
        Ok(doomed.len())
    }

    async fn begin_attempt(
        &self,
        record_id: &str,
        started: DateTime<Utc>,
    ) -> Result<Option<TransferSubmission<P>>, SyncError> {
        let mut queue = self.queue.write().await;
        // Cancelled or reset since the batch was taken.
        let Some(slot) = queue.iter_mut().find(|record| record.id == record_id) else {
            return Ok(None);
        };
        if !self.config.retry.is_due(&*slot, started) {
            return Ok(None);
        }

        let now = Utc::now();
        let mut updated = slot.clone();
        updated.status = TransferStatus::InFlight;
        updated.attempts += 1;
        updated.last_attempt_at = Some(now);
        updated.updated_at = now;
        self.store.upsert(&updated).await?;
        *slot = updated;

        debug!(
            record_id = %slot.id,
            priority = slot.priority,
            attempt = slot.attempts,
            "submitting transfer"
        );
        self.emit_status(slot);
        Ok(Some(TransferSubmission::new(
            &slot.id,
            slot.attempts,
            slot.priority,
            slot.payload.clone(),
        )))
    }

    async fn complete(&self, record_id: &str, ack: &TransferAck) -> Result<(), SyncError> {
        let mut queue = self.queue.write().await;
        let Some(position) = queue.iter().position(|record| record.id == record_id) else {
            warn!(record_id, "acknowledged transfer vanished from queue");
            return Ok(());
        };

        if let Err(err) = self.store.complete(record_id, &ack.receipt_id).await {
            // Still in flight on disk; the next open turns it into a retry.
            let slot = &mut queue[position];
            let mut updated = slot.clone();
            updated.status = TransferStatus::Failed;
            updated.last_error = Some(err.to_string());
            *slot = updated;
            return Err(err.into());
        }

        let mut record = queue.remove(position);
        drop(queue);
        record.status = TransferStatus::Completed;
        record.last_error = None;

        info!(
            record_id,
            attempt = record.attempts,
            receipt_id = %ack.receipt_id,
            duplicate = ack.duplicate,
            "transfer completed"
        );
        self.emit_status(&record);
        self.emit(SyncEvent::Removed {
            record_id: record.id,
            reason: RemovalReason::Completed,
        });
        Ok(())
    }

    async fn fail(&self, record_id: &str, error: &AuthorityError) -> Result<(), SyncError> {
        let mut queue = self.queue.write().await;
        let Some(slot) = queue.iter_mut().find(|record| record.id == record_id) else {
            warn!(record_id, "failed transfer vanished from queue");
            return Ok(());
        };

        let mut updated = slot.clone();
        updated.status = TransferStatus::Failed;
        updated.last_error = Some(error.to_string());
        updated.updated_at = Utc::now();
        let persisted = self.store.upsert(&updated).await;
        *slot = updated;
        persisted?;

        if self.config.retry.is_exhausted(slot.attempts) {
            warn!(
                record_id,
                attempts = slot.attempts,
                error = %error,
                "transfer exhausted its retry budget"
            );
        } else {
            warn!(record_id, attempt = slot.attempts, error = %error, "transfer failed");
        }
        self.emit_status(slot);
        Ok(())
    }

    fn emit_status(&self, record: &TransferRecord<P>) {
        self.emit(SyncEvent::StatusChanged {
            record_id: record.id.clone(),
            status: record.status,
            attempts: record.attempts,
            last_error: record.last_error.clone(),
        });
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    use super::*;
    use crate::policy::RetryPolicy;
    use crate::store::MemoryQueueStore;

    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[derive(Default)]
    struct ScriptedAuthority {
        failing: Mutex<HashSet<String>>,
        calls: Mutex<Vec<(String, String, u32)>>,
        gate: Option<Gate>,
    }

    impl ScriptedAuthority {
        fn gated() -> Self {
            Self {
                gate: Some(Gate::default()),
                ..Self::default()
            }
        }

        fn fail(&self, name: &str) {
            self.failing.lock().unwrap().insert(name.to_string());
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        fn names(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _, _)| name.clone())
                .collect()
        }

        fn calls_for(&self, name: &str) -> usize {
            self.names().iter().filter(|called| *called == name).count()
        }
    }

    #[async_trait]
    impl RemoteTransferAuthority<Value> for ScriptedAuthority {
        async fn submit(
            &self,
            submission: TransferSubmission<Value>,
        ) -> Result<TransferAck, AuthorityError> {
            let name = submission.payload["name"].as_str().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push((
                name.clone(),
                submission.idempotency_key.clone(),
                submission.attempt,
            ));

            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }

            if self.failing.lock().unwrap().contains(&name) {
                return Err(AuthorityError::Rejected(format!("{name} refused")));
            }
            Ok(TransferAck {
                idempotency_key: submission.idempotency_key,
                receipt_id: format!("receipt-{name}"),
                accepted_at: Utc::now(),
                duplicate: false,
            })
        }

        async fn probe(&self) -> Result<(), AuthorityError> {
            Ok(())
        }
    }

    fn item(name: &str) -> Value {
        json!({ "name": name, "item": "AN/PRC-152" })
    }

    async fn open_engine(
        config: EngineConfig,
        store: Arc<MemoryQueueStore<Value>>,
        authority: Arc<ScriptedAuthority>,
    ) -> Arc<TransferSyncEngine<Value>> {
        Arc::new(
            TransferSyncEngine::<Value>::open(config, store, authority)
                .await
                .expect("open engine"),
        )
    }

    async fn fresh(authority: Arc<ScriptedAuthority>) -> Arc<TransferSyncEngine<Value>> {
        open_engine(
            EngineConfig::default(),
            Arc::new(MemoryQueueStore::new()),
            authority,
        )
        .await
    }

    #[tokio::test]
    async fn drain_submits_in_priority_order() {
        let authority = Arc::new(ScriptedAuthority::default());
        let engine = fresh(authority.clone()).await;

        engine.enqueue(item("one"), Some(1)).await.unwrap();
        engine.enqueue(item("five"), Some(5)).await.unwrap();
        engine.enqueue(item("three"), Some(3)).await.unwrap();

        let summary = engine.drain().await.unwrap();

        assert_eq!(authority.names(), ["five", "three", "one"]);
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.remaining, 0);
        assert!(summary.last_error.is_none());
        assert!(engine.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn failure_of_one_record_does_not_block_others() {
        let authority = Arc::new(ScriptedAuthority::default());
        authority.fail("A");
        let engine = fresh(authority.clone()).await;

        let a = engine.enqueue(item("A"), Some(0)).await.unwrap();
        engine.enqueue(item("B"), Some(10)).await.unwrap();

        let summary = engine.drain().await.unwrap();
        assert_eq!(
            summary,
            SyncRunSummary {
                attempted: 2,
                succeeded: 1,
                failed: 1,
                remaining: 1,
                last_error: Some("transfer rejected: A refused".to_string()),
            }
        );

        let queue = engine.snapshot().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, a.id);
        assert_eq!(queue[0].status, TransferStatus::Failed);
        assert_eq!(queue[0].attempts, 1);
        assert_eq!(
            queue[0].last_error.as_deref(),
            Some("transfer rejected: A refused")
        );
    }

    #[tokio::test]
    async fn drain_while_offline_leaves_queue_untouched() {
        let authority = Arc::new(ScriptedAuthority::default());
        let engine = fresh(authority.clone()).await;
        engine.enqueue(item("A"), None).await.unwrap();
        let before = engine.snapshot().await;

        assert!(engine.on_connectivity_change(false).is_none());
        let result = engine.drain().await;

        assert!(matches!(result, Err(SyncError::Offline)));
        assert_eq!(engine.snapshot().await, before);
        assert!(authority.names().is_empty());
    }

    #[tokio::test]
    async fn second_drain_is_refused_while_first_runs() {
        let authority = Arc::new(ScriptedAuthority::gated());
        let engine = fresh(authority.clone()).await;
        let record = engine.enqueue(item("slow"), None).await.unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.drain().await }
        });
        let gate = authority.gate.as_ref().unwrap();
        gate.entered.notified().await;

        assert!(engine.is_draining());
        assert!(matches!(
            engine.drain().await,
            Err(SyncError::AlreadyInProgress)
        ));
        assert!(matches!(
            engine.remove(&record.id).await,
            Err(SyncError::RecordInFlight(_))
        ));
        let in_flight = engine.get(&record.id).await.unwrap();
        assert_eq!(in_flight.status, TransferStatus::InFlight);
        assert_eq!(in_flight.attempts, 1);

        gate.release.notify_one();
        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(authority.calls_for("slow"), 1);
        assert!(!engine.is_draining());
    }

    #[tokio::test]
    async fn always_failing_record_stops_at_retry_cap() {
        let authority = Arc::new(ScriptedAuthority::default());
        authority.fail("doomed");
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        };
        let engine = open_engine(config, Arc::new(MemoryQueueStore::new()), authority.clone()).await;
        let record = engine.enqueue(item("doomed"), None).await.unwrap();

        for _ in 0..5 {
            engine.drain().await.unwrap();
        }

        assert_eq!(authority.calls_for("doomed"), 3);
        let stuck = engine.get(&record.id).await.unwrap();
        assert_eq!(stuck.status, TransferStatus::Failed);
        assert_eq!(stuck.attempts, 3);

        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.remaining, 1);

        let stats = engine.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.exhausted, 1);
        assert!(stats.last_sync.is_some());
    }

    #[tokio::test]
    async fn every_record_eventually_completes_once() {
        let authority = Arc::new(ScriptedAuthority::default());
        let engine = fresh(authority.clone()).await;
        let mut ids = Vec::new();
        for n in 0..5 {
            let name = format!("r{n}");
            authority.fail(&name);
            ids.push(engine.enqueue(item(&name), Some(n)).await.unwrap().id);
        }

        let first = engine.drain().await.unwrap();
        assert_eq!(first.failed, 5);
        authority.heal();
        let second = engine.drain().await.unwrap();
        assert_eq!(second.succeeded, 5);
        assert_eq!(second.remaining, 0);

        let third = engine.drain().await.unwrap();
        assert_eq!(third.attempted, 0);

        let calls = authority.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 10);
        for id in &ids {
            let attempts: Vec<u32> = calls
                .iter()
                .filter(|(_, key, _)| key == id)
                .map(|(_, _, attempt)| *attempt)
                .collect();
            assert_eq!(attempts, [1, 2]);
        }
    }

    #[tokio::test]
    async fn snapshot_is_stable_without_mutation() {
        let engine = fresh(Arc::new(ScriptedAuthority::default())).await;
        engine.enqueue(item("a"), Some(2)).await.unwrap();
        engine.enqueue(item("b"), Some(2)).await.unwrap();

        let first = engine.snapshot().await;
        let second = engine.snapshot().await;
        assert_eq!(first, second);
        assert_eq!(first[0].payload["name"], "a");
    }

    #[tokio::test]
    async fn enqueue_validates_and_persists_before_returning() {
        let store = Arc::new(MemoryQueueStore::new());
        let engine = open_engine(
            EngineConfig::default(),
            store.clone(),
            Arc::new(ScriptedAuthority::default()),
        )
        .await;

        assert!(matches!(
            engine.enqueue(Value::Null, None).await,
            Err(SyncError::InvalidPayload(_))
        ));
        assert_eq!(store.len().await, 0);

        let record = engine.enqueue(item("kept"), None).await.unwrap();
        assert_eq!(record.priority, 0);
        let stored = store.get(&record.id).await.unwrap();
        assert_eq!(stored.status, TransferStatus::Pending);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn capacity_and_duplicate_ids_are_enforced() {
        let config = EngineConfig {
            max_queue_size: 2,
            ..EngineConfig::default()
        };
        let engine = open_engine(
            config,
            Arc::new(MemoryQueueStore::new()),
            Arc::new(ScriptedAuthority::default()),
        )
        .await;

        engine.enqueue_with_id("hr-1", item("a"), None).await.unwrap();
        assert!(matches!(
            engine.enqueue_with_id("hr-1", item("a"), None).await,
            Err(SyncError::DuplicateRecord(id)) if id == "hr-1"
        ));
        engine.enqueue(item("b"), None).await.unwrap();
        assert!(matches!(
            engine.enqueue(item("c"), None).await,
            Err(SyncError::QueueFull { capacity: 2 })
        ));
    }

    #[tokio::test]
    async fn reopening_recovers_interrupted_records_and_order() {
        let store = Arc::new(MemoryQueueStore::new());
        let authority = Arc::new(ScriptedAuthority::default());
        let engine = open_engine(EngineConfig::default(), store.clone(), authority.clone()).await;
        let low = engine.enqueue(item("low"), Some(1)).await.unwrap();
        let high = engine.enqueue(item("high"), Some(9)).await.unwrap();
        drop(engine);

        let mut crashed = store.get(&high.id).await.unwrap();
        crashed.status = TransferStatus::InFlight;
        crashed.attempts = 1;
        store.upsert(&crashed).await.unwrap();

        let reopened = open_engine(EngineConfig::default(), store.clone(), authority.clone()).await;
        let queue = reopened.snapshot().await;
        assert_eq!(queue[0].id, high.id);
        assert_eq!(queue[0].status, TransferStatus::Failed);
        assert_eq!(queue[0].last_error.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(queue[1].id, low.id);

        let newer = reopened.enqueue(item("newer"), Some(1)).await.unwrap();
        assert!(newer.seq > low.seq);
        assert_eq!(reopened.snapshot().await[2].id, newer.id);

        reopened.drain().await.unwrap();
        let calls = authority.calls.lock().unwrap().clone();
        assert_eq!(calls[0], ("high".to_string(), high.id.clone(), 2));
    }

    #[tokio::test]
    async fn coming_online_triggers_a_drain() {
        let authority = Arc::new(ScriptedAuthority::default());
        let config = EngineConfig {
            start_online: false,
            ..EngineConfig::default()
        };
        let engine = open_engine(config, Arc::new(MemoryQueueStore::new()), authority.clone()).await;
        let mut events = engine.subscribe();
        engine.enqueue(item("queued"), None).await.unwrap();

        let handle = engine
            .on_connectivity_change(true)
            .expect("reconnect drain");
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(engine.on_connectivity_change(true).is_none());

        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Enqueued { priority: 0, .. }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::ConnectivityChanged { online: true }
        );
    }

    #[tokio::test]
    async fn backoff_defers_failed_records() {
        let authority = Arc::new(ScriptedAuthority::default());
        authority.fail("later");
        let config = EngineConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_secs(3600),
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        };
        let engine = open_engine(config, Arc::new(MemoryQueueStore::new()), authority.clone()).await;
        engine.enqueue(item("later"), None).await.unwrap();

        assert_eq!(engine.drain().await.unwrap().failed, 1);
        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.remaining, 1);
        assert_eq!(authority.calls_for("later"), 1);
    }

    #[tokio::test]
    async fn manual_retry_and_discard() {
        let authority = Arc::new(ScriptedAuthority::default());
        authority.fail("x");
        authority.fail("y");
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        };
        let engine = open_engine(config, Arc::new(MemoryQueueStore::new()), authority.clone()).await;
        engine.enqueue(item("x"), None).await.unwrap();
        let y = engine.enqueue(item("y"), None).await.unwrap();
        engine.drain().await.unwrap();
        assert_eq!(engine.stats().await.exhausted, 2);

        assert_eq!(engine.retry_failed().await.unwrap(), 2);
        let stats = engine.stats().await;
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 0);

        authority.heal();
        authority.fail("y");
        engine.drain().await.unwrap();
        assert_eq!(engine.discard_exhausted().await.unwrap(), 1);
        assert!(engine.get(&y.id).await.is_none());
        assert_eq!(engine.discard_failed().await.unwrap(), 0);
        assert!(matches!(
            engine.remove(&y.id).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn store_failure_aborts_drain_and_releases_it() {
        let store = Arc::new(MemoryQueueStore::new());
        let authority = Arc::new(ScriptedAuthority::default());
        let engine = open_engine(EngineConfig::default(), store.clone(), authority.clone()).await;
        let record = engine.enqueue(item("a"), None).await.unwrap();

        store.set_fail_writes(true);
        assert!(matches!(engine.drain().await, Err(SyncError::Store(_))));
        assert!(authority.names().is_empty());
        assert_eq!(
            engine.get(&record.id).await.unwrap().status,
            TransferStatus::Pending
        );

        store.set_fail_writes(false);
        assert_eq!(engine.drain().await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn records_enqueued_mid_drain_wait_for_the_next_one() {
        let authority = Arc::new(ScriptedAuthority::gated());
        let engine = fresh(authority.clone()).await;
        engine.enqueue(item("first"), Some(0)).await.unwrap();

        let running = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.drain().await }
        });
        let gate = authority.gate.as_ref().unwrap();
        gate.entered.notified().await;

        let urgent = engine.enqueue(item("urgent"), Some(10)).await.unwrap();
        assert_eq!(engine.snapshot().await[0].id, urgent.id);
        gate.release.notify_one();

        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.remaining, 1);
        assert_eq!(authority.names(), ["first"]);

        let next = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.drain().await }
        });
        gate.entered.notified().await;
        gate.release.notify_one();
        assert_eq!(next.await.unwrap().unwrap().succeeded, 1);
        assert_eq!(authority.names(), ["first", "urgent"]);
    }

    #[tokio::test]
    async fn lost_completion_is_retried_under_the_same_key() {
        let store = Arc::new(MemoryQueueStore::new());
        let authority = Arc::new(ScriptedAuthority::default());
        let engine = open_engine(EngineConfig::default(), store.clone(), authority.clone()).await;
        let record = engine.enqueue(item("a"), None).await.unwrap();

        store.set_fail_completions(true);
        assert!(matches!(engine.drain().await, Err(SyncError::Store(_))));
        assert!(!engine.is_draining());
        assert_eq!(
            store.get(&record.id).await.unwrap().status,
            TransferStatus::InFlight
        );
        assert_eq!(
            engine.get(&record.id).await.unwrap().status,
            TransferStatus::Failed
        );

        store.set_fail_completions(false);
        assert_eq!(engine.drain().await.unwrap().succeeded, 1);
        assert!(store.is_empty().await);

        let calls = authority.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            [
                ("a".to_string(), record.id.clone(), 1),
                ("a".to_string(), record.id.clone(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn unsaved_failure_is_retried_under_the_same_key() {
        let store = Arc::new(MemoryQueueStore::new());
        let authority = Arc::new(ScriptedAuthority::gated());
        authority.fail("b");
        let engine = open_engine(EngineConfig::default(), store.clone(), authority.clone()).await;
        let record = engine.enqueue(item("b"), None).await.unwrap();

        let running = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.drain().await }
        });
        let gate = authority.gate.as_ref().unwrap();
        gate.entered.notified().await;
        store.set_fail_writes(true);
        gate.release.notify_one();

        assert!(matches!(
            running.await.unwrap(),
            Err(SyncError::Store(_))
        ));
        let in_memory = engine.get(&record.id).await.unwrap();
        assert_eq!(in_memory.status, TransferStatus::Failed);
        assert_eq!(in_memory.attempts, 1);
        assert_eq!(
            store.get(&record.id).await.unwrap().status,
            TransferStatus::InFlight
        );

        store.set_fail_writes(false);
        authority.heal();
        let retry = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.drain().await }
        });
        gate.entered.notified().await;
        gate.release.notify_one();
        assert_eq!(retry.await.unwrap().unwrap().succeeded, 1);

        let calls = authority.calls.lock().unwrap().clone();
        let keys: Vec<(&str, u32)> = calls
            .iter()
            .map(|(_, key, attempt)| (key.as_str(), *attempt))
            .collect();
        assert_eq!(keys, [(record.id.as_str(), 1), (record.id.as_str(), 2)]);
    }

    #[tokio::test]
    async fn applied_ids_cannot_be_queued_again() {
        let store = Arc::new(MemoryQueueStore::new());
        let engine = open_engine(
            EngineConfig::default(),
            store.clone(),
            Arc::new(ScriptedAuthority::default()),
        )
        .await;

        engine.enqueue_with_id("hr-7", item("a"), None).await.unwrap();
        assert_eq!(engine.drain().await.unwrap().succeeded, 1);

        assert!(matches!(
            engine.enqueue_with_id("hr-7", item("a"), None).await,
            Err(SyncError::AlreadyApplied(id)) if id == "hr-7"
        ));
        assert!(store.was_completed("hr-7").await.unwrap());
    }
}

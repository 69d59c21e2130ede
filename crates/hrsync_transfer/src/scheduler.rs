use std::sync::Arc;
use std::time::Duration;

use hrsync_contract::QueuePayload;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::TransferSyncEngine;
use crate::error::SyncError;

/// Drains whenever the engine asks for it (new or requeued records while
/// online) and on every tick of `period`, which picks up backed-off retries.
pub fn spawn_drain_loop<P>(engine: Arc<TransferSyncEngine<P>>, period: Duration) -> JoinHandle<()>
where
    P: QueuePayload,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut next_sync = time::interval_at(Instant::now() + period, period);
        next_sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = next_sync.tick() => {
                    debug!("interval drain");
                }
                _ = engine.drain_requested() => {
                    debug!("drain requested");
                }
            }

            if !engine.is_online() {
                continue;
            }

            match engine.drain().await {
                Ok(summary) if summary.attempted > 0 => info!(
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    remaining = summary.remaining,
                    "scheduled drain finished"
                ),
                Ok(_) => {}
                Err(SyncError::Offline | SyncError::AlreadyInProgress) => {
                    debug!("scheduled drain skipped")
                }
                Err(err) => warn!(error = %err, "scheduled drain failed"),
            }
        }
    })
}

use std::sync::Arc;

use hrsync_contract::QueuePayload;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::TransferSyncEngine;

pub fn spawn_connectivity_listener<P>(
    engine: Arc<TransferSyncEngine<P>>,
    mut online: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    P: QueuePayload,
{
    tokio::spawn(async move {
        let initial = *online.borrow_and_update();
        engine.on_connectivity_change(initial);

        while online.changed().await.is_ok() {
            let is_online = *online.borrow_and_update();
            engine.on_connectivity_change(is_online);
        }
        debug!("connectivity monitor closed");
    })
}

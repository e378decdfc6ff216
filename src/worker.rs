use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::complaints::ComplaintSyncEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    Submit(String),
    RetryAll,
    Shutdown,
}

/// Background task that drains submit requests one at a time and runs a
/// retry pass on every tick.
pub struct SyncWorker {
    engine: Arc<ComplaintSyncEngine>,
    sender: UnboundedSender<SyncCommand>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Must be called from within a tokio runtime.
    pub fn spawn(engine: Arc<ComplaintSyncEngine>, period: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        engine.attach_dispatcher(sender.clone());
        let handle = tokio::spawn(run(Arc::clone(&engine), receiver, period));
        info!(target: "remote_sync", period_secs = period.as_secs(), "sync worker started");
        Self {
            engine,
            sender,
            handle,
        }
    }

    pub fn submit(&self, id: impl Into<String>) -> bool {
        self.sender.send(SyncCommand::Submit(id.into())).is_ok()
    }

    pub fn retry_all(&self) -> bool {
        self.sender.send(SyncCommand::RetryAll).is_ok()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Lets the in-progress command finish, then stops the loop.
    pub async fn shutdown(self) {
        self.engine.detach_dispatcher();
        let _ = self.sender.send(SyncCommand::Shutdown);
        if let Err(err) = self.handle.await {
            debug!(target: "remote_sync", ?err, "sync worker ended abnormally");
        }
        info!(target: "remote_sync", "sync worker stopped");
    }
}

async fn run(
    engine: Arc<ComplaintSyncEngine>,
    mut receiver: UnboundedReceiver<SyncCommand>,
    period: Duration,
) {
    let mut ticker = interval(period.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(SyncCommand::Submit(id)) => {
                    let outcome = engine.try_remote_submit(&id).await;
                    debug!(target: "remote_sync", id = %id, ?outcome, "queued submit processed");
                }
                Some(SyncCommand::RetryAll) => {
                    engine.retry_unsent_complaints().await;
                }
                Some(SyncCommand::Shutdown) | None => break,
            },
            _ = ticker.tick() => {
                engine.retry_unsent_complaints().await;
            }
        }
    }
}

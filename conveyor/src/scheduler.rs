//! The scheduler loop, which turns due queue items into leased work.

use std::time::Duration;

use rusqlite::TransactionBehavior;
use tracing::{event, Level};
use uuid::Uuid;

use crate::{
    error::Result,
    events::EventKind,
    item::ItemState,
    item_store,
    shuffle::interleave_by,
    store::Store,
    work_queue, SmartString,
};

/// Configuration for a [Scheduler].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// How long to sleep between ticks when the queue is drained. Defaults
    /// to one second.
    pub poll_interval: Duration,
    /// Most items claimed per tick. A tick that claims a full batch reruns
    /// immediately instead of sleeping. Defaults to 100.
    pub batch_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// A running scheduler loop.
///
/// Each tick claims due items, interleaves them round-robin across tenants,
/// publishes a work record for each, and marks the items running, all in one
/// transaction. Any number of schedulers may run against the same store;
/// their ticks serialize on the store's write lock and each claims whatever
/// is due when its turn comes.
pub struct Scheduler {
    stop: tokio::sync::watch::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl Scheduler {
    /// Start a scheduler with default options.
    pub fn start(store: &Store) -> Scheduler {
        Scheduler::with_options(store, SchedulerOptions::default())
    }

    /// Start a scheduler with the given options.
    pub fn with_options(store: &Store, options: SchedulerOptions) -> Scheduler {
        let (stop, stop_rx) = tokio::sync::watch::channel(());
        let join = tokio::spawn(run_loop(store.clone(), options, stop_rx));
        Scheduler { stop, join }
    }

    /// Stop the loop and wait for any in-flight tick to finish.
    pub async fn close(self) -> Result<()> {
        self.stop.send(()).ok();
        self.join.await?;
        Ok(())
    }
}

async fn run_loop(
    store: Store,
    options: SchedulerOptions,
    mut stop: tokio::sync::watch::Receiver<()>,
) {
    let mut close = store.close.clone();
    event!(Level::INFO, batch_size = options.batch_size, "starting scheduler");

    loop {
        let full_batch = match tick(&store, options.batch_size).await {
            Ok(full) => full,
            Err(e) => {
                event!(Level::ERROR, error = %e, "scheduler tick failed");
                false
            }
        };

        if full_batch {
            // Keep draining, but notice a shutdown between reruns.
            if stop.has_changed().unwrap_or(true) || close.has_changed().unwrap_or(true) {
                break;
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(options.poll_interval) => {}
            _ = stop.changed() => break,
            _ = close.changed() => break,
        }
    }

    event!(Level::INFO, "scheduler stopped");
}

/// One scheduling pass. Returns true if a full batch was claimed and more
/// work is likely waiting.
pub(crate) async fn tick(store: &Store, batch_size: usize) -> Result<bool> {
    let now = store.time.now();
    let (claimed, full_batch) = store
        .interact(move |db| {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let items = item_store::fetch_due_items(&tx, batch_size, now)?;
            if items.is_empty() {
                tx.commit()?;
                return Ok((Vec::new(), false));
            }
            let full_batch = items.len() >= batch_size;

            let shuffled = interleave_by(items, |item| item.tenant_id.clone());
            let work: Vec<(Uuid, SmartString)> = shuffled
                .iter()
                .map(|item| (item.id, item.tenant_id.clone()))
                .collect();
            work_queue::insert_work_items(&tx, &work, now)?;

            let ids: Vec<Uuid> = shuffled.iter().map(|item| item.id).collect();
            item_store::mark_items(&tx, ItemState::Running, &ids, now)?;

            tx.commit()?;
            Ok((ids, full_batch))
        })
        .await?;

    if !claimed.is_empty() {
        event!(Level::DEBUG, count = claimed.len(), "scheduled work");
    }
    for id in claimed {
        store.emit(EventKind::ItemRunning { id });
    }

    Ok(full_batch)
}

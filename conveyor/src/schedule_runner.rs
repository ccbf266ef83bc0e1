//! The schedule runner loop, which fires due schedules as new queue items.

use std::time::Duration;

use rusqlite::{Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{event, Level};
use uuid::Uuid;

use crate::{
    error::Result,
    events::EventKind,
    item::NewItem,
    item_store,
    schedules::{self, Schedule},
    shuffle::interleave_by,
    store::Store,
    SmartString,
};

/// Configuration for a [ScheduleRunner].
#[derive(Debug, Clone)]
pub struct ScheduleRunnerOptions {
    /// How long to sleep between ticks. Schedule resolution is bounded by
    /// this. Defaults to ten seconds.
    pub poll_interval: Duration,
    /// Most schedules fired per tick. A full batch reruns the tick
    /// immediately. Defaults to 100.
    pub batch_size: usize,
}

impl Default for ScheduleRunnerOptions {
    fn default() -> Self {
        ScheduleRunnerOptions {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

/// A running schedule runner loop.
///
/// Each tick claims due schedules, fans them out round-robin across tenants,
/// and for each one pushes a queue item and advances the schedule's next
/// trigger instant. One schedule failing to fire is logged and rolled back
/// without affecting the rest of the batch.
pub struct ScheduleRunner {
    stop: tokio::sync::watch::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ScheduleRunner {
    /// Start a schedule runner with default options.
    pub fn start(store: &Store) -> ScheduleRunner {
        ScheduleRunner::with_options(store, ScheduleRunnerOptions::default())
    }

    /// Start a schedule runner with the given options.
    pub fn with_options(store: &Store, options: ScheduleRunnerOptions) -> ScheduleRunner {
        let (stop, stop_rx) = tokio::sync::watch::channel(());
        let join = tokio::spawn(run_loop(store.clone(), options, stop_rx));
        ScheduleRunner { stop, join }
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
    options: ScheduleRunnerOptions,
    mut stop: tokio::sync::watch::Receiver<()>,
) {
    let mut close = store.close.clone();
    event!(Level::INFO, batch_size = options.batch_size, "starting schedule runner");

    loop {
        let full_batch = match tick(&store, options.batch_size).await {
            Ok(full) => full,
            Err(e) => {
                event!(Level::ERROR, error = %e, "schedule runner tick failed");
                false
            }
        };

        if full_batch {
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

    event!(Level::INFO, "schedule runner stopped");
}

/// One firing pass. Returns true if a full batch was claimed.
pub(crate) async fn tick(store: &Store, batch_size: usize) -> Result<bool> {
    let now = store.time.now();
    let (fired, full_batch) = store
        .interact(move |db| {
            let mut tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let due = schedules::fetch_due_schedules(&tx, batch_size, now)?;
            let full_batch = due.len() >= batch_size;
            let due = interleave_by(due, |schedule| schedule.tenant_id.clone());

            let mut fired = Vec::new();
            for schedule in due {
                match fire_one(&mut tx, &schedule, now) {
                    Ok(item) => fired.push((schedule.id, item)),
                    Err(e) => {
                        event!(
                            Level::ERROR,
                            schedule_id = %schedule.id,
                            name = %schedule.name,
                            error = %e,
                            "failed to fire schedule"
                        );
                    }
                }
            }

            tx.commit()?;
            Ok((fired, full_batch))
        })
        .await?;

    for (schedule_id, (item_id, tenant_id, queue)) in fired {
        store.emit(EventKind::ItemPushed {
            id: item_id,
            tenant_id,
            queue,
        });
        store.emit(EventKind::ScheduleTriggered {
            id: schedule_id,
            item_id,
        });
    }

    Ok(full_batch)
}

/// Push the schedule's item and advance its trigger instant inside a
/// savepoint, so a failure rolls back just this schedule.
fn fire_one(
    tx: &mut Transaction,
    schedule: &Schedule,
    now: OffsetDateTime,
) -> Result<(Uuid, SmartString, SmartString)> {
    let sp = tx.savepoint()?;

    let item = NewItem {
        queue: schedule.queue.clone(),
        job_type: schedule.job_type.clone(),
        key: None,
        schedule_id: Some(schedule.id),
        run_after: None,
        payload: schedule.payload.clone(),
        payload_type: schedule.payload_type.clone(),
        target: schedule.target.clone(),
        retry_policy: schedule.retry_policy.clone(),
    };
    let inserted = item_store::insert_item(&sp, &schedule.tenant_id, &item, now)?;

    let next_run = schedule.spec.next_run(now, &schedule.timezone)?;
    schedules::advance_schedule(&sp, schedule, next_run, now)?;

    sp.commit()?;
    Ok((inserted.id, inserted.tenant_id, inserted.queue))
}

//! The worker loop, which executes leased work and finalizes items.

use std::{fmt::Debug, sync::Arc, time::Duration};

use tracing::{event, Level};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    events::EventKind,
    item::{truncate_error, HistoryItem, ItemState, QueueItem},
    item_store,
    registry::{HandlerRegistry, WorkError, WorkResult},
    retry::RetryPolicy,
    store::Store,
    work_queue::{self, WorkItem},
    SmartString,
};

/// A builder for a [Worker].
pub struct WorkerBuilder<'a, CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    store: &'a Store,
    registry: HandlerRegistry<CONTEXT>,
    context: CONTEXT,
    node_id: SmartString,
    poll_interval: Duration,
    batch_size: usize,
    lock_timeout: Duration,
}

impl<'a, CONTEXT> WorkerBuilder<'a, CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// Create a worker builder. The `node_id` identifies this worker for
    /// lease ownership and must not be shared with any other live worker
    /// process on the same store.
    pub fn new(
        store: &'a Store,
        registry: HandlerRegistry<CONTEXT>,
        context: CONTEXT,
        node_id: impl Into<SmartString>,
    ) -> Self {
        WorkerBuilder {
            store,
            registry,
            context,
            node_id: node_id.into(),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            lock_timeout: Duration::from_secs(120),
        }
    }

    /// How long to sleep between ticks when no work is waiting. Defaults to
    /// one second.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Most leases taken per tick. Items in a tick run sequentially;
    /// parallelism comes from running more workers. Defaults to 10.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// How long a lease is held before other workers may take it over.
    /// Must comfortably exceed the slowest handler. Defaults to two minutes.
    pub fn lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Register the node id, release any leases left over from a previous
    /// run of the same node, and start polling.
    pub async fn build(self) -> Result<Worker> {
        let store = self.store.clone();

        {
            let mut nodes = store.nodes.lock().unwrap_or_else(|e| e.into_inner());
            if !nodes.insert(self.node_id.clone()) {
                return Err(Error::WorkerAlreadyStarted(self.node_id.to_string()));
            }
        }

        let node_id = self.node_id.clone();
        let released = match store
            .interact(move |db| work_queue::unlock_all(db, &node_id))
            .await
        {
            Ok(released) => released,
            Err(e) => {
                // Unregister so the node id is not leaked by a failed start.
                let mut nodes = store.nodes.lock().unwrap_or_else(|e| e.into_inner());
                nodes.remove(&self.node_id);
                return Err(e);
            }
        };
        if released > 0 {
            event!(
                Level::INFO,
                node_id = %self.node_id,
                released,
                "released stale leases from previous run"
            );
        }

        let inner = Arc::new(WorkerInner {
            store: store.clone(),
            registry: self.registry,
            context: self.context,
            node_id: self.node_id.clone(),
            batch_size: self.batch_size,
            lock_timeout: self.lock_timeout,
        });

        let (stop, stop_rx) = tokio::sync::watch::channel(());
        let join = tokio::spawn(run_loop(inner, self.poll_interval, stop_rx));

        Ok(Worker {
            node_id: self.node_id,
            stop,
            join,
        })
    }
}

/// A running worker loop.
pub struct Worker {
    node_id: SmartString,
    stop: tokio::sync::watch::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl Worker {
    /// Create a builder for a worker on the given store.
    pub fn builder<CONTEXT>(
        store: &Store,
        registry: HandlerRegistry<CONTEXT>,
        context: CONTEXT,
        node_id: impl Into<SmartString>,
    ) -> WorkerBuilder<CONTEXT>
    where
        CONTEXT: Send + Sync + Debug + Clone + 'static,
    {
        WorkerBuilder::new(store, registry, context, node_id)
    }

    /// The worker's node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Stop polling and wait for the in-flight tick, including any handler
    /// it is running, to finish.
    pub async fn close(self) -> Result<()> {
        self.stop.send(()).ok();
        self.join.await?;
        Ok(())
    }
}

struct WorkerInner<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    store: Store,
    registry: HandlerRegistry<CONTEXT>,
    context: CONTEXT,
    node_id: SmartString,
    batch_size: usize,
    lock_timeout: Duration,
}

async fn run_loop<CONTEXT>(
    worker: Arc<WorkerInner<CONTEXT>>,
    poll_interval: Duration,
    mut stop: tokio::sync::watch::Receiver<()>,
) where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    let mut close = worker.store.close.clone();
    event!(Level::INFO, node_id = %worker.node_id, "starting worker");

    loop {
        let full_batch = match worker.tick().await {
            Ok(full) => full,
            Err(e) => {
                event!(Level::ERROR, error = %e, "worker tick failed");
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
            _ = tokio::time::sleep(poll_interval) => {}
            _ = stop.changed() => break,
            _ = close.changed() => break,
        }
    }

    let mut nodes = worker.store.nodes.lock().unwrap_or_else(|e| e.into_inner());
    nodes.remove(&worker.node_id);
    event!(Level::INFO, node_id = %worker.node_id, "worker stopped");
}

impl<CONTEXT> WorkerInner<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// One polling pass. Returns true when a full batch was leased and the
    /// tick should rerun immediately.
    async fn tick(&self) -> Result<bool> {
        let now = self.store.time.now();
        let node_id = self.node_id.clone();
        let batch_size = self.batch_size;
        let lock_timeout = self.lock_timeout;

        let leased = self
            .store
            .interact(move |db| {
                work_queue::lease_work_items(db, &node_id, batch_size, lock_timeout, now)
            })
            .await?;

        let full_batch = leased.len() >= self.batch_size;
        for lease in leased {
            self.run_one(lease).await;
        }

        Ok(full_batch)
    }

    /// Run a single leased item and finalize it, then release the lease.
    /// Never fails the tick; every outcome is persisted or logged.
    async fn run_one(&self, lease: WorkItem) {
        let lease_id = lease.id;
        let item = self
            .store
            .interact(move |db| item_store::get_item(db, &lease_id))
            .await;

        match item {
            Ok(Some(item)) => {
                let id = item.id;
                let outcome = match self.registry.get(&item.job_type) {
                    Some(handler) => (handler.runner)(item.clone(), self.context.clone()).await,
                    None => Err(WorkError::message(format!(
                        "no handler registered for type {}",
                        item.job_type
                    ))),
                };

                let finalized = match outcome {
                    Ok(result) => {
                        event!(Level::DEBUG, %id, "item completed");
                        self.completed(item, result).await
                    }
                    Err(error) => self.failed(item, error).await,
                };

                if let Err(e) = finalized {
                    event!(Level::ERROR, %id, error = %e, "failed to finalize item");
                }
            }
            Ok(None) => {
                // Orphaned lease; the item was already finalized elsewhere.
                event!(Level::WARN, id = %lease.id, "leased item not found, skipping");
            }
            Err(e) => {
                event!(Level::ERROR, id = %lease.id, error = %e, "failed to load leased item");
            }
        }

        let delete = self
            .store
            .interact(move |db| work_queue::delete_work_item(db, &lease))
            .await;
        if let Err(e) = delete {
            event!(Level::ERROR, id = %lease_id, error = %e, "failed to release lease");
        }
    }

    async fn completed(&self, item: QueueItem, result: WorkResult) -> Result<()> {
        let now = self.store.time.now();
        let id = item.id;
        let history = HistoryItem {
            id: item.id,
            tenant_id: item.tenant_id,
            key: item.key,
            queue: item.queue,
            job_type: item.job_type,
            schedule_id: item.schedule_id,
            created: now,
            scheduled: item.created,
            started: item.started.unwrap_or(now),
            state: ItemState::Completed,
            tries: item.tries + 1,
            payload: item.payload,
            payload_type: item.payload_type,
            result: result.payload,
            result_type: result.payload_type,
            target: item.target,
            error: None,
        };

        self.store
            .interact(move |db| {
                let tx = db.transaction()?;
                item_store::insert_history(&tx, &history)?;
                item_store::delete_item(&tx, &history.id)?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        self.store.emit(EventKind::ItemCompleted { id });
        Ok(())
    }

    async fn failed(&self, item: QueueItem, error: WorkError) -> Result<()> {
        let (message, result) = match error {
            WorkError::Handler { message, result } => (truncate_error(&message), result),
            WorkError::Unexpected(report) => {
                let correlation_id = Uuid::now_v7();
                event!(
                    Level::ERROR,
                    id = %item.id,
                    %correlation_id,
                    error = ?report,
                    "unexpected handler error"
                );
                (format!("unknown error: {correlation_id}"), None)
            }
        };

        let policy = match &item.retry_policy {
            Some(policy) => policy.clone(),
            None => self.queue_policy(&item).await?,
        };

        let now = self.store.time.now();
        match policy.next_delay(item.tries + 1) {
            Some(delay) => {
                let run_after = now + delay;
                event!(Level::DEBUG, id = %item.id, ?delay, "item failed, will retry");

                let mut retried = item;
                let id = retried.id;
                retried.state = ItemState::Retry;
                retried.tries += 1;
                retried.started = None;
                retried.run_after = Some(run_after);
                retried.result_type = result.as_ref().and_then(|r| r.payload_type.clone());
                retried.result = result.and_then(|r| r.payload);
                retried.error = Some(message);

                self.store
                    .interact(move |db| item_store::update_item(db, &retried, now))
                    .await?;
                self.store.emit(EventKind::ItemRetrying { id, run_after });
            }
            None => {
                event!(Level::DEBUG, id = %item.id, "item exhausted retries, failing");
                let id = item.id;
                let history = HistoryItem {
                    id: item.id,
                    tenant_id: item.tenant_id,
                    key: item.key,
                    queue: item.queue,
                    job_type: item.job_type,
                    schedule_id: item.schedule_id,
                    created: now,
                    scheduled: item.created,
                    started: item.started.unwrap_or(now),
                    state: ItemState::Failed,
                    tries: item.tries + 1,
                    payload: item.payload,
                    payload_type: item.payload_type,
                    result: result.as_ref().and_then(|r| r.payload.clone()),
                    result_type: result.and_then(|r| r.payload_type),
                    target: item.target,
                    error: Some(message),
                };

                self.store
                    .interact(move |db| {
                        let tx = db.transaction()?;
                        item_store::insert_history(&tx, &history)?;
                        item_store::delete_item(&tx, &history.id)?;
                        tx.commit()?;
                        Ok(())
                    })
                    .await?;
                self.store.emit(EventKind::ItemFailed { id });
            }
        }

        Ok(())
    }

    /// The queue's configured retry policy, or the system default.
    async fn queue_policy(&self, item: &QueueItem) -> Result<RetryPolicy> {
        let tenant_id = item.tenant_id.clone();
        let queue = item.queue.clone();
        let config = self
            .store
            .interact(move |db| item_store::get_config(db, &tenant_id, &queue))
            .await?;

        Ok(config
            .and_then(|c| c.retry_policy)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        item::NewItem,
        item_store::{ConfigUpdate, Queues},
        registry::Handler,
        scheduler,
        test_util::{wait_for, TestEnvironment},
    };

    #[derive(Debug, Clone, Default)]
    struct Counters {
        runs: Arc<AtomicU32>,
    }

    fn registry_completing() -> HandlerRegistry<Counters> {
        HandlerRegistry::new([Handler::new("job", |_item, ctx: Counters| async move {
            ctx.runs.fetch_add(1, Ordering::SeqCst);
            WorkResult::json(&"done").map_err(|e| WorkError::Unexpected(e.into()))
        })])
    }

    #[tokio::test]
    async fn completes_item_end_to_end() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);
        let counters = Counters::default();

        let worker = Worker::builder(
            &env.store,
            registry_completing(),
            counters.clone(),
            "node-1",
        )
        .poll_interval(Duration::from_millis(20))
        .build()
        .await
        .unwrap();

        let item = queues
            .push("tenant-1", NewItem::builder("default", "job").build())
            .await
            .unwrap();
        scheduler::tick(&env.store, 100).await.unwrap();

        let history = wait_for("item to complete", || async {
            queues.get_history_item(item.id).await
        })
        .await;

        assert_eq!(history.state, ItemState::Completed);
        assert_eq!(history.tries, 1);
        assert_eq!(history.result.as_deref(), Some(&br#""done""#[..]));
        assert_eq!(counters.runs.load(Ordering::SeqCst), 1);

        // The active row and the lease are both gone.
        assert!(matches!(
            queues.get_item(item.id).await,
            Err(Error::NotFound)
        ));
        assert!(env.work_queue_ids().await.is_empty());

        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn handler_failure_retries_then_fails() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);
        let counters = Counters::default();

        let registry = HandlerRegistry::new([Handler::new(
            "job",
            |_item, ctx: Counters| async move {
                ctx.runs.fetch_add(1, Ordering::SeqCst);
                Err::<WorkResult, _>(WorkError::message("boom"))
            },
        )]);

        let worker = Worker::builder(&env.store, registry, counters.clone(), "node-1")
            .poll_interval(Duration::from_millis(20))
            .build()
            .await
            .unwrap();
        let scheduler = crate::Scheduler::with_options(
            &env.store,
            crate::SchedulerOptions {
                poll_interval: Duration::from_millis(20),
                batch_size: 100,
            },
        );

        let item = queues
            .push(
                "tenant-1",
                NewItem::builder("default", "job")
                    .retry_policy(RetryPolicy::Constant {
                        delay: Duration::from_millis(10),
                        tries: 2,
                    })
                    .build(),
            )
            .await
            .unwrap();

        let history = wait_for("item to fail", || async {
            queues.get_history_item(item.id).await
        })
        .await;

        assert_eq!(history.state, ItemState::Failed);
        // Initial run plus two retries.
        assert_eq!(history.tries, 3);
        assert_eq!(history.error.as_deref(), Some("boom"));
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);

        scheduler.close().await.unwrap();
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_error_gets_correlation_id() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);

        let registry = HandlerRegistry::new([Handler::new("job", |_item, _ctx: ()| async move {
            Err::<WorkResult, _>(WorkError::Unexpected(eyre::eyre!("database exploded")))
        })]);

        let worker = Worker::builder(&env.store, registry, (), "node-1")
            .poll_interval(Duration::from_millis(20))
            .build()
            .await
            .unwrap();

        let item = queues
            .push(
                "tenant-1",
                NewItem::builder("default", "job")
                    .retry_policy(RetryPolicy::Constant {
                        delay: Duration::from_millis(10),
                        tries: 0,
                    })
                    .build(),
            )
            .await
            .unwrap();
        scheduler::tick(&env.store, 100).await.unwrap();

        let history = wait_for("item to fail", || async {
            queues.get_history_item(item.id).await
        })
        .await;

        let error = history.error.unwrap();
        assert!(
            error.starts_with("unknown error: "),
            "internal detail must not leak: {error}"
        );
        assert!(!error.contains("database exploded"));

        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn queue_policy_applies_when_item_has_none() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);

        queues
            .configure(
                "tenant-1",
                "default",
                ConfigUpdate {
                    retry_policy: Some(RetryPolicy::Constant {
                        delay: Duration::from_millis(10),
                        tries: 0,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let registry = HandlerRegistry::new([Handler::new("job", |_item, _ctx: ()| async move {
            Err::<WorkResult, _>(WorkError::message("nope"))
        })]);
        let worker = Worker::builder(&env.store, registry, (), "node-1")
            .poll_interval(Duration::from_millis(20))
            .build()
            .await
            .unwrap();

        let item = queues
            .push("tenant-1", NewItem::builder("default", "job").build())
            .await
            .unwrap();
        scheduler::tick(&env.store, 100).await.unwrap();

        // Zero retries allowed, so the first failure is final.
        let history = wait_for("item to fail", || async {
            queues.get_history_item(item.id).await
        })
        .await;
        assert_eq!(history.state, ItemState::Failed);
        assert_eq!(history.tries, 1);

        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_workers_never_share_an_item() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);

        #[derive(Debug, Clone, Default)]
        struct Overlap {
            active: Arc<std::sync::Mutex<std::collections::HashSet<Uuid>>>,
            overlaps: Arc<AtomicU32>,
            runs: Arc<AtomicU32>,
        }

        let context = Overlap::default();
        let handler = |item: QueueItem, ctx: Overlap| async move {
            {
                let mut active = ctx.active.lock().unwrap();
                if !active.insert(item.id) {
                    ctx.overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            ctx.active.lock().unwrap().remove(&item.id);
            ctx.runs.fetch_add(1, Ordering::SeqCst);
            Ok(WorkResult::none())
        };

        let first = Worker::builder(
            &env.store,
            HandlerRegistry::new([Handler::new("job", handler)]),
            context.clone(),
            "node-1",
        )
        .poll_interval(Duration::from_millis(10))
        .build()
        .await
        .unwrap();
        let second = Worker::builder(
            &env.store,
            HandlerRegistry::new([Handler::new("job", handler)]),
            context.clone(),
            "node-2",
        )
        .poll_interval(Duration::from_millis(10))
        .build()
        .await
        .unwrap();
        let scheduler = crate::Scheduler::with_options(
            &env.store,
            crate::SchedulerOptions {
                poll_interval: Duration::from_millis(10),
                batch_size: 100,
            },
        );

        for _ in 0..8 {
            queues
                .push("tenant-1", NewItem::builder("default", "job").build())
                .await
                .unwrap();
        }

        let counters = context.clone();
        wait_for("all items to run", || async {
            if counters.runs.load(Ordering::SeqCst) >= 8 {
                Ok(())
            } else {
                Err(Error::NotFound)
            }
        })
        .await;

        assert_eq!(context.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(context.runs.load(Ordering::SeqCst), 8);

        scheduler.close().await.unwrap();
        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_node_id_rejected() {
        let env = TestEnvironment::new().await;
        let counters = Counters::default();

        let worker = Worker::builder(
            &env.store,
            registry_completing(),
            counters.clone(),
            "node-1",
        )
        .build()
        .await
        .unwrap();

        let second = Worker::builder(
            &env.store,
            registry_completing(),
            counters.clone(),
            "node-1",
        )
        .build()
        .await;
        assert!(matches!(second, Err(Error::WorkerAlreadyStarted(_))));

        // The node id frees up once the first worker stops.
        worker.close().await.unwrap();
        let third = Worker::builder(
            &env.store,
            registry_completing(),
            counters.clone(),
            "node-1",
        )
        .build()
        .await
        .unwrap();
        third.close().await.unwrap();
    }
}

use std::{collections::HashSet, ops::Deref, path::Path, sync::Arc, time::Duration};

use deadpool_sqlite::{Hook, HookError};
use rusqlite::Connection;
use time::OffsetDateTime;
use tracing::info;

use crate::{
    error::*,
    events::{EventKind, QueueEvent},
    SmartString,
};

/// Options used to configure a [Store] instance.
pub struct StoreOptions<'a> {
    path: &'a Path,
    busy_timeout: Duration,
}

impl<'a> StoreOptions<'a> {
    /// Create a new options object for a [Store].
    pub fn new(path: &'a Path) -> Self {
        StoreOptions {
            path,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// How long a connection waits for SQLite's write lock before giving up.
    /// Claim transactions from concurrent loops serialize on this lock.
    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Build a [Store] from this options object.
    pub async fn build(self) -> Result<Store> {
        Store::with_options(self).await
    }
}

#[doc(hidden)]
pub struct StoreInner {
    pub pool: deadpool_sqlite::Pool,
    pub time: Time,
    pub close: tokio::sync::watch::Receiver<()>,
    close_tx: tokio::sync::watch::Sender<()>,
    events: tokio::sync::broadcast::Sender<QueueEvent>,
    /// Node ids of workers currently started on this store. Guards against
    /// double-starting a worker with the same node id in one process.
    pub nodes: std::sync::Mutex<HashSet<SmartString>>,
}

/// A handle to the backing database, shared by every queue component.
///
/// Any number of [Scheduler](crate::Scheduler), [Worker](crate::Worker), and
/// [ScheduleRunner](crate::ScheduleRunner) instances, in this process or
/// others, may be built on stores pointing at the same database file. Mutual
/// exclusion between them comes entirely from the store's transactions and
/// per-row version counters.
#[derive(Clone)]
pub struct Store(pub(crate) Arc<StoreInner>);

impl Deref for Store {
    type Target = Arc<StoreInner>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Store {
    /// Open or create a queue database at the given path.
    pub async fn new(path: &Path) -> Result<Store> {
        Store::with_options(StoreOptions::new(path)).await
    }

    /// Create a builder object for a [Store].
    pub fn builder(path: &Path) -> StoreOptions {
        StoreOptions::new(path)
    }

    /// Open or create a queue database with the given [StoreOptions].
    pub async fn with_options(options: StoreOptions<'_>) -> Result<Store> {
        let mut conn = Connection::open(options.path).map_err(Error::open_database)?;
        configure_connection(&mut conn, options.busy_timeout).map_err(Error::open_database)?;
        crate::migrations::migrate(&mut conn)?;
        drop(conn);

        let busy_timeout = options.busy_timeout;
        let pool = deadpool_sqlite::Config::new(options.path)
            .builder(deadpool_sqlite::Runtime::Tokio1)
            .map_err(Error::open_database)?
            .recycle_timeout(Some(Duration::from_secs(5 * 60)))
            .post_create(Hook::async_fn(move |conn, _| {
                Box::pin(async move {
                    conn.interact(move |c| configure_connection(c, busy_timeout))
                        .await
                        .map_err(|e| HookError::Message(e.to_string().into()))?
                        .map_err(HookError::Backend)?;
                    Ok(())
                })
            }))
            .build()
            .map_err(Error::open_database)?;

        let (close_tx, close_rx) = tokio::sync::watch::channel(());
        let (events, _) = tokio::sync::broadcast::channel(64);

        info!(path = %options.path.display(), "opened queue store");

        Ok(Store(Arc::new(StoreInner {
            pool,
            time: Time::new(),
            close: close_rx,
            close_tx,
            events,
            nodes: std::sync::Mutex::new(HashSet::new()),
        })))
    }

    /// Signal every loop built on this store to stop after its in-flight
    /// tick. Call [Scheduler::close](crate::Scheduler::close) and friends to
    /// actually wait for them.
    pub fn close(&self) {
        self.close_tx.send(()).ok();
    }

    /// Subscribe to [QueueEvent]s emitted by components using this store.
    /// Events from other processes sharing the database are not seen here.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event. Only called after the transaction that produced
    /// it has committed.
    pub(crate) fn emit(&self, kind: EventKind) {
        self.events
            .send(QueueEvent {
                created: self.time.now(),
                kind,
            })
            .ok();
    }

    /// Run a closure against a pooled connection.
    pub(crate) async fn interact<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.get().await?;
        conn.interact(f).await?
    }
}

fn configure_connection(
    conn: &mut Connection,
    busy_timeout: Duration,
) -> Result<(), rusqlite::Error> {
    // Setting the journal mode returns the resulting mode as a row, so it
    // cannot go through plain pragma_update.
    conn.pragma_update_and_check(None, "journal_mode", "wal", |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "normal")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

#[doc(hidden)]
#[derive(Clone)]
pub struct Time {
    start_instant: tokio::time::Instant,
    start_time: time::OffsetDateTime,
}

impl Time {
    pub fn new() -> Self {
        let start_instant = tokio::time::Instant::now();
        let start_time = time::OffsetDateTime::now_utc();

        Time {
            start_instant,
            start_time,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        let now = self.start_instant.elapsed();
        self.start_time + now
    }
}

/// Timestamps are persisted as integer unix milliseconds; retry jitter is
/// sub-second so whole seconds would not round-trip.
pub(crate) fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_ms(ms: i64, field: &'static str) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|_| Error::TimestampOutOfRange(field))
}

pub(crate) fn from_ms_opt(ms: Option<i64>, field: &'static str) -> Result<Option<OffsetDateTime>> {
    ms.map(|ms| from_ms(ms, field)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let now = OffsetDateTime::now_utc();
        let ms = to_ms(now);
        let back = from_ms(ms, "now").unwrap();
        assert_eq!(to_ms(back), ms);
    }

    #[tokio::test]
    async fn opens_database_in_wal_mode() {
        let env = crate::test_util::TestEnvironment::new().await;

        let mode: String = env
            .store
            .interact(|db| Ok(db.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(mode, "wal");
    }
}

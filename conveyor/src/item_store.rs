//! Storage operations for active queue items, history, and queue
//! configuration.
//!
//! The free functions in this module run against a borrowed connection so
//! that the polling loops can compose them inside a single transaction. The
//! [Queues] facade wraps them for callers who just want one operation at a
//! time.

use rusqlite::{named_params, params, Connection, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    events::EventKind,
    item::{HistoryItem, ItemState, NewItem, QueueConfig, QueueItem},
    retry::RetryPolicy,
    store::{from_ms, from_ms_opt, to_ms, Store},
    SmartString,
};

const ITEM_COLUMNS: &str = "id, tenant_id, key, queue, job_type, schedule_id, version, tries, \
     state, created, updated, started, run_after, payload, payload_type, target, retry_policy, \
     result, result_type, error";

fn parse_uuid(value: String, field: &'static str) -> Result<Uuid> {
    Uuid::parse_str(&value).map_err(|_| Error::InvalidId(field))
}

fn parse_retry_policy(value: Option<String>) -> Result<Option<RetryPolicy>> {
    value.map(|p| RetryPolicy::from_json(&p)).transpose()
}

fn item_from_row(row: &Row) -> Result<QueueItem> {
    let state = row
        .get::<_, String>(8)
        .map_err(|e| Error::ColumnType(e, "state"))?
        .parse::<ItemState>()?;

    Ok(QueueItem {
        id: parse_uuid(row.get(0).map_err(|e| Error::ColumnType(e, "id"))?, "id")?,
        tenant_id: SmartString::from(
            row.get::<_, String>(1)
                .map_err(|e| Error::ColumnType(e, "tenant_id"))?,
        ),
        key: row.get(2).map_err(|e| Error::ColumnType(e, "key"))?,
        queue: SmartString::from(
            row.get::<_, String>(3)
                .map_err(|e| Error::ColumnType(e, "queue"))?,
        ),
        job_type: SmartString::from(
            row.get::<_, String>(4)
                .map_err(|e| Error::ColumnType(e, "job_type"))?,
        ),
        schedule_id: row
            .get::<_, Option<String>>(5)
            .map_err(|e| Error::ColumnType(e, "schedule_id"))?
            .map(|id| parse_uuid(id, "schedule_id"))
            .transpose()?,
        version: row.get(6).map_err(|e| Error::ColumnType(e, "version"))?,
        tries: row
            .get::<_, i64>(7)
            .map_err(|e| Error::ColumnType(e, "tries"))? as u32,
        state,
        created: from_ms(
            row.get(9).map_err(|e| Error::ColumnType(e, "created"))?,
            "created",
        )?,
        updated: from_ms_opt(
            row.get(10).map_err(|e| Error::ColumnType(e, "updated"))?,
            "updated",
        )?,
        started: from_ms_opt(
            row.get(11).map_err(|e| Error::ColumnType(e, "started"))?,
            "started",
        )?,
        run_after: from_ms_opt(
            row.get(12).map_err(|e| Error::ColumnType(e, "run_after"))?,
            "run_after",
        )?,
        payload: row.get(13).map_err(|e| Error::ColumnType(e, "payload"))?,
        payload_type: row
            .get(14)
            .map_err(|e| Error::ColumnType(e, "payload_type"))?,
        target: row.get(15).map_err(|e| Error::ColumnType(e, "target"))?,
        retry_policy: parse_retry_policy(
            row.get(16)
                .map_err(|e| Error::ColumnType(e, "retry_policy"))?,
        )?,
        result: row.get(17).map_err(|e| Error::ColumnType(e, "result"))?,
        result_type: row
            .get(18)
            .map_err(|e| Error::ColumnType(e, "result_type"))?,
        error: row.get(19).map_err(|e| Error::ColumnType(e, "error"))?,
    })
}

/// Insert a new item, or overwrite the existing item sharing its
/// idempotency key. An overwrite keeps the existing row's id but resets the
/// payload, schedule, state, and try count as if the item were new.
pub(crate) fn insert_item(
    db: &Connection,
    tenant_id: &str,
    item: &NewItem,
    now: OffsetDateTime,
) -> Result<QueueItem> {
    let mut stmt = db.prepare_cached(&format!(
        "INSERT INTO queue
            (id, tenant_id, key, queue, job_type, schedule_id, version, tries, state,
             created, run_after, payload, payload_type, target, retry_policy)
        VALUES
            (:id, :tenant_id, :key, :queue, :job_type, :schedule_id, 0, 0, 'PENDING',
             :created, :run_after, :payload, :payload_type, :target, :retry_policy)
        ON CONFLICT (tenant_id, queue, key) WHERE key IS NOT NULL DO UPDATE
        SET job_type = excluded.job_type,
            schedule_id = excluded.schedule_id,
            state = 'PENDING',
            tries = 0,
            version = queue.version + 1,
            updated = excluded.created,
            started = NULL,
            run_after = excluded.run_after,
            payload = excluded.payload,
            payload_type = excluded.payload_type,
            target = excluded.target,
            retry_policy = excluded.retry_policy,
            result = NULL,
            result_type = NULL,
            error = NULL
        RETURNING {ITEM_COLUMNS}"
    ))?;

    let retry_policy = item
        .retry_policy
        .as_ref()
        .map(|p| p.to_json())
        .transpose()?;

    let mut rows = stmt.query(named_params! {
        ":id": Uuid::now_v7().to_string(),
        ":tenant_id": tenant_id,
        ":key": item.key,
        ":queue": item.queue.as_str(),
        ":job_type": item.job_type.as_str(),
        ":schedule_id": item.schedule_id.map(|id| id.to_string()),
        ":created": to_ms(now),
        ":run_after": item.run_after.map(to_ms),
        ":payload": item.payload,
        ":payload_type": item.payload_type,
        ":target": item.target,
        ":retry_policy": retry_policy,
    })?;

    let row = rows.next()?.ok_or(Error::NotFound)?;
    item_from_row(row)
}

pub(crate) fn get_item(db: &Connection, id: &Uuid) -> Result<Option<QueueItem>> {
    let mut stmt =
        db.prepare_cached(&format!("SELECT {ITEM_COLUMNS} FROM queue WHERE id = ?"))?;
    let mut rows = stmt.query(params![id.to_string()])?;
    rows.next()?.map(item_from_row).transpose()
}

/// Apply the item's mutable fields, guarded by its version. Fails with
/// [Error::VersionConflict] if a concurrent writer got there first.
pub(crate) fn update_item(db: &Connection, item: &QueueItem, now: OffsetDateTime) -> Result<()> {
    let mut stmt = db.prepare_cached(
        "UPDATE queue
        SET version = version + 1,
            updated = :updated,
            state = :state,
            key = :key,
            job_type = :job_type,
            tries = :tries,
            started = :started,
            run_after = :run_after,
            payload = :payload,
            payload_type = :payload_type,
            target = :target,
            retry_policy = :retry_policy,
            result = :result,
            result_type = :result_type,
            error = :error
        WHERE id = :id AND version = :version",
    )?;

    let retry_policy = item
        .retry_policy
        .as_ref()
        .map(|p| p.to_json())
        .transpose()?;

    let changed = stmt.execute(named_params! {
        ":id": item.id.to_string(),
        ":version": item.version,
        ":updated": to_ms(now),
        ":state": item.state.as_str(),
        ":key": item.key,
        ":job_type": item.job_type.as_str(),
        ":tries": item.tries as i64,
        ":started": item.started.map(to_ms),
        ":run_after": item.run_after.map(to_ms),
        ":payload": item.payload,
        ":payload_type": item.payload_type,
        ":target": item.target,
        ":retry_policy": retry_policy,
        ":result": item.result,
        ":result_type": item.result_type,
        ":error": item.error,
    })?;

    if changed == 1 {
        Ok(())
    } else {
        Err(Error::VersionConflict)
    }
}

pub(crate) fn delete_item(db: &Connection, id: &Uuid) -> Result<()> {
    let mut stmt = db.prepare_cached("DELETE FROM queue WHERE id = ?")?;
    let changed = stmt.execute(params![id.to_string()])?;
    if changed == 1 {
        Ok(())
    } else {
        Err(Error::NotFound)
    }
}

/// Fetch items due for execution, oldest first, skipping paused queues.
/// Callers run this inside a write transaction so the rows cannot change
/// between being read here and being marked running.
pub(crate) fn fetch_due_items(
    db: &Connection,
    limit: usize,
    now: OffsetDateTime,
) -> Result<Vec<QueueItem>> {
    let mut stmt = db.prepare_cached(&format!(
        "SELECT {ITEM_COLUMNS} FROM queue
        WHERE state IN ('PENDING', 'RETRY')
            AND (run_after IS NULL OR run_after <= :now)
            AND NOT EXISTS (
                SELECT 1 FROM queue_config c
                WHERE c.tenant_id = queue.tenant_id AND c.queue = queue.queue AND c.paused
            )
        ORDER BY created, id
        LIMIT :limit"
    ))?;

    let rows = stmt.query_and_then(
        named_params! {
            ":now": to_ms(now),
            ":limit": limit as i64,
        },
        item_from_row,
    )?;

    rows.collect()
}

pub(crate) fn mark_items(
    db: &Connection,
    state: ItemState,
    ids: &[Uuid],
    now: OffsetDateTime,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!(
        "UPDATE queue
        SET state = ?, version = version + 1, updated = ?, started = ?
        WHERE id IN ({placeholders})"
    );
    let mut stmt = db.prepare_cached(&sql)?;

    let now = to_ms(now);
    let started = (state == ItemState::Running).then_some(now);
    let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::with_capacity(ids.len() + 3);
    bound.push(Box::new(state.as_str()));
    bound.push(Box::new(now));
    bound.push(Box::new(started));
    for id in ids {
        bound.push(Box::new(id.to_string()));
    }

    stmt.execute(rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())))?;
    Ok(())
}

/// Write a history record. Rewriting the same id is a no-op so that a crash
/// between finalizing an item and releasing its lease cannot duplicate
/// history when the item is reprocessed.
pub(crate) fn insert_history(db: &Connection, history: &HistoryItem) -> Result<()> {
    let mut stmt = db.prepare_cached(
        "INSERT INTO queue_history
            (id, tenant_id, key, queue, job_type, schedule_id, created, scheduled, started,
             state, tries, payload, payload_type, result, result_type, target, error)
        VALUES
            (:id, :tenant_id, :key, :queue, :job_type, :schedule_id, :created, :scheduled,
             :started, :state, :tries, :payload, :payload_type, :result, :result_type,
             :target, :error)
        ON CONFLICT (id) DO NOTHING",
    )?;

    stmt.execute(named_params! {
        ":id": history.id.to_string(),
        ":tenant_id": history.tenant_id.as_str(),
        ":key": history.key,
        ":queue": history.queue.as_str(),
        ":job_type": history.job_type.as_str(),
        ":schedule_id": history.schedule_id.map(|id| id.to_string()),
        ":created": to_ms(history.created),
        ":scheduled": to_ms(history.scheduled),
        ":started": to_ms(history.started),
        ":state": history.state.as_str(),
        ":tries": history.tries as i64,
        ":payload": history.payload,
        ":payload_type": history.payload_type,
        ":result": history.result,
        ":result_type": history.result_type,
        ":target": history.target,
        ":error": history.error,
    })?;
    Ok(())
}

const HISTORY_COLUMNS: &str = "id, tenant_id, key, queue, job_type, schedule_id, created, \
     scheduled, started, state, tries, payload, payload_type, result, result_type, target, error";

fn history_from_row(row: &Row) -> Result<HistoryItem> {
    let state = row
        .get::<_, String>(9)
        .map_err(|e| Error::ColumnType(e, "state"))?
        .parse::<ItemState>()?;

    Ok(HistoryItem {
        id: parse_uuid(row.get(0).map_err(|e| Error::ColumnType(e, "id"))?, "id")?,
        tenant_id: SmartString::from(
            row.get::<_, String>(1)
                .map_err(|e| Error::ColumnType(e, "tenant_id"))?,
        ),
        key: row.get(2).map_err(|e| Error::ColumnType(e, "key"))?,
        queue: SmartString::from(
            row.get::<_, String>(3)
                .map_err(|e| Error::ColumnType(e, "queue"))?,
        ),
        job_type: SmartString::from(
            row.get::<_, String>(4)
                .map_err(|e| Error::ColumnType(e, "job_type"))?,
        ),
        schedule_id: row
            .get::<_, Option<String>>(5)
            .map_err(|e| Error::ColumnType(e, "schedule_id"))?
            .map(|id| parse_uuid(id, "schedule_id"))
            .transpose()?,
        created: from_ms(
            row.get(6).map_err(|e| Error::ColumnType(e, "created"))?,
            "created",
        )?,
        scheduled: from_ms(
            row.get(7).map_err(|e| Error::ColumnType(e, "scheduled"))?,
            "scheduled",
        )?,
        started: from_ms(
            row.get(8).map_err(|e| Error::ColumnType(e, "started"))?,
            "started",
        )?,
        state,
        tries: row
            .get::<_, i64>(10)
            .map_err(|e| Error::ColumnType(e, "tries"))? as u32,
        payload: row.get(11).map_err(|e| Error::ColumnType(e, "payload"))?,
        payload_type: row
            .get(12)
            .map_err(|e| Error::ColumnType(e, "payload_type"))?,
        result: row.get(13).map_err(|e| Error::ColumnType(e, "result"))?,
        result_type: row
            .get(14)
            .map_err(|e| Error::ColumnType(e, "result_type"))?,
        target: row.get(15).map_err(|e| Error::ColumnType(e, "target"))?,
        error: row.get(16).map_err(|e| Error::ColumnType(e, "error"))?,
    })
}

pub(crate) fn get_history_item(db: &Connection, id: &Uuid) -> Result<Option<HistoryItem>> {
    let mut stmt = db.prepare_cached(&format!(
        "SELECT {HISTORY_COLUMNS} FROM queue_history WHERE id = ?"
    ))?;
    let mut rows = stmt.query(params![id.to_string()])?;
    rows.next()?.map(history_from_row).transpose()
}

fn config_from_row(row: &Row) -> Result<QueueConfig> {
    Ok(QueueConfig {
        tenant_id: SmartString::from(
            row.get::<_, String>(0)
                .map_err(|e| Error::ColumnType(e, "tenant_id"))?,
        ),
        queue: SmartString::from(
            row.get::<_, String>(1)
                .map_err(|e| Error::ColumnType(e, "queue"))?,
        ),
        display_name: row
            .get(2)
            .map_err(|e| Error::ColumnType(e, "display_name"))?,
        paused: row.get(3).map_err(|e| Error::ColumnType(e, "paused"))?,
        retry_policy: parse_retry_policy(
            row.get(4)
                .map_err(|e| Error::ColumnType(e, "retry_policy"))?,
        )?,
        version: row.get(5).map_err(|e| Error::ColumnType(e, "version"))?,
    })
}

pub(crate) fn get_config(
    db: &Connection,
    tenant_id: &str,
    queue: &str,
) -> Result<Option<QueueConfig>> {
    let mut stmt = db.prepare_cached(
        "SELECT tenant_id, queue, display_name, paused, retry_policy, version
        FROM queue_config
        WHERE tenant_id = ? AND queue = ?",
    )?;
    let mut rows = stmt.query(params![tenant_id, queue])?;
    rows.next()?.map(config_from_row).transpose()
}

pub(crate) fn save_config(
    db: &Connection,
    config: &QueueConfig,
    now: OffsetDateTime,
) -> Result<QueueConfig> {
    let mut stmt = db.prepare_cached(
        "INSERT INTO queue_config
            (tenant_id, queue, created, display_name, paused, retry_policy, version)
        VALUES (:tenant_id, :queue, :now, :display_name, :paused, :retry_policy, 0)
        ON CONFLICT (tenant_id, queue) DO UPDATE
        SET display_name = excluded.display_name,
            paused = excluded.paused,
            retry_policy = excluded.retry_policy,
            updated = excluded.created,
            version = queue_config.version + 1
        RETURNING tenant_id, queue, display_name, paused, retry_policy, version",
    )?;

    let retry_policy = config
        .retry_policy
        .as_ref()
        .map(|p| p.to_json())
        .transpose()?;

    let mut rows = stmt.query(named_params! {
        ":tenant_id": config.tenant_id.as_str(),
        ":queue": config.queue.as_str(),
        ":now": to_ms(now),
        ":display_name": config.display_name,
        ":paused": config.paused,
        ":retry_policy": retry_policy,
    })?;

    let row = rows.next()?.ok_or(Error::NotFound)?;
    config_from_row(row)
}

/// An item located by id, wherever it currently lives.
#[derive(Debug, Clone)]
pub enum FetchedItem {
    /// Still active on the queue.
    Active(QueueItem),
    /// Finished and moved to history.
    Finished(HistoryItem),
}

/// Changes to apply to a queue's configuration. Unset fields keep their
/// current value.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    /// New display name.
    pub display_name: Option<String>,
    /// Pause or resume the queue.
    pub paused: Option<bool>,
    /// New default retry policy for the queue.
    pub retry_policy: Option<RetryPolicy>,
}

/// Caller-facing operations on queues and their items.
#[derive(Clone)]
pub struct Queues {
    store: Store,
}

impl Queues {
    /// Create a queue facade on the given store.
    pub fn new(store: &Store) -> Queues {
        Queues {
            store: store.clone(),
        }
    }

    /// Push a new item for the given tenant. If the item carries an
    /// idempotency key that is already present on an active item of the same
    /// tenant and queue, that item is overwritten in place and its try count
    /// reset, rather than a second item being created.
    pub async fn push(&self, tenant_id: impl Into<SmartString>, item: NewItem) -> Result<QueueItem> {
        let tenant_id = tenant_id.into();
        let now = self.store.time.now();
        let inserted = self
            .store
            .interact(move |db| insert_item(db, tenant_id.as_str(), &item, now))
            .await?;

        self.store.emit(EventKind::ItemPushed {
            id: inserted.id,
            tenant_id: inserted.tenant_id.clone(),
            queue: inserted.queue.clone(),
        });

        Ok(inserted)
    }

    /// Fetch an active item.
    pub async fn get_item(&self, id: Uuid) -> Result<QueueItem> {
        self.store
            .interact(move |db| get_item(db, &id))
            .await?
            .ok_or(Error::NotFound)
    }

    /// Find an item wherever it is, checking the active queue first and
    /// falling back to history.
    pub async fn fetch_item(&self, id: Uuid) -> Result<FetchedItem> {
        self.store
            .interact(move |db| {
                if let Some(item) = get_item(db, &id)? {
                    return Ok(Some(FetchedItem::Active(item)));
                }
                Ok(get_history_item(db, &id)?.map(FetchedItem::Finished))
            })
            .await?
            .ok_or(Error::NotFound)
    }

    /// Fetch a finished item from history.
    pub async fn get_history_item(&self, id: Uuid) -> Result<HistoryItem> {
        self.store
            .interact(move |db| get_history_item(db, &id))
            .await?
            .ok_or(Error::NotFound)
    }

    /// Update an active item. The item's `version` must match the stored
    /// row or the update fails with [Error::VersionConflict].
    pub async fn update_item(&self, item: QueueItem) -> Result<()> {
        let now = self.store.time.now();
        self.store
            .interact(move |db| update_item(db, &item, now))
            .await
    }

    /// Remove an active item without running it.
    pub async fn delete_item(&self, id: Uuid) -> Result<()> {
        self.store.interact(move |db| delete_item(db, &id)).await
    }

    /// Fetch a queue's configuration, if it has ever been configured.
    pub async fn get_config(
        &self,
        tenant_id: impl Into<SmartString>,
        queue: impl Into<SmartString>,
    ) -> Result<Option<QueueConfig>> {
        let tenant_id = tenant_id.into();
        let queue = queue.into();
        self.store
            .interact(move |db| get_config(db, tenant_id.as_str(), queue.as_str()))
            .await
    }

    /// Create or update a queue's configuration.
    pub async fn configure(
        &self,
        tenant_id: impl Into<SmartString>,
        queue: impl Into<SmartString>,
        update: ConfigUpdate,
    ) -> Result<QueueConfig> {
        let tenant_id = tenant_id.into();
        let queue = queue.into();
        let now = self.store.time.now();
        self.store
            .interact(move |db| {
                let mut config =
                    get_config(db, tenant_id.as_str(), queue.as_str())?.unwrap_or(QueueConfig {
                        tenant_id,
                        queue,
                        ..Default::default()
                    });

                if let Some(display_name) = update.display_name {
                    config.display_name = Some(display_name);
                }
                if let Some(paused) = update.paused {
                    config.paused = paused;
                }
                if let Some(retry_policy) = update.retry_policy {
                    config.retry_policy = Some(retry_policy);
                }

                save_config(db, &config, now)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{item::NewItem, test_util::TestEnvironment};

    #[tokio::test]
    async fn duplicate_key_overwrites_in_place() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);

        let first = queues
            .push(
                "tenant-1",
                NewItem::builder("default", "job")
                    .key("order-42")
                    .payload(b"v1".to_vec(), "text/plain")
                    .build(),
            )
            .await
            .unwrap();

        let second = queues
            .push(
                "tenant-1",
                NewItem::builder("default", "job")
                    .key("order-42")
                    .payload(b"v2".to_vec(), "text/plain")
                    .build(),
            )
            .await
            .unwrap();

        // Same row, new payload, reset lifecycle.
        assert_eq!(second.id, first.id);
        assert_eq!(second.payload.as_deref(), Some(&b"v2"[..]));
        assert_eq!(second.tries, 0);
        assert_eq!(second.state, ItemState::Pending);
        assert!(second.version > first.version);
        assert_eq!(env.active_items().await.len(), 1);

        // The same key on another tenant is a separate item.
        let other = queues
            .push(
                "tenant-2",
                NewItem::builder("default", "job").key("order-42").build(),
            )
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn items_without_keys_never_collide() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);

        queues
            .push("tenant-1", NewItem::builder("default", "job").build())
            .await
            .unwrap();
        queues
            .push("tenant-1", NewItem::builder("default", "job").build())
            .await
            .unwrap();

        assert_eq!(env.active_items().await.len(), 2);
    }

    #[tokio::test]
    async fn update_requires_current_version() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);

        let item = queues
            .push("tenant-1", NewItem::builder("default", "job").build())
            .await
            .unwrap();

        let mut stale = item.clone();
        stale.version -= 1;
        assert!(matches!(
            queues.update_item(stale).await,
            Err(Error::VersionConflict)
        ));

        let mut current = item;
        current.target = Some("region-eu".to_string());
        queues.update_item(current.clone()).await.unwrap();

        let fetched = queues.get_item(current.id).await.unwrap();
        assert_eq!(fetched.target.as_deref(), Some("region-eu"));
        assert_eq!(fetched.version, current.version + 1);
    }

    #[tokio::test]
    async fn fetch_item_falls_back_to_history() {
        let env = TestEnvironment::new().await;
        let queues = Queues::new(&env.store);

        let item = queues
            .push("tenant-1", NewItem::builder("default", "job").build())
            .await
            .unwrap();

        match queues.fetch_item(item.id).await.unwrap() {
            FetchedItem::Active(active) => assert_eq!(active.id, item.id),
            FetchedItem::Finished(_) => panic!("expected an active item"),
        }

        // Finalize the item by hand.
        let now = env.store.time.now();
        let finished = item.clone();
        env.store
            .interact(move |db| {
                let tx = db.transaction()?;
                insert_history(
                    &tx,
                    &HistoryItem {
                        id: finished.id,
                        tenant_id: finished.tenant_id,
                        key: finished.key,
                        queue: finished.queue,
                        job_type: finished.job_type,
                        schedule_id: None,
                        created: now,
                        scheduled: finished.created,
                        started: now,
                        state: ItemState::Completed,
                        tries: 1,
                        payload: None,
                        payload_type: None,
                        result: None,
                        result_type: None,
                        target: None,
                        error: None,
                    },
                )?;
                delete_item(&tx, &finished.id)?;
                tx.commit()?;
                Ok(())
            })
            .await
            .unwrap();

        match queues.fetch_item(item.id).await.unwrap() {
            FetchedItem::Finished(history) => {
                assert_eq!(history.id, item.id);
                assert_eq!(history.state, ItemState::Completed);
            }
            FetchedItem::Active(_) => panic!("expected a history item"),
        }

        assert!(matches!(
            queues.fetch_item(Uuid::now_v7()).await,
            Err(Error::NotFound)
        ));
    }
}

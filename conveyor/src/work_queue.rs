//! The work distribution table: short-lived lease records pointing at
//! claimed queue items.
//!
//! A lease exists from the moment a scheduler claims an item until the
//! worker that ran it finalizes the item and deletes the lease. The lease's
//! `lock_timeout` bounds how long a crashed worker can hold an item; once it
//! passes, any worker may take the lease over.

use rusqlite::{named_params, params, Connection, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    store::{from_ms, from_ms_opt, to_ms},
    SmartString,
};

#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    /// Same id as the queue item this lease belongs to.
    pub id: Uuid,
    pub tenant_id: SmartString,
    pub version: i64,
    pub created: OffsetDateTime,
    pub batch_order: i64,
    /// Node id of the worker holding the lease.
    pub lock_key: Option<SmartString>,
    /// When the lease expires and may be taken over.
    pub lock_timeout: Option<OffsetDateTime>,
}

const WORK_COLUMNS: &str = "id, tenant_id, version, created, batch_order, lock_key, lock_timeout";

fn work_item_from_row(row: &Row) -> Result<WorkItem> {
    Ok(WorkItem {
        id: Uuid::parse_str(&row.get::<_, String>(0).map_err(|e| Error::ColumnType(e, "id"))?)
            .map_err(|_| Error::InvalidId("id"))?,
        tenant_id: SmartString::from(
            row.get::<_, String>(1)
                .map_err(|e| Error::ColumnType(e, "tenant_id"))?,
        ),
        version: row.get(2).map_err(|e| Error::ColumnType(e, "version"))?,
        created: from_ms(
            row.get(3).map_err(|e| Error::ColumnType(e, "created"))?,
            "created",
        )?,
        batch_order: row
            .get(4)
            .map_err(|e| Error::ColumnType(e, "batch_order"))?,
        lock_key: row
            .get::<_, Option<String>>(5)
            .map_err(|e| Error::ColumnType(e, "lock_key"))?
            .map(SmartString::from),
        lock_timeout: from_ms_opt(
            row.get(6).map_err(|e| Error::ColumnType(e, "lock_timeout"))?,
            "lock_timeout",
        )?,
    })
}

/// Insert unleased work records for a batch of claimed items. An id that is
/// already present keeps its existing record; it will be processed either
/// way.
pub(crate) fn insert_work_items(
    db: &Connection,
    items: &[(Uuid, SmartString)],
    now: OffsetDateTime,
) -> Result<()> {
    let mut stmt = db.prepare_cached(
        "INSERT INTO work_queue (id, tenant_id, version, created, batch_order)
        VALUES (:id, :tenant_id, 0, :created, :batch_order)
        ON CONFLICT (id) DO NOTHING",
    )?;

    for (batch_order, (id, tenant_id)) in items.iter().enumerate() {
        stmt.execute(named_params! {
            ":id": id.to_string(),
            ":tenant_id": tenant_id.as_str(),
            ":created": to_ms(now),
            ":batch_order": batch_order as i64,
        })?;
    }

    Ok(())
}

/// Take leases on up to `limit` unheld or expired work records, stamping
/// them with `node_id` and an expiry of now + `lock_timeout`. Returns the
/// leased records in claim order.
pub(crate) fn lease_work_items(
    db: &Connection,
    node_id: &str,
    limit: usize,
    lock_timeout: std::time::Duration,
    now: OffsetDateTime,
) -> Result<Vec<WorkItem>> {
    let mut stmt = db.prepare_cached(&format!(
        "UPDATE work_queue
        SET lock_key = :node_id,
            lock_timeout = :expires,
            started = :now,
            version = version + 1
        WHERE id IN (
            SELECT id FROM work_queue
            WHERE lock_key IS NULL OR lock_timeout < :now
            ORDER BY created, batch_order
            LIMIT :limit
        )
        RETURNING {WORK_COLUMNS}"
    ))?;

    let rows = stmt.query_and_then(
        named_params! {
            ":node_id": node_id,
            ":expires": to_ms(now) + lock_timeout.as_millis() as i64,
            ":now": to_ms(now),
            ":limit": limit as i64,
        },
        work_item_from_row,
    )?;

    let mut items = rows.collect::<Result<Vec<_>>>()?;
    items.sort_by_key(|item| (item.created, item.batch_order));
    Ok(items)
}

/// Delete a lease record, guarded by its version so that a lease taken over
/// by another node after expiry is left alone.
pub(crate) fn delete_work_item(db: &Connection, item: &WorkItem) -> Result<()> {
    let mut stmt = db.prepare_cached("DELETE FROM work_queue WHERE id = ? AND version = ?")?;
    let changed = stmt.execute(params![item.id.to_string(), item.version])?;
    if changed == 1 {
        Ok(())
    } else {
        Err(Error::VersionConflict)
    }
}

/// Release every lease held by `node_id`. Run at worker startup to recover
/// leases left behind by an unclean shutdown of the same node.
pub(crate) fn unlock_all(db: &Connection, node_id: &str) -> Result<usize> {
    let mut stmt = db.prepare_cached(
        "UPDATE work_queue
        SET lock_key = NULL, lock_timeout = NULL, started = NULL, version = version + 1
        WHERE lock_key = ?",
    )?;
    Ok(stmt.execute(params![node_id])?)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::migrations::migrate;

    fn test_db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn
    }

    #[test]
    fn lease_and_release() {
        let db = test_db();
        let now = datetime!(2024-06-01 12:00:00 UTC);
        let id = Uuid::now_v7();

        insert_work_items(&db, &[(id, SmartString::from("tenant-1"))], now).unwrap();

        let leased =
            lease_work_items(&db, "node-a", 10, std::time::Duration::from_secs(120), now).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, id);
        assert_eq!(leased[0].lock_key.as_deref(), Some("node-a"));
        assert_eq!(
            leased[0].lock_timeout,
            Some(datetime!(2024-06-01 12:02:00 UTC))
        );

        // A second worker polling while the lease is held gets nothing.
        let other =
            lease_work_items(&db, "node-b", 10, std::time::Duration::from_secs(120), now).unwrap();
        assert!(other.is_empty());

        delete_work_item(&db, &leased[0]).unwrap();
        let leased =
            lease_work_items(&db, "node-a", 10, std::time::Duration::from_secs(120), now).unwrap();
        assert!(leased.is_empty());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let db = test_db();
        let now = datetime!(2024-06-01 12:00:00 UTC);
        let id = Uuid::now_v7();

        insert_work_items(&db, &[(id, SmartString::from("tenant-1"))], now).unwrap();
        let held =
            lease_work_items(&db, "node-a", 10, std::time::Duration::from_secs(120), now).unwrap();

        let later = now + time::Duration::minutes(3);
        let taken = lease_work_items(
            &db,
            "node-b",
            10,
            std::time::Duration::from_secs(120),
            later,
        )
        .unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].lock_key.as_deref(), Some("node-b"));

        // The original holder's delete must fail; the lease moved on.
        assert!(matches!(
            delete_work_item(&db, &held[0]),
            Err(Error::VersionConflict)
        ));
    }

    #[test]
    fn leases_follow_batch_order() {
        let db = test_db();
        let now = datetime!(2024-06-01 12:00:00 UTC);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::now_v7()).collect();
        let items: Vec<(Uuid, SmartString)> = ids
            .iter()
            .map(|id| (*id, SmartString::from("tenant-1")))
            .collect();

        insert_work_items(&db, &items, now).unwrap();

        let leased =
            lease_work_items(&db, "node-a", 2, std::time::Duration::from_secs(120), now).unwrap();
        assert_eq!(
            leased.iter().map(|i| i.id).collect::<Vec<_>>(),
            &ids[0..2]
        );
    }

    #[test]
    fn unlock_all_releases_only_own_leases() {
        let db = test_db();
        let now = datetime!(2024-06-01 12:00:00 UTC);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        insert_work_items(&db, &[(a, SmartString::from("t1"))], now).unwrap();
        lease_work_items(&db, "node-a", 10, std::time::Duration::from_secs(120), now).unwrap();
        insert_work_items(&db, &[(b, SmartString::from("t1"))], now).unwrap();
        lease_work_items(&db, "node-b", 10, std::time::Duration::from_secs(120), now).unwrap();

        assert_eq!(unlock_all(&db, "node-a").unwrap(), 1);

        let available =
            lease_work_items(&db, "node-c", 10, std::time::Duration::from_secs(120), now).unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, a);
    }

    #[test]
    fn duplicate_insert_ignored() {
        let db = test_db();
        let now = datetime!(2024-06-01 12:00:00 UTC);
        let id = Uuid::now_v7();

        insert_work_items(&db, &[(id, SmartString::from("t1"))], now).unwrap();
        insert_work_items(&db, &[(id, SmartString::from("t1"))], now).unwrap();

        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM work_queue", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}

//! Recurring schedule definitions and their storage operations.

use rusqlite::{named_params, params, Connection, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    schedule::{parse_timezone, ScheduleSpec},
    store::{from_ms, from_ms_opt, to_ms, Store},
    SmartString,
};

/// The default timezone for schedules that do not name one.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// A recurring schedule that pushes a queue item every time it fires.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Unique id.
    pub id: Uuid,
    /// The tenant that owns the schedule.
    pub tenant_id: SmartString,
    /// Caller-chosen name, unique per tenant.
    pub name: String,
    /// The queue that pushed items land on.
    pub queue: SmartString,
    /// The handler type of pushed items.
    pub job_type: SmartString,
    /// A paused schedule does not fire.
    pub paused: bool,
    /// Retry policy attached to pushed items.
    pub retry_policy: Option<RetryPolicy>,
    /// Optimistic concurrency counter.
    pub version: i64,
    /// How many times the schedule has fired.
    pub tries: u32,
    /// When the schedule was created.
    pub created: OffsetDateTime,
    /// When the schedule was last updated.
    pub updated: Option<OffsetDateTime>,
    /// The next trigger instant. `None` only while paused.
    pub next_run: Option<OffsetDateTime>,
    /// When the schedule last fired.
    pub last_run: Option<OffsetDateTime>,
    /// Payload attached to pushed items.
    pub payload: Option<Vec<u8>>,
    /// Mime type of the payload.
    pub payload_type: Option<String>,
    /// Opaque caller metadata attached to pushed items.
    pub target: Option<String>,
    /// When the schedule fires.
    pub spec: ScheduleSpec,
    /// Timezone the schedule is evaluated in.
    pub timezone: String,
}

/// A new schedule definition.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    /// Caller-chosen name, unique per tenant.
    pub name: String,
    /// The queue that pushed items land on.
    pub queue: SmartString,
    /// The handler type of pushed items.
    pub job_type: SmartString,
    /// When the schedule fires.
    pub spec: ScheduleSpec,
    /// Timezone the schedule is evaluated in. Defaults to UTC.
    pub timezone: Option<String>,
    /// Create the schedule paused.
    pub paused: bool,
    /// Retry policy attached to pushed items.
    pub retry_policy: Option<RetryPolicy>,
    /// Payload attached to pushed items.
    pub payload: Option<Vec<u8>>,
    /// Mime type of the payload.
    pub payload_type: Option<String>,
    /// Opaque caller metadata attached to pushed items.
    pub target: Option<String>,
}

impl NewSchedule {
    /// A schedule with just a name, destination, and firing spec.
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<SmartString>,
        job_type: impl Into<SmartString>,
        spec: ScheduleSpec,
    ) -> NewSchedule {
        NewSchedule {
            name: name.into(),
            queue: queue.into(),
            job_type: job_type.into(),
            spec,
            timezone: None,
            paused: false,
            retry_policy: None,
            payload: None,
            payload_type: None,
            target: None,
        }
    }
}

/// Changes to apply to a schedule. Unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    /// Rename the schedule.
    pub name: Option<String>,
    /// Change when the schedule fires.
    pub spec: Option<ScheduleSpec>,
    /// Pause or resume. Resuming recomputes the next trigger instant.
    pub paused: Option<bool>,
}

const SCHEDULE_COLUMNS: &str = "id, tenant_id, queue, job_type, name, paused, retry_policy, \
     version, tries, created, updated, next_run, last_run, payload, payload_type, target, \
     schedule, timezone";

fn schedule_from_row(row: &Row) -> Result<Schedule> {
    Ok(Schedule {
        id: Uuid::parse_str(&row.get::<_, String>(0).map_err(|e| Error::ColumnType(e, "id"))?)
            .map_err(|_| Error::InvalidId("id"))?,
        tenant_id: SmartString::from(
            row.get::<_, String>(1)
                .map_err(|e| Error::ColumnType(e, "tenant_id"))?,
        ),
        queue: SmartString::from(
            row.get::<_, String>(2)
                .map_err(|e| Error::ColumnType(e, "queue"))?,
        ),
        job_type: SmartString::from(
            row.get::<_, String>(3)
                .map_err(|e| Error::ColumnType(e, "job_type"))?,
        ),
        name: row.get(4).map_err(|e| Error::ColumnType(e, "name"))?,
        paused: row.get(5).map_err(|e| Error::ColumnType(e, "paused"))?,
        retry_policy: row
            .get::<_, Option<String>>(6)
            .map_err(|e| Error::ColumnType(e, "retry_policy"))?
            .map(|p| RetryPolicy::from_json(&p))
            .transpose()?,
        version: row.get(7).map_err(|e| Error::ColumnType(e, "version"))?,
        tries: row
            .get::<_, i64>(8)
            .map_err(|e| Error::ColumnType(e, "tries"))? as u32,
        created: from_ms(
            row.get(9).map_err(|e| Error::ColumnType(e, "created"))?,
            "created",
        )?,
        updated: from_ms_opt(
            row.get(10).map_err(|e| Error::ColumnType(e, "updated"))?,
            "updated",
        )?,
        next_run: from_ms_opt(
            row.get(11).map_err(|e| Error::ColumnType(e, "next_run"))?,
            "next_run",
        )?,
        last_run: from_ms_opt(
            row.get(12).map_err(|e| Error::ColumnType(e, "last_run"))?,
            "last_run",
        )?,
        payload: row.get(13).map_err(|e| Error::ColumnType(e, "payload"))?,
        payload_type: row
            .get(14)
            .map_err(|e| Error::ColumnType(e, "payload_type"))?,
        target: row.get(15).map_err(|e| Error::ColumnType(e, "target"))?,
        spec: ScheduleSpec::decode(
            &row.get::<_, String>(16)
                .map_err(|e| Error::ColumnType(e, "schedule"))?,
        )?,
        timezone: row.get(17).map_err(|e| Error::ColumnType(e, "timezone"))?,
    })
}

pub(crate) fn get_schedule(db: &Connection, id: &Uuid) -> Result<Option<Schedule>> {
    let mut stmt = db.prepare_cached(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?"
    ))?;
    let mut rows = stmt.query(params![id.to_string()])?;
    rows.next()?.map(schedule_from_row).transpose()
}

/// Fetch unpaused schedules whose trigger time has elapsed, most overdue
/// first. Run inside the schedule runner's claim transaction.
pub(crate) fn fetch_due_schedules(
    db: &Connection,
    limit: usize,
    now: OffsetDateTime,
) -> Result<Vec<Schedule>> {
    let mut stmt = db.prepare_cached(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedules
        WHERE NOT paused AND next_run IS NOT NULL AND next_run <= :now
        ORDER BY next_run
        LIMIT :limit"
    ))?;

    let rows = stmt.query_and_then(
        named_params! {
            ":now": to_ms(now),
            ":limit": limit as i64,
        },
        schedule_from_row,
    )?;
    rows.collect()
}

/// Record a successful trigger: advance the next trigger instant, stamp the
/// last one, and bump the fire count, guarded by version.
pub(crate) fn advance_schedule(
    db: &Connection,
    schedule: &Schedule,
    next_run: OffsetDateTime,
    now: OffsetDateTime,
) -> Result<()> {
    let mut stmt = db.prepare_cached(
        "UPDATE schedules
        SET next_run = :next_run,
            last_run = :now,
            tries = tries + 1,
            version = version + 1,
            updated = :now
        WHERE id = :id AND version = :version",
    )?;

    let changed = stmt.execute(named_params! {
        ":id": schedule.id.to_string(),
        ":version": schedule.version,
        ":next_run": to_ms(next_run),
        ":now": to_ms(now),
    })?;

    if changed == 1 {
        Ok(())
    } else {
        Err(Error::VersionConflict)
    }
}

/// Caller-facing operations on recurring schedules.
#[derive(Clone)]
pub struct Schedules {
    store: Store,
}

impl Schedules {
    /// Create a schedules facade on the given store.
    pub fn new(store: &Store) -> Schedules {
        Schedules {
            store: store.clone(),
        }
    }

    /// Create a schedule for the given tenant. Unless created paused, its
    /// first trigger instant is computed immediately.
    pub async fn create(
        &self,
        tenant_id: impl Into<SmartString>,
        schedule: NewSchedule,
    ) -> Result<Schedule> {
        let tenant_id = tenant_id.into();
        let timezone = schedule
            .timezone
            .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        parse_timezone(&timezone)?;

        let now = self.store.time.now();
        let next_run = if schedule.paused {
            None
        } else {
            Some(schedule.spec.next_run(now, &timezone)?)
        };

        self.store
            .interact(move |db| {
                let mut stmt = db.prepare_cached(&format!(
                    "INSERT INTO schedules
                        (id, tenant_id, queue, job_type, name, paused, retry_policy, version,
                         tries, created, next_run, payload, payload_type, target, schedule,
                         timezone)
                    VALUES
                        (:id, :tenant_id, :queue, :job_type, :name, :paused, :retry_policy, 0,
                         0, :created, :next_run, :payload, :payload_type, :target, :schedule,
                         :timezone)
                    RETURNING {SCHEDULE_COLUMNS}"
                ))?;

                let retry_policy = schedule
                    .retry_policy
                    .as_ref()
                    .map(|p| p.to_json())
                    .transpose()?;

                let mut rows = stmt.query(named_params! {
                    ":id": Uuid::now_v7().to_string(),
                    ":tenant_id": tenant_id.as_str(),
                    ":queue": schedule.queue.as_str(),
                    ":job_type": schedule.job_type.as_str(),
                    ":name": schedule.name,
                    ":paused": schedule.paused,
                    ":retry_policy": retry_policy,
                    ":created": to_ms(now),
                    ":next_run": next_run.map(to_ms),
                    ":payload": schedule.payload,
                    ":payload_type": schedule.payload_type,
                    ":target": schedule.target,
                    ":schedule": schedule.spec.encode(),
                    ":timezone": timezone,
                })?;

                let row = rows.next()?.ok_or(Error::NotFound)?;
                schedule_from_row(row)
            })
            .await
    }

    /// Fetch a schedule.
    pub async fn get(&self, id: Uuid) -> Result<Schedule> {
        self.store
            .interact(move |db| get_schedule(db, &id))
            .await?
            .ok_or(Error::NotFound)
    }

    /// List a tenant's schedules by name.
    pub async fn list(&self, tenant_id: impl Into<SmartString>) -> Result<Vec<Schedule>> {
        let tenant_id = tenant_id.into();
        self.store
            .interact(move |db| {
                let mut stmt = db.prepare_cached(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE tenant_id = ? ORDER BY name"
                ))?;
                let rows = stmt.query_and_then(params![tenant_id.as_str()], schedule_from_row)?;
                rows.collect()
            })
            .await
    }

    /// Apply an update to a schedule. Resuming a paused schedule computes a
    /// fresh next trigger instant; pausing clears it.
    pub async fn update(&self, id: Uuid, update: ScheduleUpdate) -> Result<Schedule> {
        let now = self.store.time.now();
        self.store
            .interact(move |db| {
                let mut schedule = get_schedule(db, &id)?.ok_or(Error::NotFound)?;
                let was_paused = schedule.paused;
                let spec_changed = update.spec.is_some();

                if let Some(name) = update.name {
                    schedule.name = name;
                }
                if let Some(spec) = update.spec {
                    schedule.spec = spec;
                }
                if let Some(paused) = update.paused {
                    schedule.paused = paused;
                }

                if schedule.paused {
                    schedule.next_run = None;
                } else if was_paused || spec_changed {
                    schedule.next_run = Some(schedule.spec.next_run(now, &schedule.timezone)?);
                }

                let mut stmt = db.prepare_cached(
                    "UPDATE schedules
                    SET name = :name,
                        paused = :paused,
                        schedule = :schedule,
                        next_run = :next_run,
                        version = version + 1,
                        updated = :now
                    WHERE id = :id AND version = :version",
                )?;

                let changed = stmt.execute(named_params! {
                    ":id": schedule.id.to_string(),
                    ":version": schedule.version,
                    ":name": schedule.name,
                    ":paused": schedule.paused,
                    ":schedule": schedule.spec.encode(),
                    ":next_run": schedule.next_run.map(to_ms),
                    ":now": to_ms(now),
                })?;
                if changed != 1 {
                    return Err(Error::VersionConflict);
                }

                get_schedule(db, &id)?.ok_or(Error::NotFound)
            })
            .await
    }

    /// Delete a schedule. Items it already pushed are unaffected.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.store
            .interact(move |db| {
                let changed = db.execute(
                    "DELETE FROM schedules WHERE id = ?",
                    params![id.to_string()],
                )?;
                if changed == 1 {
                    Ok(())
                } else {
                    Err(Error::NotFound)
                }
            })
            .await
    }

    /// Pause a schedule.
    pub async fn pause(&self, id: Uuid) -> Result<Schedule> {
        self.update(
            id,
            ScheduleUpdate {
                paused: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Resume a paused schedule.
    pub async fn resume(&self, id: Uuid) -> Result<Schedule> {
        self.update(
            id,
            ScheduleUpdate {
                paused: Some(false),
                ..Default::default()
            },
        )
        .await
    }
}

//! Queue item types and lifecycle states.

use std::str::FromStr;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    SmartString,
};

/// Longest error text persisted with an item. Anything longer is truncated.
pub(crate) const MAX_ERROR_LEN: usize = 2000;

/// The lifecycle state of a queue item.
///
/// Active items move `Pending` → `Running` and from there to a terminal
/// state or back to `Retry`, which behaves like `Pending` with a future due
/// time. `Completed` and `Failed` only ever appear on history records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Waiting to be claimed by a scheduler.
    Pending,
    /// Claimed and leased out for execution.
    Running,
    /// Failed at least once, waiting for its next attempt to come due.
    Retry,
    /// Finished successfully.
    Completed,
    /// Exhausted its retries.
    Failed,
}

impl ItemState {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "PENDING",
            ItemState::Running => "RUNNING",
            ItemState::Retry => "RETRY",
            ItemState::Completed => "COMPLETED",
            ItemState::Failed => "FAILED",
        }
    }
}

impl FromStr for ItemState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ItemState::Pending),
            "RUNNING" => Ok(ItemState::Running),
            "RETRY" => Ok(ItemState::Retry),
            "COMPLETED" => Ok(ItemState::Completed),
            "FAILED" => Ok(ItemState::Failed),
            _ => Err(Error::InvalidItemState(s.to_string())),
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An active item in a queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Time-sortable unique id.
    pub id: Uuid,
    /// The tenant that owns this item.
    pub tenant_id: SmartString,
    /// Optional idempotency key, unique within (tenant, queue).
    pub key: Option<String>,
    /// The queue this item belongs to.
    pub queue: SmartString,
    /// Which handler runs this item.
    pub job_type: SmartString,
    /// The recurring schedule that created this item, if any.
    pub schedule_id: Option<Uuid>,
    /// Optimistic concurrency counter, incremented on every update.
    pub version: i64,
    /// Runs attempted so far.
    pub tries: u32,
    /// Current lifecycle state.
    pub state: ItemState,
    /// When the item was created.
    pub created: OffsetDateTime,
    /// When the item was last updated.
    pub updated: Option<OffsetDateTime>,
    /// When the current run started.
    pub started: Option<OffsetDateTime>,
    /// Earliest time the item may run. `None` means immediately.
    pub run_after: Option<OffsetDateTime>,
    /// The item's payload.
    pub payload: Option<Vec<u8>>,
    /// Mime type of the payload.
    pub payload_type: Option<String>,
    /// Opaque caller metadata carried alongside the payload.
    pub target: Option<String>,
    /// Retry policy for this item, overriding the queue's configured policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Result of the most recent failed run, kept for diagnostics until the
    /// next run overwrites it.
    pub result: Option<Vec<u8>>,
    /// Mime type of [result](Self::result).
    pub result_type: Option<String>,
    /// Error text of the most recent failed run.
    pub error: Option<String>,
}

impl QueueItem {
    /// Deserialize the payload as JSON.
    pub fn json_payload<'a, T: serde::Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.payload.as_deref().unwrap_or_default())
    }
}

/// A new item to be pushed onto a queue, created via [ItemBuilder].
#[derive(Debug, Clone)]
pub struct NewItem {
    pub(crate) queue: SmartString,
    pub(crate) job_type: SmartString,
    pub(crate) key: Option<String>,
    pub(crate) schedule_id: Option<Uuid>,
    pub(crate) run_after: Option<OffsetDateTime>,
    pub(crate) payload: Option<Vec<u8>>,
    pub(crate) payload_type: Option<String>,
    pub(crate) target: Option<String>,
    pub(crate) retry_policy: Option<RetryPolicy>,
}

impl NewItem {
    /// Create a builder for an item on `queue` handled by `job_type`.
    pub fn builder(
        queue: impl Into<SmartString>,
        job_type: impl Into<SmartString>,
    ) -> ItemBuilder {
        ItemBuilder::new(queue, job_type)
    }
}

/// A builder for a [NewItem].
#[derive(Debug, Clone)]
pub struct ItemBuilder {
    item: NewItem,
}

impl ItemBuilder {
    /// Create a builder for an item on `queue` handled by `job_type`.
    pub fn new(queue: impl Into<SmartString>, job_type: impl Into<SmartString>) -> Self {
        ItemBuilder {
            item: NewItem {
                queue: queue.into(),
                job_type: job_type.into(),
                key: None,
                schedule_id: None,
                run_after: None,
                payload: None,
                payload_type: None,
                target: None,
                retry_policy: None,
            },
        }
    }

    /// Set an idempotency key. Pushing another item with the same key onto
    /// the same tenant and queue overwrites this one instead of adding a
    /// second item.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.item.key = Some(key.into());
        self
    }

    /// Link the item back to the schedule that created it.
    pub fn schedule_id(mut self, schedule_id: Uuid) -> Self {
        self.item.schedule_id = Some(schedule_id);
        self
    }

    /// Delay the first run until the given time.
    pub fn run_after(mut self, run_after: OffsetDateTime) -> Self {
        self.item.run_after = Some(run_after);
        self
    }

    /// Set a raw payload and its mime type.
    pub fn payload(mut self, payload: Vec<u8>, payload_type: impl Into<String>) -> Self {
        self.item.payload = Some(payload);
        self.item.payload_type = Some(payload_type.into());
        self
    }

    /// Serialize the given value as the item's JSON payload.
    pub fn json_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.item.payload = Some(serde_json::to_vec(payload)?);
        self.item.payload_type = Some("application/json".to_string());
        Ok(self)
    }

    /// Attach opaque caller metadata.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.item.target = Some(target.into());
        self
    }

    /// Override the queue's retry policy for this item.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.item.retry_policy = Some(policy);
        self
    }

    /// Finish building the item.
    pub fn build(self) -> NewItem {
        self.item
    }
}

/// An immutable record of a finished item.
#[derive(Debug, Clone)]
pub struct HistoryItem {
    /// The id the item had while active.
    pub id: Uuid,
    /// The tenant that owned the item.
    pub tenant_id: SmartString,
    /// The item's idempotency key, if it had one.
    pub key: Option<String>,
    /// The queue the item ran on.
    pub queue: SmartString,
    /// Which handler ran the item.
    pub job_type: SmartString,
    /// The schedule that created the item, if any.
    pub schedule_id: Option<Uuid>,
    /// When the history record was written.
    pub created: OffsetDateTime,
    /// When the item was originally pushed.
    pub scheduled: OffsetDateTime,
    /// When the final run started.
    pub started: OffsetDateTime,
    /// [Completed](ItemState::Completed) or [Failed](ItemState::Failed).
    pub state: ItemState,
    /// Total runs performed.
    pub tries: u32,
    /// The item's payload.
    pub payload: Option<Vec<u8>>,
    /// Mime type of the payload.
    pub payload_type: Option<String>,
    /// Result returned by the final run.
    pub result: Option<Vec<u8>>,
    /// Mime type of [result](Self::result).
    pub result_type: Option<String>,
    /// Opaque caller metadata.
    pub target: Option<String>,
    /// Error text from the final run, for failed items.
    pub error: Option<String>,
}

/// Per-queue configuration for one tenant.
///
/// Queues exist implicitly once they have items; a config row is only
/// created when a caller first configures the queue.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// The tenant the configuration applies to.
    pub tenant_id: SmartString,
    /// The queue name.
    pub queue: SmartString,
    /// Human-readable name for display purposes.
    pub display_name: Option<String>,
    /// A paused queue's items are not claimed by schedulers.
    pub paused: bool,
    /// Retry policy for items on this queue that carry no override.
    pub retry_policy: Option<RetryPolicy>,
    /// Optimistic concurrency counter.
    pub version: i64,
}

pub(crate) fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

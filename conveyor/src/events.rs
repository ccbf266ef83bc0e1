//! Events emitted as items move through the queue.
//!
//! Every event is broadcast after its transaction commits, so a subscriber
//! never sees an event for a state that was rolled back. Subscribers that
//! fall behind lose the oldest events; the queue's persisted state is always
//! authoritative.

use serde::{Serialize, Serializer};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{store::to_ms, SmartString};

/// What happened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A new item was pushed onto a queue.
    ItemPushed {
        /// The item id.
        id: Uuid,
        /// The owning tenant.
        tenant_id: SmartString,
        /// The queue name.
        queue: SmartString,
    },
    /// A scheduler claimed the item and leased it out for execution.
    ItemRunning {
        /// The item id.
        id: Uuid,
    },
    /// The item finished successfully and moved to history.
    ItemCompleted {
        /// The item id.
        id: Uuid,
    },
    /// The item failed and will run again once its retry delay elapses.
    ItemRetrying {
        /// The item id.
        id: Uuid,
        /// When the next attempt comes due.
        #[serde(serialize_with = "serialize_ms")]
        run_after: OffsetDateTime,
    },
    /// The item exhausted its retries and moved to history.
    ItemFailed {
        /// The item id.
        id: Uuid,
    },
    /// A recurring schedule fired and pushed a new item.
    ScheduleTriggered {
        /// The schedule id.
        id: Uuid,
        /// The id of the pushed item.
        item_id: Uuid,
    },
}

/// An event envelope, serializable as JSON for external broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEvent {
    /// When the event was emitted, as unix milliseconds.
    #[serde(serialize_with = "serialize_ms")]
    pub created: OffsetDateTime,
    /// The event itself.
    #[serde(flatten)]
    pub kind: EventKind,
}

fn serialize_ms<S: Serializer>(t: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(to_ms(*t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn serializes_flat_envelope() {
        let event = QueueEvent {
            created: datetime!(2024-06-01 12:00:00 UTC),
            kind: EventKind::ItemCompleted {
                id: Uuid::nil(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["created"], 1717243200000i64);
        assert_eq!(json["type"], "item_completed");
        assert_eq!(json["id"], "00000000-0000-0000-0000-000000000000");
    }
}

#![warn(missing_docs)]
//! A SQLite-backed, multi-tenant job queue with retries and recurring
//! schedules.
//!
//! Items are pushed onto named queues and claimed by a [Scheduler], which
//! leases them out fairly across tenants. A [Worker] runs the registered
//! handler for each leased item and finalizes it: success and exhausted
//! retries move the item to an immutable history table, failures with
//! retries left put it back with a computed delay. A [ScheduleRunner] turns
//! recurring [Schedule]s (fixed intervals or cron expressions, evaluated in
//! a named timezone) into new items as they come due.
//!
//! All coordination goes through the shared [Store]; any number of
//! schedulers, workers, and schedule runners may run against the same
//! database file, in one process or many.
//!
//! ```no_run
//! # use std::path::Path;
//! # use std::sync::Arc;
//! # use serde::{Deserialize, Serialize};
//! use conveyor::{
//!     Handler, HandlerRegistry, NewItem, QueueItem, Queues, Scheduler, Store, WorkError,
//!     WorkResult, Worker,
//! };
//!
//! #[derive(Debug)]
//! pub struct AppContext {
//!     // database pool or other things here
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct ReminderPayload {
//!     email: String,
//!     message: String,
//! }
//!
//! async fn send_reminder(
//!     item: QueueItem,
//!     context: Arc<AppContext>,
//! ) -> Result<WorkResult, WorkError> {
//!     let payload: ReminderPayload = item.json_payload().map_err(eyre::Report::from)?;
//!     // do something with the payload
//!     Ok(WorkResult::none())
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), eyre::Report> {
//!     let store = Store::new(Path::new("conveyor.db")).await?;
//!
//!     // Claims due items and leases them out.
//!     let scheduler = Scheduler::start(&store);
//!
//!     // Runs the leased items.
//!     let registry = HandlerRegistry::new([Handler::new("send_reminder", send_reminder)]);
//!     let context = Arc::new(AppContext {});
//!     let worker = Worker::builder(&store, registry, context, "node-1")
//!         .build()
//!         .await?;
//!
//!     // Push an item.
//!     let queues = Queues::new(&store);
//!     let item = queues
//!         .push(
//!             "tenant-1",
//!             NewItem::builder("reminders", "send_reminder")
//!                 .json_payload(&ReminderPayload {
//!                     email: "me@example.com".to_string(),
//!                     message: "Time to go!".to_string(),
//!                 })?
//!                 .build(),
//!         )
//!         .await?;
//!     println!("pushed {}", item.id);
//!
//!     // Do other stuff, then shut down.
//!     worker.close().await?;
//!     scheduler.close().await?;
//!     Ok(())
//! }
//! ```

mod error;
mod events;
mod item;
mod item_store;
mod migrations;
mod registry;
mod retry;
mod schedule;
mod schedule_runner;
mod scheduler;
mod schedules;
mod shuffle;
mod store;
#[cfg(test)]
mod test_util;
mod work_queue;
mod worker;

pub use error::{Error, Result};
pub use events::{EventKind, QueueEvent};
pub use item::{HistoryItem, ItemBuilder, ItemState, NewItem, QueueConfig, QueueItem};
pub use item_store::{ConfigUpdate, FetchedItem, Queues};
pub use registry::{Handler, HandlerRegistry, WorkError, WorkResult};
pub use retry::RetryPolicy;
pub use schedule::{IntervalUnit, ScheduleSpec};
pub use schedule_runner::{ScheduleRunner, ScheduleRunnerOptions};
pub use schedules::{NewSchedule, Schedule, ScheduleUpdate, Schedules, DEFAULT_TIMEZONE};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use store::{Store, StoreOptions};
pub use worker::{Worker, WorkerBuilder};

pub(crate) type SmartString = smartstring::SmartString<smartstring::LazyCompact>;

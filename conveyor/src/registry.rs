//! Handler registration for queue item types.

use std::{fmt::Debug, future::Future, pin::Pin, sync::Arc};

use ahash::HashMap;
use serde::Serialize;

use crate::{item::QueueItem, SmartString};

/// The output of a successful handler run, persisted with the item's
/// history record.
#[derive(Debug, Clone, Default)]
pub struct WorkResult {
    /// Result payload.
    pub payload: Option<Vec<u8>>,
    /// Mime type of the payload.
    pub payload_type: Option<String>,
}

impl WorkResult {
    /// A result with no payload.
    pub fn none() -> WorkResult {
        WorkResult::default()
    }

    /// A raw result payload with its mime type.
    pub fn raw(payload: Vec<u8>, payload_type: impl Into<String>) -> WorkResult {
        WorkResult {
            payload: Some(payload),
            payload_type: Some(payload_type.into()),
        }
    }

    /// Serialize the given value as a JSON result payload.
    pub fn json<T: Serialize>(value: &T) -> Result<WorkResult, serde_json::Error> {
        Ok(WorkResult {
            payload: Some(serde_json::to_vec(value)?),
            payload_type: Some("application/json".to_string()),
        })
    }
}

/// An error returned by a handler.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// An expected application failure. The message and optional partial
    /// result are recorded on the item for diagnostics on the next retry, or
    /// on the final history record.
    #[error("{message}")]
    Handler {
        /// Describes the failure.
        message: String,
        /// Partial output from the failed run.
        result: Option<WorkResult>,
    },
    /// Any other failure. The error itself is only logged, keyed by a
    /// generated correlation id; the item records just the id.
    #[error(transparent)]
    Unexpected(#[from] eyre::Report),
}

impl WorkError {
    /// An expected failure with no partial result.
    pub fn message(message: impl Into<String>) -> WorkError {
        WorkError::Handler {
            message: message.into(),
            result: None,
        }
    }
}

type HandlerFn<CONTEXT> = Arc<
    dyn Fn(QueueItem, CONTEXT) -> Pin<Box<dyn Future<Output = Result<WorkResult, WorkError>> + Send>>
        + Send
        + Sync,
>;

/// A handler for one item type.
///
/// The `CONTEXT` type is created by the caller and passed to every run, and
/// will usually contain database pools, clients, and whatever else handlers
/// need to do their work.
pub struct Handler<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    pub(crate) job_type: SmartString,
    pub(crate) runner: HandlerFn<CONTEXT>,
}

impl<CONTEXT> Handler<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// Create a handler for `job_type` from an async function.
    pub fn new<F, Fut>(job_type: impl Into<SmartString>, runner: F) -> Handler<CONTEXT>
    where
        F: Fn(QueueItem, CONTEXT) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkResult, WorkError>> + Send + 'static,
    {
        Handler {
            job_type: job_type.into(),
            runner: Arc::new(move |item, context| Box::pin(runner(item, context))),
        }
    }
}

/// The set of handlers a [Worker](crate::Worker) can run, keyed by item
/// type.
pub struct HandlerRegistry<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    pub(crate) handlers: HashMap<SmartString, Arc<Handler<CONTEXT>>>,
}

impl<CONTEXT> HandlerRegistry<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// Create a registry from a list of handlers.
    pub fn new(handlers: impl IntoIterator<Item = Handler<CONTEXT>>) -> HandlerRegistry<CONTEXT> {
        let handlers = handlers
            .into_iter()
            .map(|handler| (handler.job_type.clone(), Arc::new(handler)))
            .collect();
        HandlerRegistry { handlers }
    }

    /// Add a handler, replacing any existing handler for the same type.
    pub fn add(&mut self, handler: Handler<CONTEXT>) {
        self.handlers
            .insert(handler.job_type.clone(), Arc::new(handler));
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<Arc<Handler<CONTEXT>>> {
        self.handlers.get(job_type).cloned()
    }
}

use deadpool_sqlite::InteractError;

/// A [std::result::Result] whose error type defaults to [Error].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can be returned from the queue.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error occurred while updating the database to a new schema version.
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    /// An error occurred while opening the database.
    #[error("Error opening database: {0}")]
    OpenDatabase(eyre::Report),
    /// Failed to acquire a database connection.
    #[error("Error acquiring database connection: {0}")]
    PoolError(#[from] deadpool_sqlite::PoolError),
    /// Encountered an error communicating with the database.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// The database contained invalid data.
    #[error("Unexpected value type for {1}: {0}")]
    ColumnType(#[source] rusqlite::Error, &'static str),
    /// An internal task panicked.
    #[error("Internal error: {0}")]
    Panic(#[from] tokio::task::JoinError),
    /// An internal error occurred while reading the database.
    #[error("Internal error: {0}")]
    DbInteract(String),
    /// The requested item, queue, or schedule was not found.
    #[error("Not found")]
    NotFound,
    /// An optimistic update lost a race with a concurrent writer. The caller
    /// must refetch the row before trying again.
    #[error("Version conflict")]
    VersionConflict,
    /// A stored id was not a valid UUID.
    #[error("Invalid id in {0}")]
    InvalidId(&'static str),
    /// An item had an unknown state value.
    #[error("Invalid item state {0}")]
    InvalidItemState(String),
    /// Failed to serialize or deserialize a retry policy.
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(serde_json::Error),
    /// A schedule expression could not be parsed or produced no future run.
    #[error("Invalid schedule")]
    InvalidSchedule,
    /// An unknown timezone name.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    /// Invalid value for a stored timestamp.
    #[error("Timestamp {0} out of range")]
    TimestampOutOfRange(&'static str),
    /// A second worker was started with a node id that is already in use on
    /// this store.
    #[error("Worker for node id {0} already started")]
    WorkerAlreadyStarted(String),
    /// The operation timed out. This is mostly used when a loop fails to shut
    /// down in a timely fashion.
    #[error("Timed out")]
    Timeout,
    /// Indicates that the store has closed, and so the attempted operation
    /// could not be completed.
    #[error("Store closed unexpectedly")]
    Closed,
}

impl From<InteractError> for Error {
    fn from(e: InteractError) -> Self {
        Error::DbInteract(e.to_string())
    }
}

impl Error {
    pub(crate) fn open_database(err: impl Into<eyre::Report>) -> Self {
        Error::OpenDatabase(err.into())
    }
}

/// Error returned by the storage backend behind the [`QueueDao`](crate::QueueDao) port.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The underlying database reported an error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A non-database backend reported an error.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Error returned by the publish path.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The event payload could not be serialized to JSON.
    #[error("failed to serialize event: {0}")]
    Encode(#[source] serde_json::Error),

    /// The event row could not be written to storage.
    #[error("failed to store event: {0}")]
    Storage(#[from] StorageError),
}

/// Error surfaced by a single dispatch attempt.
///
/// Every variant is retryable from the queue's point of view: the affected
/// row goes back to `AVAILABLE` with its error count incremented until the
/// retry budget is exhausted, at which point it is parked in history as
/// [`ProcessingState::Failed`](crate::ProcessingState::Failed).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No decoder has been registered for the row's event type tag.
    #[error("no decoder registered for event type `{0}`")]
    UnknownEventType(String),

    /// The row's JSON payload does not deserialize as the tagged type.
    #[error("failed to decode `{event_name}` payload: {source}")]
    Decode {
        /// The event type tag of the offending row.
        event_name: String,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// One or more handlers failed; all matching handlers were still invoked.
    #[error("{failed} handler(s) failed for `{event_name}`: {source}")]
    Handler {
        /// The event type tag of the dispatched event.
        event_name: String,
        /// How many of the matching handlers failed.
        failed: usize,
        /// The first underlying handler failure.
        #[source]
        source: anyhow::Error,
    },
}

/// Error returned by the typed payload accessor on
/// [`BusEventWithMetadata`](crate::BusEventWithMetadata).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The row carries a different event type than the one requested.
    #[error("event is a `{actual}`, not a `{expected}`")]
    TypeMismatch {
        /// The event type tag that was requested.
        expected: &'static str,
        /// The event type tag the row actually carries.
        actual: String,
    },

    /// The payload is not valid JSON for the requested type.
    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),
}

//! Database row types shared by the live and history queue tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of a queue row.
///
/// `Available` and `InProcessing` rows live in the queue's live table;
/// `Processed` and `Failed` rows live in the parallel history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    /// The row is ready to be claimed once its available date has passed.
    Available,
    /// The row is claimed by a worker and protected by a lease.
    InProcessing,
    /// Every matching handler completed; terminal.
    Processed,
    /// The retry budget was exhausted; terminal.
    Failed,
}

impl ProcessingState {
    /// Whether the state belongs in the history table.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingState::Processed | ProcessingState::Failed)
    }
}

/// A persisted bus event row.
///
/// The same shape is used for the live table and the history table; only
/// `processing_state` decides where a row lives.
#[derive(Debug, Clone, FromRow)]
pub struct BusEventRow {
    /// Storage-assigned identity, unique within one queue table pair.
    pub record_id: i64,
    /// Event type tag; selects the decoder and the matching handlers.
    pub class_name: String,
    /// Serialized event payload.
    pub event_json: String,
    /// Opaque 128-bit correlation id carried end-to-end.
    pub user_token: Uuid,
    /// Creation timestamp (UTC).
    pub created_date: DateTime<Utc>,
    /// Short identifier of the producing process.
    pub creator_name: String,
    /// Owner tag of the claiming worker; `None` unless claimed.
    pub processing_owner: Option<String>,
    /// For `Available` rows, when the row becomes claimable; for
    /// `InProcessing` rows, when the claim lease expires.
    pub processing_available_date: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub processing_state: ProcessingState,
    /// Number of failed dispatch attempts so far.
    pub error_count: i32,
    /// Opaque indexed correlation handle.
    pub search_key1: i64,
    /// Opaque indexed correlation handle.
    pub search_key2: i64,
}

impl BusEventRow {
    /// Terminal copy of this row, ready for the history table.
    ///
    /// Stamps the owner that finished the row and the terminal time, so the
    /// history table records who completed each entry and when.
    pub fn into_terminal(
        mut self,
        state: ProcessingState,
        owner: &str,
        now: DateTime<Utc>,
    ) -> BusEventRow {
        debug_assert!(state.is_terminal());
        self.processing_state = state;
        self.processing_owner = Some(owner.to_owned());
        self.processing_available_date = Some(now);
        self
    }
}

/// A bus event row to be inserted.
///
/// Storage assigns `record_id` and creates the row as
/// [`ProcessingState::Available`] with no owner, an available date equal to
/// `created_date`, and an error count of zero.
#[derive(Debug, Clone)]
pub struct NewBusEvent {
    /// Event type tag.
    pub class_name: String,
    /// Serialized event payload.
    pub event_json: String,
    /// Opaque 128-bit correlation id.
    pub user_token: Uuid,
    /// Creation timestamp (UTC).
    pub created_date: DateTime<Utc>,
    /// Short identifier of the producing process.
    pub creator_name: String,
    /// Opaque indexed correlation handle.
    pub search_key1: i64,
    /// Opaque indexed correlation handle.
    pub search_key2: i64,
}

//! The storage port the queue engine is written against.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::{BusEventRow, NewBusEvent};

/// Narrow data-access contract for one queue table pair.
///
/// Implementations own the live table and its `_history` sibling. The bus
/// core is generic over this trait; [`PgQueueDao`](crate::pg::PgQueueDao)
/// is the production backend and [`MemoryQueueDao`](crate::memory::MemoryQueueDao)
/// a hermetic one for tests and embedded use.
///
/// All mutating operations must be safe against concurrent callers in the
/// same or other processes sharing the tables; [`claim_ready`](QueueDao::claim_ready)
/// in particular must never hand the same row to two claimers.
pub trait QueueDao: Send + Sync + 'static {
    /// Backend transaction handle; inserts bound to it commit or roll back
    /// with it.
    type Tx: Send;

    /// Open a transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StorageError>> + Send;

    /// Commit a transaction.
    fn commit(&self, tx: Self::Tx) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Roll back a transaction.
    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Append a row to the live table; returns the assigned record id.
    fn insert(
        &self,
        entry: &NewBusEvent,
    ) -> impl Future<Output = Result<i64, StorageError>> + Send;

    /// Append a row within a caller-supplied transaction.
    ///
    /// The row becomes visible (and claimable) only if the transaction
    /// commits.
    fn insert_in_tx(
        &self,
        tx: &mut Self::Tx,
        entry: &NewBusEvent,
    ) -> impl Future<Output = Result<i64, StorageError>> + Send;

    /// Atomically claim up to `limit` ready rows.
    ///
    /// Selects rows in `AVAILABLE` state whose available date has passed,
    /// flips them to `IN_PROCESSING` owned by `owner` with the available
    /// date advanced by `lease`, and returns the updated rows. A row is
    /// returned to at most one concurrent claimer.
    fn claim_ready(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<BusEventRow>, StorageError>> + Send;

    /// Reset a failed row to `AVAILABLE` for a later retry.
    ///
    /// Writes back the incremented error count, clears the owner, and makes
    /// the row claimable again at `available_date`.
    fn update_on_error(
        &self,
        record_id: i64,
        error_count: i32,
        available_date: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Move terminal rows to the history table.
    ///
    /// For each row: insert the terminal copy into history, then delete the
    /// live row. Rows must already carry their terminal state. The history
    /// insert must tolerate a copy left behind by an earlier partial
    /// attempt, so a retried move is idempotent.
    fn move_to_history(
        &self,
        rows: &[BusEventRow],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Reset `IN_PROCESSING` rows whose lease has expired back to
    /// `AVAILABLE`; returns how many rows were reset.
    ///
    /// Run at startup so rows stranded by a crashed owner become claimable
    /// without waiting for another process.
    fn reset_stale_leases(&self) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// All `IN_PROCESSING` rows, ordered by record id.
    fn in_processing(
        &self,
    ) -> impl Future<Output = Result<Vec<BusEventRow>, StorageError>> + Send;

    /// `AVAILABLE` rows matching the search keys, ordered by record id.
    ///
    /// With `search_key1` absent, filters on `search_key2` alone.
    fn ready(
        &self,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> impl Future<Output = Result<Vec<BusEventRow>, StorageError>> + Send;

    /// `AVAILABLE` and `IN_PROCESSING` rows matching the search keys,
    /// ordered by record id.
    fn ready_or_in_processing(
        &self,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> impl Future<Output = Result<Vec<BusEventRow>, StorageError>> + Send;

    /// [`ready`](QueueDao::ready), evaluated inside the given transaction so
    /// it observes the transaction's own uncommitted inserts.
    fn ready_in_tx(
        &self,
        tx: &mut Self::Tx,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> impl Future<Output = Result<Vec<BusEventRow>, StorageError>> + Send;

    /// [`ready_or_in_processing`](QueueDao::ready_or_in_processing),
    /// evaluated inside the given transaction.
    fn ready_or_in_processing_in_tx(
        &self,
        tx: &mut Self::Tx,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> impl Future<Output = Result<Vec<BusEventRow>, StorageError>> + Send;
}

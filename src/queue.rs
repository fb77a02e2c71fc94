//! The queue engine layered over the storage port.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::info;

use crate::config::BusConfig;
use crate::dao::QueueDao;
use crate::error::StorageError;
use crate::schema::{BusEventRow, NewBusEvent};

/// Database-backed queue: owns the claim protocol, retry scheduling, and the
/// post-commit insert notification on top of a [`QueueDao`].
pub struct DbBackedQueue<D: QueueDao> {
    dao: D,
    config: BusConfig,
    owner: String,
    insert_notify: Arc<Notify>,
}

impl<D: QueueDao> DbBackedQueue<D> {
    /// Queue over `dao`, claiming with the owner tag derived from `config`.
    pub fn new(dao: D, config: BusConfig) -> Self {
        let owner = config.owner_tag();
        DbBackedQueue {
            dao,
            config,
            owner,
            insert_notify: Arc::new(Notify::new()),
        }
    }

    /// Prepare the queue for processing. Idempotent.
    ///
    /// Resets rows left `IN_PROCESSING` past their lease by a previous
    /// owner, so a crashed process's work becomes claimable right away.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        let reset = self.dao.reset_stale_leases().await?;
        if reset > 0 {
            info!(reset, table = %self.config.table_name, "reset stale in-processing bus events");
        }
        Ok(())
    }

    /// Append a row and wake the local poller.
    ///
    /// The insert auto-commits, so the in-process notification fires as soon
    /// as the DAO call returns.
    pub async fn insert(&self, entry: &NewBusEvent) -> Result<i64, StorageError> {
        let record_id = self.dao.insert(entry).await?;
        self.insert_notify.notify_one();
        Ok(record_id)
    }

    /// Open a transaction whose bus inserts commit or roll back together
    /// with the caller's own statements.
    pub async fn begin(&self) -> Result<BusTransaction<'_, D>, StorageError> {
        let tx = self.dao.begin().await?;
        Ok(BusTransaction {
            queue: self,
            tx,
            pending_inserts: 0,
        })
    }

    /// Claim the next batch of ready rows for this process.
    pub async fn claim_ready(&self) -> Result<Vec<BusEventRow>, StorageError> {
        self.dao
            .claim_ready(
                &self.owner,
                self.config.claim_lease,
                self.config.claim_batch_size,
            )
            .await
    }

    /// Reschedule a failed row: back to `AVAILABLE`, claimable again after
    /// the configured backoff for `error_count`.
    pub async fn update_on_error(
        &self,
        row: &BusEventRow,
        error_count: i32,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let available_date = now + self.config.retry_backoff.delay(error_count);
        self.dao
            .update_on_error(row.record_id, error_count, available_date)
            .await
    }

    /// Move a batch of terminal rows to the history table.
    pub async fn move_to_history(&self, rows: &[BusEventRow]) -> Result<(), StorageError> {
        self.dao.move_to_history(rows).await
    }

    /// The storage backend, for read-only selectors.
    pub fn dao(&self) -> &D {
        &self.dao
    }

    /// The configuration this queue runs with.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Tag recorded as `processing_owner` on rows this process claims.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Notified after every committed insert; lets the poller react without
    /// waiting out its poll interval.
    pub(crate) fn insert_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.insert_notify)
    }
}

/// A caller-visible transaction on the queue's storage backend.
///
/// Bus events posted through it become visible, and the in-process insert
/// notification fires, only on [`commit`](BusTransaction::commit), never on
/// [`rollback`](BusTransaction::rollback). Dropping the transaction without
/// committing behaves like a rollback.
pub struct BusTransaction<'q, D: QueueDao> {
    queue: &'q DbBackedQueue<D>,
    tx: D::Tx,
    pending_inserts: usize,
}

impl<D: QueueDao> BusTransaction<'_, D> {
    pub(crate) async fn insert(&mut self, entry: &NewBusEvent) -> Result<i64, StorageError> {
        let record_id = self.queue.dao.insert_in_tx(&mut self.tx, entry).await?;
        self.pending_inserts += 1;
        Ok(record_id)
    }

    pub(crate) async fn ready(
        &mut self,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        self.queue
            .dao
            .ready_in_tx(&mut self.tx, search_key1, search_key2)
            .await
    }

    pub(crate) async fn ready_or_in_processing(
        &mut self,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        self.queue
            .dao
            .ready_or_in_processing_in_tx(&mut self.tx, search_key1, search_key2)
            .await
    }

    /// The backend transaction handle, for running the caller's own
    /// statements inside the same transaction.
    pub fn backend_tx(&mut self) -> &mut D::Tx {
        &mut self.tx
    }

    /// Commit; fires the in-process insert notification if any bus event
    /// was posted through this transaction.
    pub async fn commit(self) -> Result<(), StorageError> {
        let BusTransaction {
            queue,
            tx,
            pending_inserts,
        } = self;
        queue.dao.commit(tx).await?;
        if pending_inserts > 0 {
            queue.insert_notify.notify_one();
        }
        Ok(())
    }

    /// Roll back; posted bus events are discarded and no notification
    /// fires.
    pub async fn rollback(self) -> Result<(), StorageError> {
        let BusTransaction { queue, tx, .. } = self;
        queue.dao.rollback(tx).await
    }
}

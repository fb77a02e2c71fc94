//! In-memory implementation of the [`QueueDao`] port.
//!
//! Backs the integration tests and embedded single-process deployments that
//! want bus semantics without a database. Claim atomicity degenerates to a
//! process-local mutex, which satisfies the same contract for a single
//! process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::dao::QueueDao;
use crate::error::StorageError;
use crate::schema::{BusEventRow, NewBusEvent, ProcessingState};

#[derive(Debug, Default)]
struct Tables {
    next_record_id: i64,
    live: Vec<BusEventRow>,
    history: Vec<BusEventRow>,
}

impl Tables {
    fn assign_record_id(&mut self) -> i64 {
        self.next_record_id += 1;
        self.next_record_id
    }
}

/// A buffered transaction: inserts stay private to the transaction until
/// [`QueueDao::commit`] applies them.
#[derive(Debug, Default)]
pub struct MemoryTx {
    pending: Vec<BusEventRow>,
}

/// [`QueueDao`] over process-local tables.
///
/// Cloning is cheap and clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueDao {
    tables: Arc<Mutex<Tables>>,
    fail_inserts: Arc<AtomicBool>,
}

impl MemoryQueueDao {
    /// A fresh, empty queue.
    pub fn new() -> Self {
        MemoryQueueDao::default()
    }

    /// Make subsequent inserts fail with a backend error. Used to exercise
    /// publish error policies.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the live table, ordered by record id.
    pub fn live_rows(&self) -> Vec<BusEventRow> {
        self.lock().live.clone()
    }

    /// Snapshot of the history table, ordered by record id.
    pub fn history_rows(&self) -> Vec<BusEventRow> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_insert_failure(&self) -> Result<(), StorageError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected insert failure".to_owned()));
        }
        Ok(())
    }

    fn row_from_entry(entry: &NewBusEvent, record_id: i64) -> BusEventRow {
        BusEventRow {
            record_id,
            class_name: entry.class_name.clone(),
            event_json: entry.event_json.clone(),
            user_token: entry.user_token,
            created_date: entry.created_date,
            creator_name: entry.creator_name.clone(),
            processing_owner: None,
            processing_available_date: Some(entry.created_date),
            processing_state: ProcessingState::Available,
            error_count: 0,
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
        }
    }

    fn matches_keys(row: &BusEventRow, search_key1: Option<i64>, search_key2: i64) -> bool {
        row.search_key2 == search_key2 && search_key1.map_or(true, |key| row.search_key1 == key)
    }

    fn select<'a>(
        rows: impl Iterator<Item = &'a BusEventRow>,
        states: &[ProcessingState],
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Vec<BusEventRow> {
        let mut selected: Vec<BusEventRow> = rows
            .filter(|row| states.contains(&row.processing_state))
            .filter(|row| Self::matches_keys(row, search_key1, search_key2))
            .cloned()
            .collect();
        selected.sort_by_key(|row| row.record_id);
        selected
    }
}

impl QueueDao for MemoryQueueDao {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        Ok(MemoryTx::default())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError> {
        self.lock().live.extend(tx.pending);
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError> {
        drop(tx);
        Ok(())
    }

    async fn insert(&self, entry: &NewBusEvent) -> Result<i64, StorageError> {
        self.check_insert_failure()?;
        let mut tables = self.lock();
        let record_id = tables.assign_record_id();
        tables.live.push(Self::row_from_entry(entry, record_id));
        Ok(record_id)
    }

    async fn insert_in_tx(
        &self,
        tx: &mut Self::Tx,
        entry: &NewBusEvent,
    ) -> Result<i64, StorageError> {
        self.check_insert_failure()?;
        let record_id = self.lock().assign_record_id();
        tx.pending.push(Self::row_from_entry(entry, record_id));
        Ok(record_id)
    }

    async fn claim_ready(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        let now = Utc::now();
        let mut tables = self.lock();
        let mut claimed = Vec::new();
        for row in tables.live.iter_mut() {
            if claimed.len() == limit {
                break;
            }
            let ready = row.processing_state == ProcessingState::Available
                && row
                    .processing_available_date
                    .is_some_and(|available| available <= now);
            if ready {
                row.processing_state = ProcessingState::InProcessing;
                row.processing_owner = Some(owner.to_owned());
                row.processing_available_date = Some(now + lease);
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_on_error(
        &self,
        record_id: i64,
        error_count: i32,
        available_date: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tables = self.lock();
        if let Some(row) = tables.live.iter_mut().find(|row| row.record_id == record_id) {
            row.processing_state = ProcessingState::Available;
            row.processing_owner = None;
            row.processing_available_date = Some(available_date);
            row.error_count = error_count;
        }
        Ok(())
    }

    async fn move_to_history(&self, rows: &[BusEventRow]) -> Result<(), StorageError> {
        let mut tables = self.lock();
        for row in rows {
            let already_moved = tables
                .history
                .iter()
                .any(|existing| existing.record_id == row.record_id);
            if !already_moved {
                tables.history.push(row.clone());
            }
            tables.live.retain(|live| live.record_id != row.record_id);
        }
        Ok(())
    }

    async fn reset_stale_leases(&self) -> Result<u64, StorageError> {
        let now = Utc::now();
        let mut tables = self.lock();
        let mut reset = 0;
        for row in tables.live.iter_mut() {
            let stale = row.processing_state == ProcessingState::InProcessing
                && row
                    .processing_available_date
                    .is_some_and(|available| available <= now);
            if stale {
                row.processing_state = ProcessingState::Available;
                row.processing_owner = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn in_processing(&self) -> Result<Vec<BusEventRow>, StorageError> {
        let tables = self.lock();
        let mut rows: Vec<BusEventRow> = tables
            .live
            .iter()
            .filter(|row| row.processing_state == ProcessingState::InProcessing)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.record_id);
        Ok(rows)
    }

    async fn ready(
        &self,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        let tables = self.lock();
        Ok(Self::select(
            tables.live.iter(),
            &[ProcessingState::Available],
            search_key1,
            search_key2,
        ))
    }

    async fn ready_or_in_processing(
        &self,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        let tables = self.lock();
        Ok(Self::select(
            tables.live.iter(),
            &[ProcessingState::Available, ProcessingState::InProcessing],
            search_key1,
            search_key2,
        ))
    }

    async fn ready_in_tx(
        &self,
        tx: &mut Self::Tx,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        let tables = self.lock();
        Ok(Self::select(
            tables.live.iter().chain(tx.pending.iter()),
            &[ProcessingState::Available],
            search_key1,
            search_key2,
        ))
    }

    async fn ready_or_in_processing_in_tx(
        &self,
        tx: &mut Self::Tx,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        let tables = self.lock();
        Ok(Self::select(
            tables.live.iter().chain(tx.pending.iter()),
            &[ProcessingState::Available, ProcessingState::InProcessing],
            search_key1,
            search_key2,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_ok;
    use uuid::Uuid;

    fn entry(search_key1: i64, search_key2: i64) -> NewBusEvent {
        NewBusEvent {
            class_name: "test:event".to_owned(),
            event_json: "{}".to_owned(),
            user_token: Uuid::new_v4(),
            created_date: Utc::now(),
            creator_name: "test".to_owned(),
            search_key1,
            search_key2,
        }
    }

    #[tokio::test]
    async fn concurrent_claims_pick_disjoint_rows() {
        let dao = MemoryQueueDao::new();
        for _ in 0..10 {
            assert_ok!(dao.insert(&entry(1, 1)).await);
        }

        let (first, second) = tokio::join!(
            dao.claim_ready("owner-a", Duration::from_secs(60), 6),
            dao.claim_ready("owner-b", Duration::from_secs(60), 6),
        );
        let first = assert_ok!(first);
        let second = assert_ok!(second);

        assert_eq!(first.len() + second.len(), 10);
        for row in &first {
            assert!(!second.iter().any(|other| other.record_id == row.record_id));
        }
    }

    #[tokio::test]
    async fn claim_skips_rows_that_are_not_yet_available() {
        let dao = MemoryQueueDao::new();
        let record_id = assert_ok!(dao.insert(&entry(1, 1)).await);
        assert_ok!(
            dao.update_on_error(record_id, 1, Utc::now() + Duration::from_secs(3600))
                .await
        );

        let claimed = assert_ok!(dao.claim_ready("owner", Duration::from_secs(60), 10).await);
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn expired_leases_are_reset() {
        let dao = MemoryQueueDao::new();
        assert_ok!(dao.insert(&entry(1, 1)).await);

        // A zero lease expires immediately.
        let claimed = assert_ok!(dao.claim_ready("owner", Duration::ZERO, 10).await);
        assert_eq!(claimed.len(), 1);
        assert_eq!(assert_ok!(dao.claim_ready("other", Duration::ZERO, 10).await).len(), 0);

        assert_eq!(assert_ok!(dao.reset_stale_leases().await), 1);
        let reclaimed = assert_ok!(dao.claim_ready("other", Duration::from_secs(60), 10).await);
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn move_to_history_is_idempotent() {
        let dao = MemoryQueueDao::new();
        assert_ok!(dao.insert(&entry(1, 1)).await);
        let claimed = assert_ok!(dao.claim_ready("owner", Duration::from_secs(60), 10).await);
        let terminal =
            claimed[0]
                .clone()
                .into_terminal(ProcessingState::Processed, "owner", Utc::now());

        assert_ok!(dao.move_to_history(std::slice::from_ref(&terminal)).await);
        assert_ok!(dao.move_to_history(std::slice::from_ref(&terminal)).await);

        assert_eq!(dao.history_rows().len(), 1);
        assert!(dao.live_rows().is_empty());
    }

    #[tokio::test]
    async fn transactional_inserts_are_invisible_until_commit() {
        let dao = MemoryQueueDao::new();
        let mut tx = assert_ok!(dao.begin().await);
        assert_ok!(dao.insert_in_tx(&mut tx, &entry(7, 9)).await);

        assert!(dao.live_rows().is_empty());
        let seen_in_tx = assert_ok!(dao.ready_in_tx(&mut tx, Some(7), 9).await);
        assert_eq!(seen_in_tx.len(), 1);

        assert_ok!(dao.commit(tx).await);
        assert_eq!(dao.live_rows().len(), 1);
    }
}

//! The public bus facade.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::BusConfig;
use crate::dao::QueueDao;
use crate::dispatch::{EventDispatcher, EventHandler, SubscriberId};
use crate::error::{PublishError, StorageError};
use crate::event::{BusEvent, BusEventWithMetadata, encode};
use crate::queue::{BusTransaction, DbBackedQueue};
use crate::runner::{Engine, spawn_driver};
use crate::schema::BusEventRow;

enum RunState {
    New,
    Started {
        token: CancellationToken,
        driver: JoinHandle<()>,
    },
    Stopped,
}

/// A durable publish/subscribe bus over one queue table pair.
///
/// Publishers [`post`](PersistentBus::post) typed events; registered
/// [`EventHandler`]s receive them from a worker pool with at-least-once
/// semantics and bounded retries. The lifecycle is `NEW → STARTED →
/// STOPPED`; [`start`](PersistentBus::start) and
/// [`stop`](PersistentBus::stop) are idempotent, and a stopped bus can be
/// started again. Posting and handler registration require a started bus;
/// the inspection queries work in any state.
pub struct PersistentBus<D: QueueDao> {
    engine: Arc<Engine<D>>,
    state: Mutex<RunState>,
    started: AtomicBool,
}

impl<D: QueueDao> PersistentBus<D> {
    /// A bus over `dao`, configured by `config`. The bus is created in the
    /// `NEW` state; call [`start`](PersistentBus::start) to begin
    /// processing.
    pub fn new(dao: D, config: BusConfig) -> Self {
        let engine = Engine {
            queue: DbBackedQueue::new(dao, config),
            dispatcher: EventDispatcher::new(),
        };
        PersistentBus {
            engine: Arc::new(engine),
            state: Mutex::new(RunState::New),
            started: AtomicBool::new(false),
        }
    }

    /// The configuration this bus runs with.
    pub fn config(&self) -> &BusConfig {
        self.engine.queue.config()
    }

    /// The storage backend.
    pub fn dao(&self) -> &D {
        self.engine.queue.dao()
    }

    /// Whether the bus is currently started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Initialize the queue and launch the worker pool. No-op if already
    /// started; after a stop, starting again re-runs initialization.
    ///
    /// Initialization resets rows whose claim lease expired while no worker
    /// held them, so events stranded by a crash are claimable immediately.
    pub async fn start(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if matches!(*state, RunState::Started { .. }) {
            return Ok(());
        }

        self.engine.queue.initialize().await?;
        let token = CancellationToken::new();
        let driver = spawn_driver(Arc::clone(&self.engine), token.clone());
        *state = RunState::Started { token, driver };
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the worker pool to drain and wait for it, bounded by the
    /// configured shutdown timeout. No-op if not started.
    ///
    /// In-flight dispatches finish, including their terminal history move;
    /// unclaimed rows stay `AVAILABLE` for the next start.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, RunState::Stopped) {
            RunState::Started { token, driver } => {
                self.started.store(false, Ordering::SeqCst);
                token.cancel();
                let timeout = self.engine.queue.config().shutdown_timeout;
                match tokio::time::timeout(timeout, driver).await {
                    Ok(Ok(())) => {}
                    Ok(Err(join_error)) => {
                        warn!(%join_error, "bus driver task failed during shutdown");
                    }
                    Err(_) => {
                        warn!(?timeout, "bus driver did not drain within the shutdown timeout");
                    }
                }
            }
            other => *state = other,
        }
    }

    /// Register `handler` for events of type `E`.
    ///
    /// Returns the registration's identity, or `None` (with a warning) if
    /// the bus is not started. Handlers receive events in registration
    /// order; a handler registered between an event's claim and its
    /// dispatch still receives that event.
    pub fn register<E, H>(&self, handler: Arc<H>) -> Option<SubscriberId>
    where
        E: BusEvent,
        H: EventHandler<E>,
    {
        if !self.is_started() {
            warn!(
                event = E::EVENT_NAME,
                "attempting to register handler on a bus that is not started"
            );
            return None;
        }
        Some(self.engine.dispatcher.register::<E, H>(handler))
    }

    /// Remove a registration; effective for every dispatch that begins
    /// afterwards. Returns `false` (with a warning) if the bus is not
    /// started, or if the registration was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        if !self.is_started() {
            warn!("attempting to unregister handler on a bus that is not started");
            return false;
        }
        self.engine.dispatcher.unregister(id)
    }

    /// Publish an event.
    ///
    /// By default publication failures (serialization or storage) are
    /// logged and swallowed, so callers are insulated from bus outages;
    /// with [`BusConfig::strict_publish`] set they are returned instead.
    /// Posting on a non-started bus logs a warning and does nothing.
    pub async fn post<E: BusEvent>(&self, event: &E) -> Result<(), PublishError> {
        if !self.is_started() {
            warn!(
                event = E::EVENT_NAME,
                "attempting to post event on a bus that is not started"
            );
            return Ok(());
        }

        let strict = self.engine.queue.config().strict_publish;
        let entry = match encode(event, self.engine.queue.owner(), Utc::now()) {
            Ok(entry) => entry,
            Err(source) => {
                if strict {
                    return Err(PublishError::Encode(source));
                }
                error!(error = %source, event = E::EVENT_NAME, "failed to serialize bus event");
                return Ok(());
            }
        };

        match self.engine.queue.insert(&entry).await {
            Ok(_) => Ok(()),
            Err(source) => {
                if strict {
                    return Err(source.into());
                }
                error!(error = %source, event = E::EVENT_NAME, "failed to post bus event");
                Ok(())
            }
        }
    }

    /// Open a transaction for [`post_from_transaction`](PersistentBus::post_from_transaction)
    /// and the transactional inspection queries. The caller's own
    /// statements can run on [`BusTransaction::backend_tx`].
    pub async fn begin_transaction(&self) -> Result<BusTransaction<'_, D>, StorageError> {
        self.engine.queue.begin().await
    }

    /// Publish an event bound to the caller's transaction: it becomes
    /// visible only if the transaction commits.
    ///
    /// A serialization failure is logged and skipped without error, so a
    /// bus-side encoding bug never aborts the caller's transaction; storage
    /// errors propagate. Posting on a non-started bus logs a warning and
    /// does nothing.
    pub async fn post_from_transaction<E: BusEvent>(
        &self,
        event: &E,
        tx: &mut BusTransaction<'_, D>,
    ) -> Result<(), PublishError> {
        if !self.is_started() {
            warn!(
                event = E::EVENT_NAME,
                "attempting to post event on a bus that is not started"
            );
            return Ok(());
        }

        let entry = match encode(event, self.engine.queue.owner(), Utc::now()) {
            Ok(entry) => entry,
            Err(source) => {
                warn!(error = %source, event = E::EVENT_NAME, "unable to serialize bus event, skipping");
                return Ok(());
            }
        };

        tx.insert(&entry).await?;
        Ok(())
    }

    /// Rows currently claimed by a worker.
    pub async fn in_processing_events(&self) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(self.engine.queue.dao().in_processing().await?))
    }

    /// `AVAILABLE` rows matching both search keys.
    pub async fn available_events_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(
            self.engine
                .queue
                .dao()
                .ready(Some(search_key1), search_key2)
                .await?,
        ))
    }

    /// `AVAILABLE` rows matching `search_key2`.
    pub async fn available_events_for_search_key2(
        &self,
        search_key2: i64,
    ) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(
            self.engine.queue.dao().ready(None, search_key2).await?,
        ))
    }

    /// `AVAILABLE` and `IN_PROCESSING` rows matching both search keys.
    pub async fn available_or_in_processing_events_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(
            self.engine
                .queue
                .dao()
                .ready_or_in_processing(Some(search_key1), search_key2)
                .await?,
        ))
    }

    /// `AVAILABLE` and `IN_PROCESSING` rows matching `search_key2`.
    pub async fn available_or_in_processing_events_for_search_key2(
        &self,
        search_key2: i64,
    ) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(
            self.engine
                .queue
                .dao()
                .ready_or_in_processing(None, search_key2)
                .await?,
        ))
    }

    /// [`available_events_for_search_keys`](PersistentBus::available_events_for_search_keys),
    /// evaluated inside the given transaction so it observes the
    /// transaction's own uncommitted posts.
    pub async fn available_events_from_transaction_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
        tx: &mut BusTransaction<'_, D>,
    ) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(tx.ready(Some(search_key1), search_key2).await?))
    }

    /// [`available_events_for_search_key2`](PersistentBus::available_events_for_search_key2),
    /// evaluated inside the given transaction.
    pub async fn available_events_from_transaction_for_search_key2(
        &self,
        search_key2: i64,
        tx: &mut BusTransaction<'_, D>,
    ) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(tx.ready(None, search_key2).await?))
    }

    /// [`available_or_in_processing_events_for_search_keys`](PersistentBus::available_or_in_processing_events_for_search_keys),
    /// evaluated inside the given transaction.
    pub async fn available_or_in_processing_events_from_transaction_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
        tx: &mut BusTransaction<'_, D>,
    ) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(
            tx.ready_or_in_processing(Some(search_key1), search_key2)
                .await?,
        ))
    }

    /// [`available_or_in_processing_events_for_search_key2`](PersistentBus::available_or_in_processing_events_for_search_key2),
    /// evaluated inside the given transaction.
    pub async fn available_or_in_processing_events_from_transaction_for_search_key2(
        &self,
        search_key2: i64,
        tx: &mut BusTransaction<'_, D>,
    ) -> Result<Vec<BusEventWithMetadata>, StorageError> {
        Ok(to_metadata(tx.ready_or_in_processing(None, search_key2).await?))
    }
}

impl<D: QueueDao> Drop for PersistentBus<D> {
    fn drop(&mut self) {
        // Dropping the bus without stopping leaves no way to join the
        // driver, but it should not keep running either.
        if let RunState::Started { token, .. } = &*self.state.get_mut() {
            token.cancel();
        }
    }
}

fn to_metadata(rows: Vec<BusEventRow>) -> Vec<BusEventWithMetadata> {
    rows.iter().map(BusEventWithMetadata::from_row).collect()
}

//! The poll loop driving claimed rows through dispatch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, trace};

use crate::config::BusConfig;
use crate::dao::QueueDao;
use crate::dispatch::EventDispatcher;
use crate::queue::DbBackedQueue;
use crate::schema::{BusEventRow, ProcessingState};

/// Everything the driver task and the facade share.
pub(crate) struct Engine<D: QueueDao> {
    pub(crate) queue: DbBackedQueue<D>,
    pub(crate) dispatcher: EventDispatcher,
}

/// Spawn the driver task for `engine`, stoppable through `token`.
pub(crate) fn spawn_driver<D: QueueDao>(
    engine: Arc<Engine<D>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let span = info_span!("bus-driver", queue = %engine.queue.config().table_name);
    tokio::spawn(run_loop(engine, token).instrument(span))
}

/// Claim a batch, fan it out across the worker pool, write the batch's
/// terminal rows to history, repeat.
///
/// A full batch signals backlog, so the next claim runs without sleeping.
/// Otherwise the loop waits for the poll interval, an insert notification,
/// or cancellation, whichever comes first. Storage errors never end the
/// loop: it keeps polling and self-heals once the backend is reachable
/// again.
async fn run_loop<D: QueueDao>(engine: Arc<Engine<D>>, token: CancellationToken) {
    let notify = engine.queue.insert_notify();
    info!("bus driver started");

    loop {
        if token.is_cancelled() {
            break;
        }

        let claimed = match engine.queue.claim_ready().await {
            Ok(rows) => rows,
            Err(error) => {
                error!(%error, "failed to claim ready bus events");
                Vec::new()
            }
        };
        let claimed_count = claimed.len();

        if claimed_count > 0 {
            trace!(claimed = claimed_count, "dispatching claimed bus events");
            let outcomes: Vec<Option<BusEventRow>> = stream::iter(claimed)
                .map(|row| process_one(&engine, row))
                .buffer_unordered(engine.queue.config().nb_threads)
                .collect()
                .await;
            let staged: Vec<BusEventRow> = outcomes.into_iter().flatten().collect();
            if !staged.is_empty() {
                if let Err(error) = engine.queue.move_to_history(&staged).await {
                    error!(%error, "failed to move terminal bus events to history");
                }
            }
        }

        if claimed_count == engine.queue.config().claim_batch_size {
            continue;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = notify.notified() => {}
            _ = tokio::time::sleep(sleep_with_jitter(engine.queue.config())) => {}
        }
    }

    info!("bus driver stopped");
}

/// Dispatch one claimed row and account for the outcome.
///
/// Returns the terminal copy to stage for history, or `None` when the row
/// was rescheduled for a retry.
async fn process_one<D: QueueDao>(engine: &Engine<D>, row: BusEventRow) -> Option<BusEventRow> {
    let span = info_span!("dispatch", record_id = row.record_id, event = %row.class_name);
    async move {
        let started = Instant::now();
        let outcome = engine
            .dispatcher
            .dispatch(&row.class_name, &row.event_json)
            .await;
        let elapsed = started.elapsed();
        let now = Utc::now();

        match outcome {
            Ok(()) => {
                trace!(?elapsed, "bus event dispatched");
                Some(row.into_terminal(ProcessingState::Processed, engine.queue.owner(), now))
            }
            Err(error) => {
                let error_count = row.error_count + 1;
                if error_count <= engine.queue.config().max_failure_retries {
                    info!(%error, error_count, "bus dispatch error, will attempt a retry");
                    if let Err(storage) = engine.queue.update_on_error(&row, error_count, now).await
                    {
                        // The row stays IN_PROCESSING until its lease
                        // expires, after which it is claimable again.
                        error!(%storage, "failed to reschedule bus event for retry");
                    }
                    None
                } else {
                    error!(%error, error_count, "bus dispatch error, retries exhausted");
                    let mut terminal =
                        row.into_terminal(ProcessingState::Failed, engine.queue.owner(), now);
                    terminal.error_count = error_count;
                    Some(terminal)
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// The poll sleep with random jitter applied.
///
/// Jitter spreads out claim ticks when several processes poll the same
/// table.
fn sleep_with_jitter(config: &BusConfig) -> Duration {
    if config.poll_jitter.is_zero() {
        return config.poll_interval;
    }

    let jitter_millis = u64::try_from(config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
    let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
    config.poll_interval + Duration::from_millis(random_jitter)
}

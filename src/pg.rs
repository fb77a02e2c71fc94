//! PostgreSQL implementation of the [`QueueDao`] port.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::config::BusConfig;
use crate::dao::QueueDao;
use crate::error::StorageError;
use crate::schema::{BusEventRow, NewBusEvent};

const COLUMNS: &str = "record_id, class_name, event_json, user_token, created_date, \
                       creator_name, processing_owner, processing_available_date, \
                       processing_state, error_count, search_key1, search_key2";

/// [`QueueDao`] backed by a PostgreSQL table pair through an sqlx pool.
///
/// Claims rely on `FOR UPDATE SKIP LOCKED`, so concurrent workers in this
/// or other processes sharing the table always pick disjoint rows. Dates
/// are bound as native PostgreSQL timestamps.
#[derive(Debug, Clone)]
pub struct PgQueueDao {
    pool: PgPool,
    table: String,
    history_table: String,
}

impl PgQueueDao {
    /// DAO over the tables named by `config`, using the given pool.
    pub fn new(pool: PgPool, config: &BusConfig) -> Self {
        PgQueueDao {
            pool,
            table: config.table_name.clone(),
            history_table: config.history_table_name(),
        }
    }

    /// Create the live table, the history table, and their indexes if they
    /// do not exist yet. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let live = format!(
            r"
            CREATE TABLE IF NOT EXISTS {table} (
                record_id BIGSERIAL PRIMARY KEY,
                class_name VARCHAR(255) NOT NULL,
                event_json TEXT NOT NULL,
                user_token UUID NOT NULL,
                created_date TIMESTAMPTZ NOT NULL,
                creator_name VARCHAR(255) NOT NULL,
                processing_owner VARCHAR(255),
                processing_available_date TIMESTAMPTZ,
                processing_state VARCHAR(16) NOT NULL DEFAULT 'AVAILABLE',
                error_count INT NOT NULL DEFAULT 0,
                search_key1 BIGINT NOT NULL,
                search_key2 BIGINT NOT NULL
            )
            ",
            table = self.table,
        );
        let history = format!(
            r"
            CREATE TABLE IF NOT EXISTS {history} (
                record_id BIGINT PRIMARY KEY,
                class_name VARCHAR(255) NOT NULL,
                event_json TEXT NOT NULL,
                user_token UUID NOT NULL,
                created_date TIMESTAMPTZ NOT NULL,
                creator_name VARCHAR(255) NOT NULL,
                processing_owner VARCHAR(255),
                processing_available_date TIMESTAMPTZ,
                processing_state VARCHAR(16) NOT NULL,
                error_count INT NOT NULL,
                search_key1 BIGINT NOT NULL,
                search_key2 BIGINT NOT NULL
            )
            ",
            history = self.history_table,
        );
        let state_index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_state_date \
             ON {table} (processing_state, processing_available_date)",
            table = self.table,
        );
        let search_index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_search_keys \
             ON {table} (search_key2, search_key1)",
            table = self.table,
        );

        sqlx::query(&live).execute(&self.pool).await?;
        sqlx::query(&history).execute(&self.pool).await?;
        sqlx::query(&state_index).execute(&self.pool).await?;
        sqlx::query(&search_index).execute(&self.pool).await?;
        Ok(())
    }

    fn insert_sql(&self) -> String {
        // The available date starts equal to the creation date, so a fresh
        // row is immediately claimable.
        format!(
            r"
            INSERT INTO {table}
                (class_name, event_json, user_token, created_date, creator_name,
                 processing_owner, processing_available_date, processing_state,
                 error_count, search_key1, search_key2)
            VALUES ($1, $2, $3, $4, $5, NULL, $4, 'AVAILABLE', 0, $6, $7)
            RETURNING record_id
            ",
            table = self.table,
        )
    }

    fn selector_sql(&self, states: &str, with_search_key1: bool) -> String {
        let mut query = format!(
            "SELECT {COLUMNS} FROM {table} WHERE processing_state IN ({states}) \
             AND search_key2 = $1",
            table = self.table,
        );
        if with_search_key1 {
            query.push_str(" AND search_key1 = $2");
        }
        query.push_str(" ORDER BY record_id");
        query
    }

    async fn select_by_search_keys<'e, E>(
        &self,
        executor: E,
        states: &str,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let query = self.selector_sql(states, search_key1.is_some());
        let mut query_builder = sqlx::query_as::<_, BusEventRow>(&query).bind(search_key2);
        if let Some(search_key1) = search_key1 {
            query_builder = query_builder.bind(search_key1);
        }
        Ok(query_builder.fetch_all(executor).await?)
    }
}

impl QueueDao for PgQueueDao {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError> {
        Ok(tx.rollback().await?)
    }

    async fn insert(&self, entry: &NewBusEvent) -> Result<i64, StorageError> {
        let record_id = sqlx::query_scalar::<_, i64>(&self.insert_sql())
            .bind(&entry.class_name)
            .bind(&entry.event_json)
            .bind(entry.user_token)
            .bind(entry.created_date)
            .bind(&entry.creator_name)
            .bind(entry.search_key1)
            .bind(entry.search_key2)
            .fetch_one(&self.pool)
            .await?;
        Ok(record_id)
    }

    async fn insert_in_tx(
        &self,
        tx: &mut Self::Tx,
        entry: &NewBusEvent,
    ) -> Result<i64, StorageError> {
        let record_id = sqlx::query_scalar::<_, i64>(&self.insert_sql())
            .bind(&entry.class_name)
            .bind(&entry.event_json)
            .bind(entry.user_token)
            .bind(entry.created_date)
            .bind(&entry.creator_name)
            .bind(entry.search_key1)
            .bind(entry.search_key2)
            .fetch_one(&mut **tx)
            .await?;
        Ok(record_id)
    }

    async fn claim_ready(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        let now = Utc::now();
        let query = format!(
            r"
            UPDATE {table}
            SET processing_state = 'IN_PROCESSING',
                processing_owner = $1,
                processing_available_date = $2
            WHERE record_id IN (
                SELECT record_id FROM {table}
                WHERE processing_state = 'AVAILABLE'
                  AND processing_available_date <= $3
                ORDER BY record_id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            ",
            table = self.table,
        );
        let rows = sqlx::query_as::<_, BusEventRow>(&query)
            .bind(owner)
            .bind(now + lease)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn update_on_error(
        &self,
        record_id: i64,
        error_count: i32,
        available_date: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let query = format!(
            r"
            UPDATE {table}
            SET processing_state = 'AVAILABLE',
                processing_owner = NULL,
                processing_available_date = $1,
                error_count = $2
            WHERE record_id = $3
            ",
            table = self.table,
        );
        sqlx::query(&query)
            .bind(available_date)
            .bind(error_count)
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn move_to_history(&self, rows: &[BusEventRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        // ON CONFLICT makes a partially completed earlier move safe to
        // retry: the history copy wins once, the live delete is repeatable.
        let insert = format!(
            r"
            INSERT INTO {history} ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (record_id) DO NOTHING
            ",
            history = self.history_table,
        );
        let delete = format!(
            "DELETE FROM {table} WHERE record_id = ANY($1)",
            table = self.table,
        );

        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(&insert)
                .bind(row.record_id)
                .bind(&row.class_name)
                .bind(&row.event_json)
                .bind(row.user_token)
                .bind(row.created_date)
                .bind(&row.creator_name)
                .bind(&row.processing_owner)
                .bind(row.processing_available_date)
                .bind(row.processing_state)
                .bind(row.error_count)
                .bind(row.search_key1)
                .bind(row.search_key2)
                .execute(&mut *tx)
                .await?;
        }
        let record_ids: Vec<i64> = rows.iter().map(|row| row.record_id).collect();
        sqlx::query(&delete)
            .bind(&record_ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_stale_leases(&self) -> Result<u64, StorageError> {
        let query = format!(
            r"
            UPDATE {table}
            SET processing_state = 'AVAILABLE',
                processing_owner = NULL
            WHERE processing_state = 'IN_PROCESSING'
              AND processing_available_date <= $1
            ",
            table = self.table,
        );
        let result = sqlx::query(&query)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn in_processing(&self) -> Result<Vec<BusEventRow>, StorageError> {
        let query = format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE processing_state = 'IN_PROCESSING' ORDER BY record_id",
            table = self.table,
        );
        Ok(sqlx::query_as::<_, BusEventRow>(&query)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn ready(
        &self,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        self.select_by_search_keys(&self.pool, "'AVAILABLE'", search_key1, search_key2)
            .await
    }

    async fn ready_or_in_processing(
        &self,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        self.select_by_search_keys(
            &self.pool,
            "'AVAILABLE', 'IN_PROCESSING'",
            search_key1,
            search_key2,
        )
        .await
    }

    async fn ready_in_tx(
        &self,
        tx: &mut Self::Tx,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        self.select_by_search_keys(&mut **tx, "'AVAILABLE'", search_key1, search_key2)
            .await
    }

    async fn ready_or_in_processing_in_tx(
        &self,
        tx: &mut Self::Tx,
        search_key1: Option<i64>,
        search_key2: i64,
    ) -> Result<Vec<BusEventRow>, StorageError> {
        self.select_by_search_keys(
            &mut **tx,
            "'AVAILABLE', 'IN_PROCESSING'",
            search_key1,
            search_key2,
        )
        .await
    }
}

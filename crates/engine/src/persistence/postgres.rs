//! PostgreSQL implementation of the document event and lease stores
//!
//! - Optimistic concurrency via the previously observed processing date
//! - Lease acquisition as a conditional upsert on the lease row
//! - Batched writes executed in a single transaction

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::event::{EventId, EventRecord, EventStatus, Parameters};

const RECORD_COLUMNS: &str = "id, event_type, parameters, status, priority, creation_date, \
     processing_date, processed_date, survivor_of_ids, failure_cause";

/// PostgreSQL implementation of [`DocumentEventStore`] and [`LeaseStore`]
///
/// # Example
///
/// ```ignore
/// use docevents_engine::PostgresDocumentEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/docevents").await?;
/// let store = PostgresDocumentEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresDocumentEventStore {
    pool: PgPool,
}

impl PostgresDocumentEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn insert_in(
        tx: &mut Transaction<'_, Postgres>,
        record: &EventRecord,
    ) -> Result<EventId, StoreError> {
        let id = Uuid::now_v7();
        let parameters = parameters_json(&record.parameters)?;
        let survivors: Vec<Uuid> = record.survivor_of_ids.iter().copied().collect();

        sqlx::query(
            r#"
            INSERT INTO document_events (
                id, event_type, parameters, status, priority, creation_date,
                processing_date, processed_date, survivor_of_ids, failure_cause
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&record.event_type)
        .bind(&parameters)
        .bind(record.status.as_str())
        .bind(record.priority)
        .bind(record.creation_date)
        .bind(record.processing_date)
        .bind(record.processed_date)
        .bind(&survivors)
        .bind(&record.failure_cause)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to insert event: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(id)
    }

    async fn conditional_update_in(
        tx: &mut Transaction<'_, Postgres>,
        id: EventId,
        expected_processing_date: Option<DateTime<Utc>>,
        record: &EventRecord,
    ) -> Result<u64, StoreError> {
        let parameters = stored_parameters(record)?;
        let survivors: Vec<Uuid> = record.survivor_of_ids.iter().copied().collect();

        let result = sqlx::query(
            r#"
            UPDATE document_events
            SET event_type = $3,
                parameters = COALESCE($4, parameters),
                status = $5,
                priority = $6,
                processing_date = $7,
                processed_date = $8,
                survivor_of_ids = $9,
                failure_cause = $10
            WHERE id = $1
              AND processing_date IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id)
        .bind(expected_processing_date)
        .bind(&record.event_type)
        .bind(&parameters)
        .bind(record.status.as_str())
        .bind(record.priority)
        .bind(record.processing_date)
        .bind(record.processed_date)
        .bind(&survivors)
        .bind(&record.failure_cause)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to update event: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl DocumentEventStore for PostgresDocumentEventStore {
    #[instrument(skip(self, event_types))]
    async fn find_unprocessed_or_expired(
        &self,
        event_types: &[String],
        limit: usize,
        expired_before: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        if event_types.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM document_events
            WHERE event_type = ANY($1)
              AND (status = 'unprocessed'
                   OR (status = 'processing' AND processing_date < $2))
            ORDER BY priority DESC, creation_date ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(event_types)
        .bind(expired_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find events: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = records.len(), "fetched candidate events");
        Ok(records)
    }

    #[instrument(skip(self, record), fields(event_type = %record.event_type))]
    async fn insert(&self, record: &EventRecord) -> Result<EventId, StoreError> {
        let mut tx = self.begin().await?;
        let id = Self::insert_in(&mut tx, record).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%id, "inserted event");
        Ok(id)
    }

    #[instrument(skip(self, record))]
    async fn conditional_update(
        &self,
        id: EventId,
        expected_processing_date: Option<DateTime<Utc>>,
        record: &EventRecord,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let modified =
            Self::conditional_update_in(&mut tx, id, expected_processing_date, record).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(modified)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: EventId) -> Result<EventRecord, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM document_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load event: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::NotFound(id))?;

        record_from_row(&row)
    }

    #[instrument(skip(self, batch), fields(writes = batch.len()))]
    async fn execute_batch(&self, batch: WriteBatch) -> Result<Vec<WriteOutcome>, StoreError> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self.begin().await?;
        let mut outcomes = Vec::with_capacity(batch.len());

        for write in batch.into_writes() {
            let outcome = match write {
                PendingWrite::Insert(record) => {
                    WriteOutcome::Inserted(Self::insert_in(&mut tx, &record).await?)
                }
                PendingWrite::ConditionalUpdate {
                    id,
                    expected_processing_date,
                    record,
                } => WriteOutcome::Updated {
                    modified: Self::conditional_update_in(
                        &mut tx,
                        id,
                        expected_processing_date,
                        &record,
                    )
                    .await?,
                },
            };
            outcomes.push(outcome);
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(count = outcomes.len(), "executed write batch");
        Ok(outcomes)
    }
}

#[async_trait]
impl LeaseStore for PostgresDocumentEventStore {
    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        owner: &str,
        resource_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO document_event_leases (resource_id, owner, ttl_ms, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $3::double precision / 1000))
            ON CONFLICT (resource_id) DO UPDATE
            SET owner = EXCLUDED.owner,
                ttl_ms = EXCLUDED.ttl_ms,
                expires_at = EXCLUDED.expires_at
            WHERE document_event_leases.expires_at <= NOW()
               OR document_event_leases.owner = EXCLUDED.owner
            "#,
        )
        .bind(resource_id)
        .bind(owner)
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn ping_lease(&self, owner: &str, resource_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE document_event_leases
            SET expires_at = NOW() + make_interval(secs => ttl_ms::double precision / 1000)
            WHERE resource_id = $1
              AND owner = $2
              AND expires_at > NOW()
            "#,
        )
        .bind(resource_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, owner: &str, resource_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM document_event_leases
            WHERE resource_id = $1 AND owner = $2
            "#,
        )
        .bind(resource_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

fn parameters_json(parameters: &Parameters) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(parameters).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Parameters to write back, `None` for a record whose stored payload could not be decoded
fn stored_parameters(record: &EventRecord) -> Result<Option<serde_json::Value>, StoreError> {
    match record.decode_error {
        Some(_) => Ok(None),
        None => parameters_json(&record.parameters).map(Some),
    }
}

/// Map a row to a record
///
/// A malformed `parameters` column does not fail the row: the record comes
/// back with `decode_error` set so it is claimed and failed like any other
/// unparseable event.
fn record_from_row(row: &PgRow) -> Result<EventRecord, StoreError> {
    let id: Uuid = row.get("id");
    let status: String = row.get("status");
    let parameters: serde_json::Value = row.get("parameters");
    let survivors: Vec<Uuid> = row.get("survivor_of_ids");

    let (parameters, decode_error) = match serde_json::from_value::<Parameters>(parameters) {
        Ok(parameters) => (parameters, None),
        Err(e) => {
            warn!(%id, error = %e, "stored parameters are malformed");
            (Parameters::new(), Some(format!("malformed parameters: {e}")))
        }
    };

    Ok(EventRecord {
        id: Some(id),
        event_type: row.get("event_type"),
        parameters,
        status: status
            .parse::<EventStatus>()
            .map_err(StoreError::Serialization)?,
        priority: row.get("priority"),
        creation_date: row.get("creation_date"),
        processing_date: row.get("processing_date"),
        processed_date: row.get("processed_date"),
        survivor_of_ids: survivors.into_iter().collect::<BTreeSet<_>>(),
        failure_cause: row.get("failure_cause"),
        decode_error,
    })
}

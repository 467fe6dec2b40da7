use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use fulfillsync_core::{EntityType, LocalId, RemoteId};

use crate::clock::Clock;
use crate::db;

use super::{
    CorrelationError, CorrelationInsert, CorrelationRecord, CorrelationStore, resolve_collision,
};

/// Correlation table in Postgres. Uniqueness of both directions is enforced
/// by the primary key and the `(entity_type, remote_id)` unique constraint.
#[derive(Clone)]
pub struct PostgresCorrelationStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresCorrelationStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }
}

#[async_trait::async_trait]
impl CorrelationStore for PostgresCorrelationStore {
    async fn find_by_local(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
    ) -> Result<Option<CorrelationRecord>, CorrelationError> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, local_id, remote_id, created_at
            FROM sync_correlations
            WHERE entity_type = $1 AND local_id = $2
            "#,
        )
        .bind(entity_type.as_str())
        .bind(local_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_local", e))?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    async fn find_by_remote(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<Option<CorrelationRecord>, CorrelationError> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, local_id, remote_id, created_at
            FROM sync_correlations
            WHERE entity_type = $1 AND remote_id = $2
            "#,
        )
        .bind(entity_type.as_str())
        .bind(remote_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_remote", e))?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    #[instrument(skip(self), fields(entity_type = %entity_type, local_id = %local_id, remote_id = %remote_id), err)]
    async fn insert(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        remote_id: RemoteId,
    ) -> Result<CorrelationInsert, CorrelationError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_correlations (entity_type, local_id, remote_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            RETURNING entity_type, local_id, remote_id, created_at
            "#,
        )
        .bind(entity_type.as_str())
        .bind(local_id.get())
        .bind(remote_id.as_str())
        .bind(self.clock.now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        if let Some(row) = inserted {
            return record_from_row(&row).map(CorrelationInsert::Created);
        }

        let by_local = self.find_by_local(entity_type, local_id).await?;
        let by_remote = self.find_by_remote(entity_type, &remote_id).await?;
        resolve_collision(entity_type, local_id, &remote_id, by_local, by_remote)
    }
}

struct CorrelationRow {
    entity_type: String,
    local_id: i64,
    remote_id: String,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for CorrelationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(CorrelationRow {
            entity_type: row.try_get("entity_type")?,
            local_id: row.try_get("local_id")?,
            remote_id: row.try_get("remote_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<CorrelationRecord, CorrelationError> {
    let row = CorrelationRow::from_row(row)
        .map_err(|e| CorrelationError::Storage(format!("failed to decode correlation row: {e}")))?;
    let entity_type = row
        .entity_type
        .parse::<EntityType>()
        .map_err(|e| CorrelationError::Storage(e.to_string()))?;

    Ok(CorrelationRecord {
        entity_type,
        local_id: LocalId::new(row.local_id),
        remote_id: RemoteId::new(row.remote_id),
        created_at: row.created_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CorrelationError {
    if db::is_unavailable(&err) {
        return CorrelationError::Storage(format!("database unavailable in {operation}: {err}"));
    }
    // ON CONFLICT DO NOTHING covers both constraints; a unique violation here
    // means a concurrent writer slipped in between statements.
    if db::is_unique_violation(&err) {
        return CorrelationError::Storage(format!("concurrent correlation write in {operation}"));
    }
    CorrelationError::Storage(format!("sqlx error in {operation}: {err}"))
}

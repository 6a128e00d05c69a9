//! # PostgreSQL Store
//!
//! `sqlx` implementation of the three repositories over the tables created
//! by `migrations/`. Enum columns are stored as their snake_case strings;
//! nested structures (schedule, statistics, task metadata, snapshots) are
//! JSONB.
//!
//! `record_call` locks the connection row (`SELECT ... FOR UPDATE`) inside a
//! transaction so concurrent workers never lose a statistics increment;
//! `find_or_create` relies on the `(entity_id, connection_id)` primary key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

use super::{
    ConnectionRepository, LinkRepository, RepositoryError, RepositoryResult, TaskRepository,
};
use crate::models::{
    CallReport, Connection, ConnectionId, ConnectionStats, EntityId, EntityLink, ErrorDetails,
    HealthPolicy, SchedulePolicy, SyncTask, TaskId, TaskMetadata,
};

const CONNECTION_COLUMNS: &str = "connection_id, name, erp_type, credentials_ref, is_active, \
    sync_mode, schedule, health, last_health_check_at, last_latency_ms, last_error, \
    consecutive_failures, auto_disable_on_errors, error_threshold, stats, \
    last_successful_sync_at, next_scheduled_sync_at, created_at, updated_at";

const TASK_COLUMNS: &str = "task_id, kind, connection_id, entity_id, queue, status, \
    total_items, processed_items, succeeded_items, failed_items, progress_percentage, \
    avg_item_duration_ms, metadata, error_summary, error_kind, error_details, result_summary, \
    triggered_by, created_at, started_at, completed_at, updated_at";

const LINK_COLUMNS: &str = "entity_id, connection_id, external_id, status, external_snapshot, \
    pending_fields, last_sync_at, last_push_at, last_pull_at, last_error, retry_count, \
    created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> RepositoryResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| RepositoryError::Database(error.to_string()))?;
        debug!("🗄️ Synchronization schema migrated");
        Ok(())
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> RepositoryResult<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|error: String| RepositoryError::CorruptRow(format!("{column}: {error}")))
}

fn parse_optional_column<T>(row: &PgRow, column: &str) -> RepositoryResult<Option<T>>
where
    T: FromStr<Err = String>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value
            .parse()
            .map_err(|error: String| RepositoryError::CorruptRow(format!("{column}: {error}")))
    })
    .transpose()
}

fn json_column<T: DeserializeOwned>(row: &PgRow, column: &str) -> RepositoryResult<T> {
    let Json(value): Json<T> = row.try_get(column)?;
    Ok(value)
}

fn optional_json_column<T: DeserializeOwned>(
    row: &PgRow,
    column: &str,
) -> RepositoryResult<Option<T>> {
    let value: Option<Json<T>> = row.try_get(column)?;
    Ok(value.map(|Json(inner)| inner))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn connection_from_row(row: &PgRow) -> RepositoryResult<Connection> {
    let latency: Option<i64> = row.try_get("last_latency_ms")?;
    Ok(Connection {
        connection_id: row.try_get("connection_id")?,
        name: row.try_get("name")?,
        erp_type: parse_column(row, "erp_type")?,
        credentials_ref: row.try_get("credentials_ref")?,
        is_active: row.try_get("is_active")?,
        sync_mode: parse_column(row, "sync_mode")?,
        schedule: json_column::<SchedulePolicy>(row, "schedule")?,
        health: parse_column(row, "health")?,
        last_health_check_at: row.try_get("last_health_check_at")?,
        last_latency_ms: latency.map(to_u64),
        last_error: row.try_get("last_error")?,
        consecutive_failures: to_u32(row.try_get("consecutive_failures")?),
        auto_disable_on_errors: row.try_get("auto_disable_on_errors")?,
        error_threshold: to_u32(row.try_get("error_threshold")?),
        stats: json_column::<ConnectionStats>(row, "stats")?,
        last_successful_sync_at: row.try_get("last_successful_sync_at")?,
        next_scheduled_sync_at: row.try_get("next_scheduled_sync_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> RepositoryResult<SyncTask> {
    Ok(SyncTask {
        task_id: row.try_get("task_id")?,
        kind: parse_column(row, "kind")?,
        connection_id: row.try_get("connection_id")?,
        entity_id: row.try_get("entity_id")?,
        queue: parse_column(row, "queue")?,
        status: parse_column(row, "status")?,
        total_items: to_u64(row.try_get("total_items")?),
        processed_items: to_u64(row.try_get("processed_items")?),
        succeeded_items: to_u64(row.try_get("succeeded_items")?),
        failed_items: to_u64(row.try_get("failed_items")?),
        progress_percentage: row.try_get("progress_percentage")?,
        avg_item_duration_ms: row.try_get("avg_item_duration_ms")?,
        metadata: json_column::<TaskMetadata>(row, "metadata")?,
        error_summary: row.try_get("error_summary")?,
        error_kind: parse_optional_column(row, "error_kind")?,
        error_details: optional_json_column::<ErrorDetails>(row, "error_details")?,
        result_summary: optional_json_column::<serde_json::Value>(row, "result_summary")?,
        triggered_by: row.try_get("triggered_by")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn link_from_row(row: &PgRow) -> RepositoryResult<EntityLink> {
    Ok(EntityLink {
        entity_id: row.try_get("entity_id")?,
        connection_id: row.try_get("connection_id")?,
        external_id: row.try_get("external_id")?,
        status: parse_column(row, "status")?,
        external_snapshot: json_column(row, "external_snapshot")?,
        pending_fields: json_column(row, "pending_fields")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_push_at: row.try_get("last_push_at")?,
        last_pull_at: row.try_get("last_pull_at")?,
        last_error: row.try_get("last_error")?,
        retry_count: to_u32(row.try_get("retry_count")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn write_connection<'e, E>(executor: E, connection: &Connection) -> RepositoryResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO erp_connections (
            connection_id, name, erp_type, credentials_ref, is_active, sync_mode, schedule,
            health, last_health_check_at, last_latency_ms, last_error, consecutive_failures,
            auto_disable_on_errors, error_threshold, stats, last_successful_sync_at,
            next_scheduled_sync_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        ON CONFLICT (connection_id) DO UPDATE SET
            name = EXCLUDED.name,
            erp_type = EXCLUDED.erp_type,
            credentials_ref = EXCLUDED.credentials_ref,
            is_active = EXCLUDED.is_active,
            sync_mode = EXCLUDED.sync_mode,
            schedule = EXCLUDED.schedule,
            health = EXCLUDED.health,
            last_health_check_at = EXCLUDED.last_health_check_at,
            last_latency_ms = EXCLUDED.last_latency_ms,
            last_error = EXCLUDED.last_error,
            consecutive_failures = EXCLUDED.consecutive_failures,
            auto_disable_on_errors = EXCLUDED.auto_disable_on_errors,
            error_threshold = EXCLUDED.error_threshold,
            stats = EXCLUDED.stats,
            last_successful_sync_at = EXCLUDED.last_successful_sync_at,
            next_scheduled_sync_at = EXCLUDED.next_scheduled_sync_at,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(connection.connection_id)
    .bind(&connection.name)
    .bind(connection.erp_type.as_str())
    .bind(&connection.credentials_ref)
    .bind(connection.is_active)
    .bind(connection.sync_mode.as_str())
    .bind(Json(&connection.schedule))
    .bind(connection.health.as_str())
    .bind(connection.last_health_check_at)
    .bind(connection.last_latency_ms.map(to_i64))
    .bind(&connection.last_error)
    .bind(to_i32(connection.consecutive_failures))
    .bind(connection.auto_disable_on_errors)
    .bind(to_i32(connection.error_threshold))
    .bind(Json(&connection.stats))
    .bind(connection.last_successful_sync_at)
    .bind(connection.next_scheduled_sync_at)
    .bind(connection.created_at)
    .bind(connection.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl ConnectionRepository for PgSyncStore {
    async fn upsert(&self, connection: &Connection) -> RepositoryResult<()> {
        write_connection(&self.pool, connection).await
    }

    async fn get(&self, connection_id: ConnectionId) -> RepositoryResult<Option<Connection>> {
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM erp_connections WHERE connection_id = $1"
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(connection_from_row).transpose()
    }

    async fn list_active(&self) -> RepositoryResult<Vec<Connection>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM erp_connections WHERE is_active ORDER BY connection_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(connection_from_row).collect()
    }

    async fn record_call(
        &self,
        connection_id: ConnectionId,
        report: &CallReport,
        policy: &HealthPolicy,
    ) -> RepositoryResult<Connection> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM erp_connections WHERE connection_id = $1 FOR UPDATE"
        ))
        .bind(connection_id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut connection = match row {
            Some(row) => connection_from_row(&row)?,
            None => {
                return Err(RepositoryError::NotFound {
                    entity: "connection",
                    id: connection_id.to_string(),
                })
            }
        };
        connection.apply_call_report(report, policy);
        write_connection(&mut *tx, &connection).await?;
        tx.commit().await?;
        Ok(connection)
    }

    async fn schedule_next(
        &self,
        connection_id: ConnectionId,
        at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE erp_connections SET next_scheduled_sync_at = $2 WHERE connection_id = $1",
        )
        .bind(connection_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "connection",
                id: connection_id.to_string(),
            });
        }
        Ok(())
    }
}

async fn write_task<'e, E>(executor: E, task: &SyncTask, insert_only: bool) -> RepositoryResult<u64>
where
    E: sqlx::PgExecutor<'e>,
{
    let conflict = if insert_only {
        "ON CONFLICT (task_id) DO NOTHING"
    } else {
        "ON CONFLICT (task_id) DO UPDATE SET
            status = EXCLUDED.status,
            total_items = EXCLUDED.total_items,
            processed_items = EXCLUDED.processed_items,
            succeeded_items = EXCLUDED.succeeded_items,
            failed_items = EXCLUDED.failed_items,
            progress_percentage = EXCLUDED.progress_percentage,
            avg_item_duration_ms = EXCLUDED.avg_item_duration_ms,
            metadata = EXCLUDED.metadata,
            error_summary = EXCLUDED.error_summary,
            error_kind = EXCLUDED.error_kind,
            error_details = EXCLUDED.error_details,
            result_summary = EXCLUDED.result_summary,
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at,
            updated_at = EXCLUDED.updated_at"
    };

    let result = sqlx::query(&format!(
        r#"
        INSERT INTO sync_tasks ({TASK_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
        {conflict}
        "#
    ))
    .bind(task.task_id)
    .bind(task.kind.as_str())
    .bind(task.connection_id)
    .bind(task.entity_id)
    .bind(task.queue.as_str())
    .bind(task.status.as_str())
    .bind(to_i64(task.total_items))
    .bind(to_i64(task.processed_items))
    .bind(to_i64(task.succeeded_items))
    .bind(to_i64(task.failed_items))
    .bind(task.progress_percentage)
    .bind(task.avg_item_duration_ms)
    .bind(Json(&task.metadata))
    .bind(&task.error_summary)
    .bind(task.error_kind.map(|kind| kind.as_str()))
    .bind(task.error_details.as_ref().map(Json))
    .bind(task.result_summary.as_ref().map(Json))
    .bind(&task.triggered_by)
    .bind(task.created_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.updated_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl TaskRepository for PgSyncStore {
    async fn insert(&self, task: &SyncTask) -> RepositoryResult<()> {
        if write_task(&self.pool, task, true).await? == 0 {
            return Err(RepositoryError::AlreadyExists {
                entity: "task",
                id: task.task_id.to_string(),
            });
        }
        Ok(())
    }

    async fn save(&self, task: &SyncTask) -> RepositoryResult<()> {
        write_task(&self.pool, task, false).await?;
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> RepositoryResult<Option<SyncTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM sync_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }
}

#[async_trait]
impl LinkRepository for PgSyncStore {
    async fn find_or_create(
        &self,
        entity_id: EntityId,
        connection_id: ConnectionId,
        now: DateTime<Utc>,
    ) -> RepositoryResult<EntityLink> {
        sqlx::query(
            "INSERT INTO entity_links (entity_id, connection_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $3) ON CONFLICT (entity_id, connection_id) DO NOTHING",
        )
        .bind(entity_id)
        .bind(connection_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find(entity_id, connection_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "link",
                id: format!("{entity_id}@{connection_id}"),
            })
    }

    async fn find(
        &self,
        entity_id: EntityId,
        connection_id: ConnectionId,
    ) -> RepositoryResult<Option<EntityLink>> {
        let row = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM entity_links WHERE entity_id = $1 AND connection_id = $2"
        ))
        .bind(entity_id)
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn find_by_external_id(
        &self,
        connection_id: ConnectionId,
        external_id: &str,
    ) -> RepositoryResult<Option<EntityLink>> {
        let row = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM entity_links WHERE connection_id = $1 AND external_id = $2 \
             ORDER BY entity_id LIMIT 1"
        ))
        .bind(connection_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn save(&self, link: &EntityLink) -> RepositoryResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO entity_links ({LINK_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (entity_id, connection_id) DO UPDATE SET
                external_id = EXCLUDED.external_id,
                status = EXCLUDED.status,
                external_snapshot = EXCLUDED.external_snapshot,
                pending_fields = EXCLUDED.pending_fields,
                last_sync_at = EXCLUDED.last_sync_at,
                last_push_at = EXCLUDED.last_push_at,
                last_pull_at = EXCLUDED.last_pull_at,
                last_error = EXCLUDED.last_error,
                retry_count = EXCLUDED.retry_count,
                updated_at = EXCLUDED.updated_at
            "#
        ))
        .bind(link.entity_id)
        .bind(link.connection_id)
        .bind(&link.external_id)
        .bind(link.status.as_str())
        .bind(Json(&link.external_snapshot))
        .bind(Json(&link.pending_fields))
        .bind(link.last_sync_at)
        .bind(link.last_push_at)
        .bind(link.last_pull_at)
        .bind(&link.last_error)
        .bind(to_i32(link.retry_count))
        .bind(link.created_at)
        .bind(link.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_linked(
        &self,
        connection_id: ConnectionId,
        after: Option<EntityId>,
        limit: usize,
    ) -> RepositoryResult<Vec<EntityLink>> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM entity_links \
             WHERE connection_id = $1 AND external_id IS NOT NULL \
               AND ($2::BIGINT IS NULL OR entity_id > $2) \
             ORDER BY entity_id LIMIT $3"
        ))
        .bind(connection_id)
        .bind(after)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(link_from_row).collect()
    }

    async fn count_linked(&self, connection_id: ConnectionId) -> RepositoryResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entity_links WHERE connection_id = $1 AND external_id IS NOT NULL",
        )
        .bind(connection_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(count))
    }

    async fn list_push_candidates(
        &self,
        connection_id: ConnectionId,
        after: Option<EntityId>,
        limit: usize,
    ) -> RepositoryResult<Vec<EntityLink>> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM entity_links \
             WHERE connection_id = $1 \
               AND (external_id IS NOT NULL OR status IN ('pending', 'error')) \
               AND ($2::BIGINT IS NULL OR entity_id > $2) \
             ORDER BY entity_id LIMIT $3"
        ))
        .bind(connection_id)
        .bind(after)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(link_from_row).collect()
    }

    async fn count_push_candidates(&self, connection_id: ConnectionId) -> RepositoryResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entity_links WHERE connection_id = $1 \
             AND (external_id IS NOT NULL OR status IN ('pending', 'error'))",
        )
        .bind(connection_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(count))
    }
}

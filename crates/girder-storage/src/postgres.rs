//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence using PostgreSQL:
//! - Status transitions validated under `SELECT ... FOR UPDATE`, with the
//!   prior status repeated in the UPDATE's WHERE clause
//! - Status write and lifecycle event in one transaction
//! - Advisory locks via `ON CONFLICT DO NOTHING` with lazy expiry reaping

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use girder_core::run::truncate_error;
use girder_core::{
    DeadLetter, Run, RunEvent, RunEventType, RunId, RunStatus, WorkSpec,
};

use crate::dialect::SqlDialect;
use crate::sql;
use crate::store::*;

/// PostgreSQL execution store
///
/// # Example
///
/// ```ignore
/// use girder_storage::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/girder").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    dialect: SqlDialect,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            dialect: SqlDialect::Postgres,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply a validated transition inside an open transaction: lock the
    /// row, validate, update with the prior status as a guard, and append
    /// the implied event.
    async fn apply_transition(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        run_id: RunId,
        new_status: RunStatus,
        ctx: TransitionCtx,
    ) -> Result<Run, StoreError> {
        let row = sqlx::query(&sql::select_run_for_update(self.dialect))
            .bind(run_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(store_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;
        let mut run = run_from_row(&row)?;

        let from = run.status;
        RunStatus::validate_transition(from, new_status)?;

        let now = Utc::now();
        run.status = new_status;
        match new_status {
            RunStatus::Running => {
                if run.started_at.is_none() {
                    run.started_at = Some(now);
                }
            }
            RunStatus::Pending => {
                run.started_at = None;
                run.completed_at = None;
                if from == RunStatus::Failed {
                    run.retry_count += 1;
                }
            }
            status if status.is_terminal() => {
                run.completed_at = Some(now);
            }
            _ => {}
        }
        if let Some(err) = &ctx.error {
            run.error = Some(truncate_error(err));
        }
        if let Some(output) = &ctx.output {
            run.output = Some(output.clone());
        }
        if let Some(external_ref) = &ctx.external_ref {
            run.external_ref = Some(external_ref.clone());
        }

        let result = sqlx::query(&sql::update_run_status(self.dialect))
            .bind(new_status.to_string())
            .bind(&run.error)
            .bind(&run.output)
            .bind(&run.external_ref)
            .bind(run.started_at)
            .bind(run.completed_at)
            .bind(run.retry_count as i32)
            .bind(run_id.to_string())
            .bind(from.to_string())
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            // Row locked above, so this means the status changed under us.
            return Err(StoreError::Database(format!(
                "concurrent transition on run {run_id}"
            )));
        }

        let event_type = RunEventType::for_transition(from, new_status);
        sqlx::query(&sql::insert_event(self.dialect))
            .bind(Uuid::now_v7())
            .bind(run_id.to_string())
            .bind(event_type.to_string())
            .bind(&ctx.event_data)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;

        Ok(run)
    }
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    #[instrument(skip(self, spec))]
    async fn create_run(
        &self,
        run_id: RunId,
        spec: &WorkSpec,
        parent_run_id: Option<RunId>,
    ) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        if let Some(key) = &spec.idempotency_key {
            let existing = sqlx::query(&sql::select_reusable_by_key(self.dialect))
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_err)?;
            if let Some(row) = existing {
                let run = run_from_row(&row)?;
                tx.commit().await.map_err(store_err)?;
                debug!(%run_id, existing = %run.run_id, "idempotency key collision, returning existing run");
                return Ok(run);
            }
        }

        let spec_json =
            serde_json::to_value(spec).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(&sql::insert_run(self.dialect))
            .bind(run_id.to_string())
            .bind(spec.kind.to_string())
            .bind(&spec.name)
            .bind(&spec_json)
            .bind(RunStatus::Pending.to_string())
            .bind(&spec.idempotency_key)
            .bind(parent_run_id.map(|p| p.to_string()))
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        sqlx::query(&sql::insert_event(self.dialect))
            .bind(Uuid::now_v7())
            .bind(run_id.to_string())
            .bind(RunEventType::Submitted.to_string())
            .bind(None::<Value>)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        self.get_run(run_id).await
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        let row = sqlx::query(&sql::select_run(self.dialect))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;
        run_from_row(&row)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let shape = sql::RunFilterShape {
            status: filter.status.is_some(),
            kind: filter.kind.is_some(),
            name: filter.name.is_some(),
            parent: filter.parent_run_id.is_some(),
            heartbeat_before: filter.heartbeat_before.is_some(),
        };
        let sql_text = sql::list_runs(self.dialect, shape);
        let mut query = sqlx::query(&sql_text);
        if let Some(status) = filter.status {
            query = query.bind(status.to_string());
        }
        if let Some(kind) = filter.kind {
            query = query.bind(kind.to_string());
        }
        if let Some(name) = &filter.name {
            query = query.bind(name.clone());
        }
        if let Some(parent) = filter.parent_run_id {
            query = query.bind(parent.to_string());
        }
        if let Some(before) = filter.heartbeat_before {
            query = query.bind(before);
        }
        let rows = query
            .bind(filter.limit as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(&sql::select_completed_by_key(self.dialect))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(run_from_row).transpose()
    }

    #[instrument(skip(self, ctx))]
    async fn update_status(
        &self,
        run_id: RunId,
        new_status: RunStatus,
        ctx: TransitionCtx,
    ) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let run = self.apply_transition(&mut tx, run_id, new_status, ctx).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(run)
    }

    async fn record_event(
        &self,
        run_id: RunId,
        event_type: RunEventType,
        data: Option<Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(&sql::insert_event(self.dialect))
            .bind(Uuid::now_v7())
            .bind(run_id.to_string())
            .bind(event_type.to_string())
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn load_events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        let rows = sqlx::query(&sql::select_events(self.dialect))
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn set_external_ref(
        &self,
        run_id: RunId,
        external_ref: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(&sql::set_external_ref(self.dialect))
            .bind(external_ref)
            .bind(run_id.to_string())
            .bind(external_ref)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Constraint(format!(
                "external_ref already set for {run_id}"
            )));
        }
        Ok(())
    }

    async fn heartbeat(&self, run_id: RunId) -> Result<(), StoreError> {
        let result = sqlx::query(&sql::heartbeat_run(self.dialect))
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn add_to_dlq(
        &self,
        run_id: RunId,
        error: &str,
        retry_attempts: u32,
    ) -> Result<DeadLetter, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let run = self
            .apply_transition(
                &mut tx,
                run_id,
                RunStatus::DeadLettered,
                TransitionCtx::with_error(error)
                    .with_event_data(serde_json::json!({ "retry_attempts": retry_attempts })),
            )
            .await?;

        let dlq_id = Uuid::now_v7();
        let spec_json = serde_json::to_value(&run.spec)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(&sql::insert_dlq(self.dialect))
            .bind(dlq_id)
            .bind(run_id.to_string())
            .bind(&spec_json)
            .bind(truncate_error(error))
            .bind(retry_attempts as i32)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        self.get_dlq_entry(dlq_id).await
    }

    #[instrument(skip(self))]
    async fn retry_from_dlq(&self, dlq_id: Uuid, resolved_by: &str) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let row = sqlx::query(&sql::select_dlq_for_update(self.dialect))
            .bind(dlq_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?
            .ok_or(StoreError::DlqEntryNotFound(dlq_id))?;
        let entry = dlq_from_row(&row)?;
        if entry.resolved_at.is_some() {
            return Err(StoreError::AlreadyResolved(dlq_id));
        }

        let run = self
            .apply_transition(
                &mut tx,
                entry.run_id,
                RunStatus::Pending,
                TransitionCtx::default(),
            )
            .await?;

        sqlx::query(&sql::resolve_dlq(self.dialect))
            .bind(resolved_by)
            .bind(dlq_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(run)
    }

    async fn get_dlq_entry(&self, dlq_id: Uuid) -> Result<DeadLetter, StoreError> {
        let row = sqlx::query(&sql::select_dlq(self.dialect))
            .bind(dlq_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or(StoreError::DlqEntryNotFound(dlq_id))?;
        dlq_from_row(&row)
    }

    async fn list_dlq(&self, filter: &DlqFilter) -> Result<Vec<DeadLetter>, StoreError> {
        let sql_text = sql::list_dlq(
            self.dialect,
            filter.run_id.is_some(),
            filter.unresolved_only,
        );
        let mut query = sqlx::query(&sql_text);
        if let Some(run_id) = filter.run_id {
            query = query.bind(run_id.to_string());
        }
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let rows = query
            .bind(limit as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(dlq_from_row).collect()
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: RunId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Database(e.to_string()))?;

        let inserted = sqlx::query(&sql::insert_lock(self.dialect))
            .bind(key)
            .bind(owner.to_string())
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if inserted.rows_affected() == 1 {
            return Ok(true);
        }

        // Held; reap if stale and retry once.
        let reaped = sqlx::query(&sql::delete_expired_lock(self.dialect))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if reaped.rows_affected() == 0 {
            return Ok(false);
        }
        let retried = sqlx::query(&sql::insert_lock(self.dialect))
            .bind(key)
            .bind(owner.to_string())
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(retried.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &str, owner: RunId) -> Result<bool, StoreError> {
        let result = sqlx::query(&sql::release_lock(self.dialect))
            .bind(key)
            .bind(owner.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_lock_held(&self, key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(&sql::select_lock_held(self.dialect))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.is_some())
    }

    async fn cleanup_expired_locks(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(&sql::cleanup_expired_locks(self.dialect))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn list_active_locks(&self) -> Result<Vec<LockRow>, StoreError> {
        let rows = sqlx::query(&sql::list_active_locks(self.dialect))
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn upsert_manifest_stage(&self, stage: &ManifestStage) -> Result<(), StoreError> {
        sqlx::query(&sql::upsert_manifest(self.dialect))
            .bind(&stage.domain)
            .bind(&stage.workflow)
            .bind(&stage.partition)
            .bind(&stage.stage)
            .bind(stage.row_count)
            .bind(&stage.metrics)
            .bind(stage.execution_id.map(|id| id.to_string()))
            .bind(stage.batch_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn load_manifest(
        &self,
        domain: &str,
        workflow: &str,
        partition: &str,
    ) -> Result<Vec<ManifestStage>, StoreError> {
        let rows = sqlx::query(&sql::select_manifest(self.dialect))
            .bind(domain)
            .bind(workflow)
            .bind(partition)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(manifest_from_row).collect()
    }

    async fn record_anomaly(&self, anomaly: &AnomalyRecord) -> Result<(), StoreError> {
        sqlx::query(&sql::insert_anomaly(self.dialect))
            .bind(anomaly.anomaly_id)
            .bind(anomaly.run_id.to_string())
            .bind(&anomaly.step)
            .bind(anomaly.severity.to_string())
            .bind(anomaly.category.to_string())
            .bind(&anomaly.message)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

/// Classify sqlx errors into the store taxonomy
fn store_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection(e.to_string()),
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation
            | sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => StoreError::Constraint(e.to_string()),
            _ => StoreError::Database(e.to_string()),
        },
        _ => {
            error!("database error: {e}");
            StoreError::Database(e.to_string())
        }
    }
}

fn parse_run_id(s: &str) -> Result<RunId, StoreError> {
    RunId::from_str(s).map_err(|e| StoreError::Serialization(format!("bad run id {s}: {e}")))
}

fn parse_status(s: &str) -> Result<RunStatus, StoreError> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        "dead_lettered" => Ok(RunStatus::DeadLettered),
        other => Err(StoreError::Serialization(format!("bad status: {other}"))),
    }
}

fn parse_event_type(s: &str) -> Result<RunEventType, StoreError> {
    match s {
        "SUBMITTED" => Ok(RunEventType::Submitted),
        "QUEUED" => Ok(RunEventType::Queued),
        "STARTED" => Ok(RunEventType::Started),
        "PROGRESS" => Ok(RunEventType::Progress),
        "COMPLETED" => Ok(RunEventType::Completed),
        "FAILED" => Ok(RunEventType::Failed),
        "CANCELLED" => Ok(RunEventType::Cancelled),
        "RETRYING" => Ok(RunEventType::Retrying),
        "DEAD_LETTERED" => Ok(RunEventType::DeadLettered),
        "RECONCILED" => Ok(RunEventType::Reconciled),
        "ORPHAN_DETECTED" => Ok(RunEventType::OrphanDetected),
        other => Err(StoreError::Serialization(format!("bad event type: {other}"))),
    }
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let run_id: String = row.get("run_id");
    let spec_json: Value = row.get("spec");
    let spec: WorkSpec = serde_json::from_value(spec_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let status: String = row.get("status");
    let parent: Option<String> = row.get("parent_run_id");
    let retry_count: i32 = row.get("retry_count");

    Ok(Run {
        run_id: parse_run_id(&run_id)?,
        idempotency_key: row.get("idempotency_key"),
        spec,
        status: parse_status(&status)?,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        retry_count: retry_count.max(0) as u32,
        error: row.get("error"),
        parent_run_id: parent.as_deref().map(parse_run_id).transpose()?,
        external_ref: row.get("external_ref"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        output: row.get("output"),
    })
}

fn event_from_row(row: &PgRow) -> Result<RunEvent, StoreError> {
    let run_id: String = row.get("run_id");
    let event_type: String = row.get("event_type");
    Ok(RunEvent {
        event_id: row.get("event_id"),
        run_id: parse_run_id(&run_id)?,
        event_type: parse_event_type(&event_type)?,
        timestamp: row.get("timestamp"),
        data: row.get("data"),
    })
}

fn dlq_from_row(row: &PgRow) -> Result<DeadLetter, StoreError> {
    let run_id: String = row.get("run_id");
    let retry_attempts: i32 = row.get("retry_attempts");
    Ok(DeadLetter {
        dlq_id: row.get("dlq_id"),
        run_id: parse_run_id(&run_id)?,
        spec: row.get("spec"),
        error: row.get("error"),
        failed_at: row.get("failed_at"),
        resolved_at: row.get("resolved_at"),
        resolved_by: row.get("resolved_by"),
        retry_attempts: retry_attempts.max(0) as u32,
    })
}

fn lock_from_row(row: &PgRow) -> Result<LockRow, StoreError> {
    let owner: String = row.get("owner_run_id");
    Ok(LockRow {
        lock_key: row.get("lock_key"),
        owner_run_id: parse_run_id(&owner)?,
        acquired_at: row.get("acquired_at"),
        expires_at: row.get("expires_at"),
    })
}

fn manifest_from_row(row: &PgRow) -> Result<ManifestStage, StoreError> {
    let execution: Option<String> = row.get("execution_id");
    Ok(ManifestStage {
        domain: row.get("domain"),
        workflow: row.get("workflow"),
        partition: row.get("partition_key"),
        stage: row.get("stage"),
        row_count: row.get("row_count"),
        metrics: row.get("metrics"),
        updated_at: row.get("updated_at"),
        execution_id: execution.as_deref().map(parse_run_id).transpose()?,
        batch_id: row.get("batch_id"),
    })
}

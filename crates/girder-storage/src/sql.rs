//! SQL statement builders
//!
//! All ledger SQL is assembled here through the dialect, so the store
//! implementations contain no backend-specific syntax. Placeholder
//! positions are documented next to each statement; bind order must match.

use crate::dialect::SqlDialect;

/// Binds: run_id, kind, name, spec, status, idempotency_key, parent_run_id
pub fn insert_run(d: SqlDialect) -> String {
    format!(
        "INSERT INTO girder_runs \
         (run_id, kind, name, spec, status, idempotency_key, parent_run_id, retry_count, created_at) \
         VALUES ({}, 0, {})",
        d.placeholders(1, 7),
        d.current_timestamp()
    )
}

const RUN_COLUMNS: &str = "run_id, kind, name, spec, status, error, idempotency_key, \
                           parent_run_id, external_ref, output, retry_count, created_at, \
                           started_at, completed_at, last_heartbeat_at";

/// Binds: run_id
pub fn select_run(d: SqlDialect) -> String {
    format!(
        "SELECT {RUN_COLUMNS} FROM girder_runs WHERE run_id = {}",
        d.placeholder(1)
    )
}

/// Binds: run_id
pub fn select_run_for_update(d: SqlDialect) -> String {
    format!(
        "SELECT {RUN_COLUMNS} FROM girder_runs WHERE run_id = {} {}",
        d.placeholder(1),
        d.for_update()
    )
}

/// Binds: idempotency_key
///
/// Cancelled and dead-lettered runs do not block a fresh submission;
/// anything else under the key is folded onto.
pub fn select_reusable_by_key(d: SqlDialect) -> String {
    format!(
        "SELECT {RUN_COLUMNS} FROM girder_runs \
         WHERE idempotency_key = {} \
         AND status NOT IN ('cancelled', 'dead_lettered') \
         ORDER BY run_id LIMIT 1",
        d.placeholder(1)
    )
}

/// Binds: idempotency_key
pub fn select_completed_by_key(d: SqlDialect) -> String {
    format!(
        "SELECT {RUN_COLUMNS} FROM girder_runs \
         WHERE idempotency_key = {} AND status = 'completed' \
         ORDER BY run_id LIMIT 1",
        d.placeholder(1)
    )
}

/// Binds: status, error, output, external_ref, started_at, completed_at,
/// retry_count, run_id, expected_status
///
/// The expected-status guard in the WHERE clause serializes concurrent
/// transitions on the same run.
pub fn update_run_status(d: SqlDialect) -> String {
    format!(
        "UPDATE girder_runs SET \
         status = {}, \
         error = COALESCE({}, error), \
         output = COALESCE({}, output), \
         external_ref = COALESCE({}, external_ref), \
         started_at = {}, \
         completed_at = {}, \
         retry_count = {} \
         WHERE run_id = {} AND status = {}",
        d.placeholder(1),
        d.placeholder(2),
        d.placeholder(3),
        d.placeholder(4),
        d.placeholder(5),
        d.placeholder(6),
        d.placeholder(7),
        d.placeholder(8),
        d.placeholder(9)
    )
}

/// Binds: external_ref, run_id, external_ref (idempotence check)
pub fn set_external_ref(d: SqlDialect) -> String {
    format!(
        "UPDATE girder_runs SET external_ref = {} \
         WHERE run_id = {} AND (external_ref IS NULL OR external_ref = {})",
        d.placeholder(1),
        d.placeholder(2),
        d.placeholder(3)
    )
}

/// Binds: run_id
pub fn heartbeat_run(d: SqlDialect) -> String {
    format!(
        "UPDATE girder_runs SET last_heartbeat_at = {} WHERE run_id = {}",
        d.current_timestamp(),
        d.placeholder(1)
    )
}

/// Binds: event_id, run_id, event_type, data
pub fn insert_event(d: SqlDialect) -> String {
    format!(
        "INSERT INTO girder_run_events (event_id, run_id, event_type, timestamp, data) \
         VALUES ({}, {}, {}, {}, {})",
        d.placeholder(1),
        d.placeholder(2),
        d.placeholder(3),
        d.current_timestamp(),
        d.placeholder(4)
    )
}

/// Binds: run_id
pub fn select_events(d: SqlDialect) -> String {
    format!(
        "SELECT event_id, run_id, event_type, timestamp, data \
         FROM girder_run_events WHERE run_id = {} ORDER BY seq",
        d.placeholder(1)
    )
}

/// Which optional filters are present; drives placeholder numbering
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFilterShape {
    pub status: bool,
    pub kind: bool,
    pub name: bool,
    pub parent: bool,
    pub heartbeat_before: bool,
}

/// Binds, in order: each present filter, then limit, then offset
pub fn list_runs(d: SqlDialect, shape: RunFilterShape) -> String {
    let mut clauses = Vec::new();
    let mut n = 1;
    let push = |column: &str, op: &str, clauses: &mut Vec<String>, n: &mut usize| {
        clauses.push(format!("{column} {op} {}", d.placeholder(*n)));
        *n += 1;
    };
    if shape.status {
        push("status", "=", &mut clauses, &mut n);
    }
    if shape.kind {
        push("kind", "=", &mut clauses, &mut n);
    }
    if shape.name {
        push("name", "=", &mut clauses, &mut n);
    }
    if shape.parent {
        push("parent_run_id", "=", &mut clauses, &mut n);
    }
    if shape.heartbeat_before {
        clauses.push(format!(
            "(last_heartbeat_at IS NULL OR last_heartbeat_at < {})",
            d.placeholder(n)
        ));
        n += 1;
    }
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {} ", clauses.join(" AND "))
    };
    format!(
        "SELECT {RUN_COLUMNS} FROM girder_runs {}ORDER BY run_id {}",
        where_clause,
        d.limit_offset(n, n + 1)
    )
}

const DLQ_COLUMNS: &str =
    "dlq_id, run_id, spec, error, failed_at, resolved_at, resolved_by, retry_attempts";

/// Binds: dlq_id, run_id, spec, error, retry_attempts
pub fn insert_dlq(d: SqlDialect) -> String {
    format!(
        "INSERT INTO girder_dlq (dlq_id, run_id, spec, error, failed_at, retry_attempts) \
         VALUES ({}, {}, {}, {}, {}, {})",
        d.placeholder(1),
        d.placeholder(2),
        d.placeholder(3),
        d.placeholder(4),
        d.current_timestamp(),
        d.placeholder(5)
    )
}

/// Binds: dlq_id
pub fn select_dlq_for_update(d: SqlDialect) -> String {
    format!(
        "SELECT {DLQ_COLUMNS} FROM girder_dlq WHERE dlq_id = {} {}",
        d.placeholder(1),
        d.for_update()
    )
}

/// Binds: dlq_id
pub fn select_dlq(d: SqlDialect) -> String {
    format!(
        "SELECT {DLQ_COLUMNS} FROM girder_dlq WHERE dlq_id = {}",
        d.placeholder(1)
    )
}

/// Binds: resolved_by, dlq_id
pub fn resolve_dlq(d: SqlDialect) -> String {
    format!(
        "UPDATE girder_dlq SET resolved_at = {}, resolved_by = {} WHERE dlq_id = {}",
        d.current_timestamp(),
        d.placeholder(1),
        d.placeholder(2)
    )
}

/// Binds, in order: run_id (if filtered), then limit, then offset
pub fn list_dlq(d: SqlDialect, by_run: bool, unresolved_only: bool) -> String {
    let mut clauses = Vec::new();
    let mut n = 1;
    if by_run {
        clauses.push(format!("run_id = {}", d.placeholder(n)));
        n += 1;
    }
    if unresolved_only {
        clauses.push("resolved_at IS NULL".to_string());
    }
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {} ", clauses.join(" AND "))
    };
    format!(
        "SELECT {DLQ_COLUMNS} FROM girder_dlq {}ORDER BY failed_at {}",
        where_clause,
        d.limit_offset(n, n + 1)
    )
}

/// Binds: lock_key, owner_run_id, expires_at
pub fn insert_lock(d: SqlDialect) -> String {
    format!(
        "INSERT INTO girder_locks (lock_key, owner_run_id, acquired_at, expires_at) \
         VALUES ({}, {}, {}, {}) {}",
        d.placeholder(1),
        d.placeholder(2),
        d.current_timestamp(),
        d.placeholder(3),
        d.on_conflict_do_nothing(&["lock_key"])
    )
}

/// Binds: lock_key
pub fn delete_expired_lock(d: SqlDialect) -> String {
    format!(
        "DELETE FROM girder_locks WHERE lock_key = {} AND expires_at <= {}",
        d.placeholder(1),
        d.current_timestamp()
    )
}

/// Binds: lock_key, owner_run_id
pub fn release_lock(d: SqlDialect) -> String {
    format!(
        "DELETE FROM girder_locks WHERE lock_key = {} AND owner_run_id = {}",
        d.placeholder(1),
        d.placeholder(2)
    )
}

/// Binds: lock_key
pub fn select_lock_held(d: SqlDialect) -> String {
    format!(
        "SELECT 1 FROM girder_locks WHERE lock_key = {} AND expires_at > {}",
        d.placeholder(1),
        d.current_timestamp()
    )
}

pub fn cleanup_expired_locks(d: SqlDialect) -> String {
    format!(
        "DELETE FROM girder_locks WHERE expires_at <= {}",
        d.current_timestamp()
    )
}

pub fn list_active_locks(d: SqlDialect) -> String {
    format!(
        "SELECT lock_key, owner_run_id, acquired_at, expires_at \
         FROM girder_locks WHERE expires_at > {} ORDER BY acquired_at",
        d.current_timestamp()
    )
}

/// Binds: domain, workflow, partition_key, stage, row_count, metrics,
/// execution_id, batch_id
pub fn upsert_manifest(d: SqlDialect) -> String {
    format!(
        "INSERT INTO girder_manifest \
         (domain, workflow, partition_key, stage, row_count, metrics, updated_at, execution_id, batch_id) \
         VALUES ({}, {}, {}) {}",
        d.placeholders(1, 6),
        d.current_timestamp(),
        d.placeholders(7, 2),
        d.upsert_clause(
            &["domain", "workflow", "partition_key", "stage"],
            &["row_count", "metrics", "updated_at", "execution_id", "batch_id"],
        )
    )
}

/// Binds: domain, workflow, partition_key
pub fn select_manifest(d: SqlDialect) -> String {
    format!(
        "SELECT domain, workflow, partition_key, stage, row_count, metrics, updated_at, \
         execution_id, batch_id \
         FROM girder_manifest \
         WHERE domain = {} AND workflow = {} AND partition_key = {} \
         ORDER BY updated_at",
        d.placeholder(1),
        d.placeholder(2),
        d.placeholder(3)
    )
}

/// Binds: anomaly_id, run_id, step, severity, category, message
pub fn insert_anomaly(d: SqlDialect) -> String {
    format!(
        "INSERT INTO girder_anomalies \
         (anomaly_id, run_id, step, severity, category, message, recorded_at) \
         VALUES ({}, {})",
        d.placeholders(1, 6),
        d.current_timestamp()
    )
}

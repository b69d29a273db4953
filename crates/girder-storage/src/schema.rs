//! Ledger schema DDL
//!
//! Backend-agnostic CREATE TABLE text assembled through the dialect. An
//! external migration tool owns applying it; the stores assume the tables
//! exist at startup. Tests use it to stand up throwaway databases.

use crate::dialect::SqlDialect;

/// DDL for every ledger table, in dependency order
pub fn ddl(d: SqlDialect) -> Vec<String> {
    let json = d.json_type();
    let ts = d.timestamp_type();
    let serial = d.bigserial_type();

    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS girder_runs (
    run_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    spec {json} NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    idempotency_key TEXT,
    parent_run_id TEXT,
    external_ref TEXT,
    output {json},
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at {ts} NOT NULL,
    started_at {ts},
    completed_at {ts},
    last_heartbeat_at {ts}
)"#
        ),
        "CREATE INDEX IF NOT EXISTS idx_girder_runs_status ON girder_runs (status)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_girder_runs_idempotency \
         ON girder_runs (idempotency_key)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_girder_runs_parent ON girder_runs (parent_run_id)"
            .to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS girder_run_events (
    seq {serial} PRIMARY KEY,
    event_id UUID NOT NULL UNIQUE,
    run_id TEXT NOT NULL REFERENCES girder_runs (run_id),
    event_type TEXT NOT NULL,
    timestamp {ts} NOT NULL,
    data {json}
)"#
        ),
        "CREATE INDEX IF NOT EXISTS idx_girder_events_run ON girder_run_events (run_id, seq)"
            .to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS girder_dlq (
    dlq_id UUID PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES girder_runs (run_id),
    spec {json} NOT NULL,
    error TEXT NOT NULL,
    failed_at {ts} NOT NULL,
    resolved_at {ts},
    resolved_by TEXT,
    retry_attempts INTEGER NOT NULL DEFAULT 0
)"#
        ),
        "CREATE INDEX IF NOT EXISTS idx_girder_dlq_run ON girder_dlq (run_id)".to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS girder_locks (
    lock_key TEXT PRIMARY KEY,
    owner_run_id TEXT NOT NULL,
    acquired_at {ts} NOT NULL,
    expires_at {ts} NOT NULL
)"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS girder_manifest (
    domain TEXT NOT NULL,
    workflow TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    stage TEXT NOT NULL,
    row_count BIGINT,
    metrics {json},
    updated_at {ts} NOT NULL,
    execution_id TEXT,
    batch_id UUID,
    PRIMARY KEY (domain, workflow, partition_key, stage)
)"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS girder_anomalies (
    anomaly_id UUID PRIMARY KEY,
    run_id TEXT NOT NULL,
    step TEXT NOT NULL,
    severity TEXT NOT NULL,
    category TEXT NOT NULL,
    message TEXT NOT NULL,
    recorded_at {ts} NOT NULL
)"#
        ),
    ]
}

//! # Girder execution ledger storage
//!
//! Durable storage for the execution engine:
//!
//! - [`ExecutionStore`]: the single contract for runs, events, dead
//!   letters, advisory locks, the stage manifest, and anomalies. Every
//!   status update validates the state machine and writes the implied
//!   lifecycle event in the same transaction.
//! - [`dialect`]: SQL fragments that vary by backend; no backend-specific
//!   syntax appears outside it.
//! - [`MemoryStore`]: in-process implementation for tests and dry runs.
//! - [`PostgresStore`]: production implementation over sqlx.
//! - [`schema`]: backend-agnostic DDL, applied by external migration
//!   tooling.

pub mod dialect;
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod sql;
pub mod store;

pub use dialect::{BackendError, BackendKind, SqlDialect};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    AnomalyRecord, AnomalySeverity, DlqFilter, ExecutionStore, LockRow, ManifestStage, RunFilter,
    StoreError, TransitionCtx,
};

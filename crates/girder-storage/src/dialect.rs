//! SQL dialect layer
//!
//! Every backend-varying fragment of SQL is produced here: placeholder
//! form, current-timestamp expression, upsert clause, limit/offset, and
//! literal representations. Store implementations assemble their
//! statements through a dialect value, so no backend-specific syntax
//! appears outside this module.

use serde::{Deserialize, Serialize};

/// Errors from backend detection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("unrecognized backend url scheme: {0}")]
    UnrecognizedScheme(String),
}

/// Persistence backend, selected by URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process store, no durability; for tests and dry runs
    Memory,

    /// Client-server relational backend
    Postgres,

    /// Embedded file backend
    Sqlite,
}

impl BackendKind {
    /// Detect the backend from a connection URL.
    ///
    /// Recognized schemes: `memory`, `postgres`/`postgresql`, `sqlite`.
    pub fn from_url(url: &str) -> Result<Self, BackendError> {
        let scheme = url.split("://").next().unwrap_or("");
        match scheme {
            "memory" | "mem" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(BackendError::UnrecognizedScheme(other.to_string())),
        }
    }

    /// The SQL dialect for this backend; `None` for the in-memory store
    pub fn dialect(&self) -> Option<SqlDialect> {
        match self {
            Self::Memory => None,
            Self::Postgres => Some(SqlDialect::Postgres),
            Self::Sqlite => Some(SqlDialect::Sqlite),
        }
    }
}

/// Producer of backend-varying SQL fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    /// Positional parameter placeholder, 1-based
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::Sqlite => "?".to_string(),
        }
    }

    /// Comma-separated placeholder list for positions `start..start + count`
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Expression for the current UTC timestamp
    pub fn current_timestamp(&self) -> &'static str {
        match self {
            Self::Postgres => "now()",
            Self::Sqlite => "CURRENT_TIMESTAMP",
        }
    }

    /// Upsert conflict clause updating `update_cols` from the excluded row
    pub fn upsert_clause(&self, conflict_cols: &[&str], update_cols: &[&str]) -> String {
        let updates = update_cols
            .iter()
            .map(|c| match self {
                Self::Postgres => format!("{c} = EXCLUDED.{c}"),
                Self::Sqlite => format!("{c} = excluded.{c}"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "ON CONFLICT ({}) DO UPDATE SET {}",
            conflict_cols.join(", "),
            updates
        )
    }

    /// LIMIT/OFFSET fragment with placeholders at the given positions
    pub fn limit_offset(&self, limit_pos: usize, offset_pos: usize) -> String {
        format!(
            "LIMIT {} OFFSET {}",
            self.placeholder(limit_pos),
            self.placeholder(offset_pos)
        )
    }

    /// Conflict clause that silently skips duplicate inserts
    pub fn on_conflict_do_nothing(&self, conflict_cols: &[&str]) -> String {
        format!("ON CONFLICT ({}) DO NOTHING", conflict_cols.join(", "))
    }

    /// Row-locking clause for read-modify-write transactions
    pub fn for_update(&self) -> &'static str {
        match self {
            Self::Postgres => "FOR UPDATE",
            // SQLite serializes writers at the connection level.
            Self::Sqlite => "",
        }
    }

    /// Boolean literal
    pub fn boolean(&self, value: bool) -> &'static str {
        match (self, value) {
            (Self::Postgres, true) => "TRUE",
            (Self::Postgres, false) => "FALSE",
            (Self::Sqlite, true) => "1",
            (Self::Sqlite, false) => "0",
        }
    }

    /// Column type for JSON payloads
    pub fn json_type(&self) -> &'static str {
        match self {
            Self::Postgres => "JSONB",
            Self::Sqlite => "TEXT",
        }
    }

    /// Column type for UTC timestamps
    pub fn timestamp_type(&self) -> &'static str {
        match self {
            Self::Postgres => "TIMESTAMPTZ",
            Self::Sqlite => "TEXT",
        }
    }

    /// Column type for auto-incrementing integer primary keys
    pub fn bigserial_type(&self) -> &'static str {
        match self {
            Self::Postgres => "BIGSERIAL",
            Self::Sqlite => "INTEGER",
        }
    }
}

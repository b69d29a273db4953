//! Run identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of a single run.
///
/// Run ids are ULIDs: 26-character Crockford base32 tokens that sort
/// lexicographically by creation time, which keeps ledger indexes
/// append-friendly and makes `ORDER BY run_id` a chronological scan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    /// Generate a fresh id from the current time and system randomness
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Wrap an existing ULID
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// The underlying ULID
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

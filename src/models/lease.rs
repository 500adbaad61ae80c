//! Lease-related data models.
//!
//! Keys, isolation levels and the read-only views handed out by the lease
//! registry and the transaction coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one leased connection.
///
/// Built from the database target name and the connection's own identity
/// (e.g. `orders:4711`), so keys stay unique when several targets share a
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseKey(String);

impl LeaseKey {
    /// Build a key from a target name and a connection identity.
    pub fn new(target: &str, identity: impl fmt::Display) -> Self {
        Self(format!("{}:{}", target, identity))
    }

    /// Wrap an already formatted key (e.g. one read back from a session).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SQL transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// The SQL spelling, as used in `SET TRANSACTION ISOLATION LEVEL ...`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();

        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(format!("Unknown isolation level: {}", s)),
        }
    }
}

impl TryFrom<String> for IsolationLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IsolationLevel> for String {
    fn from(level: IsolationLevel) -> Self {
        level.as_sql().to_string()
    }
}

/// Metadata about an active lease (for listing without touching the connection).
#[derive(Debug, Clone, Serialize)]
pub struct LeaseMetadata {
    pub lease_key: LeaseKey,
    /// When the lease was created (absolute time)
    pub started_at: DateTime<Utc>,
    /// Seconds since the lease was created
    pub age_secs: u64,
    /// Configured time-to-live for this lease
    pub ttl_secs: u64,
    /// Locked by an in-flight request; transaction fields are then unknown
    pub busy: bool,
    /// Isolation level of the open transaction, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<IsolationLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_no: Option<String>,
}

/// Result of `TransactionCoordinator::retrieve`.
///
/// Either the lease key plus its reference number, or an error message when
/// the session has no valid lease.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveOutput {
    pub connection: Option<LeaseKey>,
    pub reference_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

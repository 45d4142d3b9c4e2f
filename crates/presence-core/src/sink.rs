//! Outward boundary: attendance persistence and roster lookup.

use std::collections::HashMap;
use thiserror::Error;

use crate::session::VerificationDecision;
use crate::types::IdentityId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("attendance already recorded for {identity} on {date}")]
    AlreadyRecorded {
        identity: IdentityId,
        date: chrono::NaiveDate,
    },
    #[error("attendance store unavailable: {0}")]
    Unavailable(String),
}

/// Receipt for a committed attendance record.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub record_id: String,
}

/// Durable attendance record store.
///
/// The core calls `commit` at most once per track and never retries; retry
/// and durability policy belong to the implementation.
pub trait AttendanceSink: Send + Sync {
    fn commit(&self, decision: &VerificationDecision) -> Result<Ack, SinkError>;
}

/// Resolves identity ids to display names.
pub trait Roster: Send + Sync {
    fn display_name(&self, identity: &IdentityId) -> Option<String>;

    /// Display name, falling back to the raw identity id.
    fn label(&self, identity: &IdentityId) -> String {
        self.display_name(identity)
            .unwrap_or_else(|| identity.as_str().to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    names: HashMap<IdentityId, String>,
}

impl StaticRoster {
    pub fn new(names: HashMap<IdentityId, String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<(IdentityId, String)> for StaticRoster {
    fn from_iter<I: IntoIterator<Item = (IdentityId, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Roster for StaticRoster {
    fn display_name(&self, identity: &IdentityId) -> Option<String> {
        self.names.get(identity).cloned()
    }
}

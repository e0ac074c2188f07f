//! Narrow interface onto the external system-of-record.
//!
//! The record store is consumed, never implemented, here: a full work
//! tracking service sits behind [`SystemOfRecord`], and this crate only ever
//! reads records, drives the claim edges of their state machine, and appends
//! audit notes.

pub mod claims;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// External record lifecycle. This crate only drives `open/backlog ->
/// in_progress` and `in_progress -> {done, blocked, open}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Backlog,
    Open,
    InProgress,
    Blocked,
    Done,
    Cancelled,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Backlog => "backlog",
            RecordState::Open => "open",
            RecordState::InProgress => "in_progress",
            RecordState::Blocked => "blocked",
            RecordState::Done => "done",
            RecordState::Cancelled => "cancelled",
        }
    }

    /// States from which a claim may proceed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, RecordState::Open | RecordState::Backlog)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Short code, also the suffix of the workspace name.
    pub id: String,
    pub state: RecordState,
    pub title: String,
    /// Actor currently holding the record, if any. Verified after a claim
    /// write to detect lost updates on trackers that do not serialize
    /// conflicting writes.
    pub assignee: Option<String>,
    pub url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a record from a local item.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub title: String,
    pub body: String,
    pub state: RecordState,
}

/// Fields merged into a record on update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub assignee: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub state: Option<RecordState>,
}

/// The system-of-record's claim/read/update surface. Conflicting writes to
/// the same record are assumed to be serialized by the remote side; every
/// listing call carries a limit so the core never fetches more than a batch
/// needs.
#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    async fn get_record(&self, id: &str) -> Result<Option<Record>>;

    async fn update_record(&self, id: &str, state: RecordState, update: RecordUpdate)
        -> Result<()>;

    async fn create_record(&self, draft: RecordDraft) -> Result<Record>;

    async fn add_note(&self, id: &str, text: &str) -> Result<()>;

    async fn list_records(&self, filter: RecordFilter, limit: usize) -> Result<Vec<Record>>;
}

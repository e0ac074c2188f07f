//! Claiming items through the system-of-record.
//!
//! A claim is nothing but the external record's status: writing
//! `in_progress` with this actor as assignee, then re-reading to verify the
//! write stuck. The external system is the sole cross-process mutual
//! exclusion mechanism; no local lock is trusted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{Record, RecordState, RecordUpdate, SystemOfRecord};
use crate::error::{Error, Result};
use crate::store::item::{Item, ItemState};

/// Result of a claim attempt.
#[derive(Debug)]
pub enum ClaimResult {
    Claimed(Record),
    /// Someone else holds the record, or its state does not admit a claim.
    AlreadyClaimed {
        state: RecordState,
        holder: Option<String>,
    },
}

/// Terminal outcome reported back to the record on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDisposition {
    Done,
    Blocked,
    /// Work failed; the record returns to the pool.
    Reopened,
}

impl ReleaseDisposition {
    fn record_state(self) -> RecordState {
        match self {
            ReleaseDisposition::Done => RecordState::Done,
            ReleaseDisposition::Blocked => RecordState::Blocked,
            ReleaseDisposition::Reopened => RecordState::Open,
        }
    }
}

/// What to do about a local item after comparing it with its external record.
/// The external system always wins on conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    MarkCompleted,
    DeleteLocal,
    MarkBlocked,
    /// Rare and loud: the record went back to open while the local item was
    /// already completed.
    ReopenLocal,
    CreateExternal,
    Noop,
}

/// Decision table for local-vs-external drift.
pub fn reconcile(local: &Item, external: Option<&Record>) -> ReconcileAction {
    let Some(record) = external else {
        return ReconcileAction::CreateExternal;
    };
    match (record.state, local.state) {
        (RecordState::Done, ItemState::Pending | ItemState::InProgress) => {
            ReconcileAction::MarkCompleted
        }
        (RecordState::Cancelled, _) => ReconcileAction::DeleteLocal,
        (RecordState::Blocked, ItemState::Pending) => ReconcileAction::MarkBlocked,
        (RecordState::Backlog | RecordState::Open, ItemState::Completed) => {
            warn!(
                record = %record.id,
                item = %local.id,
                "External record reopened after local completion"
            );
            ReconcileAction::ReopenLocal
        }
        _ => ReconcileAction::Noop,
    }
}

/// Bounded retry with exponential backoff, applied only to
/// `ExternalUnavailable` failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Drives the claim edges of the external record state machine on behalf of
/// one named actor.
pub struct ClaimCoordinator {
    tracker: Arc<dyn SystemOfRecord>,
    actor: String,
    retry: RetryPolicy,
}

impl ClaimCoordinator {
    pub fn new(tracker: Arc<dyn SystemOfRecord>, actor: impl Into<String>) -> Self {
        Self {
            tracker,
            actor: actor.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn tracker(&self) -> &Arc<dyn SystemOfRecord> {
        &self.tracker
    }

    /// Attempt to transition the record from `open`/`backlog` to
    /// `in_progress`. Any other observed state means someone else owns it.
    /// After writing, the record is read back and the assignee verified, so
    /// a tracker that silently merges conflicting writes still yields at
    /// most one effective claimant.
    pub async fn try_claim(&self, record_id: &str) -> Result<ClaimResult> {
        let record = self
            .get_with_retry(record_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("record {record_id}")))?;

        if !record.state.is_claimable() {
            return Ok(ClaimResult::AlreadyClaimed {
                state: record.state,
                holder: record.assignee,
            });
        }

        let update = RecordUpdate {
            assignee: Some(Some(self.actor.clone())),
        };
        self.update_with_retry(record_id, RecordState::InProgress, update)
            .await?;
        self.tracker
            .add_note(record_id, &format!("claimed by {}", self.actor))
            .await?;

        // Check-after-write: if another actor's write landed last, yield.
        let verified = self
            .get_with_retry(record_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("record {record_id}")))?;
        match verified.assignee.as_deref() {
            Some(holder) if holder == self.actor => {
                info!(record = %record_id, actor = %self.actor, "Claimed record");
                Ok(ClaimResult::Claimed(verified))
            }
            holder => {
                warn!(
                    record = %record_id,
                    holder = holder.unwrap_or("<none>"),
                    "Lost claim race after write"
                );
                Ok(ClaimResult::AlreadyClaimed {
                    state: verified.state,
                    holder: verified.assignee,
                })
            }
        }
    }

    /// Report a terminal outcome. `detail` is the human-readable reason (MR
    /// link, blocked reason, or error summary) and always lands in the
    /// record's notes.
    pub async fn release(
        &self,
        record_id: &str,
        outcome: ReleaseDisposition,
        detail: &str,
    ) -> Result<()> {
        let state = outcome.record_state();
        let update = RecordUpdate {
            // A reopened record goes back to the pool unassigned.
            assignee: matches!(outcome, ReleaseDisposition::Reopened).then_some(None),
        };
        self.update_with_retry(record_id, state, update).await?;
        self.tracker
            .add_note(record_id, &format!("{}: {detail}", state.as_str()))
            .await?;
        info!(record = %record_id, state = %state.as_str(), detail, "Released record");
        Ok(())
    }

    pub async fn get_record(&self, record_id: &str) -> Result<Option<Record>> {
        self.get_with_retry(record_id).await
    }

    async fn get_with_retry(&self, record_id: &str) -> Result<Option<Record>> {
        let tracker = Arc::clone(&self.tracker);
        let id = record_id.to_string();
        self.with_retry("get_record", move || {
            let tracker = Arc::clone(&tracker);
            let id = id.clone();
            async move { tracker.get_record(&id).await }
        })
        .await
    }

    async fn update_with_retry(
        &self,
        record_id: &str,
        state: RecordState,
        update: RecordUpdate,
    ) -> Result<()> {
        let tracker = Arc::clone(&self.tracker);
        let id = record_id.to_string();
        self.with_retry("update_record", move || {
            let tracker = Arc::clone(&tracker);
            let id = id.clone();
            let update = update.clone();
            async move { tracker.update_record(&id, state, update).await }
        })
        .await
    }

    async fn with_retry<T, Fut>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.retry.base_delay;
        let mut attempt = 1u32;
        loop {
            match call().await {
                Err(Error::ExternalUnavailable(reason)) if attempt < self.retry.attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.retry.attempts,
                        reason,
                        "System-of-record unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

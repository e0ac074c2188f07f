//! Batch cycle state machine: build queue, claim, provision, dispatch,
//! collect, reconcile and clean up, then loop or stop.
//!
//! Claims are sequential within a batch so the tracker's responses stay
//! deterministic for reconciliation logging; dispatched work runs in
//! parallel; batches are strictly sequential.

pub mod dispatch;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::queue::{build_queue, next_eligible, stalled_items};
use crate::store::item::{ExternalRef, Item, ItemId, ItemState};
use crate::store::{ItemStore, TransitionFields};
use crate::tracker::claims::{
    reconcile, ClaimCoordinator, ClaimResult, ReconcileAction, ReleaseDisposition,
};
use crate::tracker::{Record, RecordDraft, RecordState};
use crate::workspace::{Workspace, WorkspaceManager};
use dispatch::{dispatch_bounded, DispatchOutcome, Dispatcher};

const MAX_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Worker count per batch, clamped to 1..=5.
    pub batch_size: usize,
    /// Total item budget across the run; `None` is unbounded.
    pub max_items: Option<usize>,
    pub dispatch_timeout: Duration,
    pub include_ungrouped: bool,
    /// Prefix for per-item branches, e.g. "feature".
    pub branch_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_items: None,
            dispatch_timeout: Duration::from_secs(3600),
            include_ungrouped: false,
            branch_prefix: "feature".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    QueueEmpty,
    BudgetExhausted,
    /// An entire batch produced zero successes; escalate instead of spinning.
    NoProgress,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub completed: usize,
    pub blocked: usize,
    pub failed: usize,
    pub stop_reason: StopReason,
}

/// One claimed item with its external record and provisioned workspace.
struct WorkUnit {
    item: Item,
    record: Record,
    workspace: Workspace,
}

pub struct BatchOrchestrator {
    store: ItemStore,
    workspaces: WorkspaceManager,
    claims: ClaimCoordinator,
    dispatcher: Arc<dyn Dispatcher>,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    pub fn new(
        store: ItemStore,
        workspaces: WorkspaceManager,
        claims: ClaimCoordinator,
        dispatcher: Arc<dyn Dispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            workspaces,
            claims,
            dispatcher,
            config,
        }
    }

    /// Drive batches until the queue drains, the item budget is spent, or a
    /// whole batch fails to make progress.
    pub async fn run(&self) -> Result<RunSummary> {
        let batch_size = self.config.batch_size.clamp(1, MAX_BATCH_SIZE);
        let mut summary = RunSummary {
            processed: 0,
            completed: 0,
            blocked: 0,
            failed: 0,
            stop_reason: StopReason::QueueEmpty,
        };
        // Items completed during this run stay in the eligibility set even
        // after a merged completion deletes their file.
        let mut run_completed: HashSet<ItemId> = HashSet::new();

        loop {
            // Local state is not trusted until it has been reconciled
            // against the system-of-record.
            self.sync().await?;

            let items = self.store.list(None).await?;
            let mut completed: HashSet<ItemId> = items
                .iter()
                .filter(|i| i.state == ItemState::Completed)
                .map(|i| i.id)
                .collect();
            completed.extend(run_completed.iter().copied());
            let known: HashSet<ItemId> = items.iter().map(|i| i.id).collect();

            let mut queue = build_queue(&items, self.config.include_ungrouped);

            // Items gated on ids that do not exist would sit in the queue
            // forever; fail them open to blocked where the operator sees them.
            let stalled: Vec<(ItemId, ItemId)> = stalled_items(&queue, &known, &completed)
                .into_iter()
                .map(|(item, missing)| (item.id, missing))
                .collect();
            for (id, missing) in stalled {
                self.store
                    .transition(
                        id,
                        ItemState::Blocked,
                        TransitionFields {
                            blocked_reason: Some(format!("depends on unknown item {missing}")),
                            ..Default::default()
                        },
                    )
                    .await?;
                summary.blocked += 1;
                queue.retain(|item| item.id != id);
            }

            if queue.is_empty() {
                summary.stop_reason = StopReason::QueueEmpty;
                break;
            }

            let remaining_budget = self
                .config
                .max_items
                .map(|max| max.saturating_sub(summary.processed));
            if remaining_budget == Some(0) {
                summary.stop_reason = StopReason::BudgetExhausted;
                break;
            }
            let batch_limit = remaining_budget
                .map(|budget| budget.min(batch_size))
                .unwrap_or(batch_size);

            let batch = self
                .claim_batch(&mut queue, &completed, batch_limit, &mut summary)
                .await?;
            if batch.is_empty() {
                summary.stop_reason = StopReason::NoProgress;
                warn!("No items could be claimed this cycle, stopping");
                break;
            }

            let units = self.provision(batch).await;
            if units.is_empty() {
                summary.stop_reason = StopReason::NoProgress;
                warn!("Every claimed item failed provisioning, stopping");
                break;
            }

            let successes = self
                .dispatch_and_collect(units, &mut summary, &mut run_completed)
                .await;

            if let Some(max) = self.config.max_items {
                if summary.processed >= max {
                    summary.stop_reason = StopReason::BudgetExhausted;
                    break;
                }
            }
            if successes == 0 {
                summary.stop_reason = StopReason::NoProgress;
                warn!("Batch produced zero successes, stopping instead of spinning");
                break;
            }
        }

        info!(
            processed = summary.processed,
            completed = summary.completed,
            blocked = summary.blocked,
            failed = summary.failed,
            stop_reason = ?summary.stop_reason,
            "Run finished"
        );
        Ok(summary)
    }

    /// Compare every externally linked item against its record and apply the
    /// decision table. Tracker outages here degrade to a logged warning; the
    /// affected item is reconsidered next cycle.
    pub async fn sync(&self) -> Result<()> {
        let items = self.store.list(None).await?;
        for item in items {
            let Some(ext) = item.external_ref.clone() else {
                continue;
            };
            let record = match self.claims.get_record(&ext.id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(item = %item.id, record = %ext.id, error = %err, "Reconcile read failed");
                    continue;
                }
            };
            match reconcile(&item, record.as_ref()) {
                ReconcileAction::MarkCompleted => {
                    self.store
                        .transition(item.id, ItemState::Completed, TransitionFields::default())
                        .await?;
                }
                ReconcileAction::DeleteLocal => {
                    self.store.delete(item.id).await?;
                }
                ReconcileAction::MarkBlocked => {
                    self.store
                        .transition(
                            item.id,
                            ItemState::Blocked,
                            TransitionFields {
                                blocked_reason: Some("blocked in system-of-record".to_string()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                ReconcileAction::ReopenLocal => {
                    self.store
                        .transition(item.id, ItemState::Pending, TransitionFields::default())
                        .await?;
                }
                ReconcileAction::CreateExternal => {
                    // Ref points at a record that no longer exists; relink.
                    self.ensure_record(&item).await.map(|_| ()).unwrap_or_else(|err| {
                        warn!(item = %item.id, error = %err, "Failed to recreate external record");
                    });
                }
                ReconcileAction::Noop => {}
            }
        }
        Ok(())
    }

    /// Pull eligible candidates one at a time and claim them until the batch
    /// is full or the queue has nothing claimable. `AlreadyClaimed` and
    /// `NotFound` skip to the next candidate; tracker exhaustion marks the
    /// item failed for this cycle and moves on.
    async fn claim_batch(
        &self,
        queue: &mut Vec<Item>,
        completed: &HashSet<ItemId>,
        batch_limit: usize,
        summary: &mut RunSummary,
    ) -> Result<Vec<(Item, Record)>> {
        let mut batch = Vec::new();
        while batch.len() < batch_limit {
            let Some(candidate) = next_eligible(queue, completed).cloned() else {
                break;
            };
            queue.retain(|item| item.id != candidate.id);

            match self.claim_candidate(&candidate).await {
                Ok(Some(claimed)) => batch.push(claimed),
                Ok(None) => continue,
                Err(err) if err.is_recoverable() => {
                    info!(item = %candidate.id, error = %err, "Skipping candidate");
                    continue;
                }
                Err(Error::ExternalUnavailable(reason)) => {
                    error!(item = %candidate.id, reason, "Claim retries exhausted");
                    summary.failed += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(batch)
    }

    async fn claim_candidate(&self, item: &Item) -> Result<Option<(Item, Record)>> {
        let record = self.ensure_record(item).await?;
        match self.claims.try_claim(&record.id).await? {
            ClaimResult::Claimed(record) => {
                match self
                    .store
                    .transition(item.id, ItemState::InProgress, TransitionFields::default())
                    .await
                {
                    Ok(updated) => Ok(Some((updated, record))),
                    Err(err) => {
                        // The claim already landed externally; roll it back
                        // before skipping or the record stays assigned forever.
                        warn!(
                            item = %item.id,
                            record = %record.id,
                            error = %err,
                            "Local transition failed after claim, releasing"
                        );
                        self.release_quietly(
                            &record.id,
                            ReleaseDisposition::Reopened,
                            &format!("local transition failed: {err}"),
                        )
                        .await;
                        Err(err)
                    }
                }
            }
            ClaimResult::AlreadyClaimed { state, holder } => {
                info!(
                    item = %item.id,
                    record = %record.id,
                    state = %state.as_str(),
                    holder = holder.as_deref().unwrap_or("<none>"),
                    "Record already claimed, moving to next candidate"
                );
                Ok(None)
            }
        }
    }

    /// Create the external record for an item that has never been synced and
    /// persist the back-reference.
    async fn ensure_record(&self, item: &Item) -> Result<Record> {
        if let Some(ext) = &item.external_ref {
            if let Some(record) = self.claims.get_record(&ext.id).await? {
                return Ok(record);
            }
        }
        let record = self
            .claims
            .tracker()
            .create_record(RecordDraft {
                title: item.title.clone(),
                body: item.body.clone(),
                state: RecordState::Open,
            })
            .await?;
        self.store
            .transition(
                item.id,
                item.state,
                TransitionFields {
                    external_ref: Some(ExternalRef {
                        id: record.id.clone(),
                        url: record.url.clone(),
                    }),
                    ..Default::default()
                },
            )
            .await?;
        info!(item = %item.id, record = %record.id, "Created external record");
        Ok(record)
    }

    /// Provision a workspace per claimed item. A failure releases the claim
    /// back to the pool and drops the item from the batch without aborting
    /// the rest.
    async fn provision(&self, batch: Vec<(Item, Record)>) -> Vec<WorkUnit> {
        let mut units = Vec::new();
        for (item, record) in batch {
            let name = self.workspaces.workspace_name(&record.id);
            let branch = format!("{}/{}-{}", self.config.branch_prefix, item.id, item.slug);
            match self.workspaces.create(&name, &branch).await {
                Ok(workspace) => units.push(WorkUnit {
                    item,
                    record,
                    workspace,
                }),
                Err(err) => {
                    warn!(
                        item = %item.id,
                        workspace = %name,
                        error = %err,
                        "Provisioning failed, returning item to pool"
                    );
                    self.release_quietly(
                        &record.id,
                        ReleaseDisposition::Reopened,
                        &format!("workspace provisioning failed: {err}"),
                    )
                    .await;
                    if let Err(revert_err) = self
                        .store
                        .transition(item.id, ItemState::Pending, TransitionFields::default())
                        .await
                    {
                        error!(item = %item.id, error = %revert_err, "Failed to revert item to pending");
                    }
                }
            }
        }
        units
    }

    /// Dispatch all units concurrently, join the whole batch, and apply the
    /// outcome table. Returns the number of successful completions.
    async fn dispatch_and_collect(
        &self,
        units: Vec<WorkUnit>,
        summary: &mut RunSummary,
        run_completed: &mut HashSet<ItemId>,
    ) -> usize {
        let mut join_set = JoinSet::new();
        let mut pending: Vec<Option<WorkUnit>> = Vec::with_capacity(units.len());
        for (index, unit) in units.into_iter().enumerate() {
            let dispatcher = Arc::clone(&self.dispatcher);
            let item = unit.item.clone();
            let workspace = unit.workspace.clone();
            let timeout = self.config.dispatch_timeout;
            pending.push(Some(unit));
            join_set.spawn(async move {
                let report = dispatch_bounded(dispatcher, item, workspace, timeout).await;
                (index, report)
            });
        }

        let mut successes = 0usize;
        while let Some(joined) = join_set.join_next().await {
            let (index, report) = match joined {
                Ok(result) => result,
                Err(err) => {
                    error!(error = %err, "Dispatch task panicked");
                    continue;
                }
            };
            let Some(unit) = pending.get_mut(index).and_then(Option::take) else {
                continue;
            };

            summary.processed += 1;
            if let Err(err) = self.apply_outcome(&unit, &report.outcome, summary).await {
                error!(item = %unit.item.id, error = %err, "Failed to apply dispatch outcome");
                continue;
            }
            if let DispatchOutcome::Completed { merged, .. } = &report.outcome {
                successes += 1;
                if *merged {
                    run_completed.insert(unit.item.id);
                }
            }

            for draft in report.follow_ups {
                match self.store.create(draft).await {
                    Ok(created) => info!(id = %created.id, "Enqueued follow-up item"),
                    Err(err) => warn!(error = %err, "Failed to create follow-up item"),
                }
            }
        }
        successes
    }

    async fn apply_outcome(
        &self,
        unit: &WorkUnit,
        outcome: &DispatchOutcome,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let item_id = unit.item.id;
        let record_id = unit.record.id.as_str();
        let workspace_name = unit.workspace.name.as_str();

        match outcome {
            DispatchOutcome::Completed { result_ref, merged } => {
                summary.completed += 1;
                if *merged {
                    self.store.delete(item_id).await?;
                    self.release_quietly(record_id, ReleaseDisposition::Done, result_ref)
                        .await;
                    if let Err(err) = self.workspaces.remove(workspace_name).await {
                        warn!(workspace = %workspace_name, error = %err, "Workspace removal failed");
                    }
                } else {
                    // Not merged yet: claim and workspace stay put until a
                    // later cycle observes the merge.
                    self.store
                        .transition(
                            item_id,
                            ItemState::InProgress,
                            TransitionFields {
                                result_ref: Some(result_ref.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
            DispatchOutcome::Blocked { reason } => {
                summary.blocked += 1;
                self.store
                    .transition(
                        item_id,
                        ItemState::Blocked,
                        TransitionFields {
                            blocked_reason: Some(reason.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.release_quietly(record_id, ReleaseDisposition::Blocked, reason)
                    .await;
                // Workspace retained for operator inspection.
            }
            DispatchOutcome::Failed { error } => {
                summary.failed += 1;
                self.store
                    .transition(item_id, ItemState::Pending, TransitionFields::default())
                    .await?;
                self.release_quietly(record_id, ReleaseDisposition::Reopened, error)
                    .await;
                // Workspace retained for operator inspection.
            }
        }
        Ok(())
    }

    /// Release failures must never mask the outcome being reported.
    async fn release_quietly(&self, record_id: &str, outcome: ReleaseDisposition, detail: &str) {
        if let Err(err) = self.claims.release(record_id, outcome, detail).await {
            error!(record = %record_id, error = %err, "Failed to release claim");
        }
    }
}

//! The seam between the orchestrator and whatever actually does the work.
//!
//! Dispatch is externally driven and out of scope here; this module only
//! defines the structured outcome it must report and the timeout that bounds
//! how long the orchestrator waits for one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::store::item::{Item, ItemDraft};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed { result_ref: String, merged: bool },
    Blocked { reason: String },
    Failed { error: String },
}

/// Per-item dispatch result, plus any follow-up work the dispatched activity
/// discovered along the way.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub follow_ups: Vec<ItemDraft>,
}

impl DispatchReport {
    pub fn completed(result_ref: impl Into<String>, merged: bool) -> Self {
        Self {
            outcome: DispatchOutcome::Completed {
                result_ref: result_ref.into(),
                merged,
            },
            follow_ups: Vec::new(),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            outcome: DispatchOutcome::Blocked {
                reason: reason.into(),
            },
            follow_ups: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            outcome: DispatchOutcome::Failed {
                error: error.into(),
            },
            follow_ups: Vec::new(),
        }
    }
}

/// External work collaborator: given a claimed item and its workspace,
/// performs arbitrary activity and reports a terminal outcome.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, item: &Item, workspace: &Workspace) -> Result<DispatchReport>;
}

/// Run one dispatch under a bounded wait. Overruns and errors are converted
/// to `Failed` reports; the underlying activity is not preempted, so the
/// workspace stays behind for inspection.
pub async fn dispatch_bounded(
    dispatcher: Arc<dyn Dispatcher>,
    item: Item,
    workspace: Workspace,
    timeout: Duration,
) -> DispatchReport {
    match tokio::time::timeout(timeout, dispatcher.dispatch(&item, &workspace)).await {
        Ok(Ok(report)) => report,
        Ok(Err(err)) => {
            warn!(id = %item.id, error = %err, "Dispatch returned an error");
            DispatchReport::failed(format!("dispatch error: {err}"))
        }
        Err(_) => {
            warn!(
                id = %item.id,
                timeout_secs = timeout.as_secs(),
                "Dispatch timed out; workspace retained"
            );
            DispatchReport::failed(format!(
                "dispatch timed out after {}s",
                timeout.as_secs()
            ))
        }
    }
}

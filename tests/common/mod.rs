//! Shared harness: an in-memory system-of-record, a scripted dispatcher, and
//! git repository fixtures for workspace tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use ralph_orchestrator::error::{Error, Result};
use ralph_orchestrator::orchestrator::dispatch::{DispatchReport, Dispatcher};
use ralph_orchestrator::store::item::Item;
use ralph_orchestrator::tracker::{
    Record, RecordDraft, RecordFilter, RecordState, RecordUpdate, SystemOfRecord,
};
use ralph_orchestrator::workspace::Workspace;

/// In-memory system-of-record. Writes are serialized by the mutex and, like
/// a real tracker's concurrency control, a claim write over a record that is
/// already `in_progress` under another actor is ignored rather than applied,
/// so racing claimants resolve to exactly one effective owner.
#[derive(Default)]
pub struct InMemoryTracker {
    records: Mutex<HashMap<String, Record>>,
    notes: Mutex<Vec<(String, String)>>,
    next_id: AtomicU32,
    /// Number of upcoming calls that fail with `ExternalUnavailable`.
    fail_next: AtomicU32,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ..Default::default()
        }
    }

    pub fn fail_next_calls(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Seed a record directly, bypassing create_record.
    pub fn insert_record(&self, record: Record) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    pub fn record(&self, id: &str) -> Option<Record> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn notes_for(&self, id: &str) -> Vec<String> {
        self.notes
            .lock()
            .unwrap()
            .iter()
            .filter(|(record_id, _)| record_id == id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn check_outage(&self) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::ExternalUnavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

pub fn open_record(id: &str, title: &str) -> Record {
    Record {
        id: id.to_string(),
        state: RecordState::Open,
        title: title.to_string(),
        assignee: None,
        url: Some(format!("https://tracker.example/{id}")),
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl SystemOfRecord for InMemoryTracker {
    async fn get_record(&self, id: &str) -> Result<Option<Record>> {
        self.check_outage()?;
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn update_record(
        &self,
        id: &str,
        state: RecordState,
        update: RecordUpdate,
    ) -> Result<()> {
        self.check_outage()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("record {id}")))?;

        // Conflicting claim writes are serialized away: a second actor's
        // in_progress write over an already claimed record does not land.
        if state == RecordState::InProgress
            && record.state == RecordState::InProgress
            && record.assignee.is_some()
        {
            return Ok(());
        }

        record.state = state;
        if let Some(assignee) = update.assignee {
            record.assignee = assignee;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn create_record(&self, draft: RecordDraft) -> Result<Record> {
        self.check_outage()?;
        let id = format!("{:03}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = Record {
            id: id.clone(),
            state: draft.state,
            title: draft.title,
            assignee: None,
            url: Some(format!("https://tracker.example/{id}")),
            updated_at: Utc::now(),
        };
        self.records
            .lock()
            .unwrap()
            .insert(id.clone(), record.clone());
        Ok(record)
    }

    async fn add_note(&self, id: &str, text: &str) -> Result<()> {
        self.check_outage()?;
        self.notes
            .lock()
            .unwrap()
            .push((id.to_string(), text.to_string()));
        Ok(())
    }

    async fn list_records(&self, filter: RecordFilter, limit: usize) -> Result<Vec<Record>> {
        self.check_outage()?;
        let records = self.records.lock().unwrap();
        let mut matching: Vec<Record> = records
            .values()
            .filter(|record| filter.state.map_or(true, |state| record.state == state))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching.truncate(limit);
        Ok(matching)
    }
}

/// Dispatcher that replays scripted reports per item title and records every
/// dispatch it receives.
pub struct ScriptedDispatcher {
    reports: Mutex<HashMap<String, DispatchReport>>,
    default_report: DispatchReport,
    pub dispatched: Mutex<Vec<(String, String)>>,
}

impl ScriptedDispatcher {
    /// Items without a script entry get `default_report`.
    pub fn new(default_report: DispatchReport) -> Self {
        Self {
            reports: Mutex::new(HashMap::new()),
            default_report,
            dispatched: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, title: &str, report: DispatchReport) {
        self.reports
            .lock()
            .unwrap()
            .insert(title.to_string(), report);
    }

    pub fn dispatched_titles(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(title, _)| title.clone())
            .collect()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(&self, item: &Item, workspace: &Workspace) -> Result<DispatchReport> {
        self.dispatched
            .lock()
            .unwrap()
            .push((item.title.clone(), workspace.name.clone()));
        let report = self
            .reports
            .lock()
            .unwrap()
            .get(&item.title)
            .cloned()
            .unwrap_or_else(|| self.default_report.clone());
        Ok(report)
    }
}

/// Dispatcher that never returns within any reasonable timeout.
pub struct HungDispatcher;

#[async_trait]
impl Dispatcher for HungDispatcher {
    async fn dispatch(&self, _item: &Item, _workspace: &Workspace) -> Result<DispatchReport> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(DispatchReport::completed("unreachable", true))
    }
}

/// Initialize a git repository with one commit on `main`, suitable as the
/// base for worktree workspaces.
pub async fn init_repo(dir: &TempDir) -> PathBuf {
    let repo = dir.path().join("repo");
    tokio::fs::create_dir_all(&repo).await.unwrap();

    for args in [
        vec!["init"],
        vec!["config", "user.name", "Test"],
        vec!["config", "user.email", "test@example.com"],
    ] {
        run_git(&repo, &args).await;
    }
    tokio::fs::write(repo.join("README.md"), "# Test repo\n")
        .await
        .unwrap();
    run_git(&repo, &["add", "README.md"]).await;
    run_git(&repo, &["commit", "-m", "initial commit"]).await;
    run_git(&repo, &["branch", "-M", "main"]).await;
    repo
}

async fn run_git(repo: &PathBuf, args: &[&str]) {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

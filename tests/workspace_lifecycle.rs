mod common;

use std::path::Path;

use tempfile::TempDir;

use common::init_repo;
use ralph_orchestrator::error::Error;
use ralph_orchestrator::workspace::WorkspaceManager;

async fn branch_exists(repo: &Path, branch: &str) -> bool {
    tokio::process::Command::new("git")
        .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
        .current_dir(repo)
        .output()
        .await
        .unwrap()
        .status
        .success()
}

async fn manager(dir: &TempDir) -> (std::path::PathBuf, WorkspaceManager) {
    let repo = init_repo(dir).await;
    let root = dir.path().join("workspaces");
    let manager = WorkspaceManager::new(repo.clone(), root, "ralph", "main");
    (repo, manager)
}

#[tokio::test]
async fn create_and_remove_round_trip() {
    let dir = TempDir::new().unwrap();
    let (repo, manager) = manager(&dir).await;

    let workspace = manager.create("ralph-001", "feature/001-demo").await.unwrap();
    assert_eq!(workspace.name, "ralph-001");
    assert_eq!(workspace.branch.as_deref(), Some("feature/001-demo"));
    assert!(workspace.path.join(".git").exists());
    assert!(workspace.path.join("README.md").exists());
    assert!(manager.exists("ralph-001").await);
    assert!(branch_exists(&repo, "feature/001-demo").await);

    manager.remove("ralph-001").await.unwrap();
    assert!(!manager.exists("ralph-001").await);
    assert!(!workspace.path.exists());
    assert!(!branch_exists(&repo, "feature/001-demo").await);
}

#[tokio::test]
async fn duplicate_workspace_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_repo, manager) = manager(&dir).await;

    manager.create("ralph-001", "feature/001-first").await.unwrap();
    assert!(matches!(
        manager.create("ralph-001", "feature/001-second").await,
        Err(Error::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn existing_branch_is_rejected_before_any_worktree_is_made() {
    let dir = TempDir::new().unwrap();
    let (repo, manager) = manager(&dir).await;

    tokio::process::Command::new("git")
        .args(["branch", "feature/taken"])
        .current_dir(&repo)
        .output()
        .await
        .unwrap();

    assert!(matches!(
        manager.create("ralph-002", "feature/taken").await,
        Err(Error::AlreadyExists(_))
    ));
    assert!(!manager.exists("ralph-002").await);
}

#[tokio::test]
async fn removing_an_absent_workspace_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (_repo, manager) = manager(&dir).await;
    assert!(matches!(
        manager.remove("ralph-404").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn list_is_restricted_to_the_managed_prefix() {
    let dir = TempDir::new().unwrap();
    let (_repo, manager) = manager(&dir).await;

    manager.create("ralph-001", "feature/001-a").await.unwrap();
    manager.create("ralph-002", "feature/002-b").await.unwrap();
    // Unmanaged directory sitting in the same root.
    tokio::fs::create_dir_all(dir.path().join("workspaces").join("scratch"))
        .await
        .unwrap();

    let managed = manager.list(false).await.unwrap();
    let names: Vec<&str> = managed.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(names, vec!["ralph-001", "ralph-002"]);
    assert_eq!(managed[0].branch.as_deref(), Some("feature/001-a"));

    let everything = manager.list(true).await.unwrap();
    let names: Vec<&str> = everything.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(names, vec!["ralph-001", "ralph-002", "scratch"]);
    // The plain directory has no branch.
    assert_eq!(everything[2].branch, None);
}

#[tokio::test]
async fn list_on_absent_root_is_empty() {
    let dir = TempDir::new().unwrap();
    let (_repo, manager) = manager(&dir).await;
    assert!(manager.list(true).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_setup_tears_the_workspace_back_down() {
    let dir = TempDir::new().unwrap();
    let repo = init_repo(&dir).await;
    let root = dir.path().join("workspaces");
    let manager = WorkspaceManager::new(repo.clone(), root.clone(), "ralph", "main")
        .with_setup_command("false");

    let err = manager.create("ralph-001", "feature/001-doomed").await;
    assert!(err.is_err());
    assert!(!root.join("ralph-001").exists());
    // The branch is gone too, so the name can be reused after a fix.
    assert!(!branch_exists(&repo, "feature/001-doomed").await);
}

#[tokio::test]
async fn setup_command_runs_inside_the_new_workspace() {
    let dir = TempDir::new().unwrap();
    let repo = init_repo(&dir).await;
    let root = dir.path().join("workspaces");
    let manager = WorkspaceManager::new(repo, root, "ralph", "main")
        .with_setup_command("echo ready > setup-marker");

    let workspace = manager.create("ralph-001", "feature/001-setup").await.unwrap();
    let marker = tokio::fs::read_to_string(workspace.path.join("setup-marker"))
        .await
        .unwrap();
    assert_eq!(marker.trim(), "ready");
}

#[tokio::test]
async fn workspace_name_derives_from_the_record_code() {
    let dir = TempDir::new().unwrap();
    let (_repo, manager) = manager(&dir).await;
    assert_eq!(manager.workspace_name("017"), "ralph-017");
    assert_eq!(manager.workspace_name("REC-17"), "ralph-REC-17");
}

#[tokio::test]
async fn prune_clears_registrations_for_deleted_directories() {
    let dir = TempDir::new().unwrap();
    let (_repo, manager) = manager(&dir).await;

    let workspace = manager.create("ralph-001", "feature/001-stale").await.unwrap();
    // Directory vanished outside the manager's control.
    tokio::fs::remove_dir_all(&workspace.path).await.unwrap();

    manager.prune().await.unwrap();
    // The name is reusable again after pruning.
    manager.create("ralph-001", "feature/001-fresh").await.unwrap();
}

#[tokio::test]
async fn remove_falls_back_to_directory_deletion_for_unregistered_trees() {
    let dir = TempDir::new().unwrap();
    let (_repo, manager) = manager(&dir).await;

    // A directory that looks like a workspace but git knows nothing about.
    let impostor = dir.path().join("workspaces").join("ralph-009");
    tokio::fs::create_dir_all(&impostor).await.unwrap();
    tokio::fs::write(impostor.join("leftover.txt"), "junk")
        .await
        .unwrap();

    manager.remove("ralph-009").await.unwrap();
    assert!(!impostor.exists());
}

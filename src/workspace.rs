//! Isolated per-item working copies backed by git worktrees.
//!
//! Each workspace is a worktree under a dedicated root directory, on its own
//! branch created from the trunk. The workspace name is the uniqueness key:
//! a collision means the item is already being worked on somewhere.

use std::path::{Path, PathBuf};
use std::process::Output;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub name: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Creates, lists, and removes git worktrees under a managed root.
///
/// No retries happen here; the orchestrator owns retry policy. Removal is
/// forced, so callers must have captured any results they need first.
pub struct WorkspaceManager {
    repo: PathBuf,
    root: PathBuf,
    prefix: String,
    trunk: String,
    setup_command: Option<String>,
}

impl WorkspaceManager {
    pub fn new(
        repo: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        trunk: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            root: root.into(),
            prefix: prefix.into(),
            trunk: trunk.into(),
            setup_command: None,
        }
    }

    /// One-time setup run inside a freshly created workspace (dependency
    /// installation and the like), executed through `sh -c`.
    pub fn with_setup_command(mut self, command: impl Into<String>) -> Self {
        self.setup_command = Some(command.into());
        self
    }

    /// Deterministic workspace name for an external record's short code.
    pub fn workspace_name(&self, code: &str) -> String {
        format!("{}-{}", self.prefix, code)
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path_for(name))
            .await
            .unwrap_or(false)
    }

    /// Create a worktree on a new branch from the trunk. An existing
    /// directory or branch of the same name is an `AlreadyExists` signal,
    /// never overwritten. Partial setup failures tear the tree back down.
    pub async fn create(&self, name: &str, branch: &str) -> Result<Workspace> {
        let path = self.path_for(name);
        if self.exists(name).await {
            return Err(Error::AlreadyExists(format!(
                "workspace {name} at {}",
                path.display()
            )));
        }
        if self.branch_exists(branch).await? {
            return Err(Error::AlreadyExists(format!("branch {branch}")));
        }
        tokio::fs::create_dir_all(&self.root).await?;

        info!(name, branch, path = %path.display(), "Creating workspace");
        let path_str = path.to_string_lossy().to_string();
        self.git(&["worktree", "add", "-b", branch, &path_str, &self.trunk])
            .await?;

        if let Some(setup) = &self.setup_command {
            debug!(name, command = %setup, "Running workspace setup");
            if let Err(setup_err) = self.run_setup(setup, &path).await {
                warn!(name, error = %setup_err, "Workspace setup failed, tearing down");
                if let Err(teardown_err) = self.remove(name).await {
                    // The tree is half-created and we could not clean it up;
                    // surface the path for manual remediation.
                    warn!(name, error = %teardown_err, "Teardown after failed setup also failed");
                    return Err(Error::PartialWorkspace {
                        path,
                        reason: format!("setup failed ({setup_err}); teardown failed ({teardown_err})"),
                    });
                }
                return Err(setup_err);
            }
        }

        Ok(Workspace {
            name: name.to_string(),
            path,
            branch: Some(branch.to_string()),
        })
    }

    /// Forced removal: worktree remove, with a filesystem-deletion fallback
    /// plus a prune pass when git refuses. Best-effort branch deletion
    /// afterwards (merged or protected branches survive).
    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        if !self.exists(name).await {
            return Err(Error::NotFound(format!("workspace {name}")));
        }

        let branch = self.current_branch(&path).await;
        let path_str = path.to_string_lossy().to_string();

        info!(name, path = %path.display(), "Removing workspace");
        if let Err(err) = self
            .git(&["worktree", "remove", "--force", &path_str])
            .await
        {
            warn!(name, error = %err, "git worktree remove failed, falling back to directory deletion");
            tokio::fs::remove_dir_all(&path).await.map_err(|fs_err| {
                Error::PartialWorkspace {
                    path: path.clone(),
                    reason: format!("worktree remove failed ({err}); rm failed ({fs_err})"),
                }
            })?;
            self.prune().await?;
        }

        if let Some(branch) = branch {
            if let Err(err) = self.git(&["branch", "-D", &branch]).await {
                debug!(name, branch, error = %err, "Branch not deleted");
            }
        }
        Ok(())
    }

    /// Enumerate workspaces under the root, restricted to the managed prefix
    /// unless `include_all`. An absent root is an empty list.
    pub async fn list(&self, include_all: bool) -> Result<Vec<Workspace>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let managed_prefix = format!("{}-", self.prefix);
        let mut workspaces = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !include_all && !name.starts_with(&managed_prefix) {
                continue;
            }
            let path = entry.path();
            let branch = self.current_branch(&path).await;
            workspaces.push(Workspace {
                name: name.to_string(),
                path,
                branch,
            });
        }
        workspaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workspaces)
    }

    /// Drop stale worktree registrations (trees whose directories are gone).
    pub async fn prune(&self) -> Result<()> {
        self.git(&["worktree", "prune"]).await.map(|_| ())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .current_dir(&self.repo)
            .output()
            .await?;
        Ok(output.status.success())
    }

    async fn current_branch(&self, path: &Path) -> Option<String> {
        let output = Command::new("git")
            .args(["branch", "--show-current"])
            .current_dir(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if branch.is_empty() {
            None
        } else {
            Some(branch)
        }
    }

    async fn run_setup(&self, command: &str, path: &Path) -> Result<()> {
        let output = Command::new("sh")
            .args(["-c", command])
            .current_dir(path)
            .output()
            .await?;
        check_git_output("workspace setup", &output)
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .await?;
        check_git_output(&format!("git {}", args.join(" ")), &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn check_git_output(context: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Git(format!("{context}: {}", stderr.trim())))
    }
}

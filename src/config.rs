use std::path::PathBuf;

use crate::store::ItemStore;
use crate::workspace::WorkspaceManager;

#[derive(Debug, Clone)]
pub struct Config {
    pub items_dir: PathBuf,
    pub repo: PathBuf,
    pub workspace_root: PathBuf,
    pub workspace_prefix: String,
    pub trunk_branch: String,
    pub setup_command: Option<String>,
}

impl Config {
    pub fn item_store(&self) -> ItemStore {
        ItemStore::new(self.items_dir.clone())
    }

    pub fn workspace_manager(&self) -> WorkspaceManager {
        let manager = WorkspaceManager::new(
            self.repo.clone(),
            self.workspace_root.clone(),
            self.workspace_prefix.clone(),
            self.trunk_branch.clone(),
        );
        match &self.setup_command {
            Some(command) => manager.with_setup_command(command.clone()),
            None => manager,
        }
    }
}

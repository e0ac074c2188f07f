pub mod frontmatter;
pub mod item;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use frontmatter::{Document, FrontMatter, Value};
use item::{id_from_file_name, slugify, ExternalRef, Item, ItemDraft, ItemId, ItemState, Priority};

/// Extra fields merged into an item's front matter during a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub blocked_reason: Option<String>,
    pub result_ref: Option<String>,
    pub external_ref: Option<ExternalRef>,
}

/// File-backed item persistence. One item per front-matter file, with the
/// filename encoding `(id, state, priority, slug)`.
pub struct ItemStore {
    root: PathBuf,
}

impl ItemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read every item file, skipping malformed entries with a logged reason.
    /// An absent root directory is an empty backlog, not an error.
    pub async fn list(&self, filter: Option<ItemState>) -> Result<Vec<Item>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if id_from_file_name(name).is_none() {
                // Not an item file (README, editor droppings, ...).
                continue;
            }
            match self.read_item(&path).await {
                Ok(item) => items.push(item),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping malformed item file");
                }
            }
        }

        items.sort_by_key(|item| item.id);
        if let Some(state) = filter {
            items.retain(|item| item.state == state);
        }
        Ok(items)
    }

    pub async fn get(&self, id: ItemId) -> Result<Item> {
        let path = self
            .find_path(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("item {id}")))?;
        self.read_item(&path).await
    }

    /// Allocate the next unused id (max existing + 1).
    pub async fn next_id(&self) -> Result<ItemId> {
        let mut max = 0u32;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ItemId::new(1));
            }
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(id_from_file_name) {
                max = max.max(id.as_u32());
            }
        }
        Ok(ItemId::new(max + 1))
    }

    /// Create a new pending item. Rejects empty titles and self-dependencies;
    /// titles are flattened to one line since the heading cannot hold more.
    pub async fn create(&self, draft: ItemDraft) -> Result<Item> {
        let title = draft.title.replace(['\r', '\n'], " ").trim().to_string();
        if title.is_empty() {
            return Err(Error::MalformedInput("item title cannot be empty".into()));
        }
        fs::create_dir_all(&self.root).await?;

        let id = self.next_id().await?;
        if draft.dependencies.contains(&id) {
            return Err(Error::MalformedInput(format!(
                "item {id} cannot depend on itself"
            )));
        }

        let item = Item {
            id,
            state: ItemState::Pending,
            priority: draft.priority.unwrap_or(Priority::P2),
            group: draft.group.filter(|g| !g.trim().is_empty()),
            external_ref: None,
            dependencies: draft.dependencies,
            slug: slugify(&title),
            title,
            body: draft.body,
            completed_at: None,
            blocked_at: None,
            blocked_reason: None,
            result_ref: None,
        };

        let path = self.root.join(item.file_name());
        self.write_item(&item, &path, None).await?;
        info!(id = %item.id, title = %item.title, "Created item");
        Ok(item)
    }

    /// Rewrite the item under its new state, merging audit fields, and rename
    /// the file so name and content never disagree. The new file is written
    /// in full before the old name disappears.
    pub async fn transition(
        &self,
        id: ItemId,
        new_state: ItemState,
        fields: TransitionFields,
    ) -> Result<Item> {
        let old_path = self
            .find_path(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("item {id}")))?;
        let mut item = self.read_item(&old_path).await?;
        let old_state = item.state;

        item.state = new_state;
        match new_state {
            ItemState::Completed => item.completed_at = Some(Utc::now()),
            ItemState::Blocked => item.blocked_at = Some(Utc::now()),
            _ => {}
        }
        if let Some(reason) = fields.blocked_reason {
            item.blocked_reason = Some(reason);
        }
        if let Some(result_ref) = fields.result_ref {
            item.result_ref = Some(result_ref);
        }
        if let Some(external_ref) = fields.external_ref {
            item.external_ref = Some(external_ref);
        }

        let new_path = self.root.join(item.file_name());
        self.write_item(&item, &new_path, Some(&old_path)).await?;
        info!(
            id = %item.id,
            from = %old_state,
            to = %new_state,
            "Item transitioned"
        );
        Ok(item)
    }

    /// Remove the item file. Idempotent: deleting an absent item is `Ok`.
    pub async fn delete(&self, id: ItemId) -> Result<()> {
        match self.find_path(id).await? {
            Some(path) => {
                fs::remove_file(&path).await?;
                info!(id = %id, "Deleted item");
                Ok(())
            }
            None => {
                debug!(id = %id, "Delete requested for absent item");
                Ok(())
            }
        }
    }

    async fn find_path(&self, id: ItemId) -> Result<Option<PathBuf>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_str().and_then(id_from_file_name) == Some(id) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    async fn read_item(&self, path: &Path) -> Result<Item> {
        let content = fs::read_to_string(path).await?;
        let doc = frontmatter::parse(&content)?;
        decode(&doc)
    }

    /// Write-then-rename: serialize to a temp name, move it into place, then
    /// drop the old path. A reader observes either the old file or the new
    /// one, never a torn mixture.
    async fn write_item(&self, item: &Item, new_path: &Path, old_path: Option<&Path>) -> Result<()> {
        let doc = encode(item);
        let tmp_path = new_path.with_extension("md.tmp");
        fs::write(&tmp_path, frontmatter::render(&doc)).await?;
        fs::rename(&tmp_path, new_path).await?;
        if let Some(old) = old_path {
            if old != new_path {
                fs::remove_file(old).await?;
            }
        }
        Ok(())
    }
}

fn decode(doc: &Document) -> Result<Item> {
    let fm = &doc.front_matter;
    let require = |key: &str| {
        fm.scalar(key)
            .ok_or_else(|| Error::MalformedInput(format!("missing required key '{key}'")))
    };

    let id = ItemId::parse(require("id")?)?;
    let state = ItemState::parse(require("state")?)?;
    let priority = Priority::parse(require("priority")?)?;

    let group = fm
        .scalar("group")
        .map(str::to_string)
        .filter(|g| !g.is_empty());
    let slug = fm
        .scalar("slug")
        .map(str::to_string)
        .unwrap_or_else(|| slugify(&doc.title));

    // Blank dependency entries are discarded, never treated as errors.
    let mut dependencies = Vec::new();
    if let Some(raw_deps) = fm.list("dependencies") {
        for raw in raw_deps {
            if raw.trim().is_empty() {
                continue;
            }
            dependencies.push(ItemId::parse(raw)?);
        }
    }

    let external_ref = fm.scalar("external_ref").map(|ext_id| ExternalRef {
        id: ext_id.to_string(),
        url: fm.scalar("external_url").map(str::to_string),
    });

    let parse_time = |key: &str| -> Result<Option<DateTime<Utc>>> {
        match fm.scalar(key) {
            Some(raw) if !raw.is_empty() => DateTime::parse_from_rfc3339(raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|err| Error::MalformedInput(format!("bad timestamp in '{key}': {err}"))),
            _ => Ok(None),
        }
    };

    Ok(Item {
        id,
        state,
        priority,
        group,
        external_ref,
        dependencies,
        title: doc.title.clone(),
        body: doc.body.clone(),
        slug,
        completed_at: parse_time("completed_at")?,
        blocked_at: parse_time("blocked_at")?,
        blocked_reason: fm
            .scalar("blocked_reason")
            .map(str::to_string)
            .filter(|r| !r.is_empty()),
        result_ref: fm
            .scalar("result_ref")
            .map(str::to_string)
            .filter(|r| !r.is_empty()),
    })
}

fn encode(item: &Item) -> Document {
    let mut fm = FrontMatter::new();
    fm.set("id", Value::scalar(item.id.to_string()));
    fm.set("state", Value::scalar(item.state.as_str()));
    fm.set("priority", Value::scalar(item.priority.as_str()));
    fm.set("slug", Value::scalar(item.slug.clone()));
    if let Some(group) = &item.group {
        fm.set("group", Value::quoted(group.clone()));
    }
    fm.set(
        "dependencies",
        Value::List(item.dependencies.iter().map(ToString::to_string).collect()),
    );
    if let Some(ext) = &item.external_ref {
        fm.set("external_ref", Value::scalar(ext.id.clone()));
        if let Some(url) = &ext.url {
            fm.set("external_url", Value::quoted(url.clone()));
        }
    }
    if let Some(at) = &item.completed_at {
        fm.set("completed_at", Value::scalar(at.to_rfc3339()));
    }
    if let Some(at) = &item.blocked_at {
        fm.set("blocked_at", Value::scalar(at.to_rfc3339()));
    }
    if let Some(reason) = &item.blocked_reason {
        fm.set("blocked_reason", Value::quoted(reason.clone()));
    }
    if let Some(result_ref) = &item.result_ref {
        fm.set("result_ref", Value::quoted(result_ref.clone()));
    }

    Document {
        front_matter: fm,
        title: item.title.clone(),
        body: item.body.clone(),
    }
}

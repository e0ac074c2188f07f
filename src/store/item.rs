use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a slug derived from an item title.
const MAX_SLUG_LEN: usize = 40;

/// Numeric item identifier, zero-padded to three digits in filenames.
/// Immutable once assigned; dependency references use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u32);

impl ItemId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Parse an id from its zero-padded textual form ("001" or "1").
    pub fn parse(raw: &str) -> Result<Self> {
        raw.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|_| Error::MalformedInput(format!("invalid item id '{raw}'")))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::InProgress => "in_progress",
            ItemState::Completed => "completed",
            ItemState::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(ItemState::Pending),
            "in_progress" => Ok(ItemState::InProgress),
            "completed" => Ok(ItemState::Completed),
            "blocked" => Ok(ItemState::Blocked),
            other => Err(Error::MalformedInput(format!("invalid item state '{other}'"))),
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-tier ordinal priority; lower rank is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P1 => "p1",
            Priority::P2 => "p2",
            Priority::P3 => "p3",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "p1" | "P1" => Ok(Priority::P1),
            "p2" | "P2" => Ok(Priority::P2),
            "p3" | "P3" => Ok(Priority::P3),
            other => Err(Error::MalformedInput(format!("invalid priority '{other}'"))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link to the system-of-record, absent until first sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    /// Short code of the external record (e.g. "17" or "REC-17").
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A unit of work persisted as a front-matter file in the items directory.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: ItemId,
    pub state: ItemState,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
    pub dependencies: Vec<ItemId>,
    pub title: String,
    pub body: String,
    /// Derived from the title at creation time, never re-derived.
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

impl Item {
    /// Filename encoding `(id, state, priority, slug)`. Regenerated from the
    /// current fields on every write; never a source of truth for state.
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}-{}.md", self.id, self.state, self.priority, self.slug)
    }
}

/// Fields required to create a new item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemDraft {
    pub title: String,
    pub priority: Option<Priority>,
    pub group: Option<String>,
    pub dependencies: Vec<ItemId>,
    pub body: String,
}

/// Lowercase the title, collapse runs of non-alphanumerics into single
/// separators, and bound the length.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_sep = true;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('-');
            last_was_sep = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        "item".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extract the numeric id from an item filename. Only the leading id segment
/// is trusted; state and priority are always read from the file content.
pub fn id_from_file_name(name: &str) -> Option<ItemId> {
    let stem = name.strip_suffix(".md")?;
    let (id_part, _) = stem.split_once('-')?;
    id_part.parse::<u32>().ok().map(ItemId::new)
}

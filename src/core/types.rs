//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between components. They must not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a feature in the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl FeatureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Completed and failed features are never drawn by the batcher and
    /// ignore retry requests.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// An atomic unit of work. Ids are assigned at ingest and preserved forever;
/// within a category they encode dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    /// Ordered, human-readable verification steps.
    pub steps: Vec<String>,
    pub status: FeatureStatus,
    pub retries: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Ingest-time feature description (no status or bookkeeping fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

/// Exactly-one-of scoping for a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteScope {
    Feature(i64),
    Category(String),
    Global,
}

/// Free-text context attached to a feature, a category, or the whole run.
/// Notes are append-only; the core never mutates or deletes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: i64,
    pub feature_id: Option<i64>,
    pub category: Option<String>,
    pub content: String,
    pub session_id: Option<i64>,
    pub created_at: String,
}

impl Note {
    /// Short scope label for display ("feature 3", "category ui", "global").
    pub fn scope_label(&self) -> String {
        match (self.feature_id, self.category.as_deref()) {
            (Some(id), _) => format!("feature {id}"),
            (None, Some(cat)) => format!("category {cat}"),
            (None, None) => "global".to_string(),
        }
    }
}

/// Status of a session row. Exactly one terminal transition is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Terminal stats written exactly once when a session row is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    pub status: SessionStatus,
    pub features_attempted: u32,
    pub features_completed: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub error: Option<String>,
}

/// A persisted session row, read back for reporting and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: SessionStatus,
    pub features_attempted: u32,
    pub features_completed: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub error: Option<String>,
}

/// Per-status feature counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub failed: u32,
}

impl StatusCounts {
    pub fn bump(&mut self, status: FeatureStatus, count: u32) {
        match status {
            FeatureStatus::Pending => self.pending += count,
            FeatureStatus::InProgress => self.in_progress += count,
            FeatureStatus::Completed => self.completed += count,
            FeatureStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u32 {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// Global and per-category progress counts. Categories are ordered by their
/// lowest feature id, matching batcher order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KanbanStats {
    pub total: StatusCounts,
    pub by_category: Vec<(String, StatusCounts)>,
}

//! Control tool surface: the operations the agent may invoke against the
//! store during a session.
//!
//! This is the only write path from the agent into state. Each operation
//! takes a JSON input object, validates it fully before touching the store,
//! and returns a human-readable result string. Malformed input produces a
//! structured error, never a state change.

use serde_json::Value;
use thiserror::Error;

use crate::core::types::{FeatureStatus, KanbanStats, NoteScope};
use crate::io::store::Store;

/// Tool names, in the order they are documented to the agent.
pub const TOOL_NAMES: [&str; 7] = [
    "feature_status",
    "feature_note",
    "category_note",
    "global_note",
    "get_notes",
    "get_stats",
    "list_features",
];

const DEFAULT_LIST_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown feature id {0}")]
    UnknownFeature(i64),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Dispatch one tool invocation.
///
/// `session_id` is the active session (from the agent environment) recorded
/// on every note insertion. `max_retries` bounds the retry counter for
/// `feature_status` with status pending.
pub fn handle_tool(
    store: &mut Store,
    session_id: Option<i64>,
    max_retries: u32,
    name: &str,
    input: &Value,
) -> Result<String, ToolError> {
    match name {
        "feature_status" => feature_status(store, max_retries, input),
        "feature_note" => feature_note(store, session_id, input),
        "category_note" => category_note(store, session_id, input),
        "global_note" => global_note(store, session_id, input),
        "get_notes" => get_notes(store, input),
        "get_stats" => get_stats(store, input),
        "list_features" => list_features(store, input),
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

fn feature_status(
    store: &mut Store,
    max_retries: u32,
    input: &Value,
) -> Result<String, ToolError> {
    let id = require_id(input)?;
    let status_raw = require_str(input, "status")?.to_string();
    let status = match status_raw.as_str() {
        "pending" | "in_progress" | "completed" => {
            FeatureStatus::parse(&status_raw).expect("validated vocabulary")
        }
        other => {
            return Err(ToolError::InvalidInput(format!(
                "status must be one of in_progress, completed, pending (got '{other}')"
            )));
        }
    };
    let feature = store.feature(id)?.ok_or(ToolError::UnknownFeature(id))?;

    if status == FeatureStatus::Pending {
        // Pending is a retry request, the only path toward failed.
        if feature.status.is_terminal() {
            return Ok(format!(
                "Feature {id} is already {}; retry request ignored.",
                feature.status.as_str()
            ));
        }
        let (new_status, retries) = store.retry(id, max_retries)?;
        return Ok(if new_status == FeatureStatus::Failed {
            format!(
                "Feature {id} marked failed after {retries} attempts (limit {max_retries})."
            )
        } else {
            format!("Feature {id} returned to pending (retry {retries}/{max_retries}).")
        });
    }

    store.set_status(id, status)?;
    Ok(format!("Feature {id} marked {status_raw}."))
}

fn feature_note(
    store: &mut Store,
    session_id: Option<i64>,
    input: &Value,
) -> Result<String, ToolError> {
    let id = require_id(input)?;
    let content = require_content(input)?;
    ensure_feature_exists(store, id)?;
    store.add_note(&NoteScope::Feature(id), &content, session_id)?;
    Ok(format!("Note added to feature {id}."))
}

fn category_note(
    store: &mut Store,
    session_id: Option<i64>,
    input: &Value,
) -> Result<String, ToolError> {
    let category = require_str(input, "category")?.to_string();
    let content = require_content(input)?;
    store.add_note(&NoteScope::Category(category.clone()), &content, session_id)?;
    Ok(format!("Note added to category {category}."))
}

fn global_note(
    store: &mut Store,
    session_id: Option<i64>,
    input: &Value,
) -> Result<String, ToolError> {
    let content = require_content(input)?;
    store.add_note(&NoteScope::Global, &content, session_id)?;
    Ok("Global note added.".to_string())
}

fn get_notes(store: &mut Store, input: &Value) -> Result<String, ToolError> {
    let feature_id = optional_id(input)?;
    if let Some(id) = feature_id {
        ensure_feature_exists(store, id)?;
    }
    let category = optional_str(input, "category")?;
    let notes = store.notes_for(feature_id, category.as_deref())?;
    if notes.is_empty() {
        return Ok("No notes found.".to_string());
    }
    let lines: Vec<String> = notes
        .iter()
        .map(|note| format!("[{}] ({}) {}", note.id, note.scope_label(), note.content))
        .collect();
    Ok(lines.join("\n"))
}

fn get_stats(store: &mut Store, input: &Value) -> Result<String, ToolError> {
    let by_category = match input.get("by_category") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(other) => {
            return Err(ToolError::InvalidInput(format!(
                "by_category must be a boolean (got {other})"
            )));
        }
    };
    let stats = store.kanban_stats()?;
    Ok(render_stats(&stats, by_category))
}

fn list_features(store: &mut Store, input: &Value) -> Result<String, ToolError> {
    let status = match optional_str(input, "status")? {
        None => FeatureStatus::Pending,
        Some(raw) => FeatureStatus::parse(&raw).ok_or_else(|| {
            ToolError::InvalidInput(format!(
                "status must be one of pending, in_progress, completed, failed (got '{raw}')"
            ))
        })?,
    };
    let limit = match input.get("limit") {
        None | Some(Value::Null) => DEFAULT_LIST_LIMIT,
        Some(value) => value
            .as_u64()
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .ok_or_else(|| {
                ToolError::InvalidInput(format!("limit must be a positive integer (got {value})"))
            })?,
    };

    let features = store.features_by_status(status)?;
    if features.is_empty() {
        return Ok(format!("No {} features.", status.as_str()));
    }
    let mut lines: Vec<String> = features
        .iter()
        .take(limit)
        .map(|f| {
            format!(
                "{} [{}] {} ({}, retries {})",
                f.id,
                f.category,
                f.name,
                f.status.as_str(),
                f.retries
            )
        })
        .collect();
    if features.len() > limit {
        lines.push(format!("... {} more", features.len() - limit));
    }
    Ok(lines.join("\n"))
}

/// Human-readable stats, shared with `foreman status`.
pub fn render_stats(stats: &KanbanStats, by_category: bool) -> String {
    let mut out = format!(
        "pending {}  in_progress {}  completed {}  failed {}  (total {})",
        stats.total.pending,
        stats.total.in_progress,
        stats.total.completed,
        stats.total.failed,
        stats.total.total()
    );
    if by_category {
        for (category, counts) in &stats.by_category {
            out.push_str(&format!(
                "\n{category}: pending {}  in_progress {}  completed {}  failed {}",
                counts.pending, counts.in_progress, counts.completed, counts.failed
            ));
        }
    }
    out
}

fn ensure_feature_exists(store: &Store, id: i64) -> Result<(), ToolError> {
    if store.feature(id)?.is_none() {
        return Err(ToolError::UnknownFeature(id));
    }
    Ok(())
}

fn require_id(input: &Value) -> Result<i64, ToolError> {
    input
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ToolError::InvalidInput("missing integer field 'id'".to_string()))
}

fn optional_id(input: &Value) -> Result<Option<i64>, ToolError> {
    match input.get("id") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or_else(|| {
            ToolError::InvalidInput(format!("'id' must be an integer (got {value})"))
        }),
    }
}

fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    match input.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim()),
        _ => Err(ToolError::InvalidInput(format!(
            "missing non-empty string field '{field}'"
        ))),
    }
}

fn optional_str(input: &Value, field: &str) -> Result<Option<String>, ToolError> {
    match input.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.clone())),
        Some(other) => Err(ToolError::InvalidInput(format!(
            "'{field}' must be a non-empty string (got {other})"
        ))),
    }
}

fn require_content(input: &Value) -> Result<String, ToolError> {
    match input.get("content").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(ToolError::InvalidInput(
            "missing non-empty string field 'content'".to_string(),
        )),
    }
}

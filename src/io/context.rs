//! Bounded session-context assembly.
//!
//! Renders the per-session prompt from a template, then enforces a byte
//! budget by dropping droppable sections (notes first, then progress) and
//! truncating as a last resort. Only category/global notes are injected;
//! feature-scoped notes are fetched by the agent on demand through the tool
//! surface.

use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Feature, Note, StatusCounts};

const SESSION_TEMPLATE: &str = include_str!("prompts/session.md");

/// Everything the context for one session is assembled from.
#[derive(Debug, Clone)]
pub struct ContextInputs<'a> {
    pub category: &'a str,
    pub features: &'a [Feature],
    pub progress: StatusCounts,
    pub notes: &'a [Note],
    pub port: u16,
}

#[derive(Debug, Serialize)]
struct ProgressContext {
    pending: u32,
    in_progress: u32,
    completed: u32,
    failed: u32,
    total: u32,
}

#[derive(Debug, Serialize)]
struct NoteContext {
    scope: String,
    content: String,
}

/// Builds a session context within a byte budget.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    budget_bytes: usize,
}

impl ContextBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, inputs: &ContextInputs<'_>) -> String {
        let rendered = render_template(inputs);
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}

fn render_template(inputs: &ContextInputs<'_>) -> String {
    let mut env = Environment::new();
    env.add_template("session", SESSION_TEMPLATE)
        .expect("session template should be valid");

    let progress = ProgressContext {
        pending: inputs.progress.pending,
        in_progress: inputs.progress.in_progress,
        completed: inputs.progress.completed,
        failed: inputs.progress.failed,
        total: inputs.progress.total(),
    };
    let notes: Vec<NoteContext> = inputs
        .notes
        .iter()
        .map(|note| NoteContext {
            scope: note.scope_label(),
            content: note.content.clone(),
        })
        .collect();
    let first = inputs.features.first();

    env.get_template("session")
        .expect("session template registered")
        .render(context! {
            category => inputs.category,
            features => inputs.features,
            progress => progress,
            notes => notes,
            port => inputs.port,
            first_id => first.map(|f| f.id),
            first_name => first.map(|f| f.name.as_str()),
        })
        .expect("session template rendering should not fail")
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    use std::sync::LazyLock;
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let mut sections = Vec::new();
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();

    for (i, caps) in matches.iter().enumerate() {
        let key = caps.get(1).unwrap().as_str().to_string();
        let required = caps.get(2).unwrap().as_str() == "required";
        let start = caps.get(0).unwrap().end();
        let end = matches
            .get(i + 1)
            .map(|m| m.get(0).unwrap().start())
            .unwrap_or(rendered.len());

        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key,
                required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: notes -> progress.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in ["notes", "progress"] {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped_len = sections[idx].content.len();
            debug!(
                section = key,
                bytes_dropped = dropped_len,
                "dropped context section for budget"
            );
            sections.remove(idx);
        }
    }

    // If still over budget, truncate the largest droppable-by-nature text:
    // the batch section keeps its head, everything after the cut is lost.
    if total_len(sections) > budget && !sections.is_empty() {
        let other_len: usize = sections
            .iter()
            .take(sections.len() - 1)
            .map(|s| s.content.len())
            .sum();
        let allowed = budget.saturating_sub(other_len);
        let last = sections.last_mut().unwrap();
        let before_len = last.content.len();
        if last.content.len() > allowed {
            if allowed > 12 {
                let cut = truncation_boundary(&last.content, allowed - 12);
                last.content.truncate(cut);
                last.content.push_str("\n[truncated]");
            } else {
                let cut = truncation_boundary(&last.content, allowed);
                last.content.truncate(cut);
            }
            debug!(
                section = last.key.as_str(),
                before_len,
                after_len = last.content.len(),
                "truncated context section for budget"
            );
        }
    }
}

/// Largest char boundary at or below `limit`.
fn truncation_boundary(s: &str, limit: usize) -> usize {
    let mut cut = limit.min(s.len());
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FeatureStatus;
    use crate::test_support::feature;

    fn sample_features() -> Vec<Feature> {
        let mut a = feature(1, "cat-x");
        a.name = "Login form".to_string();
        a.steps = vec!["open /login".to_string(), "submit".to_string()];
        let mut b = feature(2, "cat-x");
        b.name = "Logout".to_string();
        vec![a, b]
    }

    fn sample_note(id: i64, content: &str) -> Note {
        Note {
            id,
            feature_id: None,
            category: Some("cat-x".to_string()),
            content: content.to_string(),
            session_id: None,
            created_at: String::new(),
        }
    }

    fn sample_progress() -> StatusCounts {
        let mut progress = StatusCounts::default();
        progress.bump(FeatureStatus::Pending, 2);
        progress.bump(FeatureStatus::Completed, 1);
        progress
    }

    #[test]
    fn context_names_category_features_port_and_first_feature() {
        let features = sample_features();
        let notes = vec![sample_note(1, "watch out for the cache")];
        let content = ContextBuilder::new(40_000).build(&ContextInputs {
            category: "cat-x",
            features: &features,
            progress: sample_progress(),
            notes: &notes,
            port: 3000,
        });

        assert!(content.contains("category=\"cat-x\""));
        assert!(content.contains("Feature 1: Login form"));
        assert!(content.contains("1. open /login"));
        assert!(content.contains("port 3000"));
        assert!(content.contains("watch out for the cache"));
        assert!(content.contains("Begin with feature 1 (Login form)"));
    }

    #[test]
    fn sections_render_in_stable_order() {
        let features = sample_features();
        let notes = vec![sample_note(1, "note body")];
        let content = ContextBuilder::new(40_000).build(&ContextInputs {
            category: "cat-x",
            features: &features,
            progress: sample_progress(),
            notes: &notes,
            port: 3000,
        });

        let contract = content.find("<contract>").expect("contract");
        let batch = content.find("<features").expect("features");
        let progress = content.find("<progress>").expect("progress");
        let notes_pos = content.find("<notes>").expect("notes");
        let server = content.find("<environment>").expect("environment");
        assert!(contract < batch && batch < progress && progress < notes_pos);
        assert!(notes_pos < server);
    }

    #[test]
    fn budget_drops_notes_before_progress() {
        let features = sample_features();
        let notes: Vec<Note> = (0..50)
            .map(|i| sample_note(i, &format!("note {i} {}", "x".repeat(40))))
            .collect();
        let full = ContextBuilder::new(40_000).build(&ContextInputs {
            category: "cat-x",
            features: &features,
            progress: sample_progress(),
            notes: &notes,
            port: 3000,
        });
        let tight = ContextBuilder::new(full.len() - 100).build(&ContextInputs {
            category: "cat-x",
            features: &features,
            progress: sample_progress(),
            notes: &notes,
            port: 3000,
        });

        assert!(!tight.contains("<notes>"), "notes should be dropped");
        assert!(tight.contains("<progress>"), "progress should remain");
        assert!(tight.contains("<contract>"), "contract should remain");
        assert!(tight.contains("Begin with feature 1"));
    }

    #[test]
    fn empty_notes_render_no_notes_section() {
        let features = sample_features();
        let content = ContextBuilder::new(40_000).build(&ContextInputs {
            category: "cat-x",
            features: &features,
            progress: sample_progress(),
            notes: &[],
            port: 3000,
        });
        assert!(!content.contains("<notes>"));
    }
}

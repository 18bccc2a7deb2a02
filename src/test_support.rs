//! Test-only helpers: feature builders, project bootstrap, and a scripted
//! executor that replays agent behavior without spawning processes.
//!
//! The scripted executor's tool actions open a second store connection at
//! the project path from the invocation environment, exactly as the real
//! agent does through `foreman tool`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use crate::core::events::{
    AgentEvent, AssistantMessage, ContentBlock, ResultEvent, SystemEvent, Usage,
};
use crate::core::types::{Feature, FeatureSpec, FeatureStatus};
use crate::io::config::load_config;
use crate::io::executor::{AgentExecutor, AgentInvocation};
use crate::io::paths::ProjectPaths;
use crate::io::store::Store;
use crate::io::tools::handle_tool;

/// Create a deterministic feature spec.
pub fn spec(id: i64, name: &str, category: &str) -> FeatureSpec {
    FeatureSpec {
        id,
        name: name.to_string(),
        description: format!("{name} description"),
        category: category.to_string(),
        steps: Vec::new(),
    }
}

/// Create a feature spec with explicit verification steps.
pub fn spec_with_steps(id: i64, name: &str, category: &str, steps: &[&str]) -> FeatureSpec {
    FeatureSpec {
        steps: steps.iter().map(|s| s.to_string()).collect(),
        ..spec(id, name, category)
    }
}

/// Create a deterministic pending feature row (for pure core tests).
pub fn feature(id: i64, category: &str) -> Feature {
    Feature {
        id,
        name: format!("feature-{id}"),
        description: format!("feature-{id} description"),
        category: category.to_string(),
        steps: Vec::new(),
        status: FeatureStatus::Pending,
        retries: 0,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

/// Bootstrap a project directory: create the state dir, ingest `specs`, and
/// return the resolved paths. The store handle is dropped so callers and
/// scripted tool actions reopen their own connections.
pub fn init_project(root: &Path, specs: &[FeatureSpec]) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    let mut store = Store::open(&paths.db_path)?;
    store.ingest(specs)?;
    Ok(paths)
}

/// One scripted step of an agent session.
#[derive(Debug, Clone)]
pub enum ScriptedAction {
    /// Deliver an event to the runner's observer.
    Event(AgentEvent),
    /// Apply a tool call through a second store connection, then deliver the
    /// matching tool_use event.
    Tool { name: String, input: Value },
}

impl ScriptedAction {
    pub fn tool(name: &str, input: Value) -> Self {
        Self::Tool {
            name: name.to_string(),
            input,
        }
    }
}

/// A scripted agent session: actions in order, then an optional terminal
/// error (simulating a crash or non-zero exit).
#[derive(Debug, Clone, Default)]
pub struct ScriptedSession {
    pub actions: Vec<ScriptedAction>,
    pub error: Option<String>,
}

/// Executor double that replays queued scripted sessions.
pub struct ScriptedExecutor {
    sessions: RefCell<VecDeque<ScriptedSession>>,
}

impl ScriptedExecutor {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            sessions: RefCell::new(sessions.into()),
        }
    }
}

impl AgentExecutor for ScriptedExecutor {
    fn run(
        &self,
        invocation: &AgentInvocation,
        on_event: &mut dyn FnMut(&AgentEvent) -> Result<()>,
    ) -> Result<()> {
        let session = self
            .sessions
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted session queued"))?;

        let project_dir = env_value(invocation, "FOREMAN_PROJECT_DIR")
            .ok_or_else(|| anyhow!("invocation missing FOREMAN_PROJECT_DIR"))?;
        let session_id = env_value(invocation, "FOREMAN_SESSION_ID")
            .and_then(|raw| raw.parse::<i64>().ok());
        let paths = ProjectPaths::new(Path::new(&project_dir));

        on_event(&ev_init())?;
        for action in session.actions {
            match action {
                ScriptedAction::Event(event) => on_event(&event)?,
                ScriptedAction::Tool { name, input } => {
                    let mut store =
                        Store::open_existing(&paths.db_path).context("scripted tool store")?;
                    let config = load_config(&paths.config_path)?;
                    handle_tool(&mut store, session_id, config.max_retries, &name, &input)
                        .map_err(|err| anyhow!("scripted tool '{name}' failed: {err}"))?;
                    on_event(&ev_tool_use(&name, input))?;
                }
            }
        }

        if let Some(error) = session.error {
            return Err(anyhow!(error));
        }
        Ok(())
    }
}

fn env_value(invocation: &AgentInvocation, key: &str) -> Option<String> {
    invocation
        .env
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

pub fn ev_init() -> AgentEvent {
    AgentEvent::System(SystemEvent {
        subtype: "init".to_string(),
        session_id: "scripted".to_string(),
        model: "scripted-model".to_string(),
    })
}

pub fn ev_text(text: &str) -> AgentEvent {
    AgentEvent::Assistant {
        message: AssistantMessage {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        },
    }
}

pub fn ev_tool_use(name: &str, input: Value) -> AgentEvent {
    AgentEvent::Assistant {
        message: AssistantMessage {
            content: vec![ContentBlock::ToolUse {
                name: name.to_string(),
                input,
            }],
        },
    }
}

pub fn ev_result_success(input_tokens: u64, output_tokens: u64, cost: f64) -> AgentEvent {
    AgentEvent::Result(ResultEvent {
        subtype: "success".to_string(),
        usage: Usage {
            input_tokens,
            output_tokens,
        },
        total_cost_usd: cost,
    })
}

pub fn ev_result_error(subtype: &str) -> AgentEvent {
    AgentEvent::Result(ResultEvent {
        subtype: subtype.to_string(),
        ..ResultEvent::default()
    })
}

/// A session that works every listed feature to completion and succeeds.
pub fn completing_session(ids: &[i64]) -> ScriptedSession {
    let mut actions = Vec::new();
    for &id in ids {
        actions.push(ScriptedAction::tool(
            "feature_status",
            serde_json::json!({"id": id, "status": "in_progress"}),
        ));
        actions.push(ScriptedAction::tool(
            "feature_status",
            serde_json::json!({"id": id, "status": "completed"}),
        ));
    }
    actions.push(ScriptedAction::Event(ev_result_success(1200, 400, 0.25)));
    ScriptedSession {
        actions,
        error: None,
    }
}

/// A session that hands every listed feature back for retry and succeeds.
pub fn retrying_session(ids: &[i64]) -> ScriptedSession {
    let mut actions = Vec::new();
    for &id in ids {
        actions.push(ScriptedAction::tool(
            "feature_status",
            serde_json::json!({"id": id, "status": "pending"}),
        ));
    }
    actions.push(ScriptedAction::Event(ev_result_success(800, 200, 0.1)));
    ScriptedSession {
        actions,
        error: None,
    }
}

/// A session that dies after stream startup, before any tool call.
pub fn crashing_session(message: &str) -> ScriptedSession {
    ScriptedSession {
        actions: Vec::new(),
        error: Some(message.to_string()),
    }
}

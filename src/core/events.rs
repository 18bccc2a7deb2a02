//! Typed model of the agent's JSONL event stream.
//!
//! The agent subprocess emits one JSON object per stdout line. The runner
//! recognizes three kinds (an init event, assistant messages with text and
//! tool-use blocks, and a terminal result carrying usage and cost) and
//! skips any other well-formed event. A line that is not valid JSON for
//! this model is a stream error and fails the iteration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event from the agent stream, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    System(SystemEvent),
    Assistant { message: AssistantMessage },
    Result(ResultEvent),
    /// Any event kind this runner does not consume (tool results, progress
    /// ticks). Logged at debug level and otherwise ignored.
    #[serde(other)]
    Other,
}

/// Stream bootstrap event carrying the agent-side session identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// A block inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Terminal event: final usage, cost, and a subtype distinguishing success
/// from agent-reported error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl ResultEvent {
    pub fn is_success(&self) -> bool {
        self.subtype == "success"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Parse one stream line into an event.
pub fn parse_event(line: &str) -> serde_json::Result<AgentEvent> {
    serde_json::from_str(line)
}

/// True when `block` is a `feature_status` tool call claiming completion.
/// Feeds the runner's informational claimed-completion counter; the
/// authoritative count is the completed-stat delta measured across the
/// session.
pub fn claims_completion(block: &ContentBlock) -> bool {
    let ContentBlock::ToolUse { name, input } = block else {
        return false;
    };
    name == "feature_status"
        && input.get("status").and_then(Value::as_str) == Some("completed")
}

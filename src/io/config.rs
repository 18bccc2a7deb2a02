//! Orchestrator configuration stored under `.autonomous/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum features selected into one session.
    pub batch_size: usize,

    /// Retry requests beyond this count mark a feature failed.
    pub max_retries: u32,

    /// Consecutive failed sessions before the loop stops (unless forced).
    pub breaker_threshold: u32,

    /// Sleep between a failed session and the next attempt, in seconds.
    pub failure_backoff_secs: u64,

    /// In-progress features older than this many hours are released at startup.
    pub stale_hours: i64,

    /// Category/global notes injected into the session context, newest first.
    pub context_notes: usize,

    /// Maximum bytes for the session context before dropping sections.
    pub prompt_budget_bytes: usize,

    /// Wall-clock limit for one agent invocation, in seconds. 0 disables it.
    pub session_timeout_secs: u64,

    /// Truncate captured agent stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Dev-server port handed to the agent.
    pub port: u16,

    /// Template directory exported to the agent environment, if any.
    pub template_dir: Option<PathBuf>,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command to spawn for one agent session. The prompt is written to its
    /// stdin; events are read from its stdout as JSONL.
    pub command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_retries: 3,
            breaker_threshold: 3,
            failure_backoff_secs: 5,
            stale_hours: 2,
            context_notes: 10,
            prompt_budget_bytes: 40_000,
            session_timeout_secs: 0,
            output_limit_bytes: 200_000,
            port: 3000,
            template_dir: None,
            agent: AgentConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.breaker_threshold == 0 {
            return Err(anyhow!("breaker_threshold must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.stale_hours <= 0 {
            return Err(anyhow!("stale_hours must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = OrchestratorConfig {
            batch_size: 5,
            port: 4111,
            ..OrchestratorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cfg = OrchestratorConfig {
            batch_size: 0,
            ..OrchestratorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_agent_command_is_rejected() {
        let cfg = OrchestratorConfig {
            agent: AgentConfig {
                command: Vec::new(),
            },
            ..OrchestratorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

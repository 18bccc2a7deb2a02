//! Executor abstraction for agent invocation.
//!
//! The [`AgentExecutor`] trait decouples session orchestration from the
//! actual agent backend (by default the configured `agent.command`). Tests
//! use scripted executors that replay events and tool calls without spawning
//! processes.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::events::{AgentEvent, parse_event};
use crate::io::process::{StreamRequest, run_streaming};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// Working directory for the agent process (the target project).
    pub workdir: PathBuf,
    /// Assembled session context plus instruction text, fed via stdin.
    pub prompt: String,
    /// Environment exported to the agent (project dir, session id, template
    /// dir, port, headless flag).
    pub env: Vec<(String, String)>,
    /// Model override appended to the agent command when set.
    pub model: Option<String>,
    /// Wall-clock limit for the invocation. `None` disables it.
    pub timeout: Option<Duration>,
    /// Bound on captured agent stderr.
    pub output_limit_bytes: usize,
}

/// Abstraction over agent execution backends.
pub trait AgentExecutor {
    /// Run the agent, delivering every stream event to `on_event` in order.
    /// Returns only after the agent has terminated.
    fn run(
        &self,
        invocation: &AgentInvocation,
        on_event: &mut dyn FnMut(&AgentEvent) -> Result<()>,
    ) -> Result<()>;
}

/// Executor that spawns the configured agent command.
pub struct ProcessExecutor {
    command: Vec<String>,
    cancel: Option<Arc<AtomicBool>>,
}

impl ProcessExecutor {
    pub fn new(command: Vec<String>, cancel: Option<Arc<AtomicBool>>) -> Self {
        Self { command, cancel }
    }
}

impl AgentExecutor for ProcessExecutor {
    #[instrument(skip_all, fields(timeout_secs = invocation.timeout.map(|t| t.as_secs())))]
    fn run(
        &self,
        invocation: &AgentInvocation,
        on_event: &mut dyn FnMut(&AgentEvent) -> Result<()>,
    ) -> Result<()> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(
            command = %program,
            workdir = %invocation.workdir.display(),
            "starting agent"
        );

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]);
        if let Some(model) = &invocation.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&invocation.workdir);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let outcome = run_streaming(
            cmd,
            &StreamRequest {
                stdin: invocation.prompt.as_bytes(),
                timeout: invocation.timeout,
                output_limit_bytes: invocation.output_limit_bytes,
                cancel: self.cancel.as_deref(),
            },
            &mut |line| {
                let event = parse_event(line)
                    .with_context(|| format!("parse agent event: {}", truncate(line, 200)))?;
                on_event(&event)
            },
        )?;

        if outcome.timed_out {
            warn!("agent timed out");
            return Err(anyhow!(
                "agent timed out after {:?}",
                invocation.timeout.unwrap_or_default()
            ));
        }
        if !outcome.status.success() {
            warn!(exit_code = ?outcome.status.code(), "agent failed");
            return Err(anyhow!(
                "agent exited with status {:?}: {}",
                outcome.status.code(),
                outcome.stderr_tail(2048)
            ));
        }

        debug!("agent completed");
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::AgentEvent;

    fn invocation(workdir: &std::path::Path) -> AgentInvocation {
        AgentInvocation {
            workdir: workdir.to_path_buf(),
            prompt: String::new(),
            env: Vec::new(),
            model: None,
            timeout: Some(Duration::from_secs(10)),
            output_limit_bytes: 4096,
        }
    }

    #[test]
    fn parses_each_stdout_line_into_an_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ProcessExecutor::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"printf '{"type":"system","subtype":"init"}\n{"type":"result","subtype":"success"}\n'"#
                    .to_string(),
            ],
            None,
        );

        let mut events = Vec::new();
        executor
            .run(&invocation(temp.path()), &mut |event| {
                events.push(event.clone());
                Ok(())
            })
            .expect("run");

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AgentEvent::System(_)));
        assert!(matches!(events[1], AgentEvent::Result(_)));
    }

    #[test]
    fn malformed_stream_line_fails_the_invocation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ProcessExecutor::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf 'not json\\n'".to_string(),
            ],
            None,
        );

        let err = executor
            .run(&invocation(temp.path()), &mut |_| Ok(()))
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("parse agent event"), "{message}");
    }

    #[test]
    fn nonzero_exit_is_an_error_with_stderr_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ProcessExecutor::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo boom >&2; exit 3".to_string(),
            ],
            None,
        );

        let err = executor
            .run(&invocation(temp.path()), &mut |_| Ok(()))
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("boom"), "{message}");
    }
}

//! Append-only per-session transcript logs under `.autonomous/`.
//!
//! One file per session, human-readable: agent text, tool calls, runner
//! annotations, and a final stats block. Product artifacts, written
//! regardless of `RUST_LOG`; no programmatic consumer.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::SessionClose;

pub struct SessionLog {
    file: File,
    path: PathBuf,
}

impl SessionLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open session log {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, flushed immediately so a crash mid-session leaves a
    /// usable transcript.
    pub fn line(&mut self, text: &str) -> Result<()> {
        writeln!(self.file, "{text}")
            .and_then(|()| self.file.flush())
            .with_context(|| format!("write session log {}", self.path.display()))
    }

    /// Final stats block, appended once when the session closes.
    pub fn stats_block(&mut self, close: &SessionClose) -> Result<()> {
        self.line("")?;
        self.line("=== session stats ===")?;
        self.line(&format!("status: {}", close.status.as_str()))?;
        self.line(&format!(
            "features: attempted {}, verified {}",
            close.features_attempted, close.features_completed
        ))?;
        self.line(&format!(
            "tokens: in {}, out {}",
            close.input_tokens, close.output_tokens
        ))?;
        self.line(&format!("cost: ${:.4}", close.cost))?;
        if let Some(error) = &close.error {
            self.line(&format!("error: {error}"))?;
        }
        Ok(())
    }
}

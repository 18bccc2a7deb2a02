//! Startup sweep that re-normalizes state left behind by a prior crash.
//!
//! Runs exactly once, before the first session. In-progress features can
//! only come from a crashed session (the batcher never marks them, and a
//! clean session always normalizes them), so they are returned to pending.
//! The stale sweep is a second net for the unexpected multi-process case:
//! release rather than block forever.

use anyhow::Result;
use tracing::info;

use crate::io::store::Store;

/// Counts reported by the startup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphans_reset: usize,
    pub stale_reset: usize,
}

/// Reset orphaned and stale in-progress features to pending.
///
/// Logs both counts; never fails the run for a non-zero count.
pub fn run_recovery(store: &mut Store, stale_hours: i64) -> Result<RecoveryReport> {
    let orphans_reset = store.reset_orphans()?;
    if orphans_reset > 0 {
        info!(count = orphans_reset, "reset orphaned in-progress features");
    }
    let stale_reset = store.reset_stale(stale_hours)?;
    if stale_reset > 0 {
        info!(
            count = stale_reset,
            hours = stale_hours,
            "reset stale in-progress features"
        );
    }
    Ok(RecoveryReport {
        orphans_reset,
        stale_reset,
    })
}

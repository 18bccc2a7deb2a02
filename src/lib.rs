//! Feature-queue orchestrator for autonomous coding agents.
//!
//! Drives an external code-generation agent through a SQLite-backed queue of
//! feature specs (`.autonomous/db.sqlite3`) until every feature is verified
//! complete or permanently failed. One session at a time: select a batch
//! from the first incomplete category, hand the agent a bounded context,
//! observe its event stream, and reconcile what it claims against what the
//! store says.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod recovery;
pub mod session;
pub mod test_support;
pub mod validate;

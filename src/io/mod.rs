//! Side-effecting layer: the SQLite store, configuration, path resolution,
//! context assembly, agent process execution, session logs, and the control
//! tool surface the agent calls back into.

pub mod config;
pub mod context;
pub mod executor;
pub mod paths;
pub mod process;
pub mod session_log;
pub mod store;
pub mod tools;

//! Stable exit codes for foreman CLI commands.

/// Command succeeded; also used when the loop stops at the iteration cap,
/// on a circuit-breaker trip (with an advisory), or on SIGINT/SIGTERM.
pub const OK: i32 = 0;
/// Configuration or validation failure (missing store, contiguity violation,
/// bad input).
pub const INVALID: i32 = 1;

//! Pure, deterministic core logic: shared types, the agent event model,
//! the category-contiguity check, and the circuit breaker. Nothing in this
//! module touches the filesystem, the database, or a subprocess.

pub mod breaker;
pub mod contiguity;
pub mod events;
pub mod types;

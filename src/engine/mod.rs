//! Engine modules: from resolved configuration to executed workflows.
//!
//! - `planner`: dependency-respecting, deterministic execution order
//! - `store`: durable workflow records (atomic writes, backups, locks)
//! - `executor`: runs one module at a time and persists every transition

pub mod executor;
pub mod planner;
pub mod store;

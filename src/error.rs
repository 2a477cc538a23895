//! Error handling module for docflow
//!
//! Provides the crate-wide error type. Component errors (`RegistryError`,
//! `PlanningError`, `PersistenceError`, `TransitionError`) live next to the
//! code that raises them and convert into [`DocflowError`] through `From`.

use std::time::Duration;

use thiserror::Error;

use crate::engine::planner::PlanningError;
use crate::engine::store::PersistenceError;
use crate::module_manifest::RegistryError;
use crate::workflow_state::TransitionError;

/// Main error type for docflow
#[derive(Error, Debug)]
pub enum DocflowError {
    /// Module catalogue is inconsistent (duplicates, dangling dependencies)
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Contradictory or invalid configuration; `key` names the offending entry
    #[error("Configuration error at '{key}': {reason}")]
    Configuration { key: String, reason: String },

    /// Cycle or unsatisfied dependency; raised before any workflow exists
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    /// A module reported failure or crashed
    #[error("Module '{module}' failed: {reason}")]
    Execution { module: String, reason: String },

    /// A module did not return within its time bound
    #[error("Module '{module}' timed out after {timeout:?}")]
    Timeout { module: String, timeout: Duration },

    /// Write failure, corruption or a concurrent-modification conflict
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Illegal module or workflow state change
    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for docflow operations
pub type Result<T> = std::result::Result<T, DocflowError>;

impl DocflowError {
    /// Create a configuration error for a specific key
    pub fn configuration(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an execution error for a module
    pub fn execution(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Stable category name, used by the CLI for exit codes and JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registry(_) => "registry",
            Self::Configuration { .. } => "configuration",
            Self::Planning(_) => "planning",
            Self::Execution { .. } => "execution",
            Self::Timeout { .. } => "timeout",
            Self::Persistence(
                PersistenceError::ConcurrentModification { .. } | PersistenceError::Busy { .. },
            ) => "concurrent-modification",
            Self::Persistence(_) => "persistence",
            Self::Transition(_) => "transition",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Returns true if another invocation changed the workflow underneath us
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(
            self,
            Self::Persistence(
                PersistenceError::ConcurrentModification { .. } | PersistenceError::Busy { .. }
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_key() {
        let err = DocflowError::configuration("preferences.modules.EntityRef", "module is required");
        assert_eq!(
            err.to_string(),
            "Configuration error at 'preferences.modules.EntityRef': module is required"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DocflowError = io_err.into();
        assert!(matches!(err, DocflowError::Io(_)));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_timeout_names_module_and_bound() {
        let err = DocflowError::Timeout {
            module: "Migrate".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("Migrate"));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_concurrent_modification_kind() {
        let err: DocflowError = PersistenceError::ConcurrentModification {
            name: "docs".to_string(),
            expected: 3,
            found: 4,
        }
        .into();
        assert!(err.is_concurrent_modification());
        assert_eq!(err.kind(), "concurrent-modification");
    }
}

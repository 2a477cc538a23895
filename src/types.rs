//! Type-safe status and classification enums for docflow
//!
//! Statuses are persisted inside workflow records and printed by the CLI, so
//! every enum here round-trips through both serde (lowercase JSON strings) and
//! strum (lowercase `Display` / `FromStr`).

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Release maturity of a module as declared by its developer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Maturity {
    Experimental,
    Preview,
    #[default]
    Stable,
}

/// Execution status of one module inside a workflow
///
/// ```text
/// Pending ──> Running ──> Completed
///    ^           │
///    │           v
///    └─retry── Failed
///
/// (any non-completed state may move to Skipped, which is terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModuleStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ModuleStatus {
    /// Returns true once the module will not run again without operator action
    #[inline]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if the module blocks its dependents permanently
    #[inline]
    pub const fn blocks_dependents(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }

    /// Returns true if `self -> to` is a legal state-machine transition.
    ///
    /// Resets are not transitions; they are handled by
    /// [`ModuleExecutionState::reset`](crate::workflow_state::ModuleExecutionState::reset).
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Failed, Self::Pending)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Skipped)
                | (Self::Failed, Self::Skipped)
        )
    }
}

/// Lifecycle status of a whole workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Completed,
    Failed,
    Abandoned,
}

impl WorkflowStatus {
    /// Completed and Failed are terminal; Abandoned can be reactivated
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Completed)
                | (Self::Active, Self::Failed)
                | (Self::Active, Self::Abandoned)
                | (Self::Abandoned, Self::Active)
        )
    }
}

/// Terminal status reported by a module implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

//! docflow Library
//!
//! Plans and runs document-processing modules against a target directory as
//! durable, resumable workflows.
//!
//! - `module_manifest`: module registry (descriptors and implementations)
//! - `config_file` / `logic::resolver`: developer manifest, user preferences,
//!   and the enable/disable decision for each module
//! - `engine::planner`: deterministic dependency ordering
//! - `workflow_state`: per-workflow state machine
//! - `engine::store` / `engine::executor`: persistence and execution

pub mod cli;
pub mod config;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod logic;
pub mod module_manifest;
pub mod module_runner;
pub mod module_traits;
pub mod process_guard;
pub mod toolkit;
pub mod types;
pub mod workflow_state;

// Re-export main types for convenience
pub use config::{Settings, SettingsOverrides};
pub use config_file::{ConfigWarning, DeveloperConfig, DeveloperManifest, UserPreferences, parse_overrides};
pub use engine::executor::{RunReport, StepReport, WorkflowEngine};
pub use engine::planner::{PlanEntry, PlanningError, ResolvedPlan, build_plan};
pub use engine::store::{PersistenceError, WorkflowListing, WorkflowStore};
pub use error::{DocflowError, Result};
pub use logic::resolver::{Resolution, resolve};
pub use module_manifest::{ModuleDescriptor, ModuleRegistry, RegistryError};
pub use module_runner::CommandModule;
pub use module_traits::{DocumentModule, ModuleContext, ModuleOutcome};
pub use toolkit::Toolkit;
pub use types::{Maturity, ModuleStatus, OutcomeStatus, WorkflowStatus};
pub use workflow_state::{StatusSummary, TransitionError, Workflow};

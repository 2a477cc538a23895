//! Workflow State Machine
//!
//! The durable unit of progress: a named workflow over one target directory,
//! built from a plan snapshot, tracking one [`ModuleExecutionState`] per
//! enabled module.
//!
//! # Design Principles
//!
//! - **Single Source of Truth**: nothing outside this type mutates module states
//! - **Validated Transitions**: every status change goes through
//!   [`ModuleStatus::can_transition_to`] / [`WorkflowStatus::can_transition_to`]
//!   or an explicit, recorded reset
//! - **No Silent History Loss**: every change appends a [`TransitionRecord`]
//! - **Status Before Payload**: an outcome's status decides the transition; a
//!   failed outcome can never be recorded as completed
//!
//! # Module Flow
//!
//! ```text
//! pending ──> running ──> completed
//!    ^           │
//!    │           v
//!    └─retry─ failed
//!
//! pending | running | failed ──> skipped   (cascade or explicit, terminal)
//! ```
//!
//! Persistence, locking and module invocation live in
//! [`engine::executor`](crate::engine::executor); this module is pure state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::planner::ResolvedPlan;
use crate::module_traits::ModuleOutcome;
use crate::types::{ModuleStatus, OutcomeStatus, WorkflowStatus};

/// Current on-disk record format
pub const FORMAT_VERSION: u32 = 1;

/// `last_error` written for modules found `running` with nobody holding the lock
pub const INTERRUPTED: &str = "interrupted";

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Module '{module}' cannot move from {from} to {to}")]
    Module {
        module: String,
        from: ModuleStatus,
        to: ModuleStatus,
    },

    #[error("Workflow '{workflow}' cannot move from {from} to {to}")]
    Workflow {
        workflow: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Module '{module}' is not an enabled part of workflow '{workflow}'")]
    UnknownModule { workflow: String, module: String },

    #[error("Workflow '{workflow}' is {status}; cannot {action}")]
    NotActive {
        workflow: String,
        status: WorkflowStatus,
        action: &'static str,
    },
}

// ============================================================================
// Records
// ============================================================================

/// Progress of one module inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleExecutionState {
    pub name: String,
    pub status: ModuleStatus,
    /// Explicit retries so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Payload of the last successful run, forwarded to dependents
    #[serde(default)]
    pub result: Option<Value>,
    /// Set when the module was skipped because this dependency failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<String>,
}

impl ModuleExecutionState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ModuleStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
            result: None,
            skipped_because: None,
        }
    }

    /// Back to a fresh `pending` state with no attempts
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.name));
    }
}

/// One entry of the append-only workflow history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub at: DateTime<Utc>,
    /// `None` for workflow-level changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A failed module as shown by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedModule {
    pub name: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Read-only projection of a workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub name: String,
    pub workflow_id: Uuid,
    pub target_directory: PathBuf,
    pub status: WorkflowStatus,
    pub revision: u64,
    pub last_updated_at: DateTime<Utc>,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub percent_complete: u8,
    pub next_module: Option<String>,
    pub failed_modules: Vec<FailedModule>,
}

// ============================================================================
// Workflow
// ============================================================================

/// A named, directory-scoped workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub format_version: u32,
    pub workflow_id: Uuid,
    pub name: String,
    pub target_directory: PathBuf,
    /// Plan snapshot taken at creation; never recomputed
    pub plan: ResolvedPlan,
    /// One state per enabled module, in plan order
    pub module_states: Vec<ModuleExecutionState>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    /// Bumped on every persisted change
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Workflow {
    /// New active workflow with every enabled module pending (not yet persisted)
    pub fn new(name: impl Into<String>, target_directory: impl Into<PathBuf>, plan: ResolvedPlan) -> Self {
        let now = Utc::now();
        let module_states = plan
            .enabled()
            .map(|entry| ModuleExecutionState::new(&entry.name))
            .collect();

        Self {
            format_version: FORMAT_VERSION,
            workflow_id: Uuid::new_v4(),
            name: name.into(),
            target_directory: target_directory.into(),
            plan,
            module_states,
            created_at: now,
            last_updated_at: now,
            status: WorkflowStatus::Active,
            revision: 0,
            history: vec![TransitionRecord {
                at: now,
                module: None,
                from: "none".to_string(),
                to: WorkflowStatus::Active.to_string(),
                note: Some("created".to_string()),
            }],
        }
    }

    pub fn state(&self, module: &str) -> Option<&ModuleExecutionState> {
        self.module_states.iter().find(|s| s.name == module)
    }

    fn state_mut(&mut self, module: &str) -> Result<&mut ModuleExecutionState, TransitionError> {
        let workflow = &self.name;
        self.module_states
            .iter_mut()
            .find(|s| s.name == module)
            .ok_or_else(|| TransitionError::UnknownModule {
                workflow: workflow.clone(),
                module: module.to_string(),
            })
    }

    /// Declared dependencies of a planned module
    pub fn dependencies_of(&self, module: &str) -> &[String] {
        self.plan
            .get(module)
            .map(|e| e.dependencies.as_slice())
            .unwrap_or_default()
    }

    /// True once every module is completed, failed or skipped
    pub fn all_finished(&self) -> bool {
        self.module_states.iter().all(|s| s.status.is_finished())
    }

    fn record(&mut self, module: Option<&str>, from: String, to: String, note: Option<String>) {
        self.history.push(TransitionRecord {
            at: Utc::now(),
            module: module.map(str::to_string),
            from,
            to,
            note,
        });
    }

    fn require_active(&self, action: &'static str) -> Result<(), TransitionError> {
        if self.status == WorkflowStatus::Active {
            Ok(())
        } else {
            Err(TransitionError::NotActive {
                workflow: self.name.clone(),
                status: self.status,
                action,
            })
        }
    }

    // ------------------------------------------------------------------------
    // Module transitions
    // ------------------------------------------------------------------------

    fn transition_module(
        &mut self,
        module: &str,
        to: ModuleStatus,
        note: Option<String>,
    ) -> Result<(), TransitionError> {
        let now = Utc::now();
        let state = self.state_mut(module)?;
        let from = state.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError::Module {
                module: module.to_string(),
                from,
                to,
            });
        }

        state.status = to;
        match to {
            ModuleStatus::Running => {
                state.started_at = Some(now);
                state.finished_at = None;
                state.last_error = None;
                state.result = None;
            }
            ModuleStatus::Completed | ModuleStatus::Failed | ModuleStatus::Skipped => {
                state.finished_at = Some(now);
            }
            ModuleStatus::Pending => {}
        }

        tracing::debug!(workflow = %self.name, module, %from, %to, "module transition");
        self.record(Some(module), from.to_string(), to.to_string(), note);
        Ok(())
    }

    /// `pending -> running`; the workflow must be active
    pub fn mark_running(&mut self, module: &str) -> Result<(), TransitionError> {
        self.require_active("start a module")?;
        self.transition_module(module, ModuleStatus::Running, None)
    }

    /// Record what a module reported. The status is checked first: only a
    /// `completed` outcome stores its payload.
    pub fn record_outcome(&mut self, module: &str, outcome: &ModuleOutcome) -> Result<(), TransitionError> {
        match outcome.status {
            OutcomeStatus::Completed => {
                self.transition_module(module, ModuleStatus::Completed, None)?;
                let state = self.state_mut(module)?;
                state.result = Some(outcome.payload.clone());
                state.last_error = None;
            }
            OutcomeStatus::Failed => {
                let error = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "module reported failure".to_string());
                self.record_failure(module, error)?;
            }
        }
        Ok(())
    }

    /// `running -> failed` for a reported failure, crash or timeout
    pub fn record_failure(&mut self, module: &str, error: impl Into<String>) -> Result<(), TransitionError> {
        let error = error.into();
        self.transition_module(module, ModuleStatus::Failed, Some(error.clone()))?;
        let state = self.state_mut(module)?;
        state.last_error = Some(error);
        state.result = None;
        Ok(())
    }

    /// Turn durable `running` states into `failed` ("interrupted").
    ///
    /// Only valid when no process is executing the workflow, i.e. while the
    /// caller holds the workflow lock.
    pub fn repair_interrupted(&mut self) -> Vec<String> {
        let running: Vec<String> = self
            .module_states
            .iter()
            .filter(|s| s.status == ModuleStatus::Running)
            .map(|s| s.name.clone())
            .collect();

        for module in &running {
            tracing::warn!(workflow = %self.name, module = %module, "module was interrupted while running");
            // running -> failed is always legal
            let _ = self.record_failure(module, INTERRUPTED);
        }
        running
    }

    /// Skip every pending module with a failed or skipped dependency,
    /// transitively. Returns the newly skipped modules in plan order.
    pub fn cascade_skips(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();

        // Plan order puts dependencies first, so one pass reaches the fixed point
        let names: Vec<String> = self.module_states.iter().map(|s| s.name.clone()).collect();
        for name in names {
            if self.state(&name).map(|s| s.status) != Some(ModuleStatus::Pending) {
                continue;
            }
            let blocker = self
                .dependencies_of(&name)
                .iter()
                .find(|dep| {
                    self.state(dep)
                        .is_some_and(|s| s.status.blocks_dependents())
                })
                .cloned();

            if let Some(blocker) = blocker {
                let note = format!("dependency '{blocker}' did not complete");
                if self.transition_module(&name, ModuleStatus::Skipped, Some(note)).is_ok() {
                    if let Ok(state) = self.state_mut(&name) {
                        state.skipped_because = Some(blocker.clone());
                    }
                    tracing::info!(workflow = %self.name, module = %name, %blocker, "module skipped");
                    skipped.push(name);
                }
            }
        }
        skipped
    }

    /// Put modules skipped by a cascade back to `pending`. The next
    /// `cascade_skips` skips again whatever is still blocked.
    fn restore_cascaded(&mut self) {
        let cascaded: Vec<String> = self
            .module_states
            .iter()
            .filter(|s| s.status == ModuleStatus::Skipped && s.skipped_because.is_some())
            .map(|s| s.name.clone())
            .collect();

        for name in cascaded {
            if let Ok(state) = self.state_mut(&name) {
                state.reset();
            }
            self.record(
                Some(&name),
                ModuleStatus::Skipped.to_string(),
                ModuleStatus::Pending.to_string(),
                Some("restored after dependency was reopened".to_string()),
            );
        }
    }

    /// First pending module (plan order) whose dependencies all completed
    pub fn next_candidate(&self) -> Option<&str> {
        self.module_states
            .iter()
            .filter(|s| s.status == ModuleStatus::Pending)
            .find(|s| {
                self.dependencies_of(&s.name).iter().all(|dep| {
                    self.state(dep)
                        .is_some_and(|d| d.status == ModuleStatus::Completed)
                })
            })
            .map(|s| s.name.as_str())
    }

    // ------------------------------------------------------------------------
    // Workflow transitions
    // ------------------------------------------------------------------------

    fn transition_workflow(&mut self, to: WorkflowStatus, note: Option<String>) -> Result<(), TransitionError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError::Workflow {
                workflow: self.name.clone(),
                from,
                to,
            });
        }
        self.status = to;
        tracing::info!(workflow = %self.name, %from, %to, "workflow transition");
        self.record(None, from.to_string(), to.to_string(), note);
        Ok(())
    }

    /// Once every module is finished: `failed` if any module failed,
    /// otherwise `completed`. Returns the new status if it changed.
    pub fn finalize(&mut self) -> Option<WorkflowStatus> {
        if self.status != WorkflowStatus::Active || !self.all_finished() {
            return None;
        }
        let any_failed = self
            .module_states
            .iter()
            .any(|s| s.status == ModuleStatus::Failed);
        let to = if any_failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        self.transition_workflow(to, None).ok().map(|()| to)
    }

    /// Terminal workflows go back to active when an operator retries or resets
    fn reopen(&mut self, note: &str) {
        if self.status.is_terminal() {
            let from = self.status;
            self.status = WorkflowStatus::Active;
            tracing::info!(workflow = %self.name, %from, "workflow reopened");
            self.record(None, from.to_string(), self.status.to_string(), Some(note.to_string()));
        }
    }

    pub fn abandon(&mut self) -> Result<(), TransitionError> {
        self.transition_workflow(WorkflowStatus::Abandoned, None)
    }

    pub fn reactivate(&mut self) -> Result<(), TransitionError> {
        self.transition_workflow(WorkflowStatus::Active, Some("reactivated".to_string()))
    }

    /// `failed -> pending` with `attempts += 1`; reopens a finished workflow
    pub fn retry(&mut self, module: &str) -> Result<(), TransitionError> {
        if self.status == WorkflowStatus::Abandoned {
            return Err(TransitionError::NotActive {
                workflow: self.name.clone(),
                status: self.status,
                action: "retry a module",
            });
        }
        let from = self.state(module).map(|s| s.status);
        if from != Some(ModuleStatus::Failed) {
            return match from {
                Some(from) => Err(TransitionError::Module {
                    module: module.to_string(),
                    from,
                    to: ModuleStatus::Pending,
                }),
                None => Err(TransitionError::UnknownModule {
                    workflow: self.name.clone(),
                    module: module.to_string(),
                }),
            };
        }

        self.reopen("module retried");
        let attempt = self.state(module).map_or(1, |s| s.attempts + 1);
        self.transition_module(module, ModuleStatus::Pending, Some(format!("retry #{attempt}")))?;
        let state = self.state_mut(module)?;
        state.attempts = attempt;
        state.started_at = None;
        state.finished_at = None;
        self.restore_cascaded();
        Ok(())
    }

    /// Explicitly skip a module; its dependents are skipped by cascade
    pub fn skip(&mut self, module: &str) -> Result<Vec<String>, TransitionError> {
        self.require_active("skip a module")?;
        self.transition_module(module, ModuleStatus::Skipped, Some("skipped by operator".to_string()))?;
        let mut skipped = vec![module.to_string()];
        skipped.extend(self.cascade_skips());
        self.finalize();
        Ok(skipped)
    }

    /// Reset one module (or all modules) to a fresh `pending` state
    pub fn reset(&mut self, module: Option<&str>) -> Result<(), TransitionError> {
        if self.status == WorkflowStatus::Abandoned {
            return Err(TransitionError::NotActive {
                workflow: self.name.clone(),
                status: self.status,
                action: "reset",
            });
        }

        let targets: Vec<String> = match module {
            Some(name) => {
                self.state_mut(name)?;
                vec![name.to_string()]
            }
            None => self.module_states.iter().map(|s| s.name.clone()).collect(),
        };

        self.reopen("reset");
        for name in &targets {
            let state = self.state_mut(name)?;
            let from = state.status;
            let attempts = state.attempts;
            state.reset();
            self.record(
                Some(name),
                from.to_string(),
                ModuleStatus::Pending.to_string(),
                Some(format!("reset (had {attempts} attempts)")),
            );
        }
        if module.is_some() {
            self.restore_cascaded();
        }
        tracing::info!(workflow = %self.name, modules = targets.len(), "workflow reset");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Projection / validation
    // ------------------------------------------------------------------------

    pub fn status_summary(&self) -> StatusSummary {
        let count = |status: ModuleStatus| {
            self.module_states
                .iter()
                .filter(|s| s.status == status)
                .count()
        };
        let total = self.module_states.len();
        let completed = count(ModuleStatus::Completed);
        let percent_complete = if total == 0 {
            100
        } else {
            u8::try_from(completed * 100 / total).unwrap_or(100)
        };

        StatusSummary {
            name: self.name.clone(),
            workflow_id: self.workflow_id,
            target_directory: self.target_directory.clone(),
            status: self.status,
            revision: self.revision,
            last_updated_at: self.last_updated_at,
            total,
            pending: count(ModuleStatus::Pending),
            running: count(ModuleStatus::Running),
            completed,
            failed: count(ModuleStatus::Failed),
            skipped: count(ModuleStatus::Skipped),
            percent_complete,
            next_module: self.next_candidate().map(str::to_string),
            failed_modules: self
                .module_states
                .iter()
                .filter(|s| s.status == ModuleStatus::Failed)
                .map(|s| FailedModule {
                    name: s.name.clone(),
                    attempts: s.attempts,
                    last_error: s.last_error.clone(),
                })
                .collect(),
        }
    }

    /// Structural checks applied to every record read from disk
    pub fn validate(&self) -> Result<(), String> {
        if self.format_version == 0 || self.format_version > FORMAT_VERSION {
            return Err(format!("unsupported record format {}", self.format_version));
        }
        if self.name.is_empty() {
            return Err("workflow name is empty".to_string());
        }
        self.plan.validate()?;

        let planned = self.plan.order();
        let tracked: Vec<&str> = self.module_states.iter().map(|s| s.name.as_str()).collect();
        if planned != tracked {
            return Err(format!(
                "module states {tracked:?} do not match planned modules {planned:?}"
            ));
        }

        let running = self
            .module_states
            .iter()
            .filter(|s| s.status == ModuleStatus::Running)
            .count();
        if running > 1 {
            return Err(format!("{running} modules are marked running"));
        }
        if self.status == WorkflowStatus::Completed && !self.all_finished() {
            return Err("workflow is completed but has unfinished modules".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::planner::PlanEntry;
    use serde_json::json;

    fn entry(name: &str, deps: &[&str]) -> PlanEntry {
        PlanEntry {
            name: name.to_string(),
            version: "1.0".to_string(),
            enabled: true,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            order_hint: None,
            maturity: Default::default(),
            module_config: Value::Null,
            timeout_secs: None,
        }
    }

    /// A <- B <- C
    fn chain() -> Workflow {
        Workflow::new(
            "docs",
            "/srv/docs",
            ResolvedPlan {
                entries: vec![entry("A", &[]), entry("B", &["A"]), entry("C", &["B"])],
            },
        )
    }

    fn run(wf: &mut Workflow, module: &str, outcome: ModuleOutcome) {
        wf.mark_running(module).unwrap();
        wf.record_outcome(module, &outcome).unwrap();
    }

    // =========================================================================
    // Creation Tests
    // =========================================================================

    #[test]
    fn test_new_workflow_is_pending_and_valid() {
        let wf = chain();
        assert_eq!(wf.status, WorkflowStatus::Active);
        assert!(wf.module_states.iter().all(|s| s.status == ModuleStatus::Pending));
        assert!(wf.module_states.iter().all(|s| s.attempts == 0));
        assert_eq!(wf.next_candidate(), Some("A"));
        wf.validate().unwrap();
    }

    #[test]
    fn test_disabled_plan_entries_have_no_state() {
        let mut disabled = entry("Lint", &[]);
        disabled.enabled = false;
        let wf = Workflow::new(
            "docs",
            "/srv/docs",
            ResolvedPlan {
                entries: vec![entry("A", &[]), disabled],
            },
        );
        assert_eq!(wf.module_states.len(), 1);
        assert!(wf.state("Lint").is_none());
    }

    // =========================================================================
    // Module Transition Tests
    // =========================================================================

    #[test]
    fn test_completed_outcome_stores_payload() {
        let mut wf = chain();
        run(&mut wf, "A", ModuleOutcome::completed(json!({"files": 4})));
        let a = wf.state("A").unwrap();
        assert_eq!(a.status, ModuleStatus::Completed);
        assert_eq!(a.result, Some(json!({"files": 4})));
        assert!(a.finished_at.is_some());
        assert_eq!(wf.next_candidate(), Some("B"));
    }

    #[test]
    fn test_failed_outcome_with_payload_is_recorded_failed() {
        let mut wf = chain();
        let outcome = ModuleOutcome::failed("bad ref").with_payload(json!({"partial": true}));
        run(&mut wf, "A", outcome);
        let a = wf.state("A").unwrap();
        assert_eq!(a.status, ModuleStatus::Failed);
        assert_eq!(a.last_error.as_deref(), Some("bad ref"));
        assert_eq!(a.result, None);
    }

    #[test]
    fn test_cannot_start_module_twice() {
        let mut wf = chain();
        wf.mark_running("A").unwrap();
        assert!(matches!(
            wf.mark_running("A"),
            Err(TransitionError::Module { from: ModuleStatus::Running, .. })
        ));
    }

    #[test]
    fn test_unknown_module_is_rejected() {
        let mut wf = chain();
        assert!(matches!(
            wf.mark_running("Ghost"),
            Err(TransitionError::UnknownModule { .. })
        ));
    }

    #[test]
    fn test_cascade_skips_transitive_dependents() {
        let mut wf = chain();
        run(&mut wf, "A", ModuleOutcome::failed("boom"));
        assert_eq!(wf.cascade_skips(), vec!["B".to_string(), "C".to_string()]);
        assert_eq!(wf.state("C").unwrap().skipped_because.as_deref(), Some("B"));
        assert_eq!(wf.next_candidate(), None);
        assert_eq!(wf.finalize(), Some(WorkflowStatus::Failed));
    }

    #[test]
    fn test_repair_interrupted_marks_failed() {
        let mut wf = chain();
        wf.mark_running("A").unwrap();
        assert_eq!(wf.repair_interrupted(), vec!["A".to_string()]);
        let a = wf.state("A").unwrap();
        assert_eq!(a.status, ModuleStatus::Failed);
        assert_eq!(a.last_error.as_deref(), Some(INTERRUPTED));
    }

    // =========================================================================
    // Retry / Skip / Reset Tests
    // =========================================================================

    #[test]
    fn test_retry_increments_attempts_and_restores_cascade() {
        let mut wf = chain();
        run(&mut wf, "A", ModuleOutcome::failed("boom"));
        wf.cascade_skips();
        wf.finalize();
        assert_eq!(wf.status, WorkflowStatus::Failed);

        wf.retry("A").unwrap();
        assert_eq!(wf.status, WorkflowStatus::Active);
        let a = wf.state("A").unwrap();
        assert_eq!(a.status, ModuleStatus::Pending);
        assert_eq!(a.attempts, 1);
        assert_eq!(wf.state("B").unwrap().status, ModuleStatus::Pending);

        run(&mut wf, "A", ModuleOutcome::completed(json!(null)));
        assert_eq!(wf.next_candidate(), Some("B"));
        assert_eq!(wf.state("A").unwrap().attempts, 1);
    }

    #[test]
    fn test_retry_requires_failed_module() {
        let mut wf = chain();
        assert!(matches!(
            wf.retry("A"),
            Err(TransitionError::Module { from: ModuleStatus::Pending, .. })
        ));
    }

    #[test]
    fn test_completed_module_cannot_be_skipped() {
        let mut wf = chain();
        run(&mut wf, "A", ModuleOutcome::completed(json!(1)));
        assert!(wf.skip("A").is_err());
    }

    #[test]
    fn test_explicit_skip_cascades_and_completes() {
        let mut wf = chain();
        run(&mut wf, "A", ModuleOutcome::completed(json!(1)));
        let skipped = wf.skip("B").unwrap();
        assert_eq!(skipped, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.state("B").unwrap().skipped_because, None);
    }

    #[test]
    fn test_reset_all_is_recorded_in_history() {
        let mut wf = chain();
        run(&mut wf, "A", ModuleOutcome::failed("boom"));
        wf.retry("A").unwrap();
        let before = wf.history.len();

        wf.reset(None).unwrap();
        assert!(wf.module_states.iter().all(|s| s.status == ModuleStatus::Pending));
        assert_eq!(wf.state("A").unwrap().attempts, 0);
        assert_eq!(wf.history.len(), before + 3);
        assert!(wf.history.last().unwrap().note.as_deref().unwrap().starts_with("reset"));
    }

    #[test]
    fn test_abandon_and_reactivate() {
        let mut wf = chain();
        wf.abandon().unwrap();
        assert!(matches!(
            wf.mark_running("A"),
            Err(TransitionError::NotActive { status: WorkflowStatus::Abandoned, .. })
        ));
        assert!(wf.reset(None).is_err());
        wf.reactivate().unwrap();
        assert!(wf.mark_running("A").is_ok());
    }

    #[test]
    fn test_completed_workflow_cannot_be_abandoned() {
        let mut wf = chain();
        for m in ["A", "B", "C"] {
            run(&mut wf, m, ModuleOutcome::completed(json!(m)));
        }
        assert_eq!(wf.finalize(), Some(WorkflowStatus::Completed));
        assert!(wf.abandon().is_err());
    }

    // =========================================================================
    // Summary / Validation Tests
    // =========================================================================

    #[test]
    fn test_status_summary_counts() {
        let mut wf = chain();
        run(&mut wf, "A", ModuleOutcome::completed(json!(1)));
        run(&mut wf, "B", ModuleOutcome::failed("nope"));
        let summary = wf.status_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.percent_complete, 33);
        assert_eq!(summary.failed_modules[0].name, "B");
        assert_eq!(summary.next_module, None);
    }

    #[test]
    fn test_validate_rejects_mismatched_states() {
        let mut wf = chain();
        wf.module_states.pop();
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let mut wf = chain();
        run(&mut wf, "A", ModuleOutcome::completed(json!({"ok": true})));
        let json = serde_json::to_string(&wf).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wf);
        assert_eq!(back.status_summary(), wf.status_summary());
    }
}

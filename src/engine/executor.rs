//! Workflow Engine
//!
//! Creates, loads and advances workflows. Every mutating operation follows
//! the same protocol:
//!
//! 1. Take the per-workflow lock (non-blocking; busy means someone else is
//!    working on it)
//! 2. Re-read the stored record and compare `workflow_id` + `revision` with
//!    the caller's copy (compare-and-swap)
//! 3. Apply the transition in memory
//! 4. Persist atomically, then hand the new state back to the caller
//!
//! `execute_next` holds the lock across the whole module call and persists
//! twice: once after marking the module `running`, once with the outcome. A
//! crash in between leaves a durable `running` state that the next load turns
//! into `failed` ("interrupted"), never `completed`.
//!
//! A module that overruns its timeout is recorded as failed, but the lock is
//! only released once the module has actually returned. Command modules stop
//! their process group at the timeout and return within the exit allowance.
//! An in-process module that ignores the timeout keeps the workflow locked
//! until it finishes, so nothing else can run next to it.
//!
//! # What This Explicitly Refuses To Do
//!
//! - Run two modules at once, or the same module twice
//! - Overwrite a record that changed since the caller loaded it
//! - Recompute a stored plan

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::engine::planner::ResolvedPlan;
use crate::engine::store::{
    validate_workflow_name, PersistenceError, WorkflowListing, WorkflowLock, WorkflowStore,
};
use crate::error::{DocflowError, Result};
use crate::module_manifest::ModuleRegistry;
use crate::module_traits::{ModuleContext, ModuleOutcome};
use crate::process_guard::DEFAULT_GRACE_PERIOD;
use crate::types::{ModuleStatus, WorkflowStatus};
use crate::workflow_state::{StatusSummary, TransitionError, Workflow};

/// Time bound for modules without a per-module timeout
pub const DEFAULT_MODULE_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a timed-out module gets to return before the engine stops
/// waiting. Covers a command module's SIGTERM grace period and SIGKILL.
pub const DEFAULT_EXIT_ALLOWANCE: Duration = DEFAULT_GRACE_PERIOD.saturating_add(Duration::from_secs(2));

/// The module run by one `execute_next` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedModule {
    pub name: String,
    pub status: ModuleStatus,
    pub error: Option<String>,
}

/// What one `execute_next` call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    /// `None` when nothing was runnable
    pub executed: Option<ExecutedModule>,
    /// Modules skipped by cascade during this step
    pub skipped: Vec<String>,
    pub workflow_status: WorkflowStatus,
    /// The executed module overran its timeout and had not returned when the
    /// step ended. The workflow stays locked until it does.
    pub still_running: bool,
}

impl StepReport {
    pub fn is_idle(&self) -> bool {
        self.executed.is_none()
    }
}

/// Result of `run_until_blocked`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
    /// Stopped because the stop flag was raised
    pub interrupted: bool,
}

/// Owns the store and the module implementations
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    store: WorkflowStore,
    registry: ModuleRegistry,
    default_timeout: Duration,
    exit_allowance: Duration,
}

impl WorkflowEngine {
    pub fn new(store: WorkflowStore, registry: ModuleRegistry) -> Self {
        Self {
            store,
            registry,
            default_timeout: DEFAULT_MODULE_TIMEOUT,
            exit_allowance: DEFAULT_EXIT_ALLOWANCE,
        }
    }

    /// Override the time bound for modules without their own timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Override how long a timed-out module may take to return
    pub fn with_exit_allowance(mut self, allowance: Duration) -> Self {
        self.exit_allowance = allowance;
        self
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    // ========================================================================
    // Create / Load
    // ========================================================================

    /// Create and persist a new workflow with every enabled module pending.
    ///
    /// # Errors
    ///
    /// - `DuplicateWorkflow` if the name is taken and `overwrite` is false
    /// - `Busy` if another invocation holds the workflow
    pub fn create_workflow(
        &self,
        name: &str,
        target_directory: impl Into<PathBuf>,
        plan: ResolvedPlan,
        overwrite: bool,
    ) -> Result<Workflow> {
        validate_workflow_name(name).map_err(|reason| DocflowError::configuration("workflow.name", reason))?;
        plan.validate()
            .map_err(|reason| DocflowError::configuration("plan", reason))?;

        let lock = self.store.try_lock(name)?;
        if self.store.exists(name) {
            if !overwrite {
                return Err(PersistenceError::DuplicateWorkflow {
                    name: name.to_string(),
                }
                .into());
            }
            tracing::warn!(workflow = %name, "overwriting existing workflow");
            self.store.remove(&lock, name)?;
        }

        let mut workflow = Workflow::new(name, target_directory, plan);
        self.commit(&lock, &mut workflow)?;

        tracing::info!(
            workflow = %name,
            id = %workflow.workflow_id,
            modules = workflow.module_states.len(),
            target = %workflow.target_directory.display(),
            "workflow created"
        );
        Ok(workflow)
    }

    /// Load a workflow, recovering from backups and repairing interrupted runs.
    ///
    /// A durable `running` module is turned into `failed` only if the workflow
    /// lock is free; while another invocation holds it the record is returned
    /// as stored.
    pub fn load_workflow(&self, name: &str) -> Result<Workflow> {
        validate_workflow_name(name).map_err(|reason| DocflowError::configuration("workflow.name", reason))?;
        let loaded = self.store.read(name)?;
        let mut workflow = loaded.workflow;

        let interrupted = workflow
            .module_states
            .iter()
            .any(|s| s.status == ModuleStatus::Running);
        let needs_rewrite = interrupted || loaded.recovered_from.is_some();

        if needs_rewrite {
            match self.store.try_lock(name) {
                Ok(lock) => {
                    // The record may have moved on between the read and the lock
                    let reread = self.store.read(name)?;
                    workflow = reread.workflow;
                    let repaired = workflow.repair_interrupted();
                    if !repaired.is_empty() || reread.recovered_from.is_some() {
                        workflow.cascade_skips();
                        workflow.finalize();
                        self.commit(&lock, &mut workflow)?;
                    }
                    if !repaired.is_empty() {
                        tracing::warn!(workflow = %name, modules = ?repaired, "recovered interrupted modules");
                    }
                }
                Err(PersistenceError::Busy { .. }) => {
                    tracing::debug!(workflow = %name, "workflow in use, not repairing");
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::debug!(workflow = %name, revision = workflow.revision, status = %workflow.status, "workflow loaded");
        Ok(workflow)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run the next runnable module and persist the outcome.
    ///
    /// Before choosing, pending modules with a failed or skipped dependency
    /// are skipped (transitively). A module only starts once every dependency
    /// is `completed`. When nothing is left to run the workflow is finalized.
    ///
    /// On success `workflow` holds the persisted state. Module failures,
    /// crashes and timeouts are recorded, not returned as errors.
    ///
    /// # Errors
    ///
    /// - `ConcurrentModification` / `Busy` if the stored record moved on or
    ///   another invocation is running it
    /// - `NotActive` if the workflow is not active
    /// - persistence failures
    pub fn execute_next(&self, workflow: &mut Workflow) -> Result<StepReport> {
        let lock = self.store.try_lock(&workflow.name)?;
        let mut current = self.reload_for_update(&lock, workflow)?;

        if current.status != WorkflowStatus::Active {
            return Err(TransitionError::NotActive {
                workflow: current.name.clone(),
                status: current.status,
                action: "execute modules",
            }
            .into());
        }

        let mut skipped = current.cascade_skips();
        let Some(module) = current.next_candidate().map(str::to_string) else {
            let finalized = current.finalize();
            // Skips, finalization or an interrupted-run repair changed the record
            if finalized.is_some() || current != *workflow {
                self.commit(&lock, &mut current)?;
            }
            *workflow = current;
            return Ok(StepReport {
                executed: None,
                skipped,
                workflow_status: workflow.status,
                still_running: false,
            });
        };

        current.mark_running(&module)?;
        self.commit(&lock, &mut current)?;
        *workflow = current.clone();

        let ctx = self.context_for(&current, &module);
        tracing::info!(workflow = %current.name, module = %module, timeout = ?ctx.timeout, "module started");

        let invocation = self.invoke(&module, ctx);
        match invocation.result {
            Ok(outcome) => current.record_outcome(&module, &outcome)?,
            Err(err) => {
                let message = failure_message(&err);
                tracing::error!(workflow = %current.name, module = %module, error = %err, "module crashed");
                current.record_failure(&module, message)?;
            }
        }

        let state = current.state(&module).cloned();
        match state.as_ref().map(|s| s.status) {
            Some(ModuleStatus::Completed) => {
                tracing::info!(workflow = %current.name, module = %module, "module completed");
            }
            _ => {
                tracing::warn!(
                    workflow = %current.name,
                    module = %module,
                    error = state.as_ref().and_then(|s| s.last_error.as_deref()).unwrap_or_default(),
                    "module failed"
                );
            }
        }

        skipped.extend(current.cascade_skips());
        current.finalize();
        self.commit(&lock, &mut current)?;
        *workflow = current;

        let still_running = invocation.straggler.is_some();
        if let Some(worker) = invocation.straggler {
            tracing::error!(
                workflow = %workflow.name,
                module = %module,
                "module ignored its timeout; workflow stays locked until it returns"
            );
            hold_until_exit(lock, worker);
        }

        Ok(StepReport {
            executed: state.map(|s| ExecutedModule {
                name: s.name,
                status: s.status,
                error: s.last_error,
            }),
            skipped,
            workflow_status: workflow.status,
            still_running,
        })
    }

    /// Call `execute_next` until the workflow is terminal, nothing is
    /// runnable, a timed-out module is still running, or `stop` is raised.
    /// The flag is only checked between modules; a running module is never
    /// cut short.
    ///
    /// # Errors
    ///
    /// `NotActive` for an abandoned workflow; it has to be reactivated first.
    pub fn run_until_blocked(&self, workflow: &mut Workflow, stop: &AtomicBool) -> Result<RunReport> {
        if workflow.status == WorkflowStatus::Abandoned {
            return Err(TransitionError::NotActive {
                workflow: workflow.name.clone(),
                status: workflow.status,
                action: "continue",
            }
            .into());
        }

        let mut report = RunReport::default();

        while workflow.status == WorkflowStatus::Active {
            if stop.load(Ordering::SeqCst) {
                tracing::warn!(workflow = %workflow.name, "stop requested, pausing workflow");
                report.interrupted = true;
                break;
            }
            let step = self.execute_next(workflow)?;
            let blocked = step.is_idle() || step.still_running;
            report.steps.push(step);
            if blocked {
                break;
            }
        }
        Ok(report)
    }

    fn context_for(&self, workflow: &Workflow, module: &str) -> ModuleContext {
        let entry = workflow.plan.get(module);
        let prior_results = workflow
            .dependencies_of(module)
            .iter()
            .filter_map(|dep| {
                workflow
                    .state(dep)
                    .and_then(|s| s.result.clone())
                    .map(|payload| (dep.clone(), payload))
            })
            .collect();

        ModuleContext {
            module: module.to_string(),
            target_directory: workflow.target_directory.clone(),
            prior_results,
            module_config: entry.map(|e| e.module_config.clone()).unwrap_or_default(),
            timeout: entry
                .and_then(|e| e.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout),
        }
    }

    /// Run the implementation on a worker thread, bounded by `ctx.timeout`.
    /// Errors and panics come back as `Execution`, stalls as `Timeout`.
    ///
    /// After a timeout the worker gets `exit_allowance` to return. If it is
    /// still running after that, its handle is passed back to the caller.
    fn invoke(&self, module: &str, ctx: ModuleContext) -> Invocation {
        let Some(handler) = self.registry.handler(module) else {
            return Invocation::finished(Err(DocflowError::execution(module, "no implementation registered")));
        };
        let timeout = ctx.timeout;
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name(format!("module-{module}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx)));
                // Receiver is gone once the engine stopped waiting
                let _ = tx.send(result);
            });
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                return Invocation::finished(Err(DocflowError::execution(
                    module,
                    format!("failed to start module thread: {e}"),
                )));
            }
        };

        let result = match rx.recv_timeout(timeout) {
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(err))) => Err(DocflowError::execution(module, format!("{err:#}"))),
            Ok(Err(panic)) => Err(DocflowError::execution(
                module,
                format!("module panicked: {}", panic_message(&*panic)),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(DocflowError::execution(
                module,
                "module thread exited without a result",
            )),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(module, ?timeout, allowance = ?self.exit_allowance, "module timed out, waiting for it to stop");
                let timed_out = Err(DocflowError::Timeout {
                    module: module.to_string(),
                    timeout,
                });
                return match rx.recv_timeout(self.exit_allowance) {
                    Err(RecvTimeoutError::Timeout) => Invocation {
                        result: timed_out,
                        straggler: Some(worker),
                    },
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = worker.join();
                        Invocation::finished(timed_out)
                    }
                };
            }
        };

        let _ = worker.join();
        Invocation::finished(result)
    }

    // ========================================================================
    // Operator Actions
    // ========================================================================

    /// Read-only projection of the stored workflow
    pub fn status(&self, name: &str) -> Result<StatusSummary> {
        Ok(self.load_workflow(name)?.status_summary())
    }

    pub fn abandon(&self, workflow: &mut Workflow) -> Result<()> {
        self.update(workflow, Workflow::abandon)
    }

    pub fn reactivate(&self, workflow: &mut Workflow) -> Result<()> {
        self.update(workflow, Workflow::reactivate)
    }

    /// Reset one module (or all) to pending with zero attempts
    pub fn reset(&self, workflow: &mut Workflow, module: Option<&str>) -> Result<()> {
        self.update(workflow, |wf| wf.reset(module))
    }

    /// `failed -> pending`, `attempts += 1`
    pub fn retry(&self, workflow: &mut Workflow, module: &str) -> Result<()> {
        self.update(workflow, |wf| wf.retry(module))
    }

    /// Explicitly skip a module; dependents are cascade-skipped
    pub fn skip(&self, workflow: &mut Workflow, module: &str) -> Result<Vec<String>> {
        let mut skipped = Vec::new();
        self.update(workflow, |wf| {
            skipped = wf.skip(module)?;
            Ok(())
        })?;
        Ok(skipped)
    }

    pub fn list_workflows(&self) -> Result<Vec<WorkflowListing>> {
        Ok(self.store.list()?)
    }

    // ========================================================================
    // Compare-and-swap plumbing
    // ========================================================================

    fn update<F>(&self, workflow: &mut Workflow, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Workflow) -> std::result::Result<(), TransitionError>,
    {
        let lock = self.store.try_lock(&workflow.name)?;
        let mut current = self.reload_for_update(&lock, workflow)?;
        apply(&mut current)?;
        self.commit(&lock, &mut current)?;
        *workflow = current;
        Ok(())
    }

    /// Stored record, provided it is the one the caller loaded
    fn reload_for_update(&self, lock: &WorkflowLock, workflow: &Workflow) -> Result<Workflow> {
        let stored = self.store.read(lock.name())?.workflow;

        if stored.workflow_id != workflow.workflow_id || stored.revision != workflow.revision {
            tracing::warn!(
                workflow = %workflow.name,
                expected = workflow.revision,
                found = stored.revision,
                "stored workflow diverged from caller's copy"
            );
            return Err(PersistenceError::ConcurrentModification {
                name: workflow.name.clone(),
                expected: workflow.revision,
                found: stored.revision,
            }
            .into());
        }

        let mut current = stored;
        // We hold the lock, so a durable `running` state is left over from a dead run
        current.repair_interrupted();
        Ok(current)
    }

    /// Bump revision and timestamp, then persist. The in-memory copy is rolled
    /// back if the write fails.
    fn commit(&self, lock: &WorkflowLock, workflow: &mut Workflow) -> Result<()> {
        let previous = (workflow.revision, workflow.last_updated_at);
        workflow.revision += 1;
        workflow.last_updated_at = Utc::now();

        if let Err(err) = self.store.write(lock, workflow) {
            (workflow.revision, workflow.last_updated_at) = previous;
            tracing::error!(workflow = %workflow.name, error = %err, "failed to persist workflow");
            return Err(err.into());
        }
        Ok(())
    }
}

/// What `invoke` hands back to `execute_next`
struct Invocation {
    result: Result<ModuleOutcome>,
    /// Worker still running past its timeout and the exit allowance
    straggler: Option<JoinHandle<()>>,
}

impl Invocation {
    fn finished(result: Result<ModuleOutcome>) -> Self {
        Self {
            result,
            straggler: None,
        }
    }
}

/// Keep the workflow locked until a timed-out worker returns
fn hold_until_exit(lock: WorkflowLock, worker: JoinHandle<()>) {
    let name = lock.name().to_string();
    let spawned = thread::Builder::new()
        .name(format!("hold-{name}"))
        .spawn(move || {
            let _ = worker.join();
            tracing::info!(workflow = %lock.name(), "timed-out module returned, workflow unlocked");
            drop(lock);
        });
    if let Err(e) = spawned {
        tracing::error!(workflow = %name, error = %e, "failed to start lock holder, workflow unlocked early");
    }
}

/// Message stored in `last_error`
fn failure_message(err: &DocflowError) -> String {
    match err {
        DocflowError::Execution { reason, .. } => reason.clone(),
        DocflowError::Timeout { timeout, .. } => format!("timed out after {timeout:?}"),
        other => other.to_string(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

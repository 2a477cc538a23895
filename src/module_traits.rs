//! Module execution contract.
//!
//! Every processing module, whether compiled in or an external command,
//! implements [`DocumentModule`]. The engine hands it a [`ModuleContext`] and
//! stores the returned [`ModuleOutcome`] without interpreting the payload.
//!
//! # Contract
//!
//! - `execute()` returns `Ok(outcome)` for both success and *reported* failure.
//!   The outcome's `status` is authoritative: a `Failed` outcome is recorded as
//!   failed no matter what payload it carries.
//! - `Err(_)` and panics are treated as crashes and recorded exactly like a
//!   reported failure.
//! - Implementations must not mutate workflow state; they only see the target
//!   directory, the payloads of their declared dependencies and their own
//!   configuration block.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::OutcomeStatus;

/// Everything a module receives for one run
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Name of the module being run
    pub module: String,
    /// Directory the workflow operates on
    pub target_directory: PathBuf,
    /// Payloads of completed declared dependencies, keyed by module name
    pub prior_results: BTreeMap<String, Value>,
    /// Module configuration block from the developer manifest
    pub module_config: Value,
    /// Time bound the engine enforces for this run
    pub timeout: Duration,
}

/// Terminal result reported by a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModuleOutcome {
    /// Successful run with a payload for dependents
    pub fn completed(payload: Value) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            payload,
            error: None,
        }
    }

    /// Reported failure
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            payload: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Attach a payload (diagnostics, partial counts) to the outcome
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A processing unit the engine can run against a target directory.
///
/// Closures of the right shape implement this trait, which keeps small
/// in-process modules and test doubles terse:
///
/// ```
/// use docflow::module_traits::{DocumentModule, ModuleContext, ModuleOutcome};
///
/// let module = |_ctx: &ModuleContext| {
///     Ok::<_, anyhow::Error>(ModuleOutcome::completed(serde_json::json!({"files": 3})))
/// };
/// # fn assert_module<M: DocumentModule>(_m: &M) {}
/// # assert_module(&module);
/// ```
pub trait DocumentModule: Send + Sync {
    /// Run the module once and report a terminal outcome.
    fn execute(&self, ctx: &ModuleContext) -> anyhow::Result<ModuleOutcome>;
}

impl<F> DocumentModule for F
where
    F: Fn(&ModuleContext) -> anyhow::Result<ModuleOutcome> + Send + Sync,
{
    fn execute(&self, ctx: &ModuleContext) -> anyhow::Result<ModuleOutcome> {
        self(ctx)
    }
}

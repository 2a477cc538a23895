use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::SettingsOverrides;
use crate::engine::executor::StepReport;
use crate::engine::store::WorkflowListing;
use crate::workflow_state::StatusSummary;

/// docflow - plan and run document-processing modules as resumable workflows
#[derive(Parser, Debug)]
#[command(name = "docflow")]
#[command(about = "Plan and run document-processing modules as resumable workflows")]
#[command(after_help = "Settings flags override the matching DOCFLOW_* environment variables.")]
#[command(version)]
pub struct Cli {
    /// Directory holding workflow records
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Developer manifest (default: ./docflow.json)
    #[arg(long, global = true)]
    pub manifest: Option<PathBuf>,

    /// User preference file
    #[arg(long, global = true)]
    pub preferences: Option<PathBuf>,

    /// Timeout in seconds for modules without their own
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Prior record generations kept per workflow
    #[arg(long, global = true)]
    pub backup_generations: Option<usize>,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn settings_overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            state_dir: self.state_dir.clone(),
            manifest_path: self.manifest.clone(),
            preferences_path: self.preferences.clone(),
            timeout_secs: self.timeout_secs,
            backup_generations: self.backup_generations,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the resolved execution plan without running anything
    Plan {
        /// One-shot override, repeatable (e.g. --set Lint=true)
        #[arg(long = "set", value_name = "MODULE=BOOL")]
        set: Vec<String>,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a workflow for a target directory
    Create {
        name: String,
        target_dir: PathBuf,
        /// Replace an existing workflow of the same name
        #[arg(long)]
        overwrite: bool,
        /// One-shot override, repeatable
        #[arg(long = "set", value_name = "MODULE=BOOL")]
        set: Vec<String>,
    },
    /// Run pending modules until the workflow finishes or is blocked
    Continue {
        name: String,
        /// Run a single module and stop
        #[arg(long)]
        step: bool,
    },
    /// Show workflow progress
    Status {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// List stored workflows
    List {
        #[arg(long)]
        json: bool,
    },
    /// Put a failed module back to pending
    Retry { name: String, module: String },
    /// Skip a module (dependents are skipped too)
    Skip { name: String, module: String },
    /// Reset one module, or every module, to pending
    Reset { name: String, module: Option<String> },
    /// Stop a workflow; it can be reactivated later
    Abandon { name: String },
    /// Resume an abandoned workflow
    Reactivate { name: String },
    /// Enable a module in the user preferences
    Enable { module: String },
    /// Disable a module in the user preferences
    Disable { module: String },
}

// ============================================================================
// Rendering
// ============================================================================

pub fn render_status(summary: &StatusSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Workflow:  {} ({})", summary.name, summary.status);
    let _ = writeln!(out, "Target:    {}", summary.target_directory.display());
    let _ = writeln!(
        out,
        "Progress:  {}% ({}/{} completed, {} failed, {} skipped, {} pending)",
        summary.percent_complete,
        summary.completed,
        summary.total,
        summary.failed,
        summary.skipped,
        summary.pending
    );
    if let Some(next) = &summary.next_module {
        let _ = writeln!(out, "Next:      {next}");
    }
    for failed in &summary.failed_modules {
        let _ = writeln!(
            out,
            "Failed:    {} (attempts: {}): {}",
            failed.name,
            failed.attempts,
            failed.last_error.as_deref().unwrap_or("no error recorded")
        );
    }
    let _ = writeln!(out, "Updated:   {} (revision {})", summary.last_updated_at.to_rfc3339(), summary.revision);
    out
}

pub fn render_step(step: &StepReport) -> String {
    let mut out = String::new();
    match &step.executed {
        Some(module) => match &module.error {
            Some(error) => {
                let _ = write!(out, "{}: {} ({error})", module.name, module.status);
            }
            None => {
                let _ = write!(out, "{}: {}", module.name, module.status);
            }
        },
        None => {
            let _ = write!(out, "nothing to run");
        }
    }
    if !step.skipped.is_empty() {
        let _ = write!(out, "; skipped {}", step.skipped.join(", "));
    }
    out
}

pub fn render_listing(listing: &[WorkflowListing]) -> String {
    if listing.is_empty() {
        return "No workflows.\n".to_string();
    }
    let mut out = String::new();
    for entry in listing {
        if entry.corrupted {
            let _ = writeln!(out, "{:<24} corrupted", entry.name);
            continue;
        }
        let status = entry.status.map(|s| s.to_string()).unwrap_or_default();
        let target = entry
            .target_directory
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let updated = entry
            .last_updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let _ = writeln!(out, "{:<24} {:<10} {:<20} {}", entry.name, status, updated, target);
    }
    out
}

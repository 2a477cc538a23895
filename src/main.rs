//! docflow - Main entry point
//!
//! Thin command-line shell over the library: parse flags, set up logging and
//! interrupt handling, dispatch, and map errors to exit codes.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use docflow::cli::{self, Cli, Commands};
use docflow::config::Settings;
use docflow::config_file::{ConfigWarning, parse_overrides};
use docflow::error::DocflowError;
use docflow::process_guard;
use docflow::toolkit::Toolkit;
use docflow::types::WorkflowStatus;
use docflow::workflow_state::TransitionError;

/// Exit code when a workflow ends in the failed state
const EXIT_WORKFLOW_FAILED: u8 = 4;

/// Initialize tracing on stderr. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "docflow=debug" } else { "docflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose, cli.json_logs);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("✗ {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// 2: configuration, registry or planning; 3: concurrent modification; 1: anything else
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<DocflowError>() {
        Some(e) if e.is_concurrent_modification() => 3,
        Some(DocflowError::Configuration { .. } | DocflowError::Registry(_) | DocflowError::Planning(_)) => 2,
        _ => 1,
    }
}

fn print_warnings(warnings: &[ConfigWarning]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::load(cli.settings_overrides())?;
    tracing::debug!(?settings, "settings resolved");

    match cli.command {
        Commands::Plan { set, json } => {
            let toolkit = Toolkit::load(settings)?;
            let outcome = toolkit.plan(&parse_overrides(&set)?)?;
            print_warnings(&outcome.warnings);
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.plan)?);
            } else {
                println!("{}", outcome.plan.summary());
            }
        }
        Commands::Create {
            name,
            target_dir,
            overwrite,
            set,
        } => {
            let toolkit = Toolkit::load(settings)?;
            let outcome = toolkit.plan(&parse_overrides(&set)?)?;
            print_warnings(&outcome.warnings);
            let target = absolute_target(&target_dir)?;
            let workflow = toolkit
                .engine()?
                .create_workflow(&name, &target, outcome.plan, overwrite)?;
            println!(
                "✓ Created workflow '{}' for {} ({} modules)",
                workflow.name,
                workflow.target_directory.display(),
                workflow.module_states.len()
            );
        }
        Commands::Continue { name, step } => {
            let engine = Toolkit::load(settings)?.engine()?;
            let mut workflow = engine.load_workflow(&name)?;
            if workflow.status == WorkflowStatus::Abandoned {
                let err = DocflowError::from(TransitionError::NotActive {
                    workflow: name.clone(),
                    status: workflow.status,
                    action: "continue",
                });
                return Err(anyhow::Error::from(err).context(format!("run `docflow reactivate {name}` first")));
            }

            if step {
                let report = engine.execute_next(&mut workflow)?;
                println!("{}", cli::render_step(&report));
                if report.still_running {
                    println!("A timed-out module is still running; '{name}' stays locked until it returns.");
                }
            } else {
                let stop = interrupt_flag();
                let report = engine.run_until_blocked(&mut workflow, &stop)?;
                for step in &report.steps {
                    println!("{}", cli::render_step(step));
                }
                if report.interrupted {
                    println!("Paused; run `docflow continue {name}` to resume.");
                }
                if report.steps.last().is_some_and(|s| s.still_running) {
                    println!("A timed-out module is still running; '{name}' stays locked until it returns.");
                }
            }

            print!("{}", cli::render_status(&workflow.status_summary()));
            if workflow.status == WorkflowStatus::Failed {
                return Ok(ExitCode::from(EXIT_WORKFLOW_FAILED));
            }
        }
        Commands::Status { name, json } => {
            let engine = Toolkit::load(settings)?.engine()?;
            let summary = engine.status(&name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", cli::render_status(&summary));
            }
        }
        Commands::List { json } => {
            let engine = Toolkit::load(settings)?.engine()?;
            let listing = engine.list_workflows()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                print!("{}", cli::render_listing(&listing));
            }
        }
        Commands::Retry { name, module } => {
            let engine = Toolkit::load(settings)?.engine()?;
            let mut workflow = engine.load_workflow(&name)?;
            engine.retry(&mut workflow, &module)?;
            println!("✓ '{module}' is pending again in '{name}'");
        }
        Commands::Skip { name, module } => {
            let engine = Toolkit::load(settings)?.engine()?;
            let mut workflow = engine.load_workflow(&name)?;
            let skipped = engine.skip(&mut workflow, &module)?;
            println!("✓ Skipped in '{name}': {}", skipped.join(", "));
        }
        Commands::Reset { name, module } => {
            let engine = Toolkit::load(settings)?.engine()?;
            let mut workflow = engine.load_workflow(&name)?;
            engine.reset(&mut workflow, module.as_deref())?;
            match module {
                Some(module) => println!("✓ Reset '{module}' in '{name}'"),
                None => println!("✓ Reset every module in '{name}'"),
            }
        }
        Commands::Abandon { name } => {
            let engine = Toolkit::load(settings)?.engine()?;
            let mut workflow = engine.load_workflow(&name)?;
            engine.abandon(&mut workflow)?;
            println!("✓ Abandoned '{name}'");
        }
        Commands::Reactivate { name } => {
            let engine = Toolkit::load(settings)?.engine()?;
            let mut workflow = engine.load_workflow(&name)?;
            engine.reactivate(&mut workflow)?;
            println!("✓ Reactivated '{name}'");
        }
        Commands::Enable { module } => {
            let mut toolkit = Toolkit::load(settings)?;
            toolkit.set_module_enabled(&module, true)?;
            println!("✓ Enabled '{module}'");
        }
        Commands::Disable { module } => {
            let mut toolkit = Toolkit::load(settings)?;
            toolkit.set_module_enabled(&module, false)?;
            println!("✓ Disabled '{module}'");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Workflows store an absolute target so they can be resumed from anywhere
fn absolute_target(target: &Path) -> Result<std::path::PathBuf> {
    if !target.is_dir() {
        anyhow::bail!("target directory does not exist: {}", target.display());
    }
    target
        .canonicalize()
        .with_context(|| format!("Failed to resolve target directory: {}", target.display()))
}

/// Stop flag raised by SIGINT/SIGTERM/SIGHUP. Without handlers the default
/// signal behaviour applies and the next load repairs the running module.
fn interrupt_flag() -> Arc<AtomicBool> {
    process_guard::install_interrupt_flag().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to install interrupt handlers");
        Arc::new(AtomicBool::new(false))
    })
}

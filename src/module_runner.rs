//! External Command Modules
//!
//! [`CommandModule`] implements the module contract by running a program
//! declared in the developer manifest. This is the only sanctioned way the
//! engine starts external processes:
//!
//! - Process group isolation (the whole tree dies on timeout or parent death)
//! - Context passed through environment variables, never through arguments
//! - Bounded by the module timeout, with SIGTERM before SIGKILL
//! - Nothing from the group survives the module: members left running after
//!   the leader exits are terminated the same way
//!
//! # Protocol
//!
//! | Variable                  | Content                                   |
//! |---------------------------|-------------------------------------------|
//! | `DOCFLOW_MODULE`          | Module name                               |
//! | `DOCFLOW_TARGET_DIR`      | Target directory (also the working dir)   |
//! | `DOCFLOW_PRIOR_RESULTS`   | JSON object: dependency name -> payload   |
//! | `DOCFLOW_MODULE_CONFIG`   | JSON configuration block                  |
//!
//! Exit status 0 means completed; stdout is the payload (JSON if it parses,
//! otherwise a JSON string, `null` if empty). Any other exit is a failure
//! carrying the tail of stderr.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::config_file::CommandSpec;
use crate::module_traits::{DocumentModule, ModuleContext, ModuleOutcome};
use crate::process_guard::{self, CommandProcessGroup, DEFAULT_GRACE_PERIOD};

/// Lines of stderr kept in a failure message
const STDERR_TAIL_LINES: usize = 20;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Minimum wait for buffered output once the process group is gone
const PIPE_FLUSH: Duration = Duration::from_millis(200);

/// A module implemented by an external program
#[derive(Debug, Clone)]
pub struct CommandModule {
    program: PathBuf,
    args: Vec<String>,
    grace_period: Duration,
}

impl CommandModule {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Build from a manifest entry; relative programs containing a path
    /// separator are resolved against `base_dir` (the manifest directory)
    pub fn from_spec(spec: &CommandSpec, base_dir: Option<&std::path::Path>) -> Self {
        let program = PathBuf::from(&spec.program);
        let program = match base_dir {
            Some(base) if program.is_relative() && program.components().count() > 1 => base.join(program),
            _ => program,
        };
        Self::new(program, spec.args.clone())
    }

    /// Time between SIGTERM and SIGKILL when the module times out
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn spawn(&self, ctx: &ModuleContext) -> Result<Child> {
        let prior_results =
            serde_json::to_string(&ctx.prior_results).context("Failed to encode prior results")?;
        let module_config =
            serde_json::to_string(&ctx.module_config).context("Failed to encode module config")?;

        tracing::debug!(
            module = %ctx.module,
            program = %self.program.display(),
            args = ?self.args,
            "spawning module command"
        );

        Command::new(&self.program)
            .args(&self.args)
            .current_dir(&ctx.target_directory)
            .env("DOCFLOW_MODULE", &ctx.module)
            .env("DOCFLOW_TARGET_DIR", &ctx.target_directory)
            .env("DOCFLOW_PRIOR_RESULTS", prior_results)
            .env("DOCFLOW_MODULE_CONFIG", module_config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .with_context(|| format!("Failed to spawn module command: {}", self.program.display()))
    }

    /// Poll until the child exits or the deadline passes
    fn wait_until(&self, child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = child.try_wait().context("Failed waiting for module command")? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl DocumentModule for CommandModule {
    fn execute(&self, ctx: &ModuleContext) -> Result<ModuleOutcome> {
        let deadline = Instant::now() + ctx.timeout;
        let mut child = self.spawn(ctx)?;
        let pid = child.id();

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let Some(status) = self.wait_until(&mut child, deadline)? else {
            tracing::warn!(module = %ctx.module, pid, timeout = ?ctx.timeout, "module command timed out");
            process_guard::terminate_group(&mut child, self.grace_period);
            return Ok(ModuleOutcome::failed(format!("timed out after {:?}", ctx.timeout)));
        };

        // Background children must not outlive the module or hold its pipes open
        if process_guard::group_alive(pid) {
            tracing::debug!(module = %ctx.module, pid, "stopping processes left behind by module command");
            process_guard::terminate_group(&mut child, self.grace_period);
        }

        let stdout = collect(stdout, deadline);
        let stderr = collect(stderr, deadline);
        let payload = parse_payload(&stdout);

        if status.success() {
            tracing::debug!(module = %ctx.module, "module command succeeded");
            return Ok(ModuleOutcome::completed(payload));
        }

        let reason = match status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        let tail = stderr_tail(&stderr);
        tracing::debug!(module = %ctx.module, %reason, "module command failed");

        let message = if tail.is_empty() {
            reason
        } else {
            format!("{reason}: {tail}")
        };
        Ok(ModuleOutcome::failed(message).with_payload(payload))
    }
}

/// Read a pipe to the end on a helper thread so the child never blocks on a full pipe
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            let _ = tx.send(String::from_utf8_lossy(&bytes).into_owned());
        });
        rx
    })
}

/// Output of a drained pipe. A process outside the group can keep the pipe
/// open, so waiting stops at the deadline (plus a short flush allowance).
fn collect(pipe: Option<Receiver<String>>, deadline: Instant) -> String {
    let Some(rx) = pipe else {
        return String::new();
    };
    let wait = deadline.saturating_duration_since(Instant::now()).max(PIPE_FLUSH);
    rx.recv_timeout(wait).unwrap_or_default()
}

fn parse_payload(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

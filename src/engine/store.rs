//! Durable workflow records.
//!
//! One JSON record per named workflow inside the state directory:
//!
//! | File                     | Purpose                                       |
//! |--------------------------|-----------------------------------------------|
//! | `<name>.json`            | Current record                                |
//! | `<name>.json.bak.1..N`   | Previous valid generations, newest first      |
//! | `<name>.json.tmp`        | Write in progress (never read)                |
//! | `<name>.lock`            | Advisory `flock` held by mutating operations  |
//!
//! # Write Protocol
//!
//! 1. Rotate backups (only a record that still parses is rotated in)
//! 2. Write the new record to `<name>.json.tmp`, `fsync`
//! 3. `rename` over `<name>.json`, `fsync` the directory
//!
//! A crash at any point leaves either the previous record, the new record, or
//! (if the primary was damaged by something else) a valid backup.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use thiserror::Error;

use crate::types::WorkflowStatus;
use crate::workflow_state::Workflow;

/// Default number of prior generations kept next to each record
pub const DEFAULT_BACKUP_GENERATIONS: usize = 3;

const RECORD_EXTENSION: &str = "json";

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Workflow '{name}' not found")]
    WorkflowNotFound { name: String },

    #[error("Workflow '{name}' already exists (use overwrite to replace it)")]
    DuplicateWorkflow { name: String },

    /// Neither the record nor any backup is structurally valid
    #[error("Workflow '{name}' is corrupted: {reason}")]
    Corrupted { name: String, reason: String },

    /// Stored state diverged from what the caller loaded
    #[error(
        "Workflow '{name}' was modified concurrently (expected revision {expected}, found {found}); reload and try again"
    )]
    ConcurrentModification {
        name: String,
        expected: u64,
        found: u64,
    },

    /// Another invocation holds the workflow lock
    #[error("Workflow '{name}' is in use by another invocation")]
    Busy { name: String },

    #[error("Failed to write {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: String },

    #[error("Failed to read {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },
}

impl PersistenceError {
    fn write(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    fn read(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

// ============================================================================
// Atomic Writes
// ============================================================================

/// Write `bytes` to `path` so that readers see either the old or the new
/// content, never a prefix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp_path = temp_path_for(path);

    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Workflow names become file names, so they are restricted to a safe set
pub fn validate_workflow_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("workflow name cannot be empty".to_string());
    }
    if name.len() > 128 {
        return Err("workflow name is longer than 128 characters".to_string());
    }
    if name.starts_with('.') {
        return Err("workflow name cannot start with '.'".to_string());
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("workflow name contains invalid character '{c}'"));
    }
    Ok(())
}

// ============================================================================
// Lock
// ============================================================================

/// Exclusive advisory lock on one workflow; released on drop
pub struct WorkflowLock {
    name: String,
    _lock: Flock<File>,
}

impl WorkflowLock {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for WorkflowLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowLock").field("name", &self.name).finish()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Record loaded from disk
#[derive(Debug, Clone)]
pub struct LoadedRecord {
    pub workflow: Workflow,
    /// Backup the record was recovered from, if the primary was unusable
    pub recovered_from: Option<PathBuf>,
}

/// One line of `list_workflows`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowListing {
    pub name: String,
    pub target_directory: Option<PathBuf>,
    pub status: Option<WorkflowStatus>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub corrupted: bool,
}

/// Directory of workflow records
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    root: PathBuf,
    backup_generations: usize,
}

impl WorkflowStore {
    /// Open (and create if needed) a state directory
    pub fn open(root: impl Into<PathBuf>, backup_generations: usize) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PersistenceError::write(&root, e))?;
        tracing::debug!(root = %root.display(), backup_generations, "workflow store opened");
        Ok(Self {
            root,
            backup_generations,
        })
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{RECORD_EXTENSION}"))
    }

    pub fn backup_path(&self, name: &str, generation: usize) -> PathBuf {
        self.root.join(format!("{name}.{RECORD_EXTENSION}.bak.{generation}"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.lock"))
    }

    /// Take the workflow lock without waiting.
    ///
    /// # Errors
    ///
    /// `Busy` if another invocation (or another handle in this process) holds it.
    pub fn try_lock(&self, name: &str) -> Result<WorkflowLock, PersistenceError> {
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| PersistenceError::write(&path, e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(WorkflowLock {
                name: name.to_string(),
                _lock: lock,
            }),
            Err((_, Errno::EWOULDBLOCK)) => {
                tracing::debug!(workflow = %name, "workflow lock is held elsewhere");
                Err(PersistenceError::Busy {
                    name: name.to_string(),
                })
            }
            Err((_, errno)) => Err(PersistenceError::write(&path, errno)),
        }
    }

    /// True if a record or any backup exists for `name`
    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).exists()
            || (1..=self.backup_generations).any(|g| self.backup_path(name, g).exists())
    }

    /// Read a record, falling back to the newest valid backup.
    ///
    /// # Errors
    ///
    /// - `WorkflowNotFound` if neither record nor backups exist
    /// - `Corrupted` if none of them is structurally valid
    pub fn read(&self, name: &str) -> Result<LoadedRecord, PersistenceError> {
        let primary = self.record_path(name);
        let mut found_any = false;
        let mut first_problem: Option<String> = None;

        match self.read_candidate(name, &primary)? {
            Candidate::Valid(workflow) => {
                return Ok(LoadedRecord {
                    workflow: *workflow,
                    recovered_from: None,
                });
            }
            Candidate::Missing => {}
            Candidate::Invalid(reason) => {
                tracing::warn!(workflow = %name, %reason, "workflow record unusable, trying backups");
                found_any = true;
                first_problem = Some(reason);
            }
        }

        for generation in 1..=self.backup_generations {
            let path = self.backup_path(name, generation);
            match self.read_candidate(name, &path)? {
                Candidate::Valid(workflow) => {
                    tracing::warn!(
                        workflow = %name,
                        backup = %path.display(),
                        revision = workflow.revision,
                        "recovered workflow from backup"
                    );
                    return Ok(LoadedRecord {
                        workflow: *workflow,
                        recovered_from: Some(path),
                    });
                }
                Candidate::Missing => {}
                Candidate::Invalid(reason) => {
                    found_any = true;
                    first_problem.get_or_insert(reason);
                }
            }
        }

        if found_any {
            Err(PersistenceError::Corrupted {
                name: name.to_string(),
                reason: first_problem.unwrap_or_else(|| "no valid generation".to_string()),
            })
        } else {
            Err(PersistenceError::WorkflowNotFound {
                name: name.to_string(),
            })
        }
    }

    fn read_candidate(&self, name: &str, path: &Path) -> Result<Candidate, PersistenceError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Candidate::Missing),
            Err(e) => return Err(PersistenceError::read(path, e)),
        };

        let workflow: Workflow = match serde_json::from_slice(&bytes) {
            Ok(workflow) => workflow,
            Err(e) => return Ok(Candidate::Invalid(format!("{}: {e}", path.display()))),
        };
        if workflow.name != name {
            return Ok(Candidate::Invalid(format!(
                "{}: record belongs to workflow '{}'",
                path.display(),
                workflow.name
            )));
        }
        if let Err(reason) = workflow.validate() {
            return Ok(Candidate::Invalid(format!("{}: {reason}", path.display())));
        }
        Ok(Candidate::Valid(Box::new(workflow)))
    }

    /// Persist a record while holding its lock
    pub fn write(&self, lock: &WorkflowLock, workflow: &Workflow) -> Result<(), PersistenceError> {
        let path = self.record_path(&workflow.name);
        if lock.name() != workflow.name {
            return Err(PersistenceError::write(
                &path,
                format!("lock is held for '{}', not '{}'", lock.name(), workflow.name),
            ));
        }

        let content =
            serde_json::to_vec_pretty(workflow).map_err(|e| PersistenceError::write(&path, e))?;

        self.rotate_backups(&workflow.name)?;
        write_atomic(&path, &content).map_err(|e| PersistenceError::write(&path, e))?;

        tracing::debug!(
            workflow = %workflow.name,
            revision = workflow.revision,
            "workflow record written"
        );
        Ok(())
    }

    /// Shift `.bak.i` to `.bak.i+1` and copy the current record to `.bak.1`,
    /// but only if the current record is valid.
    fn rotate_backups(&self, name: &str) -> Result<(), PersistenceError> {
        if self.backup_generations == 0 {
            return Ok(());
        }
        let primary = self.record_path(name);
        if !matches!(self.read_candidate(name, &primary)?, Candidate::Valid(_)) {
            return Ok(());
        }

        for generation in (1..self.backup_generations).rev() {
            let from = self.backup_path(name, generation);
            if from.exists() {
                let to = self.backup_path(name, generation + 1);
                fs::rename(&from, &to).map_err(|e| PersistenceError::write(&to, e))?;
            }
        }

        let first = self.backup_path(name, 1);
        let bytes = fs::read(&primary).map_err(|e| PersistenceError::read(&primary, e))?;
        write_atomic(&first, &bytes).map_err(|e| PersistenceError::write(&first, e))?;
        Ok(())
    }

    /// Delete a record and all of its backups (used when overwriting)
    pub fn remove(&self, lock: &WorkflowLock, name: &str) -> Result<(), PersistenceError> {
        if lock.name() != name {
            return Err(PersistenceError::write(
                &self.record_path(name),
                format!("lock is held for '{}'", lock.name()),
            ));
        }
        let paths = std::iter::once(self.record_path(name))
            .chain((1..=self.backup_generations).map(|g| self.backup_path(name, g)));
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(PersistenceError::write(&path, e)),
            }
        }
        tracing::info!(workflow = %name, "workflow record removed");
        Ok(())
    }

    /// Every stored workflow, sorted by name. Unreadable records are listed
    /// with `corrupted: true` instead of failing the listing.
    pub fn list(&self) -> Result<Vec<WorkflowListing>, PersistenceError> {
        let entries = fs::read_dir(&self.root).map_err(|e| PersistenceError::read(&self.root, e))?;

        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PersistenceError::read(&self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_workflow_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        let listings = names
            .into_iter()
            .map(|name| match self.read(&name) {
                Ok(loaded) => WorkflowListing {
                    target_directory: Some(loaded.workflow.target_directory),
                    status: Some(loaded.workflow.status),
                    last_updated_at: Some(loaded.workflow.last_updated_at),
                    corrupted: false,
                    name,
                },
                Err(err) => {
                    tracing::warn!(workflow = %name, error = %err, "unreadable workflow record");
                    WorkflowListing {
                        name,
                        target_directory: None,
                        status: None,
                        last_updated_at: None,
                        corrupted: true,
                    }
                }
            })
            .collect();
        Ok(listings)
    }
}

enum Candidate {
    Missing,
    Invalid(String),
    Valid(Box<Workflow>),
}

//! Runtime settings
//!
//! Where docflow keeps its state and finds its configuration documents.
//! Layered, later layers win:
//!
//! | Layer        | Source                                                   |
//! |--------------|----------------------------------------------------------|
//! | Defaults     | XDG state/config directories, `./docflow.json`           |
//! | Environment  | `DOCFLOW_STATE_DIR`, `DOCFLOW_MANIFEST`,                 |
//! |              | `DOCFLOW_PREFERENCES`, `DOCFLOW_TIMEOUT_SECS`,           |
//! |              | `DOCFLOW_BACKUP_GENERATIONS`                             |
//! | CLI flags    | [`SettingsOverrides`]                                    |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::engine::executor::DEFAULT_MODULE_TIMEOUT;
use crate::engine::store::DEFAULT_BACKUP_GENERATIONS;
use crate::error::{DocflowError, Result};

pub const ENV_STATE_DIR: &str = "DOCFLOW_STATE_DIR";
pub const ENV_MANIFEST: &str = "DOCFLOW_MANIFEST";
pub const ENV_PREFERENCES: &str = "DOCFLOW_PREFERENCES";
pub const ENV_TIMEOUT_SECS: &str = "DOCFLOW_TIMEOUT_SECS";
pub const ENV_BACKUP_GENERATIONS: &str = "DOCFLOW_BACKUP_GENERATIONS";

/// Upper bound on kept backups; every load checks each generation
pub const MAX_BACKUP_GENERATIONS: usize = 32;

/// Default developer manifest, relative to the working directory
pub const DEFAULT_MANIFEST: &str = "docflow.json";

/// Resolved runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    /// Directory holding workflow records, backups and locks
    pub state_dir: PathBuf,
    /// Developer manifest (module catalogue and constraints)
    pub manifest_path: PathBuf,
    /// Per-user enable/disable switches
    pub preferences_path: PathBuf,
    /// Time bound for modules without their own timeout
    pub module_timeout: Duration,
    /// Prior record generations kept per workflow
    pub backup_generations: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let state_base = dirs::state_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("state")))
            .unwrap_or_else(|| PathBuf::from("."));
        let config_base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            state_dir: state_base.join("docflow"),
            manifest_path: PathBuf::from(DEFAULT_MANIFEST),
            preferences_path: config_base.join("docflow").join("preferences.json"),
            module_timeout: DEFAULT_MODULE_TIMEOUT,
            backup_generations: DEFAULT_BACKUP_GENERATIONS,
        }
    }
}

/// Values given on the command line; `None` keeps the lower layer
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub state_dir: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub preferences_path: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub backup_generations: Option<usize>,
}

impl Settings {
    /// Defaults, then `DOCFLOW_*` environment variables, then `overrides`
    pub fn load(overrides: SettingsOverrides) -> Result<Self> {
        let settings = Self::from_lookup(|key| std::env::var(key).ok())?.apply(overrides);
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overlaid with variables from `lookup` (the environment in
    /// production, a map in tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(dir) = lookup(ENV_STATE_DIR).filter(|v| !v.is_empty()) {
            settings.state_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(ENV_MANIFEST).filter(|v| !v.is_empty()) {
            settings.manifest_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_PREFERENCES).filter(|v| !v.is_empty()) {
            settings.preferences_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_TIMEOUT_SECS)? {
            settings.module_timeout = Duration::from_secs(secs);
        }
        if let Some(generations) = parse_var::<usize>(&lookup, ENV_BACKUP_GENERATIONS)? {
            settings.backup_generations = generations;
        }
        Ok(settings)
    }

    pub fn apply(mut self, overrides: SettingsOverrides) -> Self {
        if let Some(dir) = overrides.state_dir {
            self.state_dir = dir;
        }
        if let Some(path) = overrides.manifest_path {
            self.manifest_path = path;
        }
        if let Some(path) = overrides.preferences_path {
            self.preferences_path = path;
        }
        if let Some(secs) = overrides.timeout_secs {
            self.module_timeout = Duration::from_secs(secs);
        }
        if let Some(generations) = overrides.backup_generations {
            self.backup_generations = generations;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.module_timeout.is_zero() {
            return Err(DocflowError::configuration(
                "timeout_secs",
                "module timeout must be at least one second",
            ));
        }
        if !(1..=MAX_BACKUP_GENERATIONS).contains(&self.backup_generations) {
            return Err(DocflowError::configuration(
                "backup_generations",
                format!(
                    "must be between 1 and {MAX_BACKUP_GENERATIONS}, got {}",
                    self.backup_generations
                ),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| DocflowError::configuration(key, format!("invalid value '{raw}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert!(settings.state_dir.ends_with("docflow"));
        assert_eq!(settings.manifest_path, PathBuf::from("docflow.json"));
        assert!(settings.preferences_path.ends_with("docflow/preferences.json"));
        assert_eq!(settings.module_timeout, DEFAULT_MODULE_TIMEOUT);
        assert_eq!(settings.backup_generations, 3);
    }

    #[test]
    fn test_environment_overrides_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            (ENV_STATE_DIR, "/var/lib/docflow"),
            (ENV_TIMEOUT_SECS, "30"),
            (ENV_BACKUP_GENERATIONS, "5"),
        ]))
        .unwrap();
        assert_eq!(settings.state_dir, PathBuf::from("/var/lib/docflow"));
        assert_eq!(settings.module_timeout, Duration::from_secs(30));
        assert_eq!(settings.backup_generations, 5);
    }

    #[test]
    fn test_cli_overrides_environment() {
        let settings = Settings::from_lookup(lookup(&[(ENV_STATE_DIR, "/env")]))
            .unwrap()
            .apply(SettingsOverrides {
                state_dir: Some(PathBuf::from("/cli")),
                timeout_secs: Some(9),
                ..Default::default()
            });
        assert_eq!(settings.state_dir, PathBuf::from("/cli"));
        assert_eq!(settings.module_timeout, Duration::from_secs(9));
    }

    #[test]
    fn test_invalid_environment_value_names_variable() {
        let err = Settings::from_lookup(lookup(&[(ENV_TIMEOUT_SECS, "soon")])).unwrap_err();
        assert!(matches!(err, DocflowError::Configuration { ref key, .. } if key == ENV_TIMEOUT_SECS));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let settings = Settings::default().apply(SettingsOverrides {
            timeout_secs: Some(0),
            ..Default::default()
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_backup_generations_must_keep_at_least_one() {
        let settings = Settings::default().apply(SettingsOverrides {
            backup_generations: Some(0),
            ..Default::default()
        });
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, DocflowError::Configuration { ref key, .. } if key == "backup_generations"));
    }

    #[test]
    fn test_backup_generations_are_capped() {
        let at_cap = Settings::default().apply(SettingsOverrides {
            backup_generations: Some(MAX_BACKUP_GENERATIONS),
            ..Default::default()
        });
        assert!(at_cap.validate().is_ok());

        let settings = Settings::from_lookup(lookup(&[(ENV_BACKUP_GENERATIONS, "1000000000")])).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, DocflowError::Configuration { ref key, .. } if key == "backup_generations"));
    }
}

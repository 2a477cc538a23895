//! Configuration documents consumed by the resolver.
//!
//! Three independently authored inputs:
//!
//! | Document            | Author    | Persisted | Purpose                                   |
//! |---------------------|-----------|-----------|-------------------------------------------|
//! | `DeveloperManifest` | developer | yes       | module catalogue, required/default/order  |
//! | `UserPreferences`   | user      | yes       | module → enabled for non-required modules |
//! | override map        | operator  | never     | one-shot module → enabled from the CLI    |
//!
//! All documents are flat, versioned JSON. Unknown keys are collected as
//! warnings and ignored; a missing file yields the all-default document.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::engine::store::write_atomic;
use crate::error::{DocflowError, Result};
use crate::module_manifest::ModuleDescriptor;
use crate::types::Maturity;

/// Highest document version this build understands
pub const SUPPORTED_VERSION: u32 = 1;

fn default_version() -> u32 {
    SUPPORTED_VERSION
}

fn default_true() -> bool {
    true
}

fn default_module_version() -> String {
    "0.0.0".to_string()
}

// ============================================================================
// Warnings
// ============================================================================

/// Which configuration layer a warning refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfigSource {
    Developer,
    User,
    Override,
}

/// Non-fatal configuration finding, collected rather than silently ignored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigWarning {
    /// Document contains a key this version does not understand
    UnknownKey { document: String, key: String },
    /// Configuration names a module the registry does not know
    UnknownModule { source: ConfigSource, name: String },
    /// An experimental module was switched on by user or override
    ExperimentalEnabled { source: ConfigSource, name: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey { document, key } => {
                write!(f, "{}: unknown key '{}' ignored", document, key)
            }
            Self::UnknownModule { source, name } => {
                write!(f, "{} configuration names unknown module '{}' (ignored)", source, name)
            }
            Self::ExperimentalEnabled { source, name } => {
                write!(f, "experimental module '{}' enabled by {} configuration", name, source)
            }
        }
    }
}

/// A parsed document plus the warnings found while reading it
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub document: T,
    pub warnings: Vec<ConfigWarning>,
}

fn unknown_keys(document: &str, extra: &BTreeMap<String, Value>) -> Vec<ConfigWarning> {
    extra
        .keys()
        .map(|key| ConfigWarning::UnknownKey {
            document: document.to_string(),
            key: key.clone(),
        })
        .collect()
}

/// Read a JSON document, mapping a missing file to `None`
fn read_document<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "configuration file not found, using defaults");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| DocflowError::configuration(path.display().to_string(), e.to_string()))
}

fn check_version(path: &Path, version: u32) -> Result<()> {
    if version > SUPPORTED_VERSION {
        return Err(DocflowError::configuration(
            format!("{}:version", path.display()),
            format!(
                "document version {} is newer than supported version {}",
                version, SUPPORTED_VERSION
            ),
        ));
    }
    Ok(())
}

// ============================================================================
// Developer Manifest
// ============================================================================

/// External program implementing a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One module entry in the developer manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestModule {
    pub name: String,

    #[serde(default = "default_module_version")]
    pub version: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default = "default_true")]
    pub default_enabled: bool,

    /// Lower hints run earlier among modules that are otherwise unordered
    #[serde(default)]
    pub order_hint: Option<i64>,

    #[serde(default)]
    pub maturity: Maturity,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub command: Option<CommandSpec>,

    /// Opaque configuration block handed to the module
    #[serde(default)]
    pub config: Value,

    /// Per-module override of the engine timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ManifestModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_module_version(),
            dependencies: Vec::new(),
            required: false,
            default_enabled: true,
            order_hint: None,
            maturity: Maturity::Stable,
            description: String::new(),
            command: None,
            config: Value::Null,
            timeout_secs: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn to_descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            dependencies: self.dependencies.iter().cloned().collect(),
            required: self.required,
            maturity: self.maturity,
            description: self.description.clone(),
        }
    }
}

/// Developer-authored module catalogue and constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeveloperManifest {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub modules: Vec<ManifestModule>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for DeveloperManifest {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            modules: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl DeveloperManifest {
    /// Load the manifest; a missing file yields an empty catalogue
    pub fn load(path: impl AsRef<Path>) -> Result<Loaded<Self>> {
        let path = path.as_ref();
        let document: Self = read_document(path)?.unwrap_or_default();
        check_version(path, document.version)?;

        let name = path.display().to_string();
        let mut warnings = unknown_keys(&name, &document.extra);
        for module in &document.modules {
            warnings.extend(unknown_keys(&format!("{} module '{}'", name, module.name), &module.extra));
        }

        Ok(Loaded { document, warnings })
    }

    /// Parse a manifest from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let document: Self = serde_json::from_str(json)
            .map_err(|e| DocflowError::configuration("manifest", e.to_string()))?;
        check_version(Path::new("manifest"), document.version)?;
        Ok(document)
    }

    /// Descriptors for the registry (discovery source)
    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.modules.iter().map(ManifestModule::to_descriptor).collect()
    }

    /// Developer configuration layer for the resolver and planner
    pub fn developer_config(&self) -> DeveloperConfig {
        DeveloperConfig {
            modules: self
                .modules
                .iter()
                .map(|m| {
                    (
                        m.name.clone(),
                        DeveloperModuleConfig {
                            required: m.required,
                            default_enabled: m.default_enabled,
                            order_hint: m.order_hint,
                            module_config: m.config.clone(),
                            timeout_secs: m.timeout_secs,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn module(&self, name: &str) -> Option<&ManifestModule> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// Developer constraints for one module
#[derive(Debug, Clone, PartialEq)]
pub struct DeveloperModuleConfig {
    pub required: bool,
    pub default_enabled: bool,
    pub order_hint: Option<i64>,
    pub module_config: Value,
    pub timeout_secs: Option<u64>,
}

impl Default for DeveloperModuleConfig {
    fn default() -> Self {
        Self {
            required: false,
            default_enabled: true,
            order_hint: None,
            module_config: Value::Null,
            timeout_secs: None,
        }
    }
}

/// Developer configuration layer, keyed by module name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeveloperConfig {
    pub modules: BTreeMap<String, DeveloperModuleConfig>,
}

impl DeveloperConfig {
    pub fn get(&self, name: &str) -> Option<&DeveloperModuleConfig> {
        self.modules.get(name)
    }

    /// Modules not mentioned by the developer default to enabled
    pub fn default_enabled(&self, name: &str) -> bool {
        self.get(name).is_none_or(|m| m.default_enabled)
    }

    pub fn required(&self, name: &str) -> bool {
        self.get(name).is_some_and(|m| m.required)
    }

    pub fn order_hint(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|m| m.order_hint)
    }
}

// ============================================================================
// User Preferences
// ============================================================================

/// Per-user module switches (non-required modules only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub modules: BTreeMap<String, bool>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            modules: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl UserPreferences {
    /// Load preferences; a missing file yields empty preferences
    pub fn load(path: impl AsRef<Path>) -> Result<Loaded<Self>> {
        let path = path.as_ref();
        let document: Self = read_document(path)?.unwrap_or_default();
        check_version(path, document.version)?;
        let warnings = unknown_keys(&path.display().to_string(), &document.extra);
        Ok(Loaded { document, warnings })
    }

    /// Save preferences atomically, creating the parent directory if needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        tracing::debug!(path = %path.display(), "user preferences saved");
        Ok(())
    }

    pub fn set(&mut self, module: impl Into<String>, enabled: bool) {
        self.modules.insert(module.into(), enabled);
    }
}

// ============================================================================
// Override Map
// ============================================================================

/// Parse one-shot `name=bool` overrides (e.g., from repeated `--set` flags).
///
/// Accepted values: `true`/`false`, `on`/`off`, `yes`/`no`, `1`/`0`.
pub fn parse_overrides<S: AsRef<str>>(entries: &[S]) -> Result<BTreeMap<String, bool>> {
    let mut overrides = BTreeMap::new();

    for entry in entries {
        let entry = entry.as_ref();
        let Some((name, value)) = entry.split_once('=') else {
            return Err(DocflowError::configuration(
                format!("override.{}", entry),
                "expected NAME=true|false",
            ));
        };
        let name = name.trim();
        let enabled = match value.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => true,
            "false" | "off" | "no" | "0" => false,
            other => {
                return Err(DocflowError::configuration(
                    format!("override.{}", name),
                    format!("'{}' is not a boolean", other),
                ));
            }
        };
        if overrides.insert(name.to_string(), enabled).is_some_and(|prev| prev != enabled) {
            return Err(DocflowError::configuration(
                format!("override.{}", name),
                "module is both enabled and disabled on the command line",
            ));
        }
    }

    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = DeveloperManifest::load(dir.path().join("docflow.json")).unwrap();
        assert!(manifest.document.modules.is_empty());
        assert!(manifest.warnings.is_empty());

        let prefs = UserPreferences::load(dir.path().join("prefs.json")).unwrap();
        assert!(prefs.document.modules.is_empty());
    }

    #[test]
    fn test_manifest_defaults_and_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docflow.json");
        fs::write(
            &path,
            json!({
                "version": 1,
                "colour": "blue",
                "modules": [
                    {"name": "EntityRef", "version": "1.2"},
                    {"name": "Migrate", "dependencies": ["EntityRef"], "order_hint": 5, "flavour": 1}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let loaded = DeveloperManifest::load(&path).unwrap();
        let manifest = loaded.document;
        assert_eq!(manifest.modules.len(), 2);
        assert!(manifest.modules[0].default_enabled);
        assert_eq!(manifest.modules[1].version, "0.0.0");
        assert_eq!(manifest.modules[1].order_hint, Some(5));

        let keys: Vec<String> = loaded
            .warnings
            .iter()
            .filter_map(|w| match w {
                ConfigWarning::UnknownKey { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec!["colour".to_string(), "flavour".to_string()]);
    }

    #[test]
    fn test_newer_version_rejected() {
        let err = DeveloperManifest::from_json(r#"{"version": 99, "modules": []}"#).unwrap_err();
        assert!(matches!(err, DocflowError::Configuration { .. }));
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_malformed_manifest_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docflow.json");
        fs::write(&path, "{ not json").unwrap();
        let err = DeveloperManifest::load(&path).unwrap_err();
        assert!(err.to_string().contains("docflow.json"));
    }

    #[test]
    fn test_developer_config_projection() {
        let manifest = DeveloperManifest::from_json(
            r#"{"modules": [{"name": "A", "required": true, "default_enabled": false, "config": {"x": 1}}]}"#,
        )
        .unwrap();
        let dev = manifest.developer_config();
        assert!(dev.required("A"));
        assert!(!dev.default_enabled("A"));
        assert!(dev.default_enabled("Unlisted"));
        assert_eq!(dev.get("A").unwrap().module_config, json!({"x": 1}));
    }

    #[test]
    fn test_preferences_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("preferences.json");

        let mut prefs = UserPreferences::default();
        prefs.set("ContentType", false);
        prefs.save(&path).unwrap();

        let reloaded = UserPreferences::load(&path).unwrap().document;
        assert_eq!(reloaded.modules.get("ContentType"), Some(&false));
    }

    #[test]
    fn test_parse_overrides() {
        let overrides = parse_overrides(&["EntityRef=false", "Migrate = on"]).unwrap();
        assert_eq!(overrides.get("EntityRef"), Some(&false));
        assert_eq!(overrides.get("Migrate"), Some(&true));
    }

    #[test]
    fn test_parse_overrides_rejects_garbage() {
        assert!(parse_overrides(&["EntityRef"]).is_err());
        assert!(parse_overrides(&["EntityRef=maybe"]).is_err());
        assert!(parse_overrides(&["A=true", "A=false"]).is_err());
    }
}

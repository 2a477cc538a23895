//! Configuration Resolver
//!
//! Merges the three configuration layers into one enabled/disabled decision
//! per registered module.
//!
//! # Design
//!
//! - **Pure logic**: No I/O, no side effects, no prompts
//! - **Deterministic**: Output is a `BTreeMap`, warnings are emitted in name order
//! - **Never silent**: unknown names become warnings, required-module
//!   violations become errors
//!
//! # Resolution Rules
//!
//! ```text
//! enabled = required OR (override[name] ?? user[name] ?? developer_default[name])
//! ```
//!
//! | Situation                                  | Result                          |
//! |--------------------------------------------|---------------------------------|
//! | required module disabled by user/override  | `ConfigurationError`            |
//! | unknown module in user/override/developer  | warning, entry ignored          |
//! | experimental module switched on by a user  | warning, module enabled         |

use std::collections::BTreeMap;

use crate::config_file::{ConfigSource, ConfigWarning, DeveloperConfig};
use crate::error::{DocflowError, Result};
use crate::module_manifest::ModuleRegistry;
use crate::types::Maturity;

/// Output of the resolver: one decision per registered module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Every registered module, enabled or not (disabled ones are kept so the
    /// planner can report dependency violations)
    pub enabled: BTreeMap<String, bool>,
    /// Non-fatal findings collected during resolution
    pub warnings: Vec<ConfigWarning>,
}

impl Resolution {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).copied().unwrap_or(false)
    }

    /// Names of enabled modules, sorted
    pub fn enabled_modules(&self) -> impl Iterator<Item = &str> {
        self.enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.as_str())
    }
}

/// Resolve enabled/disabled decisions for every module in the registry.
///
/// # Errors
///
/// Returns `DocflowError::Configuration` naming the offending key when a
/// required module is disabled through user preferences or an override.
///
/// # What This Explicitly Refuses To Do
///
/// - Auto-enable dependencies: the planner reports those as errors
/// - Ask the user anything: ambiguity is returned, never prompted for
pub fn resolve(
    registry: &ModuleRegistry,
    developer: &DeveloperConfig,
    user: &BTreeMap<String, bool>,
    overrides: &BTreeMap<String, bool>,
) -> Result<Resolution> {
    let mut warnings = Vec::new();

    for (source, names) in [
        (ConfigSource::Developer, developer.modules.keys().collect::<Vec<_>>()),
        (ConfigSource::User, user.keys().collect()),
        (ConfigSource::Override, overrides.keys().collect()),
    ] {
        for name in names {
            if !registry.contains(name) {
                tracing::warn!(module = %name, %source, "configuration names unknown module");
                warnings.push(ConfigWarning::UnknownModule {
                    source,
                    name: name.clone(),
                });
            }
        }
    }

    let mut enabled = BTreeMap::new();

    for descriptor in registry.list_modules() {
        let name = descriptor.name.as_str();
        let required = descriptor.required || developer.required(name);

        if required {
            if overrides.get(name) == Some(&false) {
                return Err(DocflowError::configuration(
                    format!("override.{}", name),
                    format!("module '{}' is required and cannot be disabled", name),
                ));
            }
            if user.get(name) == Some(&false) {
                return Err(DocflowError::configuration(
                    format!("preferences.modules.{}", name),
                    format!("module '{}' is required and cannot be disabled", name),
                ));
            }
            enabled.insert(name.to_string(), true);
            continue;
        }

        let (decision, source) = match (overrides.get(name), user.get(name)) {
            (Some(&value), _) => (value, ConfigSource::Override),
            (None, Some(&value)) => (value, ConfigSource::User),
            (None, None) => (developer.default_enabled(name), ConfigSource::Developer),
        };

        if decision && descriptor.maturity == Maturity::Experimental && source != ConfigSource::Developer {
            warnings.push(ConfigWarning::ExperimentalEnabled {
                source,
                name: name.to_string(),
            });
        }

        enabled.insert(name.to_string(), decision);
    }

    tracing::debug!(
        enabled = enabled.values().filter(|on| **on).count(),
        total = enabled.len(),
        warnings = warnings.len(),
        "configuration resolved"
    );

    Ok(Resolution { enabled, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::DeveloperModuleConfig;
    use crate::module_manifest::ModuleDescriptor;

    fn registry() -> ModuleRegistry {
        ModuleRegistry::from_descriptors([
            ModuleDescriptor::builder("EntityRef", "1.0").required().build().unwrap(),
            ModuleDescriptor::builder("ContentType", "1.0").build().unwrap(),
            ModuleDescriptor::builder("Migrate", "1.0")
                .depends_on("EntityRef")
                .depends_on("ContentType")
                .build()
                .unwrap(),
            ModuleDescriptor::builder("Lint", "0.1")
                .maturity(Maturity::Experimental)
                .build()
                .unwrap(),
        ])
        .unwrap()
    }

    fn developer() -> DeveloperConfig {
        let mut dev = DeveloperConfig::default();
        dev.modules.insert(
            "Lint".to_string(),
            DeveloperModuleConfig {
                default_enabled: false,
                ..Default::default()
            },
        );
        dev
    }

    fn map(entries: &[(&str, bool)]) -> BTreeMap<String, bool> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_developer_defaults_apply() {
        let res = resolve(&registry(), &developer(), &map(&[]), &map(&[])).unwrap();
        assert!(res.is_enabled("EntityRef"));
        assert!(res.is_enabled("ContentType"));
        assert!(res.is_enabled("Migrate"));
        assert!(!res.is_enabled("Lint"));
        assert_eq!(res.enabled.len(), 4);
        assert!(res.warnings.is_empty());
    }

    #[test]
    fn test_precedence_override_over_user_over_developer() {
        let user = map(&[("ContentType", false), ("Migrate", false)]);
        let overrides = map(&[("Migrate", true)]);
        let res = resolve(&registry(), &developer(), &user, &overrides).unwrap();
        assert!(!res.is_enabled("ContentType"));
        assert!(res.is_enabled("Migrate"));
    }

    #[test]
    fn test_required_module_cannot_be_disabled_by_user() {
        let err = resolve(&registry(), &developer(), &map(&[("EntityRef", false)]), &map(&[]))
            .unwrap_err();
        match err {
            DocflowError::Configuration { key, .. } => {
                assert_eq!(key, "preferences.modules.EntityRef")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_required_module_cannot_be_disabled_by_override() {
        let err = resolve(&registry(), &developer(), &map(&[]), &map(&[("EntityRef", false)]))
            .unwrap_err();
        assert!(matches!(err, DocflowError::Configuration { ref key, .. } if key == "override.EntityRef"));
    }

    #[test]
    fn test_required_via_developer_config() {
        let mut dev = developer();
        dev.modules.insert(
            "ContentType".to_string(),
            DeveloperModuleConfig {
                required: true,
                default_enabled: false,
                ..Default::default()
            },
        );
        let res = resolve(&registry(), &dev, &map(&[]), &map(&[])).unwrap();
        assert!(res.is_enabled("ContentType"));
        assert!(resolve(&registry(), &dev, &map(&[("ContentType", false)]), &map(&[])).is_err());
    }

    #[test]
    fn test_unknown_modules_collected_as_warnings() {
        let res = resolve(
            &registry(),
            &developer(),
            &map(&[("Ghost", true)]),
            &map(&[("Phantom", false)]),
        )
        .unwrap();
        assert_eq!(
            res.warnings,
            vec![
                ConfigWarning::UnknownModule {
                    source: ConfigSource::User,
                    name: "Ghost".to_string()
                },
                ConfigWarning::UnknownModule {
                    source: ConfigSource::Override,
                    name: "Phantom".to_string()
                },
            ]
        );
        assert!(!res.enabled.contains_key("Ghost"));
    }

    #[test]
    fn test_experimental_enabled_by_user_warns() {
        let res = resolve(&registry(), &developer(), &map(&[("Lint", true)]), &map(&[])).unwrap();
        assert!(res.is_enabled("Lint"));
        assert!(res.warnings.contains(&ConfigWarning::ExperimentalEnabled {
            source: ConfigSource::User,
            name: "Lint".to_string()
        }));
    }

    #[test]
    fn test_enabling_required_module_is_accepted() {
        let res = resolve(&registry(), &developer(), &map(&[("EntityRef", true)]), &map(&[])).unwrap();
        assert!(res.is_enabled("EntityRef"));
    }
}

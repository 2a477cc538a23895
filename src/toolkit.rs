//! Toolkit assembly
//!
//! Wires the configuration documents, the module registry, the resolver, the
//! planner and the engine together for one invocation. Everything here is
//! computed once and threaded through explicitly; there is no process-wide
//! "current configuration".

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::Settings;
use crate::config_file::{ConfigWarning, DeveloperManifest, UserPreferences};
use crate::engine::executor::WorkflowEngine;
use crate::engine::planner::{self, ResolvedPlan};
use crate::engine::store::WorkflowStore;
use crate::error::{DocflowError, Result};
use crate::logic::resolver;
use crate::module_manifest::ModuleRegistry;
use crate::module_runner::CommandModule;

/// Build the registry from the manifest, attaching a [`CommandModule`] to
/// every module that declares a command.
pub fn build_registry(manifest: &DeveloperManifest, base_dir: Option<&Path>) -> Result<ModuleRegistry> {
    let mut builder = ModuleRegistry::builder();
    for module in &manifest.modules {
        builder = builder.module(module.to_descriptor());
        if let Some(spec) = &module.command {
            builder = builder.handler(&module.name, Arc::new(CommandModule::from_spec(spec, base_dir)));
        }
    }
    Ok(builder.build()?)
}

/// A plan together with every warning collected on the way
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: ResolvedPlan,
    pub warnings: Vec<ConfigWarning>,
}

/// Everything one invocation needs
#[derive(Debug, Clone)]
pub struct Toolkit {
    pub settings: Settings,
    pub manifest: DeveloperManifest,
    pub preferences: UserPreferences,
    pub registry: ModuleRegistry,
    /// Warnings from reading the documents
    pub load_warnings: Vec<ConfigWarning>,
}

impl Toolkit {
    /// Load manifest and preferences named by `settings` and build the registry
    pub fn load(settings: Settings) -> Result<Self> {
        let manifest = DeveloperManifest::load(&settings.manifest_path)?;
        let preferences = UserPreferences::load(&settings.preferences_path)?;
        let base_dir = settings
            .manifest_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty());
        let registry = build_registry(&manifest.document, base_dir)?;

        let mut load_warnings = manifest.warnings;
        load_warnings.extend(preferences.warnings);
        for warning in &load_warnings {
            tracing::warn!(%warning, "configuration warning");
        }

        tracing::debug!(
            manifest = %settings.manifest_path.display(),
            modules = registry.len(),
            "toolkit loaded"
        );

        Ok(Self {
            settings,
            manifest: manifest.document,
            preferences: preferences.document,
            registry,
            load_warnings,
        })
    }

    /// Resolve configuration and compute the execution plan
    pub fn plan(&self, overrides: &BTreeMap<String, bool>) -> Result<PlanOutcome> {
        let developer = self.manifest.developer_config();
        let resolution = resolver::resolve(&self.registry, &developer, &self.preferences.modules, overrides)?;
        let plan = planner::build_plan(&self.registry, &developer, &resolution)?;

        let mut warnings = self.load_warnings.clone();
        warnings.extend(resolution.warnings);
        Ok(PlanOutcome { plan, warnings })
    }

    /// Engine over the configured state directory
    pub fn engine(&self) -> Result<WorkflowEngine> {
        let store = WorkflowStore::open(&self.settings.state_dir, self.settings.backup_generations)?;
        Ok(WorkflowEngine::new(store, self.registry.clone()).with_default_timeout(self.settings.module_timeout))
    }

    /// Persist a user preference for one module.
    ///
    /// # Errors
    ///
    /// `Configuration` if the module is unknown, or if `enabled` is false for
    /// a required module.
    pub fn set_module_enabled(&mut self, module: &str, enabled: bool) -> Result<()> {
        let key = format!("preferences.modules.{module}");
        let Some(descriptor) = self.registry.get(module) else {
            return Err(DocflowError::configuration(key, format!("unknown module '{module}'")));
        };
        let required = descriptor.required || self.manifest.module(module).is_some_and(|m| m.required);
        if required && !enabled {
            return Err(DocflowError::configuration(
                key,
                format!("module '{module}' is required and cannot be disabled"),
            ));
        }

        self.preferences.set(module, enabled);
        self.preferences.save(&self.settings.preferences_path)?;
        tracing::info!(module, enabled, "user preference saved");
        Ok(())
    }
}

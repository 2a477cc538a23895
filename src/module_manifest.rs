//! Module Registry
//!
//! Static catalogue of module descriptors, built once per process from a
//! discovery source (normally the developer manifest, see
//! [`config_file::DeveloperManifest`](crate::config_file::DeveloperManifest)).
//!
//! # Design Principles
//!
//! 1. **Immutable after build**: descriptors and handlers are fixed once
//!    [`RegistryBuilder::build`] succeeds
//! 2. **Fail Fast**: duplicate names, self-dependencies and dangling
//!    dependencies are rejected at build time with the offending names
//! 3. **Lookup by name**: the engine finds implementations through the
//!    registry and never branches on module identity

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::module_traits::DocumentModule;
use crate::types::Maturity;

/// Errors raised while building the registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two descriptors share a name
    #[error("Module '{name}' is registered more than once")]
    DuplicateModule { name: String },

    /// A dependency names a module that is not registered
    #[error("Module '{module}' depends on '{dependency}', which is not registered")]
    MissingDependency { module: String, dependency: String },

    /// A module lists itself as a dependency
    #[error("Module '{module}' depends on itself")]
    SelfDependency { module: String },

    /// A handler was attached for a name with no descriptor
    #[error("Implementation supplied for unknown module '{name}'")]
    UnknownModule { name: String },

    /// Descriptor fields are malformed
    #[error("Invalid module descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

/// Immutable description of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module name (e.g., "EntityRef")
    pub name: String,

    /// Module version for compatibility tracking
    pub version: String,

    /// Names of modules that must complete before this one
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Required modules can never be disabled by users or overrides
    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub maturity: Maturity,

    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

impl ModuleDescriptor {
    /// Create a new descriptor builder
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(name, version)
    }

    /// Validate the descriptor on its own (registry-wide checks happen in `build`)
    fn validate_structure(&self) -> Result<(), RegistryError> {
        validate_module_name(&self.name).map_err(|reason| RegistryError::InvalidDescriptor {
            name: self.name.clone(),
            reason,
        })?;

        if self.version.trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                name: self.name.clone(),
                reason: "version cannot be empty".to_string(),
            });
        }

        if self.dependencies.contains(&self.name) {
            return Err(RegistryError::SelfDependency {
                module: self.name.clone(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{} [{}]", self.name, self.version, self.maturity)?;
        if self.required {
            write!(f, " (required)")?;
        }
        Ok(())
    }
}

/// Module names appear in file keys and `name=bool` override flags.
///
/// Allowed: ASCII letters, digits, `_`, `-`, `.`; must start with a letter.
pub fn validate_module_name(name: &str) -> Result<(), String> {
    let Some(first) = name.chars().next() else {
        return Err("name cannot be empty".to_string());
    };
    if !first.is_ascii_alphabetic() {
        return Err("name must start with a letter".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err("name may only contain letters, digits, '_', '-' and '.'".to_string());
    }
    Ok(())
}

/// Builder for creating ModuleDescriptor instances
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    descriptor: ModuleDescriptor,
}

impl DescriptorBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            descriptor: ModuleDescriptor {
                name: name.into(),
                version: version.into(),
                dependencies: BTreeSet::new(),
                required: false,
                maturity: Maturity::Stable,
                description: String::new(),
            },
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.descriptor.dependencies.insert(dependency.into());
        self
    }

    /// Mark as required
    pub fn required(mut self) -> Self {
        self.descriptor.required = true;
        self
    }

    pub fn maturity(mut self, maturity: Maturity) -> Self {
        self.descriptor.maturity = maturity;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = description.into();
        self
    }

    /// Build the descriptor
    pub fn build(self) -> Result<ModuleDescriptor, RegistryError> {
        self.descriptor.validate_structure()?;
        Ok(self.descriptor)
    }
}

/// A descriptor together with its implementation, if one was supplied
#[derive(Clone)]
pub struct RegisteredModule {
    pub descriptor: ModuleDescriptor,
    handler: Option<Arc<dyn DocumentModule>>,
}

impl RegisteredModule {
    /// Implementation to run, if the discovery source provided one
    pub fn handler(&self) -> Option<Arc<dyn DocumentModule>> {
        self.handler.clone()
    }
}

impl fmt::Debug for RegisteredModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredModule")
            .field("descriptor", &self.descriptor)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Registry of known modules, keyed and iterated by name
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, RegisteredModule>,
    descriptors: Vec<ModuleDescriptor>,
}

impl ModuleRegistry {
    /// Start a new registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build a registry from descriptors alone (no implementations)
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ModuleDescriptor>,
    ) -> Result<Self, RegistryError> {
        descriptors
            .into_iter()
            .fold(Self::builder(), RegistryBuilder::module)
            .build()
    }

    /// All descriptors, sorted by name
    pub fn list_modules(&self) -> &[ModuleDescriptor] {
        &self.descriptors
    }

    /// Get a descriptor by name
    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name).map(|m| &m.descriptor)
    }

    /// Get the implementation registered for a module
    pub fn handler(&self, name: &str) -> Option<Arc<dyn DocumentModule>> {
        self.modules.get(name).and_then(RegisteredModule::handler)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules that declare `name` as a direct dependency, sorted by name
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.descriptors
            .iter()
            .filter(|d| d.dependencies.contains(name))
            .map(|d| d.name.as_str())
            .collect()
    }
}

/// Collects descriptors and handlers before validation
#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<ModuleDescriptor>,
    handlers: Vec<(String, Arc<dyn DocumentModule>)>,
}

impl RegistryBuilder {
    /// Add a descriptor
    pub fn module(mut self, descriptor: ModuleDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Attach an implementation to a descriptor added before or after this call
    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn DocumentModule>) -> Self {
        self.handlers.push((name.into(), handler));
        self
    }

    /// Validate and freeze the registry
    ///
    /// # Errors
    ///
    /// - `InvalidDescriptor` / `SelfDependency` for malformed descriptors
    /// - `DuplicateModule` if two descriptors share a name
    /// - `MissingDependency` if a dependency is not registered
    /// - `UnknownModule` if a handler names no descriptor
    pub fn build(self) -> Result<ModuleRegistry, RegistryError> {
        let mut modules: BTreeMap<String, RegisteredModule> = BTreeMap::new();

        for descriptor in self.descriptors {
            descriptor.validate_structure()?;
            if modules.contains_key(&descriptor.name) {
                return Err(RegistryError::DuplicateModule {
                    name: descriptor.name,
                });
            }
            modules.insert(
                descriptor.name.clone(),
                RegisteredModule {
                    descriptor,
                    handler: None,
                },
            );
        }

        for module in modules.values() {
            if let Some(missing) = module
                .descriptor
                .dependencies
                .iter()
                .find(|dep| !modules.contains_key(*dep))
            {
                return Err(RegistryError::MissingDependency {
                    module: module.descriptor.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        for (name, handler) in self.handlers {
            match modules.get_mut(&name) {
                Some(module) => module.handler = Some(handler),
                None => return Err(RegistryError::UnknownModule { name }),
            }
        }

        let descriptors = modules.values().map(|m| m.descriptor.clone()).collect();
        tracing::debug!(modules = modules.len(), "module registry built");

        Ok(ModuleRegistry {
            modules,
            descriptors,
        })
    }
}

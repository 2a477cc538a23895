//! Execution Planner
//!
//! Translates resolver decisions into a `ResolvedPlan`: a deterministic,
//! dependency-respecting order over the enabled modules.
//!
//! # Ordering
//!
//! Kahn's algorithm over the subgraph of enabled modules. Among modules that
//! are ready at the same time, the one with the lowest developer order hint
//! goes first (modules without a hint after all hinted ones), then lexical
//! name order. The same inputs always give the same plan, which matters
//! because plans are persisted and compared across resumed sessions.
//!
//! # Design
//!
//! - **Pure logic**: No I/O, no side effects, only generates the plan
//! - **Hard stops**: a cycle or a disabled/absent dependency aborts planning;
//!   nothing is auto-enabled
//! - **Self-contained output**: each entry snapshots what the engine needs
//!   (dependencies, module config, timeout) so a stored workflow does not
//!   depend on later configuration changes

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config_file::DeveloperConfig;
use crate::logic::resolver::Resolution;
use crate::module_manifest::ModuleRegistry;
use crate::types::Maturity;

// ============================================================================
// Errors
// ============================================================================

/// Why a dependency cannot be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingReason {
    Disabled,
    NotRegistered,
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::NotRegistered => write!(f, "not registered"),
        }
    }
}

/// Planning failures; raised before any workflow is created
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    /// The enabled modules contain a dependency cycle
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle {
        /// Full cycle, first module repeated at the end
        cycle: Vec<String>,
    },

    /// An enabled module depends on a disabled or unknown module
    #[error(
        "Module '{module}' depends on '{dependency}', which is {reason} (chain: {})",
        .chain.join(" -> ")
    )]
    UnsatisfiedDependency {
        module: String,
        dependency: String,
        reason: MissingReason,
        /// Path from a top-level enabled module down to the missing dependency
        chain: Vec<String>,
    },
}

// ============================================================================
// Plan Types
// ============================================================================

/// One module in a resolved plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    /// Direct dependencies, sorted
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub order_hint: Option<i64>,
    #[serde(default)]
    pub maturity: Maturity,
    /// Configuration block handed to the module at run time
    #[serde(default)]
    pub module_config: Value,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Ordered plan: enabled modules in execution order, then disabled modules
/// in name order (kept for display only)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPlan {
    pub entries: Vec<PlanEntry>,
}

impl ResolvedPlan {
    /// Enabled entries in execution order
    pub fn enabled(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.enabled)
    }

    /// Names of enabled modules in execution order
    pub fn order(&self) -> Vec<&str> {
        self.enabled().map(|e| e.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.enabled().next().is_none()
    }

    /// Check the plan invariant: every enabled module's dependencies are
    /// enabled and appear earlier.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        let mut enabled_phase = true;

        for entry in &self.entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(format!("module '{}' appears twice in plan", entry.name));
            }
            if !entry.enabled {
                enabled_phase = false;
                continue;
            }
            if !enabled_phase {
                return Err(format!("enabled module '{}' listed after disabled modules", entry.name));
            }
            for dep in &entry.dependencies {
                let ok = self
                    .get(dep)
                    .is_some_and(|d| d.enabled && seen.contains(d.name.as_str()) && d.name != entry.name);
                if !ok {
                    return Err(format!(
                        "module '{}' runs before or without its dependency '{}'",
                        entry.name, dep
                    ));
                }
            }
        }
        Ok(())
    }

    /// Returns a summary of the plan for logging/display
    pub fn summary(&self) -> String {
        let enabled: Vec<&PlanEntry> = self.enabled().collect();
        let mut lines = vec![format!("Execution plan ({} enabled):", enabled.len())];

        for (i, entry) in enabled.iter().enumerate() {
            let deps = if entry.dependencies.is_empty() {
                String::new()
            } else {
                format!(" <- {}", entry.dependencies.join(", "))
            };
            lines.push(format!(
                "  {}. {} v{} [{}]{}",
                i + 1,
                entry.name,
                entry.version,
                entry.maturity,
                deps
            ));
        }

        let disabled: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| !e.enabled)
            .map(|e| e.name.as_str())
            .collect();
        if !disabled.is_empty() {
            lines.push(format!("  disabled: {}", disabled.join(", ")));
        }

        lines.join("\n")
    }
}

// ============================================================================
// Plan Calculation
// ============================================================================

/// Ready-queue key: hinted modules first by hint, then by name
type ReadyKey<'a> = (bool, i64, &'a str);

fn ready_key<'a>(developer: &DeveloperConfig, name: &'a str) -> ReadyKey<'a> {
    match developer.order_hint(name) {
        Some(hint) => (false, hint, name),
        None => (true, 0, name),
    }
}

/// Build the execution plan from resolver decisions.
///
/// # Errors
///
/// - `UnsatisfiedDependency` if an enabled module depends on a disabled or
///   unregistered module (the chain names the path from the top-level module)
/// - `Cycle` if the enabled modules form a dependency cycle
pub fn build_plan(
    registry: &ModuleRegistry,
    developer: &DeveloperConfig,
    resolution: &Resolution,
) -> Result<ResolvedPlan, PlanningError> {
    let enabled: BTreeSet<&str> = resolution
        .enabled_modules()
        .filter(|name| registry.contains(name))
        .collect();

    check_dependencies(registry, resolution, &enabled)?;

    // Kahn's algorithm over the enabled subgraph
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for &name in &enabled {
        let deps = registry
            .get(name)
            .map(|d| &d.dependencies)
            .into_iter()
            .flatten();
        in_degree.insert(name, 0);
        for dep in deps {
            *in_degree.entry(name).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(name);
        }
    }

    let mut ready: BTreeSet<ReadyKey<'_>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&name, _)| ready_key(developer, name))
        .collect();

    let mut order: Vec<&str> = Vec::with_capacity(enabled.len());
    while let Some(key) = ready.pop_first() {
        let name = key.2;
        order.push(name);
        for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(ready_key(developer, dependent));
                }
            }
        }
    }

    if order.len() != enabled.len() {
        let placed: BTreeSet<&str> = order.iter().copied().collect();
        let remaining: BTreeSet<&str> = enabled.difference(&placed).copied().collect();
        let cycle = find_cycle(registry, &remaining);
        tracing::warn!(cycle = %cycle.join(" -> "), "dependency cycle in enabled modules");
        return Err(PlanningError::Cycle { cycle });
    }

    let mut entries: Vec<PlanEntry> = order
        .iter()
        .map(|name| plan_entry(registry, developer, name, true))
        .collect();
    entries.extend(
        registry
            .list_modules()
            .iter()
            .filter(|d| !enabled.contains(d.name.as_str()))
            .map(|d| plan_entry(registry, developer, &d.name, false)),
    );

    tracing::info!(order = ?order, "execution plan computed");
    Ok(ResolvedPlan { entries })
}

fn plan_entry(
    registry: &ModuleRegistry,
    developer: &DeveloperConfig,
    name: &str,
    enabled: bool,
) -> PlanEntry {
    let descriptor = registry.get(name);
    let dev = developer.get(name);
    PlanEntry {
        name: name.to_string(),
        version: descriptor.map(|d| d.version.clone()).unwrap_or_default(),
        enabled,
        dependencies: descriptor
            .map(|d| d.dependencies.iter().cloned().collect())
            .unwrap_or_default(),
        order_hint: dev.and_then(|d| d.order_hint),
        maturity: descriptor.map(|d| d.maturity).unwrap_or_default(),
        module_config: dev.map(|d| d.module_config.clone()).unwrap_or(Value::Null),
        timeout_secs: dev.and_then(|d| d.timeout_secs),
    }
}

/// Every dependency of an enabled module must itself be registered and enabled
fn check_dependencies(
    registry: &ModuleRegistry,
    resolution: &Resolution,
    enabled: &BTreeSet<&str>,
) -> Result<(), PlanningError> {
    for &name in enabled {
        let Some(descriptor) = registry.get(name) else {
            continue;
        };
        for dep in &descriptor.dependencies {
            let reason = if !registry.contains(dep) {
                MissingReason::NotRegistered
            } else if !resolution.is_enabled(dep) {
                MissingReason::Disabled
            } else {
                continue;
            };

            let mut chain = dependent_chain(registry, enabled, name);
            chain.push(dep.clone());
            tracing::warn!(module = %name, dependency = %dep, %reason, "unsatisfied dependency");
            return Err(PlanningError::UnsatisfiedDependency {
                module: name.to_string(),
                dependency: dep.clone(),
                reason,
                chain,
            });
        }
    }
    Ok(())
}

/// Walk up from `name` through enabled dependents (lexically first at each
/// step) to a module nothing enabled depends on; returns top-down order.
fn dependent_chain(registry: &ModuleRegistry, enabled: &BTreeSet<&str>, name: &str) -> Vec<String> {
    let mut chain = vec![name.to_string()];
    let mut visited: BTreeSet<String> = BTreeSet::from([name.to_string()]);
    let mut current = name.to_string();

    while let Some(parent) = registry
        .dependents_of(&current)
        .into_iter()
        .find(|d| enabled.contains(d) && !visited.contains(*d))
    {
        visited.insert(parent.to_string());
        chain.push(parent.to_string());
        current = parent.to_string();
    }

    chain.reverse();
    chain
}

/// Find one cycle among `remaining` (modules Kahn's algorithm could not place).
///
/// Every remaining module has an unplaced dependency inside `remaining`, so
/// following the smallest such dependency from the smallest module must
/// revisit a module; the revisited suffix is the cycle.
fn find_cycle(registry: &ModuleRegistry, remaining: &BTreeSet<&str>) -> Vec<String> {
    let Some(&start) = remaining.iter().next() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut position: BTreeMap<&str, usize> = BTreeMap::new();
    let mut current = start;

    loop {
        if let Some(&idx) = position.get(current) {
            let mut cycle: Vec<String> = path[idx..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        let next = registry.get(current).and_then(|d| {
            d.dependencies
                .iter()
                .map(String::as_str)
                .find(|dep| remaining.contains(dep))
        });
        match next {
            Some(dep) => current = dep,
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::DeveloperModuleConfig;
    use crate::module_manifest::ModuleDescriptor;

    fn registry(modules: &[(&str, &[&str])]) -> ModuleRegistry {
        ModuleRegistry::from_descriptors(modules.iter().map(|(name, deps)| {
            deps.iter()
                .fold(ModuleDescriptor::builder(*name, "1.0"), |b, d| b.depends_on(*d))
                .build()
                .unwrap()
        }))
        .unwrap()
    }

    fn all_enabled(registry: &ModuleRegistry) -> Resolution {
        Resolution {
            enabled: registry
                .list_modules()
                .iter()
                .map(|d| (d.name.clone(), true))
                .collect(),
            warnings: Vec::new(),
        }
    }

    fn with_hints(hints: &[(&str, i64)]) -> DeveloperConfig {
        let mut dev = DeveloperConfig::default();
        for (name, hint) in hints {
            dev.modules.insert(
                name.to_string(),
                DeveloperModuleConfig {
                    order_hint: Some(*hint),
                    ..Default::default()
                },
            );
        }
        dev
    }

    #[test]
    fn test_dependencies_come_first() {
        let reg = registry(&[
            ("Migrate", &["EntityRef", "ContentType"]),
            ("EntityRef", &[]),
            ("ContentType", &[]),
        ]);
        let plan = build_plan(&reg, &DeveloperConfig::default(), &all_enabled(&reg)).unwrap();
        assert_eq!(plan.order(), vec!["ContentType", "EntityRef", "Migrate"]);
        plan.validate().unwrap();
    }

    #[test]
    fn test_order_hint_breaks_ties_before_name() {
        let reg = registry(&[("A", &[]), ("B", &[]), ("C", &[]), ("D", &["A"])]);
        let dev = with_hints(&[("C", 1), ("B", 2)]);
        let plan = build_plan(&reg, &dev, &all_enabled(&reg)).unwrap();
        assert_eq!(plan.order(), vec!["C", "B", "A", "D"]);
    }

    #[test]
    fn test_disabled_modules_listed_after_enabled() {
        let reg = registry(&[("A", &[]), ("B", &[]), ("C", &["A"])]);
        let mut res = all_enabled(&reg);
        res.enabled.insert("B".to_string(), false);
        let plan = build_plan(&reg, &DeveloperConfig::default(), &res).unwrap();

        assert_eq!(plan.order(), vec!["A", "C"]);
        let last = plan.entries.last().unwrap();
        assert_eq!(last.name, "B");
        assert!(!last.enabled);
        plan.validate().unwrap();
        assert!(plan.summary().contains("disabled: B"));
    }

    #[test]
    fn test_disabled_dependency_is_hard_error() {
        let reg = registry(&[("A", &[]), ("B", &["A"]), ("C", &["B"])]);
        let mut res = all_enabled(&reg);
        res.enabled.insert("A".to_string(), false);

        let err = build_plan(&reg, &DeveloperConfig::default(), &res).unwrap_err();
        assert_eq!(
            err,
            PlanningError::UnsatisfiedDependency {
                module: "B".to_string(),
                dependency: "A".to_string(),
                reason: MissingReason::Disabled,
                chain: vec!["C".to_string(), "B".to_string(), "A".to_string()],
            }
        );
        assert!(err.to_string().contains("C -> B -> A"));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let reg = registry(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"]), ("D", &[])]);
        let err = build_plan(&reg, &DeveloperConfig::default(), &all_enabled(&reg)).unwrap_err();
        match err {
            PlanningError::Cycle { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for name in ["A", "B", "C"] {
                    assert!(cycle.contains(&name.to_string()));
                }
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_outside_enabled_set_is_ignored() {
        let reg = registry(&[("A", &["B"]), ("B", &["A"]), ("C", &[])]);
        let mut res = all_enabled(&reg);
        res.enabled.insert("A".to_string(), false);
        res.enabled.insert("B".to_string(), false);
        let plan = build_plan(&reg, &DeveloperConfig::default(), &res).unwrap();
        assert_eq!(plan.order(), vec!["C"]);
    }

    #[test]
    fn test_validate_catches_out_of_order_plan() {
        let reg = registry(&[("A", &[]), ("B", &["A"])]);
        let mut plan = build_plan(&reg, &DeveloperConfig::default(), &all_enabled(&reg)).unwrap();
        plan.entries.swap(0, 1);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_snapshots_developer_settings() {
        let reg = registry(&[("A", &[])]);
        let mut dev = DeveloperConfig::default();
        dev.modules.insert(
            "A".to_string(),
            DeveloperModuleConfig {
                module_config: serde_json::json!({"pattern": "*.adoc"}),
                timeout_secs: Some(7),
                ..Default::default()
            },
        );
        let plan = build_plan(&reg, &dev, &all_enabled(&reg)).unwrap();
        let entry = plan.get("A").unwrap();
        assert_eq!(entry.timeout_secs, Some(7));
        assert_eq!(entry.module_config["pattern"], "*.adoc");
    }
}

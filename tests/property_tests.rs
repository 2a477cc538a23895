//! Property-Based Tests for docflow
//!
//! Uses proptest over randomly generated module graphs:
//! - Every plan respects dependency order
//! - Plans are deterministic and independent of registration order
//! - Status enums survive Display -> FromStr

use std::collections::{BTreeMap, HashMap};

use proptest::prelude::*;

use docflow::{
    DeveloperConfig, ModuleDescriptor, ModuleRegistry, ModuleStatus, WorkflowStatus, build_plan, resolve,
};
use docflow::config_file::DeveloperModuleConfig;

// =============================================================================
// Graph Strategies
// =============================================================================

const MAX_MODULES: usize = 12;

/// Acyclic graphs: module `i` may only depend on modules `j < i`
fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    prop::collection::vec(prop::collection::vec(any::<bool>(), MAX_MODULES), 1..MAX_MODULES).prop_map(
        |adjacency| {
            adjacency
                .iter()
                .enumerate()
                .map(|(i, row)| (0..i).filter(|&j| row[j]).collect())
                .collect()
        },
    )
}

fn module_name(i: usize) -> String {
    format!("M{i:02}")
}

fn descriptors(graph: &[Vec<usize>]) -> Vec<ModuleDescriptor> {
    graph
        .iter()
        .enumerate()
        .map(|(i, deps)| {
            deps.iter()
                .fold(ModuleDescriptor::builder(module_name(i), "1.0"), |b, &j| {
                    b.depends_on(module_name(j))
                })
                .build()
                .expect("valid descriptor")
        })
        .collect()
}

fn plan_order(registry: &ModuleRegistry, developer: &DeveloperConfig) -> Vec<String> {
    let resolution = resolve(registry, developer, &BTreeMap::new(), &BTreeMap::new()).expect("resolves");
    build_plan(registry, developer, &resolution)
        .expect("acyclic graph plans")
        .order()
        .into_iter()
        .map(str::to_string)
        .collect()
}

proptest! {
    /// Every module appears once, after all of its dependencies
    #[test]
    fn plan_respects_dependencies(graph in dag_strategy()) {
        let registry = ModuleRegistry::from_descriptors(descriptors(&graph)).unwrap();
        let order = plan_order(&registry, &DeveloperConfig::default());

        prop_assert_eq!(order.len(), graph.len());
        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(p, name)| (name.as_str(), p)).collect();
        for (i, deps) in graph.iter().enumerate() {
            for &j in deps {
                prop_assert!(position[module_name(j).as_str()] < position[module_name(i).as_str()]);
            }
        }
    }

    /// Registration order has no influence on the plan
    #[test]
    fn plan_is_deterministic(graph in dag_strategy()) {
        let forward = ModuleRegistry::from_descriptors(descriptors(&graph)).unwrap();
        let mut reversed_descriptors = descriptors(&graph);
        reversed_descriptors.reverse();
        let reversed = ModuleRegistry::from_descriptors(reversed_descriptors).unwrap();

        let developer = DeveloperConfig::default();
        prop_assert_eq!(plan_order(&forward, &developer), plan_order(&forward, &developer));
        prop_assert_eq!(plan_order(&forward, &developer), plan_order(&reversed, &developer));
    }

    /// Order hints reorder independent modules but never break dependencies
    #[test]
    fn order_hints_never_break_dependencies(
        graph in dag_strategy(),
        hints in prop::collection::vec(prop::option::of(-5i64..5), MAX_MODULES),
    ) {
        let registry = ModuleRegistry::from_descriptors(descriptors(&graph)).unwrap();
        let mut developer = DeveloperConfig::default();
        for (i, hint) in hints.iter().take(graph.len()).enumerate() {
            developer.modules.insert(
                module_name(i),
                DeveloperModuleConfig { order_hint: *hint, ..Default::default() },
            );
        }

        let order = plan_order(&registry, &developer);
        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(p, name)| (name.as_str(), p)).collect();
        for (i, deps) in graph.iter().enumerate() {
            for &j in deps {
                prop_assert!(position[module_name(j).as_str()] < position[module_name(i).as_str()]);
            }
        }
    }
}

// =============================================================================
// Status Enum Property Tests
// =============================================================================

fn module_status_strategy() -> impl Strategy<Value = ModuleStatus> {
    prop_oneof![
        Just(ModuleStatus::Pending),
        Just(ModuleStatus::Running),
        Just(ModuleStatus::Completed),
        Just(ModuleStatus::Failed),
        Just(ModuleStatus::Skipped),
    ]
}

fn workflow_status_strategy() -> impl Strategy<Value = WorkflowStatus> {
    prop_oneof![
        Just(WorkflowStatus::Active),
        Just(WorkflowStatus::Completed),
        Just(WorkflowStatus::Failed),
        Just(WorkflowStatus::Abandoned),
    ]
}

proptest! {
    /// ModuleStatus: to_string -> parse is identity, output is lowercase
    #[test]
    fn module_status_roundtrip(status in module_status_strategy()) {
        let s = status.to_string();
        prop_assert_eq!(s.to_lowercase(), s.clone());
        let parsed: ModuleStatus = s.parse().expect("Should parse");
        prop_assert_eq!(status, parsed);
    }

    /// WorkflowStatus: to_string -> parse is identity
    #[test]
    fn workflow_status_roundtrip(status in workflow_status_strategy()) {
        let parsed: WorkflowStatus = status.to_string().parse().expect("Should parse");
        prop_assert_eq!(status, parsed);
    }

    /// Terminal module states never transition back to running
    #[test]
    fn finished_modules_never_restart(status in module_status_strategy()) {
        if status.is_finished() {
            prop_assert!(!status.can_transition_to(ModuleStatus::Running));
        }
    }
}

//! Configuration Resolution Tests
//!
//! From documents on disk to a finished workflow:
//! - Developer manifest + user preferences + one-shot overrides
//! - Planning errors surfaced before any workflow exists
//! - Command modules receiving their context through the environment

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use serde_json::json;
use tempfile::TempDir;

use docflow::config_file::ConfigWarning;
use docflow::engine::planner::MissingReason;
use docflow::{
    DeveloperManifest, DocflowError, ModuleStatus, PlanningError, Settings, Toolkit, WorkflowStatus,
    parse_overrides,
};

// =============================================================================
// Helpers
// =============================================================================

const MANIFEST: &str = r#"{
    "version": 1,
    "modules": [
        {
            "name": "EntityRef",
            "required": true,
            "order_hint": 1,
            "command": {"program": "sh", "args": ["-c", "echo '{\"refs\": 12}'"]}
        },
        {
            "name": "ContentType",
            "order_hint": 2,
            "config": {"default_type": "article"},
            "command": {"program": "sh", "args": ["-c", "printf '{\"config\":%s}' \"$DOCFLOW_MODULE_CONFIG\""]}
        },
        {
            "name": "Migrate",
            "dependencies": ["EntityRef", "ContentType"],
            "command": {"program": "sh", "args": ["-c", "printf '{\"prior\":%s}' \"$DOCFLOW_PRIOR_RESULTS\""]}
        },
        {
            "name": "Lint",
            "maturity": "experimental",
            "default_enabled": false
        }
    ]
}"#;

fn settings(dir: &TempDir) -> Settings {
    Settings {
        state_dir: dir.path().join("state"),
        manifest_path: dir.path().join("docflow.json"),
        preferences_path: dir.path().join("preferences.json"),
        ..Default::default()
    }
}

fn write(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
}

fn toolkit(dir: &TempDir) -> Toolkit {
    write(&dir.path().join("docflow.json"), MANIFEST);
    Toolkit::load(settings(dir)).unwrap()
}

fn overrides(entries: &[&str]) -> BTreeMap<String, bool> {
    parse_overrides(entries).unwrap()
}

// =============================================================================
// Resolution
// =============================================================================

#[test]
fn test_manifest_parses_with_defaults() {
    let manifest = DeveloperManifest::from_json(MANIFEST).unwrap();
    assert_eq!(manifest.modules.len(), 4);
    let lint = manifest.module("Lint").unwrap();
    assert!(!lint.default_enabled);
    assert_eq!(lint.version, manifest.module("Migrate").unwrap().version);
}

#[test]
fn test_default_plan_honours_dependencies_and_hints() {
    let dir = TempDir::new().unwrap();
    let outcome = toolkit(&dir).plan(&BTreeMap::new()).unwrap();

    assert_eq!(outcome.plan.order(), vec!["EntityRef", "ContentType", "Migrate"]);
    assert!(!outcome.plan.get("Lint").unwrap().enabled);
    assert!(outcome.warnings.is_empty());
    assert!(outcome.plan.summary().contains("disabled: Lint"));
}

#[test]
fn test_user_preference_and_override_precedence() {
    let dir = TempDir::new().unwrap();
    write(
        &dir.path().join("preferences.json"),
        r#"{"version": 1, "modules": {"Lint": true}}"#,
    );
    let kit = toolkit(&dir);

    let outcome = kit.plan(&BTreeMap::new()).unwrap();
    assert!(outcome.plan.get("Lint").unwrap().enabled);
    assert!(outcome.warnings.iter().any(|w| matches!(
        w,
        ConfigWarning::ExperimentalEnabled { name, .. } if name == "Lint"
    )));

    let outcome = kit.plan(&overrides(&["Lint=off"])).unwrap();
    assert!(!outcome.plan.get("Lint").unwrap().enabled);
}

#[test]
fn test_unknown_keys_and_modules_are_warnings() {
    let dir = TempDir::new().unwrap();
    write(
        &dir.path().join("preferences.json"),
        r#"{"version": 1, "modules": {"Ghost": true}, "theme": "dark"}"#,
    );
    let outcome = toolkit(&dir).plan(&BTreeMap::new()).unwrap();

    assert!(outcome.warnings.iter().any(|w| matches!(
        w,
        ConfigWarning::UnknownModule { name, .. } if name == "Ghost"
    )));
    assert!(outcome.warnings.iter().any(|w| matches!(
        w,
        ConfigWarning::UnknownKey { key, .. } if key == "theme"
    )));
}

#[test]
fn test_disabling_required_module_names_the_key() {
    let dir = TempDir::new().unwrap();
    let err = toolkit(&dir).plan(&overrides(&["EntityRef=false"])).unwrap_err();
    assert!(matches!(err, DocflowError::Configuration { ref key, .. } if key == "override.EntityRef"));
}

#[test]
fn test_disabled_dependency_is_reported_with_chain() {
    let dir = TempDir::new().unwrap();
    let err = toolkit(&dir).plan(&overrides(&["ContentType=no"])).unwrap_err();

    match err {
        DocflowError::Planning(PlanningError::UnsatisfiedDependency {
            module,
            dependency,
            reason,
            chain,
        }) => {
            assert_eq!(module, "Migrate");
            assert_eq!(dependency, "ContentType");
            assert_eq!(reason, MissingReason::Disabled);
            assert_eq!(chain, vec!["Migrate".to_string(), "ContentType".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_cycle_is_a_planning_error() {
    let dir = TempDir::new().unwrap();
    write(
        &dir.path().join("docflow.json"),
        r#"{"modules": [
            {"name": "A", "dependencies": ["B"]},
            {"name": "B", "dependencies": ["A"]}
        ]}"#,
    );
    let err = Toolkit::load(settings(&dir)).unwrap().plan(&BTreeMap::new()).unwrap_err();

    match err {
        DocflowError::Planning(PlanningError::Cycle { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"A".to_string()));
            assert!(cycle.contains(&"B".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_dangling_manifest_dependency_is_registry_error() {
    let dir = TempDir::new().unwrap();
    write(
        &dir.path().join("docflow.json"),
        r#"{"modules": [{"name": "A", "dependencies": ["Missing"]}]}"#,
    );
    let err = Toolkit::load(settings(&dir)).unwrap_err();
    assert!(matches!(err, DocflowError::Registry(_)));
}

#[test]
fn test_newer_manifest_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    write(&dir.path().join("docflow.json"), r#"{"version": 99, "modules": []}"#);
    assert!(matches!(
        Toolkit::load(settings(&dir)).unwrap_err(),
        DocflowError::Configuration { .. }
    ));
}

// =============================================================================
// End to End
// =============================================================================

#[test]
fn test_command_modules_run_to_completion() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let kit = toolkit(&dir);
    let outcome = kit.plan(&BTreeMap::new()).unwrap();
    let engine = kit.engine().unwrap();

    let mut wf = engine
        .create_workflow("docs", target.path(), outcome.plan, false)
        .unwrap();
    engine.run_until_blocked(&mut wf, &AtomicBool::new(false)).unwrap();

    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.state("ContentType").unwrap().result, Some(json!({"config": {"default_type": "article"}})));

    let migrate = wf.state("Migrate").unwrap();
    assert_eq!(migrate.status, ModuleStatus::Completed);
    let prior = &migrate.result.as_ref().unwrap()["prior"];
    assert_eq!(prior["EntityRef"], json!({"refs": 12}));
    assert_eq!(prior["ContentType"]["config"]["default_type"], "article");

    let summary = engine.status("docs").unwrap();
    assert_eq!(summary.percent_complete, 100);
    assert_eq!(summary.next_module, None);
}

#[test]
fn test_plan_snapshot_survives_manifest_change() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let kit = toolkit(&dir);
    let engine = kit.engine().unwrap();
    engine
        .create_workflow("docs", target.path(), kit.plan(&BTreeMap::new()).unwrap().plan, false)
        .unwrap();

    // Dropping a module from the manifest does not change the stored workflow
    write(
        &dir.path().join("docflow.json"),
        r#"{"modules": [{"name": "EntityRef", "required": true}]}"#,
    );
    let engine = Toolkit::load(settings(&dir)).unwrap().engine().unwrap();
    let wf = engine.load_workflow("docs").unwrap();
    assert_eq!(
        wf.module_states.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        vec!["EntityRef", "ContentType", "Migrate"]
    );
}

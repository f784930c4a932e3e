use std::io::Write;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use taskweave_core::config::AppConfig;
use taskweave_core::error::TaskweaveError;
use taskweave_core::template::{NodeTemplate, WorkflowDesign};
use taskweave_engine::{Engine, EventJournal};
use taskweave_store::SqliteStore;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
workspace = "/tmp/taskweave-test"

[engine]
max_task_retries = 5
event_capacity = 64
auto_complete_placeholders = false

[store]
path = "/tmp/taskweave-test/flows.db"

[aggregator]
max_depth = 3

[merge]
separator = "::"
supersede_original = true

[log]
level = 3
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_task_retries, 5);
    assert_eq!(config.engine.event_capacity, 64);
    assert!(!config.engine.auto_complete_placeholders);
    assert_eq!(config.store_path().to_str(), Some("/tmp/taskweave-test/flows.db"));
    assert_eq!(config.aggregator.max_depth, 3);
    assert_eq!(config.merge.separator, "::");
    assert!(config.merge.supersede_original);
    assert_eq!(config.log.as_ref().unwrap().level, 3);
    assert_eq!(
        config.log_dir().unwrap().to_str(),
        Some("/tmp/taskweave-test/logs")
    );
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("TASKWEAVE_TEST_WORKSPACE", "/tmp/tw-from-env");
    let tmp = write_config("workspace = \"${TASKWEAVE_TEST_WORKSPACE}\"\n");
    let config = AppConfig::load(tmp.path()).expect("load config");
    std::env::remove_var("TASKWEAVE_TEST_WORKSPACE");

    assert_eq!(config.workspace, "/tmp/tw-from-env");
    assert_eq!(config.store_path().to_str(), Some("/tmp/tw-from-env/taskweave.db"));
}

#[test]
fn test_invalid_values_rejected() {
    let tmp = write_config("[log]\nlevel = 7\n");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(TaskweaveError::Config(_))
    ));

    let tmp = write_config("[merge]\nseparator = \"\"\n");
    assert!(AppConfig::load(tmp.path()).is_err());

    let tmp = write_config("[engine\nbroken");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(TaskweaveError::Config(_))
    ));
}

#[test]
fn test_missing_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/taskweave.toml")).unwrap_err();
    assert!(matches!(err, TaskweaveError::ConfigNotFound(_)));
}

#[test]
fn test_disabled_log_has_no_dir() {
    let tmp = write_config("[log]\nenabled = false\n");
    let config = AppConfig::load(tmp.path()).expect("load config");
    assert!(config.log_dir().is_none());
}

#[tokio::test]
async fn test_configured_engine_persists_and_journals() {
    let dir = tempfile::tempdir().unwrap();
    let tmp = write_config(&format!(
        "workspace = \"{}\"\n\n[log]\nlevel = 1\n",
        dir.path().display()
    ));
    let config = AppConfig::load(tmp.path()).expect("load config");

    let store = Arc::new(SqliteStore::open(&config.store_path()).unwrap());
    let engine = Engine::from_config(store, &config);
    let cancel = CancellationToken::new();
    let journal = EventJournal::new(config.log_dir().unwrap(), 1)
        .spawn(&engine.event_bus(), cancel.clone());

    let tpl = engine
        .import_template(WorkflowDesign::new("one").node(NodeTemplate::human("only", "Only")))
        .unwrap();
    let instance = engine.launch(&tpl.id, json!({})).unwrap();
    let task = engine.open_tasks(&instance.id).unwrap().remove(0);
    engine.submit_result(&task.id, json!("done")).unwrap();

    cancel.cancel();
    journal.await.unwrap();

    assert!(config.store_path().exists());
    let log = std::fs::read_dir(config.log_dir().unwrap())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let content = std::fs::read_to_string(log).unwrap();
    let events: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(
        kinds,
        vec!["template_created", "instance_started", "instance_completed"]
    );
}

//! Fixtures shared by Taskweave integration tests.

use std::sync::Arc;

use serde_json::Value;

use taskweave_core::config::AppConfig;
use taskweave_core::instance::TaskInstance;
use taskweave_core::template::{NodeTemplate, WorkflowDesign};
use taskweave_core::types::InstanceId;
use taskweave_engine::{Engine, EngineSettings};
use taskweave_store::SqliteStore;

/// Engine over a fresh in-memory store with default settings.
pub fn engine() -> Engine {
    Engine::new(store(), EngineSettings::default())
}

/// Engine over a fresh in-memory store using `config`'s engine settings.
pub fn engine_with(config: &AppConfig) -> Engine {
    Engine::from_config(store(), config)
}

fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().expect("in-memory store"))
}

/// Parse a config from inline TOML.
pub fn config_from_toml(toml_str: &str) -> AppConfig {
    toml::from_str(toml_str).expect("valid test config")
}

/// `start -> draft -> review -> end`
pub fn linear_design() -> WorkflowDesign {
    WorkflowDesign::new("linear")
        .node(NodeTemplate::start("start"))
        .node(NodeTemplate::human("draft", "Draft"))
        .node(NodeTemplate::human("review", "Review"))
        .node(NodeTemplate::end("end"))
        .edge("start", "draft")
        .edge("draft", "review")
        .edge("review", "end")
}

/// `a` and `b` both feed `join`.
pub fn join_design() -> WorkflowDesign {
    WorkflowDesign::new("join")
        .node(NodeTemplate::human("a", "A"))
        .node(NodeTemplate::human("b", "B"))
        .node(NodeTemplate::human("join", "Join"))
        .edge("a", "join")
        .edge("b", "join")
}

/// `a -> c` next to an independent root `b`.
pub fn branch_design() -> WorkflowDesign {
    WorkflowDesign::new("branch")
        .node(NodeTemplate::human("a", "A"))
        .node(NodeTemplate::human("b", "B"))
        .node(NodeTemplate::human("c", "C"))
        .edge("a", "c")
}

/// Child workflow with a single entry and exit: `start -> x -> y -> end`.
pub fn child_design(name: &str) -> WorkflowDesign {
    WorkflowDesign::new(name)
        .node(NodeTemplate::start("start"))
        .node(NodeTemplate::human("x", "X"))
        .node(NodeTemplate::human("y", "Y"))
        .node(NodeTemplate::end("end"))
        .edge("start", "x")
        .edge("x", "y")
        .edge("y", "end")
}

/// Child workflow with two unconnected work nodes and no placeholders.
pub fn disconnected_design(name: &str) -> WorkflowDesign {
    WorkflowDesign::new(name)
        .node(NodeTemplate::human("p", "P"))
        .node(NodeTemplate::human("q", "Q"))
}

/// Single-node workflow.
pub fn single_design(name: &str) -> WorkflowDesign {
    WorkflowDesign::new(name).node(NodeTemplate::human("only", "Only"))
}

/// The task created for `key` in `instance`.
pub fn task_at(engine: &Engine, instance: &InstanceId, key: &str) -> TaskInstance {
    engine
        .list_tasks(instance)
        .expect("list tasks")
        .into_iter()
        .find(|t| t.node_key == key)
        .unwrap_or_else(|| panic!("no task for node '{}'", key))
}

/// Output recorded on the node `key` of `instance`.
pub fn output_of(engine: &Engine, instance: &InstanceId, key: &str) -> Option<Value> {
    engine
        .store()
        .find_node(instance, key)
        .expect("node exists")
        .output
}

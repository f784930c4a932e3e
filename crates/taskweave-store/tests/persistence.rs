use serde_json::json;
use tempfile::TempDir;

use taskweave_core::instance::{NodeInstance, WorkflowInstance};
use taskweave_core::template::{NodeTemplate, WorkflowDesign, WorkflowTemplate};
use taskweave_core::traits::GraphStore;
use taskweave_core::types::{InstanceStatus, NodeStatus};
use taskweave_store::SqliteStore;

#[test]
fn test_reopen_keeps_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("taskweave.db");

    let tpl = WorkflowTemplate::from_design(
        WorkflowDesign::new("persisted")
            .node(NodeTemplate::human("draft", "Draft"))
            .node(NodeTemplate::human("review", "Review"))
            .edge("draft", "review"),
    )
    .unwrap();
    let instance = WorkflowInstance::new(tpl.id.clone(), json!({"ticket": 42}));
    let nodes: Vec<NodeInstance> = tpl
        .nodes
        .iter()
        .map(|n| NodeInstance::new(instance.id.clone(), n.key.clone()))
        .collect();

    {
        let store = SqliteStore::open(&path).unwrap();
        store.insert_template(&tpl).unwrap();
        store.create_instance(&instance, &nodes).unwrap();
        assert!(store.start_instance(&instance.id).unwrap());
    }

    let store = SqliteStore::open(&path).unwrap();
    let loaded = store.get_instance(&instance.id).unwrap();
    assert_eq!(loaded.status, InstanceStatus::Running);
    assert_eq!(loaded.context, json!({"ticket": 42}));

    let template = store.get_template(&tpl.id).unwrap();
    assert_eq!(template.name, "persisted");
    assert_eq!(template.graph().entry_points(), vec!["draft"]);

    let review = store.find_node(&instance.id, "review").unwrap();
    assert_eq!(review.status, NodeStatus::Waiting);
    assert_eq!(store.list_instances(Some(&tpl.id)).unwrap().len(), 1);
    assert!(store.list_instances(Some(&unknown_template())).unwrap().is_empty());
}

fn unknown_template() -> taskweave_core::types::TemplateId {
    taskweave_core::types::TemplateId::from_str("no-such-template")
}

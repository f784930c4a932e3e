use std::sync::Arc;

use serde_json::json;

use taskweave_core::error::TaskweaveError;
use taskweave_core::event::EngineEvent;
use taskweave_core::types::{InstanceStatus, NodeStatus, TaskStatus};
use taskweave_test_utils::*;

#[test]
fn test_linear_workflow_runs_to_completion() {
    let engine = engine();
    let tpl = engine.import_template(linear_design()).unwrap();
    let instance = engine.launch(&tpl.id, json!({"topic": "release notes"})).unwrap();

    // The start placeholder completes itself.
    let open = engine.open_tasks(&instance.id).unwrap();
    assert_eq!(open.len(), 1);
    let draft = &open[0];
    assert_eq!(draft.node_key, "draft");
    assert_eq!(draft.input["context"]["topic"], "release notes");
    assert_eq!(draft.input["upstream"]["start"]["topic"], "release notes");

    engine.start_task(&draft.id).unwrap();
    engine.submit_result(&draft.id, json!({"text": "v1"})).unwrap();

    let review = task_at(&engine, &instance.id, "review");
    assert_eq!(review.input["upstream"]["draft"]["text"], "v1");
    engine.submit_result(&review.id, json!({"approved": true})).unwrap();

    let instance = engine.get_instance(&instance.id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(output_of(&engine, &instance.id, "end"), Some(json!({"approved": true})));
    assert_eq!(engine.stats(&instance.id).unwrap().percent_complete, 100.0);
}

#[test]
fn test_join_waits_for_every_parent() {
    for order in [["a", "b"], ["b", "a"]] {
        let engine = engine();
        let tpl = engine.import_template(join_design()).unwrap();
        let instance = engine.launch(&tpl.id, json!({})).unwrap();

        let first = task_at(&engine, &instance.id, order[0]);
        engine.submit_result(&first.id, json!(order[0])).unwrap();
        let join = engine.store().find_node(&instance.id, "join").unwrap();
        assert_eq!(join.status, NodeStatus::Waiting);
        assert!(engine.store().task_for_node(&join.id).unwrap().is_none());

        let second = task_at(&engine, &instance.id, order[1]);
        engine.submit_result(&second.id, json!(order[1])).unwrap();
        let join_task = task_at(&engine, &instance.id, "join");
        assert_eq!(join_task.input["upstream"]["a"], "a");
        assert_eq!(join_task.input["upstream"]["b"], "b");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_parents_activate_join_once() {
    for _ in 0..20 {
        let engine = Arc::new(engine());
        let tpl = engine.import_template(join_design()).unwrap();
        let instance = engine.launch(&tpl.id, json!({})).unwrap();
        let mut events = engine.event_bus().subscribe();

        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let engine = Arc::clone(&engine);
                let task = task_at(&engine, &instance.id, key);
                tokio::task::spawn_blocking(move || engine.submit_result(&task.id, json!(key)))
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let join_tasks: Vec<_> = engine
            .list_tasks(&instance.id)
            .unwrap()
            .into_iter()
            .filter(|t| t.node_key == "join")
            .collect();
        assert_eq!(join_tasks.len(), 1);

        let mut ready = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::NodeReady { node_key, .. } = event {
                if node_key == "join" {
                    ready += 1;
                }
            }
        }
        assert_eq!(ready, 1);
    }
}

#[test]
fn test_try_activate_is_idempotent() {
    let engine = engine();
    let tpl = engine.import_template(join_design()).unwrap();
    let instance = engine.launch(&tpl.id, json!({})).unwrap();
    let join = engine.store().find_node(&instance.id, "join").unwrap();

    // Upstream unfinished.
    assert!(!engine.try_activate(&join.id).unwrap());

    for key in ["a", "b"] {
        let task = task_at(&engine, &instance.id, key);
        engine.submit_result(&task.id, json!(null)).unwrap();
    }
    // Already activated by the cascade.
    assert!(!engine.try_activate(&join.id).unwrap());
    assert!(engine.on_node_ready(&join.id).unwrap().is_none());
    assert_eq!(engine.list_tasks(&instance.id).unwrap().len(), 3);
}

#[test]
fn test_tasks_exist_exactly_for_activated_nodes() {
    let engine = engine();
    let tpl = engine.import_template(linear_design()).unwrap();
    let instance = engine.launch(&tpl.id, json!({})).unwrap();
    let draft = task_at(&engine, &instance.id, "draft");
    engine.start_task(&draft.id).unwrap();
    engine.block_task(&draft.id).unwrap();

    let check = || {
        for node in engine.list_nodes(&instance.id).unwrap() {
            let task = engine.store().task_for_node(&node.id).unwrap();
            assert_eq!(
                task.is_some(),
                node.status.has_task(),
                "node '{}' is {}",
                node.node_key,
                node.status
            );
        }
    };
    check();

    engine.resume_task(&draft.id).unwrap();
    engine.fail_task(&draft.id, "typo").unwrap();
    check();
    engine.retry_task(&draft.id).unwrap();
    engine.submit_result(&draft.id, json!("v2")).unwrap();
    check();
}

#[test]
fn test_blocked_task_cannot_be_submitted() {
    let engine = engine();
    let tpl = engine.import_template(single_design("one")).unwrap();
    let instance = engine.launch(&tpl.id, json!({})).unwrap();
    let task = task_at(&engine, &instance.id, "only");
    engine.start_task(&task.id).unwrap();
    engine.block_task(&task.id).unwrap();

    let err = engine.submit_result(&task.id, json!(1)).unwrap_err();
    assert!(err.is_conflict());
    engine.resume_task(&task.id).unwrap();
    engine.submit_result(&task.id, json!(1)).unwrap();
    assert_eq!(engine.get_task(&task.id).unwrap().status, TaskStatus::Completed);
}

#[test]
fn test_retry_limit() {
    let engine = engine_with(&config_from_toml("[engine]\nmax_task_retries = 1\n"));
    let tpl = engine.import_template(single_design("one")).unwrap();
    let instance = engine.launch(&tpl.id, json!({})).unwrap();
    let task = task_at(&engine, &instance.id, "only");

    engine.fail_task(&task.id, "first").unwrap();
    assert_eq!(engine.get_instance(&instance.id).unwrap().status, InstanceStatus::Failed);
    let retried = engine.retry_task(&task.id).unwrap();
    assert_eq!(retried.attempt, 2);
    assert_eq!(engine.get_instance(&instance.id).unwrap().status, InstanceStatus::Running);

    engine.fail_task(&task.id, "second").unwrap();
    let err = engine.retry_task(&task.id).unwrap_err();
    assert!(matches!(err, TaskweaveError::RetryLimit { limit: 1, .. }));
}

#[test]
fn test_branch_completed_while_failed_activates_after_retry() {
    let engine = engine();
    let tpl = engine.import_template(branch_design()).unwrap();
    let instance = engine.launch(&tpl.id, json!({})).unwrap();
    let a = task_at(&engine, &instance.id, "a");
    let b = task_at(&engine, &instance.id, "b");

    engine.fail_task(&b.id, "flaky").unwrap();
    assert_eq!(engine.get_instance(&instance.id).unwrap().status, InstanceStatus::Failed);

    // The parallel branch still finishes, but `c` cannot start yet.
    engine.submit_result(&a.id, json!("from a")).unwrap();
    let c = engine.store().find_node(&instance.id, "c").unwrap();
    assert_eq!(c.status, NodeStatus::Waiting);
    assert!(engine.store().task_for_node(&c.id).unwrap().is_none());

    engine.retry_task(&b.id).unwrap();
    let c_task = task_at(&engine, &instance.id, "c");
    assert_eq!(c_task.status, TaskStatus::Open);
    assert_eq!(c_task.input["upstream"]["a"], "from a");

    engine.submit_result(&b.id, json!("from b")).unwrap();
    engine.submit_result(&c_task.id, json!("from c")).unwrap();
    assert_eq!(
        engine.get_instance(&instance.id).unwrap().status,
        InstanceStatus::Completed
    );
    assert!(engine.open_tasks(&instance.id).unwrap().is_empty());
}

#[test]
fn test_unclaimed_tasks_pass_through_running() {
    let engine = engine();
    let tpl = engine.import_template(join_design()).unwrap();
    let instance = engine.launch(&tpl.id, json!({})).unwrap();
    let mut events = engine.event_bus().subscribe();

    let a = task_at(&engine, &instance.id, "a");
    let b = task_at(&engine, &instance.id, "b");
    engine.submit_result(&a.id, json!(1)).unwrap();
    engine.fail_task(&b.id, "gave up").unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        let step = match event {
            EngineEvent::NodeStarted { node_key, .. } => format!("started {}", node_key),
            EngineEvent::NodeCompleted { node_key, .. } => format!("completed {}", node_key),
            EngineEvent::NodeFailed { node_key, .. } => format!("failed {}", node_key),
            _ => continue,
        };
        seen.push(step);
    }
    assert_eq!(seen, vec!["started a", "completed a", "started b", "failed b"]);
}

#[test]
fn test_start_twice_conflicts() {
    let engine = engine();
    let tpl = engine.import_template(single_design("one")).unwrap();
    let instance = engine.create_instance(&tpl.id, json!({})).unwrap();
    assert_eq!(engine.list_nodes(&instance.id).unwrap()[0].status, NodeStatus::Created);

    engine.start_instance(&instance.id).unwrap();
    assert!(engine.start_instance(&instance.id).unwrap_err().is_conflict());
}

#[test]
fn test_cancel_closes_open_tasks() {
    let engine = engine();
    let tpl = engine.import_template(join_design()).unwrap();
    let instance = engine.launch(&tpl.id, json!({})).unwrap();
    engine.cancel_instance(&instance.id).unwrap();

    assert_eq!(engine.get_instance(&instance.id).unwrap().status, InstanceStatus::Cancelled);
    assert!(engine.open_tasks(&instance.id).unwrap().is_empty());
    assert!(engine
        .list_nodes(&instance.id)
        .unwrap()
        .iter()
        .all(|n| n.status == NodeStatus::Cancelled));
    assert!(engine.cancel_instance(&instance.id).unwrap_err().is_conflict());
}

//! End-to-end run-tree migration: fresh UUIDs, parent-before-child ordering,
//! trace-ID rewriting, and dotted-order regeneration across a three-level
//! tree (root -> child -> grandchild).

mod common;

use std::collections::HashMap;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trace_migrate::migrate::experiment::ExperimentMigrator;

#[tokio::test]
async fn test_run_tree_keeps_trace_integrity() {
    let source = MockServer::start().await;
    let dest = MockServer::start().await;

    // Runs deliberately listed out of order; the migrator must sort by
    // dotted_order before assigning IDs.
    let runs = json!({
        "runs": [
            {
                "id": "uuid-b",
                "name": "grandchild",
                "run_type": "tool",
                "session_id": "exp-s",
                "parent_run_id": "uuid-a",
                "trace_id": "uuid-r",
                "dotted_order": "T0Zuuid-r.T1Zuuid-a.T2Zuuid-b",
            },
            {
                "id": "uuid-r",
                "name": "root",
                "run_type": "chain",
                "session_id": "exp-s",
                "trace_id": "uuid-r",
                "dotted_order": "T0Zuuid-r",
            },
            {
                "id": "uuid-a",
                "name": "child",
                "run_type": "llm",
                "session_id": "exp-s",
                "parent_run_id": "uuid-r",
                "trace_id": "uuid-r",
                "dotted_order": "T0Zuuid-r.T1Zuuid-a",
                "reference_example_id": "e1",
            },
        ],
        "cursors": {"next": null},
    });

    Mock::given(method("POST"))
        .and(path("/api/v1/runs/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(runs))
        .expect(1)
        .mount(&source)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/runs/batch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&dest)
        .await;

    let (ctx, _state_dir) = common::test_context(&source.uri(), &dest.uri());
    let migrator = ExperimentMigrator::new(ctx);

    let experiment_map = HashMap::from([("exp-s".to_string(), "exp-d".to_string())]);
    let example_map = HashMap::from([("e1".to_string(), "de1".to_string())]);

    let summary = migrator
        .migrate_runs(&["exp-s".to_string()], &experiment_map, &example_map)
        .await
        .expect("run migration succeeds");

    assert_eq!(summary.migrated, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.mapping.len(), 3);

    let batch_request = dest
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path().ends_with("/runs/batch"))
        .expect("batch issued");
    let body: Value = serde_json::from_slice(&batch_request.body).expect("json body");
    let posted = body["post"].as_array().expect("post array");
    assert_eq!(posted.len(), 3);

    // Sorted by dotted_order: root first, grandchild last.
    let (root, child, grandchild) = (&posted[0], &posted[1], &posted[2]);
    assert_eq!(root["name"], "root");
    assert_eq!(child["name"], "child");
    assert_eq!(grandchild["name"], "grandchild");

    let new_root = root["id"].as_str().unwrap();
    let new_child = child["id"].as_str().unwrap();
    let new_grandchild = grandchild["id"].as_str().unwrap();

    // Fresh UUIDs, consistent with the returned mapping.
    assert_ne!(new_root, "uuid-r");
    assert_eq!(summary.mapping["uuid-r"], new_root);
    assert_eq!(summary.mapping["uuid-a"], new_child);
    assert_eq!(summary.mapping["uuid-b"], new_grandchild);

    // Root: trace_id equals its own new ID; no parent field at all.
    assert_eq!(root["trace_id"], new_root);
    assert!(root.get("parent_run_id").is_none());
    assert_eq!(root["dotted_order"], format!("T0Z{new_root}"));

    // Children share the root's new trace and point at mapped parents.
    assert_eq!(child["trace_id"], new_root);
    assert_eq!(child["parent_run_id"], new_root);
    assert_eq!(
        child["dotted_order"],
        format!("T0Z{new_root}.T1Z{new_child}")
    );
    assert_eq!(grandchild["trace_id"], new_root);
    assert_eq!(grandchild["parent_run_id"], new_child);
    assert_eq!(
        grandchild["dotted_order"],
        format!("T0Z{new_root}.T1Z{new_child}.T2Z{new_grandchild}")
    );

    // Experiment and example references are rewritten.
    assert_eq!(root["session_id"], "exp-d");
    assert_eq!(child["reference_example_id"], "de1");
}

#[tokio::test]
async fn test_runs_of_unmapped_experiment_are_skipped() {
    let source = MockServer::start().await;
    let dest = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/runs/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runs": [{
                "id": "uuid-x",
                "name": "stray",
                "run_type": "chain",
                "session_id": "exp-unknown",
                "dotted_order": "T0Zuuid-x",
            }],
            "cursors": {"next": null},
        })))
        .mount(&source)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/runs/batch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&dest)
        .await;

    let (ctx, _state_dir) = common::test_context(&source.uri(), &dest.uri());
    let migrator = ExperimentMigrator::new(ctx);

    let experiment_map = HashMap::from([("exp-s".to_string(), "exp-d".to_string())]);
    let summary = migrator
        .migrate_runs(&["exp-s".to_string()], &experiment_map, &HashMap::new())
        .await
        .expect("skips are not failures");

    assert_eq!(summary.migrated, 0);
    assert_eq!(summary.skipped, 1);
    assert!(summary.mapping.is_empty());
}

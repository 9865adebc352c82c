//! End-to-end dataset scenarios against mock source and destination
//! instances: first migration, idempotent re-run with skip-existing, and the
//! update path that patches examples in place by inputs hash.

mod common;

use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trace_migrate::canonical::fingerprint;
use trace_migrate::migrate::UpsertAction;
use trace_migrate::migrate::dataset::DatasetMigrator;
use trace_migrate::resource::ResourceKind;

fn source_dataset() -> Value {
    json!({
        "id": "D1",
        "name": "x",
        "description": "seed dataset",
        "data_type": "kv",
        "externally_managed": false,
    })
}

async fn mount_source_dataset(source: &MockServer, example: Value) {
    Mock::given(method("GET"))
        .and(path("/api/v1/datasets/D1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(source_dataset()))
        .mount(source)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/examples"))
        .and(query_param("dataset", "D1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([example])))
        .mount(source)
        .await;
}

#[tokio::test]
async fn test_first_migration_creates_dataset_and_example() {
    let source = MockServer::start().await;
    let dest = MockServer::start().await;

    mount_source_dataset(
        &source,
        json!({"id": "e1", "inputs": {"q": 1}, "outputs": {"a": 2}}),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .and(query_param("name", "x"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&dest)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/datasets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "dst-1"})))
        .expect(1)
        .mount(&dest)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/examples"))
        .and(query_param("dataset", "dst-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&dest)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/examples/bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "de1"}])))
        .expect(1)
        .mount(&dest)
        .await;

    let (ctx, _state_dir) = common::test_context(&source.uri(), &dest.uri());
    let migrator = DatasetMigrator::new(ctx.clone()).expect("migrator");

    let (outcome, examples) = migrator
        .migrate_dataset("D1", true)
        .await
        .expect("migration succeeds");

    assert_eq!(outcome.action, UpsertAction::Created);
    assert_eq!(outcome.destination_id, "dst-1");
    assert_eq!(examples.created, 1);
    assert_eq!(examples.mapping["e1"], "de1");

    let dataset_map = ctx.mapping_snapshot(ResourceKind::Dataset).await;
    assert_eq!(dataset_map["D1"], "dst-1");
    let example_map = ctx.mapping_snapshot(ResourceKind::Example).await;
    assert_eq!(example_map["e1"], "de1");

    // The bulk payload carries inputs whose fingerprint matches the source
    // example's inputs.
    let bulk_request = dest
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path().ends_with("/examples/bulk"))
        .expect("bulk request issued");
    let payloads: Vec<Value> = serde_json::from_slice(&bulk_request.body).expect("array body");
    assert_eq!(
        fingerprint(&payloads[0]["inputs"]),
        fingerprint(&json!({"q": 1}))
    );
}

#[tokio::test]
async fn test_second_run_with_skip_existing_writes_nothing() {
    let source = MockServer::start().await;
    let dest = MockServer::start().await;

    mount_source_dataset(
        &source,
        json!({"id": "e1", "inputs": {"q": 1}, "outputs": {"a": 2}}),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .and(query_param("name", "x"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "dst-1", "name": "x"}])),
        )
        .mount(&dest)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/datasets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "unexpected"})))
        .expect(0)
        .mount(&dest)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/examples/bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&dest)
        .await;

    let (ctx, _state_dir) = common::test_context(&source.uri(), &dest.uri());
    let migrator = DatasetMigrator::new(ctx.clone()).expect("migrator");

    let (outcome, examples) = migrator
        .migrate_dataset("D1", true)
        .await
        .expect("skip is a success");

    assert_eq!(outcome.action, UpsertAction::SkippedExisting);
    assert_eq!(outcome.destination_id, "dst-1");
    assert_eq!(examples.created + examples.updated, 0);

    // The existing ID still lands in the map so children can resolve it.
    let dataset_map = ctx.mapping_snapshot(ResourceKind::Dataset).await;
    assert_eq!(dataset_map["D1"], "dst-1");
}

#[tokio::test]
async fn test_update_path_patches_matched_example() {
    let source = MockServer::start().await;
    let dest = MockServer::start().await;

    // Source outputs changed since the first run.
    mount_source_dataset(
        &source,
        json!({"id": "e1", "inputs": {"q": 1}, "outputs": {"a": 3}}),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .and(query_param("name", "x"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "dst-1", "name": "x"}])),
        )
        .mount(&dest)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/datasets/dst-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "dst-1"})))
        .expect(1)
        .mount(&dest)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/examples"))
        .and(query_param("dataset", "dst-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!([{"id": "de1", "inputs": {"q": 1}, "outputs": {"a": 2}}]),
        ))
        .mount(&dest)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/examples/de1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "de1"})))
        .expect(1)
        .mount(&dest)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/examples/bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&dest)
        .await;

    let (ctx, _state_dir) = {
        let mut config = common::test_config(&source.uri(), &dest.uri());
        config.migration.skip_existing = false;
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = trace_migrate::session::SessionStore::with_dir(dir.path());
        (
            std::sync::Arc::new(
                trace_migrate::migrate::MigrationContext::new(config, store).expect("context"),
            ),
            dir,
        )
    };
    let migrator = DatasetMigrator::new(ctx.clone()).expect("migrator");

    let (outcome, examples) = migrator
        .migrate_dataset("D1", true)
        .await
        .expect("update succeeds");

    assert_eq!(outcome.action, UpsertAction::Updated);
    assert_eq!(examples.updated, 1);
    assert_eq!(examples.created, 0);
    assert_eq!(examples.mapping["e1"], "de1");

    // The PATCH body carries the refreshed outputs.
    let patch_request = dest
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path().ends_with("/examples/de1"))
        .expect("example patch issued");
    let body: Value = serde_json::from_slice(&patch_request.body).expect("json body");
    assert_eq!(body["outputs"], json!({"a": 3}));
}

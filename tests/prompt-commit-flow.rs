//! Prompt repo migration against mock instances: commit-DAG replay with
//! parent threading through the destination's latest hash, and the
//! "already up to date" treatment of empty-detail conflicts.

mod common;

use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trace_migrate::errors::MigrateError;
use trace_migrate::migrate::UpsertAction;
use trace_migrate::migrate::prompt::{PromptMigrator, PromptOptions};

fn prompt_record() -> Value {
    json!({
        "id": "pr-1",
        "repo_handle": "grader",
        "description": "LLM grader prompt",
        "tags": [],
    })
}

#[tokio::test]
async fn test_dag_replay_threads_parent_through_dest_latest() {
    let source = MockServer::start().await;
    let dest = MockServer::start().await;

    // Listing is tip-first; the migrator must replay root-first.
    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "commits": [
                {"id": "x2", "commit_hash": "c2", "parent_commit_hash": "c1"},
                {"id": "x1", "commit_hash": "c1", "parent_commit_hash": null},
            ]
        })))
        .mount(&source)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader/c1"))
        .and(query_param("include_model", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "manifest": {"id": ["ChatPromptTemplate"], "kwargs": {"rev": 1}}
        })))
        .mount(&source)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader/c2"))
        .and(query_param("include_model", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "manifest": {"id": ["ChatPromptTemplate"], "kwargs": {"rev": 2}}
        })))
        .mount(&source)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/prompts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "dp-1"})))
        .expect(1)
        .mount(&dest)
        .await;
    // Before the first push the repo has no latest commit; afterwards it
    // reports the pushed hash.
    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader/latest"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "no commits"})))
        .up_to_n_times(1)
        .mount(&dest)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"commit_hash": "d1"})))
        .mount(&dest)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/commits/-/grader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"commit_hash": "d1"})))
        .expect(2)
        .mount(&dest)
        .await;

    let (ctx, _state_dir) = common::test_context(&source.uri(), &dest.uri());
    let migrator = PromptMigrator::new(ctx);

    let options = PromptOptions {
        include_all_commits: true,
        ..PromptOptions::default()
    };
    let outcome = migrator
        .migrate_prompt(&prompt_record(), &options)
        .await
        .expect("replay succeeds");
    assert_eq!(outcome.action, UpsertAction::Created);

    let pushes: Vec<Value> = dest
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/api/v1/commits/-/grader")
        .map(|r| serde_json::from_slice(&r.body).expect("json body"))
        .collect();
    assert_eq!(pushes.len(), 2);

    // Root first, orphaned (no parent on an empty repo); the second commit
    // chains onto the destination's then-latest hash, not the source hash.
    assert_eq!(pushes[0]["manifest"]["kwargs"]["rev"], 1);
    assert!(pushes[0].get("parent_commit").is_none());
    assert_eq!(pushes[1]["manifest"]["kwargs"]["rev"], 2);
    assert_eq!(pushes[1]["parent_commit"], "d1");
}

#[tokio::test]
async fn test_empty_detail_conflict_means_up_to_date() {
    let source = MockServer::start().await;
    let dest = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "commit_hash": "c1",
            "manifest": {"id": ["ChatPromptTemplate"], "kwargs": {}},
        })))
        .mount(&source)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/prompts"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"detail": "exists"})))
        .mount(&dest)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"commit_hash": "c1"})))
        .mount(&dest)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/commits/-/grader"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"detail": ""})))
        .mount(&dest)
        .await;

    let (ctx, _state_dir) = common::test_context(&source.uri(), &dest.uri());
    let migrator = PromptMigrator::new(ctx);

    // Default options treat the empty-detail conflict as a no-op sync.
    let outcome = migrator
        .migrate_prompt(&prompt_record(), &PromptOptions::default())
        .await
        .expect("idempotent no-op");
    assert_eq!(outcome.action, UpsertAction::SkippedExisting);
}

#[tokio::test]
async fn test_conflict_detection_can_be_disabled() {
    let source = MockServer::start().await;
    let dest = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "commit_hash": "c1",
            "manifest": {"id": ["ChatPromptTemplate"], "kwargs": {}},
        })))
        .mount(&source)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/prompts"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"detail": "exists"})))
        .mount(&dest)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/commits/-/grader/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"commit_hash": "c1"})))
        .mount(&dest)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/commits/-/grader"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"detail": ""})))
        .mount(&dest)
        .await;

    let (ctx, _state_dir) = common::test_context(&source.uri(), &dest.uri());
    let migrator = PromptMigrator::new(ctx);

    let options = PromptOptions {
        conflict_means_synced: false,
        ..PromptOptions::default()
    };
    let err = migrator
        .migrate_prompt(&prompt_record(), &options)
        .await
        .expect_err("strict mode surfaces the conflict");
    assert!(matches!(err, MigrateError::Conflict { .. }));
}

//! Integration tests for the offset pagination driver: termination on short
//! pages, empty pages, and servers that keep replaying the same records.

mod common;

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trace_migrate::client::ApiClient;

async fn client_for(server: &MockServer) -> ApiClient {
    let config = common::test_config(&server.uri(), &server.uri());
    ApiClient::new(&config.source, &config.migration).expect("client")
}

#[tokio::test]
async fn test_short_page_terminates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .and(query_param("offset", "0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "a"}, {"id": "b"}])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "c"}])))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let items = client
        .paginate("/datasets", Vec::new(), 2)
        .collect()
        .await
        .expect("collect");

    assert_eq!(items.len(), 3);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_empty_listing_terminates_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let items = client
        .paginate("/datasets", Vec::new(), 100)
        .collect()
        .await
        .expect("collect");
    assert!(items.is_empty());
}

#[tokio::test]
async fn test_replaying_server_is_stopped_by_dedup_guard() {
    let server = MockServer::start().await;
    // Same full page regardless of offset: a broken server that would loop
    // a naive client forever.
    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "a"}, {"id": "b"}])),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let items = client
        .paginate("/datasets", Vec::new(), 2)
        .collect()
        .await
        .expect("collect");

    assert_eq!(items.len(), 2, "replayed records are not re-yielded");
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        2,
        "the all-duplicates page ends the iteration"
    );
}

#[tokio::test]
async fn test_wrapped_and_keyed_response_shapes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": [{"id": "a"}], "total": 1})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/feedback"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"feedback": [{"id": "f1"}, {"id": "f2"}]})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;

    let wrapped = client
        .paginate("/datasets", Vec::new(), 100)
        .collect()
        .await
        .expect("collect");
    assert_eq!(wrapped.len(), 1);

    let keyed = client
        .paginate("/feedback", Vec::new(), 100)
        .with_items_key("feedback")
        .collect()
        .await
        .expect("collect");
    assert_eq!(keyed.len(), 2);
}

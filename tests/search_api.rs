mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::{hits_response, FakeEmbedderFactory, FakeEngine};
use intelligent_search::embedding::EmbedPurpose;
use intelligent_search::index::IndexManager;
use intelligent_search::search::Searcher;
use intelligent_search::server::{router, AppState};

const COHERE: &str = "cohere.embed-multilingual-v3";

/// Serve the API on an ephemeral port and return its base URL.
async fn spawn_api(engine: Arc<FakeEngine>, factory: Arc<FakeEmbedderFactory>) -> String {
    let state = AppState::new(
        Searcher::new(engine.clone(), factory),
        IndexManager::new(engine, Duration::ZERO),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

fn search_body(method: &str, unit: &str) -> Value {
    json!({
        "indexName": "manuals",
        "text": "返品の方法",
        "searchMethod": method,
        "searchResultUnit": unit
    })
}

#[tokio::test]
async fn test_hybrid_document_search() {
    let engine = Arc::new(FakeEngine::with_index("manuals", COHERE));
    engine.state.lock().unwrap().search_response = hits_response(&[
        ("返品は30日以内に受け付けます。", "svc/returns.pdf"),
        ("送料は無料です。", "svc/shipping.txt"),
    ]);
    let factory = Arc::new(FakeEmbedderFactory::new(4));
    let base = spawn_api(engine.clone(), factory.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&search_body("hybrid", "document"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let hits: Value = resp.json().await.unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 2);
    assert_eq!(hits[0]["text"], "返品は30日以内に受け付けます。");
    assert_eq!(hits[0]["doc_name"], "svc/returns.pdf");
    assert_eq!(hits[0]["docs_root"], "s3://bucket/manuals");
    assert_eq!(hits[0]["service"], "svc");
    assert_eq!(hits[0]["score"], 1.0);

    let state = engine.state.lock().unwrap();
    let (index, body, pipeline) = &state.searches[0];
    assert_eq!(index, "manuals");
    assert_eq!(pipeline.as_deref(), Some("collapse-hybrid-search-pipeline"));
    assert_eq!(body["size"], 5);
    assert_eq!(body["_source"], false);
    let queries = body.pointer("/query/hybrid/queries").unwrap();
    assert_eq!(queries[0]["match"]["keyword"]["query"], "返品の方法");
    assert_eq!(queries[1]["knn"]["vector"]["k"], 5);
    assert_eq!(queries[1]["knn"]["vector"]["vector"].as_array().unwrap().len(), 4);

    // The query was embedded with the model recorded on the index.
    let calls = factory.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].model_id, COHERE);
    assert_eq!(calls[0].purpose, EmbedPurpose::Query);
}

#[tokio::test]
async fn test_hybrid_chunk_uses_hybrid_pipeline() {
    let engine = Arc::new(FakeEngine::with_index("manuals", COHERE));
    engine.state.lock().unwrap().search_response = hits_response(&[]);
    let base = spawn_api(engine.clone(), Arc::new(FakeEmbedderFactory::new(4))).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&search_body("hybrid", "chunk"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let hits: Value = resp.json().await.unwrap();
    assert_eq!(hits, json!([]));

    let state = engine.state.lock().unwrap();
    assert_eq!(state.searches[0].2.as_deref(), Some("hybrid-search-pipeline"));
}

#[tokio::test]
async fn test_keyword_chunk_needs_no_embedding_or_pipeline() {
    let engine = Arc::new(FakeEngine::with_index("manuals", COHERE));
    engine.state.lock().unwrap().search_response = hits_response(&[("x", "svc/a.txt")]);
    let factory = Arc::new(FakeEmbedderFactory::new(4));
    let base = spawn_api(engine.clone(), factory.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&search_body("keyword", "chunk"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let state = engine.state.lock().unwrap();
    assert_eq!(state.searches[0].2, None);
    assert!(factory.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_method_is_400() {
    let engine = Arc::new(FakeEngine::with_index("manuals", COHERE));
    let base = spawn_api(engine.clone(), Arc::new(FakeEmbedderFactory::new(4))).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&search_body("semantic", "chunk"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "error": "invalid search method" }));
    assert!(engine.state.lock().unwrap().searches.is_empty());
}

#[tokio::test]
async fn test_invalid_result_unit_is_400() {
    let engine = Arc::new(FakeEngine::with_index("manuals", COHERE));
    let base = spawn_api(engine, Arc::new(FakeEmbedderFactory::new(4))).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&search_body("vector", "page"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "error": "Invalid search result unit" }));
}

#[tokio::test]
async fn test_engine_failure_is_generic_500() {
    let engine = Arc::new(FakeEngine::with_index("manuals", COHERE));
    engine.state.lock().unwrap().fail_search = true;
    let base = spawn_api(engine, Arc::new(FakeEmbedderFactory::new(4))).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&search_body("keyword", "document"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "error": "Internal server error" }));
}

#[tokio::test]
async fn test_unknown_index_vector_search_is_500() {
    let engine = Arc::new(FakeEngine::new());
    let base = spawn_api(engine, Arc::new(FakeEmbedderFactory::new(4))).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&search_body("vector", "chunk"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let engine = Arc::new(FakeEngine::new());
    let base = spawn_api(engine, Arc::new(FakeEmbedderFactory::new(4))).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&json!({ "text": "missing everything else" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_list_and_delete_indices() {
    let engine = Arc::new(FakeEngine::with_index("manuals", COHERE));
    let base = spawn_api(engine, Arc::new(FakeEmbedderFactory::new(4))).await;
    let client = reqwest::Client::new();

    let listed: Value = client
        .get(format!("{}/indices", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed, json!({ "indices": ["manuals"] }));

    let resp = client
        .delete(format!("{}/indices/manuals", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "index": "manuals", "deleted": true }));

    // Deleting again is still a success.
    let resp = client
        .delete(format!("{}/indices/manuals", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deleted"], false);
}

#[tokio::test]
async fn test_health() {
    let base = spawn_api(Arc::new(FakeEngine::new()), Arc::new(FakeEmbedderFactory::new(4))).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

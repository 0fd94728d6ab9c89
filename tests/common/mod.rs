//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use intelligent_search::embedding::{EmbedPurpose, Embedder, EmbedderFactory, EmbeddingError};
use intelligent_search::models::{DocumentLocator, IndexRecord};
use intelligent_search::opensearch::SearchEngine;
use intelligent_search::storage::ObjectStore;

/// Text marker that makes [`FakeEmbedder`] fail the call.
pub const EMBED_FAIL: &str = "EMBED_FAIL";
/// Text marker that makes [`FakeEmbedder`] return one dimension too few.
pub const SHORT_VECTOR: &str = "SHORT_VECTOR";

// ============ Object store ============

/// Documents by URI, in listing order. A `None` body fails the fetch.
#[derive(Default)]
pub struct FakeStore {
    docs: Vec<(String, Option<Vec<u8>>)>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, uri: &str, text: &str) -> Self {
        self.docs.push((uri.to_string(), Some(text.as_bytes().to_vec())));
        self
    }

    pub fn with_broken(mut self, uri: &str) -> Self {
        self.docs.push((uri.to_string(), None));
        self
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list(&self, prefix_uri: &str) -> Result<Vec<DocumentLocator>> {
        Ok(self
            .docs
            .iter()
            .filter(|(uri, _)| uri.starts_with(prefix_uri))
            .filter_map(|(uri, _)| DocumentLocator::parse(uri).ok())
            .collect())
    }

    async fn fetch(&self, locator: &DocumentLocator) -> Result<Vec<u8>> {
        match self.docs.iter().find(|(uri, _)| *uri == locator.uri) {
            Some((_, Some(bytes))) => Ok(bytes.clone()),
            Some((_, None)) => bail!("access denied: {}", locator.uri),
            None => bail!("no such key: {}", locator.uri),
        }
    }
}

// ============ Embedder ============

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedCall {
    pub model_id: String,
    pub text: String,
    pub purpose: EmbedPurpose,
}

pub struct FakeEmbedder {
    model_id: String,
    dimension: usize,
    pub calls: Arc<Mutex<Vec<EmbedCall>>>,
}

impl FakeEmbedder {
    pub fn new(model_id: &str, dimension: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.lock().unwrap().push(EmbedCall {
            model_id: self.model_id.clone(),
            text: text.to_string(),
            purpose,
        });
        if text.contains(EMBED_FAIL) {
            return Err(EmbeddingError::Status {
                status: 503,
                body: "ThrottlingException".to_string(),
            });
        }
        let len = if text.contains(SHORT_VECTOR) {
            self.dimension - 1
        } else {
            self.dimension
        };
        Ok(vec![text.chars().count() as f32 / 100.0; len])
    }
}

/// Embedder that holds every call for `delay` and remembers the highest
/// number of calls that were in flight at once.
pub struct SlowEmbedder {
    dimension: usize,
    delay: Duration,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl SlowEmbedder {
    pub fn new(dimension: usize, delay: Duration) -> Self {
        Self {
            dimension,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for SlowEmbedder {
    fn model_id(&self) -> &str {
        "slow-model"
    }

    async fn embed(&self, _text: &str, _purpose: EmbedPurpose) -> Result<Vec<f32>, EmbeddingError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![0.5; self.dimension])
    }
}

/// Hands out [`FakeEmbedder`]s that all log into one shared call list.
pub struct FakeEmbedderFactory {
    dimension: usize,
    pub calls: Arc<Mutex<Vec<EmbedCall>>>,
}

impl FakeEmbedderFactory {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl EmbedderFactory for FakeEmbedderFactory {
    fn embedder_for(&self, model_id: &str) -> Result<Arc<dyn Embedder>> {
        let mut embedder = FakeEmbedder::new(model_id, self.dimension);
        embedder.calls = Arc::clone(&self.calls);
        Ok(Arc::new(embedder))
    }
}

// ============ Search engine ============

#[derive(Default)]
pub struct EngineState {
    /// Every call, in order, as `"<op> <arg>"`.
    pub calls: Vec<String>,
    /// Index name → create body.
    pub indices: HashMap<String, Value>,
    pub bulk_sizes: Vec<usize>,
    pub records: Vec<IndexRecord>,
    pub searches: Vec<(String, Value, Option<String>)>,
    /// 0-based bulk request number that fails.
    pub fail_bulk_at: Option<usize>,
    pub fail_search: bool,
    pub search_response: Value,
}

#[derive(Default)]
pub struct FakeEngine {
    pub state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that already holds `index`, built with `model_id`.
    pub fn with_index(index: &str, model_id: &str) -> Self {
        let engine = Self::new();
        engine.state.lock().unwrap().indices.insert(
            index.to_string(),
            json!({ "mappings": { "_meta": { "model_id": model_id } } }),
        );
        engine
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn bulk_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().bulk_sizes.clone()
    }

    pub fn records(&self) -> Vec<IndexRecord> {
        self.state.lock().unwrap().records.clone()
    }

    fn log(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl SearchEngine for FakeEngine {
    async fn put_cluster_settings(&self, body: &Value) -> Result<()> {
        self.log(format!("cluster_settings {}", body["persistent"]));
        Ok(())
    }

    async fn put_search_pipeline(&self, name: &str, _body: &Value) -> Result<()> {
        self.log(format!("pipeline {}", name));
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        self.log(format!("exists {}", index));
        Ok(self.state.lock().unwrap().indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        self.log(format!("create {}", index));
        let mut state = self.state.lock().unwrap();
        if state.indices.contains_key(index) {
            bail!("resource_already_exists_exception: {}", index);
        }
        state.indices.insert(index.to_string(), body.clone());
        Ok(())
    }

    async fn put_index_settings(&self, index: &str, body: &Value) -> Result<()> {
        self.log(format!(
            "settings {} refresh_interval={}",
            index,
            body["index"]["refresh_interval"].as_str().unwrap_or("?")
        ));
        Ok(())
    }

    async fn bulk(&self, records: &[IndexRecord]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let n = state.bulk_sizes.len();
        state.calls.push(format!("bulk {}", records.len()));
        state.bulk_sizes.push(records.len());
        if state.fail_bulk_at == Some(n) {
            bail!("bulk request rejected items: mapper_parsing_exception");
        }
        state.records.extend_from_slice(records);
        Ok(())
    }

    async fn search(&self, index: &str, body: &Value, pipeline: Option<&str>) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        state
            .searches
            .push((index.to_string(), body.clone(), pipeline.map(str::to_string)));
        if state.fail_search {
            bail!("OpenSearch POST /{}/_search returned HTTP 503", index);
        }
        Ok(state.search_response.clone())
    }

    async fn index_model_id(&self, index: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        let body = state
            .indices
            .get(index)
            .ok_or_else(|| anyhow!("index_not_found_exception: {}", index))?;
        Ok(body
            .pointer("/mappings/_meta/model_id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn list_indices(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .indices
            .keys()
            .filter(|n| !n.starts_with('.'))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete_index(&self, index: &str) -> Result<bool> {
        self.log(format!("delete {}", index));
        Ok(self.state.lock().unwrap().indices.remove(index).is_some())
    }
}

/// A search response carrying one hit per `(text, doc_name)`.
pub fn hits_response(hits: &[(&str, &str)]) -> Value {
    let hits: Vec<Value> = hits
        .iter()
        .enumerate()
        .map(|(i, (text, doc_name))| {
            json!({
                "_index": "docs",
                "_score": 1.0 - i as f64 * 0.1,
                "fields": {
                    "keyword": [text],
                    "service": ["svc"],
                    "docs_root": ["s3://bucket/manuals"],
                    "doc_name": [doc_name]
                }
            })
        })
        .collect();
    json!({ "took": 4, "hits": { "total": { "value": hits.len() }, "hits": hits } })
}

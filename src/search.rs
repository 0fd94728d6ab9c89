//! Query path: request validation, query building, pipeline selection and
//! hit mapping.
//!
//! Every query asks for the top 5 hits and reads the stored fields back
//! instead of `_source`, so the vector never travels in a response.
//!
//! | Method | Query | `chunk` pipeline | `document` pipeline |
//! |--------|-------|------------------|---------------------|
//! | `keyword` | `match` on `keyword` | none | `collapse-search-pipeline` |
//! | `vector` | `knn` on `vector`, k=5 | none | `collapse-search-pipeline` |
//! | `hybrid` | `hybrid` of both | `hybrid-search-pipeline` | `collapse-hybrid-search-pipeline` |
//!
//! Vector and hybrid queries embed the text with the model recorded in the
//! index `_meta`, which is not necessarily the one configured for ingestion.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::embedding::{EmbedPurpose, EmbedderFactory};
use crate::index::{COLLAPSE_HYBRID_PIPELINE, COLLAPSE_PIPELINE, HYBRID_PIPELINE};
use crate::models::SearchHit;
use crate::opensearch::SearchEngine;

pub const RESULT_SIZE: usize = 5;
pub const KNN_K: usize = 5;
pub const RESULT_FIELDS: [&str; 4] = ["keyword", "service", "docs_root", "doc_name"];

/// A request the caller got wrong. Messages are part of the API contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchRequestError {
    #[error("invalid search method")]
    InvalidMethod(String),
    #[error("Invalid search result unit")]
    InvalidResultUnit(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    Keyword,
    Vector,
    Hybrid,
}

impl SearchMethod {
    pub fn needs_vector(self) -> bool {
        !matches!(self, Self::Keyword)
    }
}

impl FromStr for SearchMethod {
    type Err = SearchRequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(Self::Keyword),
            "vector" => Ok(Self::Vector),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(SearchRequestError::InvalidMethod(other.to_string())),
        }
    }
}

/// Whether hits are individual passages or collapsed to one per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultUnit {
    Chunk,
    Document,
}

impl FromStr for ResultUnit {
    type Err = SearchRequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chunk" => Ok(Self::Chunk),
            "document" => Ok(Self::Document),
            other => Err(SearchRequestError::InvalidResultUnit(other.to_string())),
        }
    }
}

/// Body of `POST /search`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub index_name: String,
    pub text: String,
    pub search_method: String,
    pub search_result_unit: String,
}

impl SearchRequest {
    /// Validate method, then result unit.
    pub fn parse(&self) -> Result<(SearchMethod, ResultUnit), SearchRequestError> {
        let method = self.search_method.parse()?;
        let unit = self.search_result_unit.parse()?;
        Ok((method, unit))
    }
}

pub fn pipeline_for(method: SearchMethod, unit: ResultUnit) -> Option<&'static str> {
    match (method, unit) {
        (SearchMethod::Hybrid, ResultUnit::Document) => Some(COLLAPSE_HYBRID_PIPELINE),
        (SearchMethod::Hybrid, ResultUnit::Chunk) => Some(HYBRID_PIPELINE),
        (_, ResultUnit::Document) => Some(COLLAPSE_PIPELINE),
        (_, ResultUnit::Chunk) => None,
    }
}

/// Build the query body. `vector` is required for vector and hybrid queries.
pub fn build_query(method: SearchMethod, text: &str, vector: Option<&[f32]>) -> Result<Value> {
    let match_query = json!({ "match": { "keyword": { "query": text } } });
    let knn_query = || -> Result<Value> {
        let vector = vector.ok_or_else(|| anyhow!("{:?} search needs a query vector", method))?;
        Ok(json!({ "knn": { "vector": { "vector": vector, "k": KNN_K } } }))
    };

    let query = match method {
        SearchMethod::Keyword => match_query,
        SearchMethod::Vector => knn_query()?,
        SearchMethod::Hybrid => json!({ "hybrid": { "queries": [match_query, knn_query()?] } }),
    };

    Ok(json!({
        "size": RESULT_SIZE,
        "_source": false,
        "fields": RESULT_FIELDS,
        "query": query,
    }))
}

/// Map `hits.hits[*]` to [`SearchHit`]s, reading the first value of each
/// requested field.
pub fn parse_hits(response: &Value) -> Result<Vec<SearchHit>> {
    let hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("search response has no hits.hits array"))?;

    hits.iter()
        .map(|hit| {
            let field = |name: &str| -> Result<String> {
                hit.get("fields")
                    .and_then(|f| f.get(name))
                    .and_then(|v| v.get(0))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("hit is missing field '{}'", name))
            };
            Ok(SearchHit {
                text: field("keyword")?,
                score: hit.get("_score").and_then(Value::as_f64).unwrap_or(0.0),
                service: field("service")?,
                docs_root: field("docs_root")?,
                doc_name: field("doc_name")?,
            })
        })
        .collect()
}

/// Runs search requests against the engine.
#[derive(Clone)]
pub struct Searcher {
    engine: Arc<dyn SearchEngine>,
    embedders: Arc<dyn EmbedderFactory>,
}

impl Searcher {
    pub fn new(engine: Arc<dyn SearchEngine>, embedders: Arc<dyn EmbedderFactory>) -> Self {
        Self { engine, embedders }
    }

    /// Validation failures come back as a [`SearchRequestError`] inside the
    /// `anyhow::Error`.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let (method, unit) = request.parse()?;

        let vector = if method.needs_vector() {
            Some(self.query_vector(&request.index_name, &request.text).await?)
        } else {
            None
        };

        let body = build_query(method, &request.text, vector.as_deref())?;
        let pipeline = pipeline_for(method, unit);
        tracing::debug!(
            "search {} method={:?} unit={:?} pipeline={:?}",
            request.index_name,
            method,
            unit,
            pipeline
        );

        let response = self
            .engine
            .search(&request.index_name, &body, pipeline)
            .await?;
        parse_hits(&response)
    }

    async fn query_vector(&self, index: &str, text: &str) -> Result<Vec<f32>> {
        let model_id = self
            .engine
            .index_model_id(index)
            .await?
            .ok_or_else(|| anyhow!("index {} has no model_id in its _meta", index))?;
        let embedder = self.embedders.embedder_for(&model_id)?;
        let vector = embedder
            .embed(text, EmbedPurpose::Query)
            .await
            .with_context(|| format!("embedding query with {}", model_id))?;
        Ok(vector)
    }
}

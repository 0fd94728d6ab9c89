//! Index lifecycle.
//!
//! An index moves through three states:
//!
//! ```text
//! absent ──ensure_index──▶ present (bulk-tuned, refresh 1000s)
//!                               │
//!                   restore_refresh_interval
//!                               ▼
//!                         present (steady, refresh 60s)
//! ```
//!
//! Creation is idempotent: [`IndexManager::ensure_index`] on an index that
//! already exists changes nothing and does not wait. Cluster settings and
//! search pipelines are overwritten on every run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::opensearch::SearchEngine;

/// Refresh interval while bulk loading.
pub const BULK_REFRESH_INTERVAL: &str = "1000s";
/// Refresh interval restored after loading.
pub const STEADY_REFRESH_INTERVAL: &str = "60s";

pub const COLLAPSE_HYBRID_PIPELINE: &str = "collapse-hybrid-search-pipeline";
pub const COLLAPSE_PIPELINE: &str = "collapse-search-pipeline";
pub const HYBRID_PIPELINE: &str = "hybrid-search-pipeline";

/// Custom analyzer applied to the `keyword` field.
pub const KEYWORD_ANALYZER: &str = "custom_sudachi_analyzer";

/// Outcome of [`IndexManager::ensure_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Created,
    AlreadyPresent,
}

pub fn cluster_settings_body(index_thread_qty: u32) -> Value {
    json!({
        "persistent": {
            "knn.algo_param.index_thread_qty": index_thread_qty.to_string(),
        }
    })
}

fn normalization_processor() -> Value {
    json!({
        "normalization-processor": {
            "normalization": { "technique": "min_max" },
            "combination": {
                "technique": "arithmetic_mean",
                "parameters": { "weights": [0.5, 0.5] },
            },
        }
    })
}

fn collapse_processor() -> Value {
    json!({ "collapse": { "field": "doc_name" } })
}

/// The three search pipelines the query API relies on, by name.
pub fn search_pipelines() -> Vec<(&'static str, Value)> {
    vec![
        (
            COLLAPSE_HYBRID_PIPELINE,
            json!({
                "description": "Pipeline for hybrid search and collapse",
                "phase_results_processors": [normalization_processor()],
                "response_processors": [collapse_processor()],
            }),
        ),
        (
            COLLAPSE_PIPELINE,
            json!({
                "description": "Pipeline for collapse",
                "response_processors": [collapse_processor()],
            }),
        ),
        (
            HYBRID_PIPELINE,
            json!({
                "description": "Pipeline for hybrid search",
                "phase_results_processors": [normalization_processor()],
            }),
        ),
    ]
}

/// Settings and mappings for a new index.
///
/// The `keyword` field uses a Sudachi analyzer, so the cluster needs the
/// `analysis-sudachi` and `analysis-icu` plugins.
pub fn index_body(dimension: usize, model_id: &str) -> Value {
    json!({
        "settings": {
            "index": {
                "analysis": {
                    "filter": {
                        "custom_sudachi_part_of_speech": {
                            "type": "sudachi_part_of_speech",
                            "stoptags": [
                                "感動詞,フィラー",
                                "接頭辞",
                                "代名詞",
                                "助詞",
                                "助動詞",
                                "動詞,一般,*,*,*,終止形-一般",
                                "名詞,普通名詞,副詞可能",
                            ],
                        }
                    },
                    "analyzer": {
                        KEYWORD_ANALYZER: {
                            "type": "custom",
                            "tokenizer": "sudachi_tokenizer",
                            "filter": ["sudachi_normalizedform", "custom_sudachi_part_of_speech"],
                            "char_filter": ["icu_normalizer"],
                        }
                    },
                },
                "knn": true,
                "refresh_interval": BULK_REFRESH_INTERVAL,
            }
        },
        "mappings": {
            "_meta": { "model_id": model_id },
            "properties": {
                "vector": {
                    "type": "knn_vector",
                    "dimension": dimension,
                    "method": {
                        "engine": "lucene",
                        "space_type": "cosinesimil",
                        "name": "hnsw",
                        "parameters": {},
                    },
                },
                "docs_root": { "type": "keyword" },
                "doc_name": { "type": "keyword" },
                "keyword": { "type": "text", "analyzer": KEYWORD_ANALYZER },
                "service": { "type": "keyword" },
            },
        },
    })
}

pub fn refresh_interval_body(interval: &str) -> Value {
    json!({ "index": { "refresh_interval": interval } })
}

/// Drives index and cluster state through a [`SearchEngine`].
#[derive(Clone)]
pub struct IndexManager {
    engine: Arc<dyn SearchEngine>,
    stabilize_delay: Duration,
}

impl IndexManager {
    /// `stabilize_delay` is waited out after creating an index, before the
    /// first write reaches it.
    pub fn new(engine: Arc<dyn SearchEngine>, stabilize_delay: Duration) -> Self {
        Self {
            engine,
            stabilize_delay,
        }
    }

    pub async fn tune_cluster(&self, index_thread_qty: u32) -> Result<()> {
        self.engine
            .put_cluster_settings(&cluster_settings_body(index_thread_qty))
            .await
            .context("applying cluster settings")
    }

    pub async fn upsert_pipelines(&self) -> Result<()> {
        for (name, body) in search_pipelines() {
            self.engine
                .put_search_pipeline(name, &body)
                .await
                .with_context(|| format!("creating search pipeline {}", name))?;
            tracing::debug!("search pipeline {} ready", name);
        }
        Ok(())
    }

    /// Create `index` if it does not exist.
    pub async fn ensure_index(
        &self,
        index: &str,
        dimension: usize,
        model_id: &str,
    ) -> Result<IndexState> {
        if self.engine.index_exists(index).await? {
            tracing::info!("index {} already exists", index);
            return Ok(IndexState::AlreadyPresent);
        }

        self.engine
            .create_index(index, &index_body(dimension, model_id))
            .await
            .with_context(|| format!("creating index {}", index))?;
        tracing::info!(
            "index {} created (dimension {}, model {})",
            index,
            dimension,
            model_id
        );

        if !self.stabilize_delay.is_zero() {
            tracing::info!("waiting {:?} for the index to settle", self.stabilize_delay);
            tokio::time::sleep(self.stabilize_delay).await;
        }
        Ok(IndexState::Created)
    }

    pub async fn restore_refresh_interval(&self, index: &str) -> Result<()> {
        self.engine
            .put_index_settings(index, &refresh_interval_body(STEADY_REFRESH_INTERVAL))
            .await
            .with_context(|| format!("restoring refresh_interval on {}", index))
    }

    /// Delete `index`. A missing index counts as success; the return value
    /// says whether anything was removed.
    pub async fn delete_index(&self, index: &str) -> Result<bool> {
        let deleted = self.engine.delete_index(index).await?;
        if deleted {
            tracing::info!("index {} deleted", index);
        } else {
            tracing::info!("index {} not found, nothing to delete", index);
        }
        Ok(deleted)
    }

    pub async fn list_indices(&self) -> Result<Vec<String>> {
        self.engine.list_indices().await
    }
}

//! Ingestion pipeline orchestration.
//!
//! Coordinates a full load: cluster tuning → search pipelines → index →
//! enumerate documents → load, split and embed (concurrently) → bulk write →
//! restore index settings. Each step gates the next; a failure in any of the
//! index-level steps aborts the run.
//!
//! Per-document problems (unsupported type, fetch error, embedding call
//! failure) never abort the run. The document is reported as
//! [`DocumentOutcome::Skipped`] and logged. The one exception is an embedding
//! whose length differs from the configured dimension: the index cannot hold
//! it, so the run stops with [`DimensionMismatch`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::chunk;
use crate::config::Config;
use crate::embedding::{EmbedPurpose, Embedder};
use crate::extract::{spawn_load_document, DocumentKind};
use crate::index::{IndexManager, IndexState};
use crate::models::{DocumentLocator, DocumentOutcome, IndexRecord};
use crate::opensearch::SearchEngine;
use crate::storage::ObjectStore;

/// An embedding came back with the wrong number of dimensions.
#[derive(Debug, Error)]
#[error("{uri}: embedding has {actual} dimensions, index expects {expected}")]
pub struct DimensionMismatch {
    pub uri: String,
    pub expected: usize,
    pub actual: usize,
}

/// Tunables for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub index_name: String,
    pub dimension: usize,
    pub max_chunk_length: usize,
    pub growth_step: usize,
    pub workers: usize,
    pub batch_size: usize,
    pub knn_index_thread_qty: u32,
    pub stabilize_delay: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            index_name: config.opensearch.index_name.clone(),
            dimension: config.embedding.dimension,
            max_chunk_length: config.chunking.max_chunk_length,
            growth_step: config.chunking.growth_step,
            workers: config.ingest.workers,
            batch_size: config.ingest.batch_size,
            knn_index_thread_qty: config.ingest.knn_index_thread_qty,
            stabilize_delay: Duration::from_secs(config.ingest.stabilize_delay_secs),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Documents found under the prefix.
    pub documents: usize,
    /// Documents dropped during load, split or embed, in listing order.
    pub skipped: Vec<DocumentLocator>,
    pub records: usize,
    pub batches: usize,
    pub index_created: bool,
}

pub struct Ingestor {
    store: Arc<dyn ObjectStore>,
    embedder: Arc<dyn Embedder>,
    engine: Arc<dyn SearchEngine>,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        embedder: Arc<dyn Embedder>,
        engine: Arc<dyn SearchEngine>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            engine,
            settings,
        }
    }

    /// Load every document under `prefix_uri` into the configured index.
    pub async fn run(&self, prefix_uri: &str) -> Result<IngestReport> {
        let index = &self.settings.index_name;
        let manager = IndexManager::new(self.engine.clone(), self.settings.stabilize_delay);

        manager.tune_cluster(self.settings.knn_index_thread_qty).await?;
        manager.upsert_pipelines().await?;
        let state = manager
            .ensure_index(index, self.settings.dimension, self.embedder.model_id())
            .await?;

        let locators = self
            .store
            .list(prefix_uri)
            .await
            .with_context(|| format!("listing {}", prefix_uri))?;
        tracing::info!("{} documents found under {}", locators.len(), prefix_uri);

        let documents = locators.len();
        let outcomes = self.embed_documents(locators).await?;

        let mut skipped = Vec::new();
        let mut records = Vec::new();
        for outcome in outcomes {
            match outcome {
                DocumentOutcome::Embedded(mut recs) => records.append(&mut recs),
                DocumentOutcome::Skipped { locator, .. } => skipped.push(locator),
            }
        }
        tracing::info!(
            "{} documents ({} chunks) were embedded, {} skipped",
            documents - skipped.len(),
            records.len(),
            skipped.len()
        );

        let batches = self.write_batches(&records).await?;
        manager.restore_refresh_interval(index).await?;

        let report = IngestReport {
            documents,
            skipped,
            records: records.len(),
            batches,
            index_created: state == IndexState::Created,
        };
        tracing::info!("ingest finished: {:?}", report);
        Ok(report)
    }

    /// Process documents on a bounded worker pool. Outcomes come back in
    /// listing order once every worker has finished.
    async fn embed_documents(&self, locators: Vec<DocumentLocator>) -> Result<Vec<DocumentOutcome>> {
        let total = locators.len();
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let started = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for (position, locator) in locators.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let started = Arc::clone(&started);
            let worker = DocumentWorker {
                store: Arc::clone(&self.store),
                embedder: Arc::clone(&self.embedder),
                settings: self.settings.clone(),
            };

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                let n = started.fetch_add(1, Ordering::SeqCst);
                tracing::info!("embedding: {}/{}", n, total);
                let outcome = worker.process(&locator).await?;
                Ok::<_, anyhow::Error>((position, outcome))
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            let result = joined.context("document worker panicked")?;
            match result {
                Ok(entry) => outcomes.push(entry),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        outcomes.sort_by_key(|(position, _)| *position);
        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }

    /// Write records in fixed-size batches, one request at a time.
    async fn write_batches(&self, records: &[IndexRecord]) -> Result<usize> {
        let batch_size = self.settings.batch_size.max(1);
        let total = records.len().div_ceil(batch_size);
        for (i, batch) in records.chunks(batch_size).enumerate() {
            self.engine
                .bulk(batch)
                .await
                .with_context(|| format!("bulk batch {}/{}", i + 1, total))?;
            tracing::debug!("bulk batch {}/{} ({} records)", i + 1, total, batch.len());
        }
        Ok(total)
    }
}

/// Everything one worker needs to turn a locator into records.
struct DocumentWorker {
    store: Arc<dyn ObjectStore>,
    embedder: Arc<dyn Embedder>,
    settings: IngestSettings,
}

impl DocumentWorker {
    /// Load, split and embed one document. Only a dimension mismatch is
    /// returned as an error; everything else becomes a skip.
    async fn process(&self, locator: &DocumentLocator) -> Result<DocumentOutcome> {
        let skip = |reason: String| {
            tracing::warn!("skipping {}: {}", locator.uri, reason);
            DocumentOutcome::Skipped {
                locator: locator.clone(),
                reason,
            }
        };

        let kind = match DocumentKind::for_locator(locator) {
            Ok(kind) => kind,
            Err(e) => return Ok(skip(e.to_string())),
        };
        let bytes = match self.store.fetch(locator).await {
            Ok(bytes) => bytes,
            Err(e) => return Ok(skip(format!("{:#}", e))),
        };
        let text = match spawn_load_document(bytes, kind).await {
            Ok(text) => text,
            Err(e) => return Ok(skip(e.to_string())),
        };

        let split = chunk::split_passages(
            &text,
            self.settings.max_chunk_length,
            self.settings.growth_step,
        );
        if split.effective_limit > self.settings.max_chunk_length {
            tracing::debug!(
                "{}: passage limit grown to {}",
                locator.uri,
                split.effective_limit
            );
        }

        let mut records = Vec::with_capacity(split.passages.len());
        for passage in split.passages {
            let vector = match self.embedder.embed(&passage, EmbedPurpose::Document).await {
                Ok(vector) => vector,
                Err(e) => return Ok(skip(e.to_string())),
            };
            if vector.len() != self.settings.dimension {
                return Err(DimensionMismatch {
                    uri: locator.uri.clone(),
                    expected: self.settings.dimension,
                    actual: vector.len(),
                }
                .into());
            }
            records.push(IndexRecord::new(
                &self.settings.index_name,
                locator,
                passage,
                vector,
            ));
        }

        Ok(DocumentOutcome::Embedded(records))
    }
}

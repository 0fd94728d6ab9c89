//! Configuration loading.
//!
//! Settings come from an optional TOML file, then environment variables
//! override individual fields. Every field has a default, so a deployment
//! that only sets the environment (a container task, for instance) needs no
//! file at all.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `OPENSEARCH_ENDPOINT` | `opensearch.endpoint` | unset |
//! | `OPENSEARCH_INDEX_NAME` | `opensearch.index_name` | unset |
//! | `OPENSEARCH_REGION` | `opensearch.region` | second host label |
//! | `EMBED_DIMENSION` | `embedding.dimension` | `1024` |
//! | `EMBED_MODEL_ID` | `embedding.model_id` | `amazon.titan-embed-text-v2:0` |
//! | `BEDROCK_REGION` | `embedding.region` | `us-east-1` |
//! | `DOCUMENT_S3_URI` | `documents.uri` | unset |
//! | `AWS_REGION` | `documents.region` | `us-east-1` |
//! | `S3_ENDPOINT_URL` | `documents.endpoint_url` | unset |
//! | `MAX_CHUNK_LENGTH` | `chunking.max_chunk_length` | `400` |
//! | `SERVER_BIND` | `server.bind` | `127.0.0.1:8080` |
//!
//! AWS credentials are not part of this file. They come from
//! `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` (plus `AWS_SESSION_TOKEN`), or,
//! inside an ECS task, from the container credentials endpoint named by
//! `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI`. They are fetched once at startup
//! and not refreshed, so a long-running `serve` on task-role credentials must
//! be restarted before they expire. See [`crate::sigv4::AwsCredentials::resolve`].
//!
//! ```toml
//! [opensearch]
//! endpoint = "search-docs-abc123.ap-northeast-1.es.amazonaws.com"
//! index_name = "manuals"
//!
//! [embedding]
//! model_id = "cohere.embed-multilingual-v3"
//! dimension = 1024
//! region = "us-east-1"
//!
//! [documents]
//! uri = "s3://acme-docs/manuals/"
//! exclude_globs = ["**/drafts/**"]
//!
//! [ingest]
//! workers = 8
//! batch_size = 50
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::chunk;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub opensearch: OpenSearchConfig,
    pub embedding: EmbeddingConfig,
    pub documents: DocumentsConfig,
    pub chunking: ChunkingConfig,
    pub ingest: IngestConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenSearchConfig {
    /// Domain endpoint. A bare host means HTTPS with SigV4 signing; an
    /// explicit `http://` URL is sent unsigned (local clusters).
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub index_name: String,
    /// Signing region. Taken from the endpoint host when unset.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_opensearch_timeout")]
    pub timeout_secs: u64,
}

impl Default for OpenSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            index_name: String::new(),
            region: None,
            timeout_secs: default_opensearch_timeout(),
        }
    }
}

fn default_opensearch_timeout() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            dimension: default_dimension(),
            region: default_region(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

fn default_model_id() -> String {
    "amazon.titan-embed-text-v2:0".to_string()
}
fn default_dimension() -> usize {
    1024
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_embedding_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    /// Storage prefix to ingest, e.g. `s3://bucket/prefix/`.
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (MinIO, LocalStack). Path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Only keys matching one of these (relative to the prefix) are ingested.
    /// Empty means everything.
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            region: default_region(),
            endpoint_url: None,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_length")]
    pub max_chunk_length: usize,
    #[serde(default = "default_growth_step")]
    pub growth_step: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_length: default_max_chunk_length(),
            growth_step: default_growth_step(),
        }
    }
}

fn default_max_chunk_length() -> usize {
    chunk::DEFAULT_MAX_LENGTH
}
fn default_growth_step() -> usize {
    chunk::GROWTH_STEP
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Documents processed in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Records per bulk request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause after creating the index, before the first write.
    #[serde(default = "default_stabilize_delay")]
    pub stabilize_delay_secs: u64,
    /// `knn.algo_param.index_thread_qty` applied before loading.
    #[serde(default = "default_knn_threads")]
    pub knn_index_thread_qty: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            stabilize_delay_secs: default_stabilize_delay(),
            knn_index_thread_qty: default_knn_threads(),
        }
    }
}

fn default_workers() -> usize {
    8
}
fn default_batch_size() -> usize {
    50
}
fn default_stabilize_delay() -> u64 {
    20
}
fn default_knn_threads() -> u32 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    /// Override fields from environment-style variables. `lookup` returns the
    /// value of a variable, or `None` when unset; empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENSEARCH_ENDPOINT") {
            self.opensearch.endpoint = v;
        }
        if let Some(v) = get("OPENSEARCH_INDEX_NAME") {
            self.opensearch.index_name = v;
        }
        if let Some(v) = get("OPENSEARCH_REGION") {
            self.opensearch.region = Some(v);
        }
        if let Some(v) = get("EMBED_DIMENSION") {
            self.embedding.dimension = v
                .trim()
                .parse()
                .with_context(|| format!("EMBED_DIMENSION is not a number: '{}'", v))?;
        }
        if let Some(v) = get("EMBED_MODEL_ID") {
            self.embedding.model_id = v;
        }
        if let Some(v) = get("BEDROCK_REGION") {
            self.embedding.region = v;
        }
        if let Some(v) = get("DOCUMENT_S3_URI") {
            self.documents.uri = v;
        }
        if let Some(v) = get("AWS_REGION") {
            self.documents.region = v;
        }
        if let Some(v) = get("S3_ENDPOINT_URL") {
            self.documents.endpoint_url = Some(v);
        }
        if let Some(v) = get("MAX_CHUNK_LENGTH") {
            self.chunking.max_chunk_length = v
                .trim()
                .parse()
                .with_context(|| format!("MAX_CHUNK_LENGTH is not a number: '{}'", v))?;
        }
        if let Some(v) = get("SERVER_BIND") {
            self.server.bind = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            bail!("embedding.dimension must be > 0");
        }
        if self.embedding.model_id.trim().is_empty() {
            bail!("embedding.model_id must not be empty");
        }
        if self.chunking.max_chunk_length == 0 {
            bail!("chunking.max_chunk_length must be > 0");
        }
        if self.chunking.growth_step == 0 {
            bail!("chunking.growth_step must be > 0");
        }
        if self.ingest.workers == 0 {
            bail!("ingest.workers must be > 0");
        }
        if self.ingest.batch_size == 0 {
            bail!("ingest.batch_size must be > 0");
        }
        Ok(())
    }

    /// Fail unless a cluster endpoint is configured.
    pub fn require_cluster(&self) -> Result<()> {
        if self.opensearch.endpoint.trim().is_empty() {
            bail!("OpenSearch endpoint not configured (set OPENSEARCH_ENDPOINT or opensearch.endpoint)");
        }
        Ok(())
    }

    /// Fail unless a cluster endpoint and a target index are configured.
    pub fn require_index(&self) -> Result<()> {
        self.require_cluster()?;
        if self.opensearch.index_name.trim().is_empty() {
            bail!("index name not configured (set OPENSEARCH_INDEX_NAME or opensearch.index_name)");
        }
        Ok(())
    }

    /// Fail unless a document source is configured.
    pub fn require_documents(&self) -> Result<()> {
        if self.documents.uri.trim().is_empty() {
            bail!("document source not configured (set DOCUMENT_S3_URI or documents.uri)");
        }
        Ok(())
    }
}

/// Load configuration: TOML file (if given), then process environment, then validation.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`] with an explicit variable lookup.
pub fn load_config_with<F>(path: Option<&Path>, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str::<Config>(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    config.apply_env_overrides(lookup)?;
    config.validate()?;
    Ok(config)
}

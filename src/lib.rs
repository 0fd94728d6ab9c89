//! # Intelligent Search
//!
//! Document ingestion and retrieval for an OpenSearch-backed search service.
//!
//! Documents are read from S3, split into sentence-aligned passages, embedded
//! with an Amazon Bedrock model, and bulk-loaded into an OpenSearch index that
//! supports keyword (Sudachi-analyzed), vector (k-NN) and hybrid retrieval.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │     S3      │──▶│ Load → Split →   │──▶│  OpenSearch  │
//! │ ObjectStore │   │ Embed (Bedrock)  │   │  _bulk       │
//! └─────────────┘   └──────────────────┘   └──────┬───────┘
//!                                                 │
//!                       ┌─────────────────────────┤
//!                       ▼                         ▼
//!                 ┌──────────┐              ┌──────────┐
//!                 │   CLI    │              │   HTTP   │
//!                 │(isearch) │              │  /search │
//!                 └──────────┘              └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENSEARCH_ENDPOINT=search-docs-abc123.ap-northeast-1.es.amazonaws.com
//! export OPENSEARCH_INDEX_NAME=manuals
//! export DOCUMENT_S3_URI=s3://acme-docs/manuals/
//! isearch ingest                                  # load everything under the prefix
//! isearch search "返品の方法" --method hybrid       # query from the terminal
//! isearch serve                                   # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Core data types |
//! | [`extract`] | Document loading (text, PDF, DOCX, PPTX, HTML) |
//! | [`chunk`] | Sentence-boundary passage splitting |
//! | [`embedding`] | Embedding trait and Bedrock client |
//! | [`storage`] | Object storage trait and S3 client |
//! | [`opensearch`] | Search engine trait and OpenSearch client |
//! | [`sigv4`] | AWS Signature V4 |
//! | [`index`] | Index lifecycle, pipelines and mappings |
//! | [`ingest`] | Ingestion orchestration |
//! | [`search`] | Query building and hit mapping |
//! | [`server`] | HTTP API |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod models;
pub mod opensearch;
pub mod search;
pub mod server;
pub mod sigv4;
pub mod storage;

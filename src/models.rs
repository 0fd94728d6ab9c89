//! Core data types that flow through the ingestion and retrieval pipeline.
//!
//! Documents are identified by a storage locator (`s3://bucket/key`). The
//! locator carries the path convention the index relies on: the first key
//! segment belongs to the document root, the remaining segments form the
//! document name, and the second-to-last segment names the owning service.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected storage locator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("locator '{0}' is not of the form scheme://bucket/key")]
    Malformed(String),
    #[error("locator '{0}' needs at least two key segments (root/name)")]
    TooShallow(String),
}

/// A document address in object storage, with its derived index identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLocator {
    /// Full locator as listed, e.g. `s3://bucket/svc-a/sub/file.txt`.
    pub uri: String,
    pub bucket: String,
    /// Object key within the bucket, e.g. `svc-a/sub/file.txt`.
    pub key: String,
    /// `scheme://bucket/<first key segment>`.
    pub docs_root: String,
    /// Remaining key segments joined with `/`.
    pub doc_name: String,
    /// Second-to-last path segment.
    pub service: String,
}

impl DocumentLocator {
    /// Parse a `scheme://bucket/key...` locator.
    ///
    /// ```rust
    /// use intelligent_search::models::DocumentLocator;
    ///
    /// let loc = DocumentLocator::parse("s3://bucket/svc-a/sub/file.txt").unwrap();
    /// assert_eq!(loc.docs_root, "s3://bucket/svc-a");
    /// assert_eq!(loc.doc_name, "sub/file.txt");
    /// assert_eq!(loc.service, "sub");
    /// ```
    pub fn parse(uri: &str) -> Result<Self, LocatorError> {
        let (scheme, bucket, key) =
            split_uri(uri).ok_or_else(|| LocatorError::Malformed(uri.to_string()))?;
        if key.is_empty() {
            return Err(LocatorError::Malformed(uri.to_string()));
        }

        let segments: Vec<&str> = key.split('/').collect();
        if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
            return Err(LocatorError::TooShallow(uri.to_string()));
        }

        Ok(Self {
            uri: uri.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            docs_root: format!("{}://{}/{}", scheme, bucket, segments[0]),
            doc_name: segments[1..].join("/"),
            service: segments[segments.len() - 2].to_string(),
        })
    }

    /// Lower-cased file extension of the key, without the dot.
    pub fn extension(&self) -> Option<String> {
        let file = self.key.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    }
}

/// Split `scheme://bucket/key` into its three parts. The key may be empty
/// (a bucket-level prefix) but the bucket may not.
pub fn split_uri(uri: &str) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    let (bucket, key) = match rest.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return None;
    }
    Some((scheme, bucket, key))
}

/// One passage ready to be written to the search index.
///
/// Serializes to the document `_source`; the target index travels in the
/// bulk action line instead.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexRecord {
    #[serde(skip)]
    pub index: String,
    pub vector: Vec<f32>,
    pub docs_root: String,
    pub doc_name: String,
    /// The passage text, analyzed for keyword search.
    pub keyword: String,
    pub service: String,
}

impl IndexRecord {
    pub fn new(index: &str, locator: &DocumentLocator, passage: String, vector: Vec<f32>) -> Self {
        Self {
            index: index.to_string(),
            vector,
            docs_root: locator.docs_root.clone(),
            doc_name: locator.doc_name.clone(),
            keyword: passage,
            service: locator.service.clone(),
        }
    }
}

/// Result of processing one document in the worker pool.
#[derive(Debug)]
pub enum DocumentOutcome {
    /// All passages embedded; records in passage order.
    Embedded(Vec<IndexRecord>),
    /// The document was dropped; the run continues.
    Skipped {
        locator: DocumentLocator,
        reason: String,
    },
}

/// A single search result as returned by the query API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub text: String,
    pub score: f64,
    pub service: String,
    pub docs_root: String,
    pub doc_name: String,
}

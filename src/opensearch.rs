//! OpenSearch REST client.
//!
//! [`SearchEngine`] covers the handful of cluster operations the pipeline and
//! the query API need. [`OpenSearchClient`] talks to an Amazon OpenSearch
//! Service domain over HTTPS, signing every request with SigV4 for service
//! `es`. An explicit `http://` endpoint is treated as a local cluster and sent
//! unsigned.
//!
//! The signing region comes from configuration, or from the second label of
//! the domain host (`search-x.ap-northeast-1.es.amazonaws.com` →
//! `ap-northeast-1`).

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use crate::config::OpenSearchConfig;
use crate::models::IndexRecord;
use crate::sigv4::{self, AwsCredentials, CanonicalRequest, SigningScope};

/// Search engine collaborator.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// `PUT /_cluster/settings`.
    async fn put_cluster_settings(&self, body: &Value) -> Result<()>;

    /// `PUT /_search/pipeline/{name}`. Overwrites an existing pipeline.
    async fn put_search_pipeline(&self, name: &str, body: &Value) -> Result<()>;

    async fn index_exists(&self, index: &str) -> Result<bool>;

    async fn create_index(&self, index: &str, body: &Value) -> Result<()>;

    /// `PUT /{index}/_settings`.
    async fn put_index_settings(&self, index: &str, body: &Value) -> Result<()>;

    /// Write records with one `_bulk` request. Fails if any item failed.
    async fn bulk(&self, records: &[IndexRecord]) -> Result<()>;

    /// Run a query, optionally through a named search pipeline. Returns the
    /// raw response body.
    async fn search(&self, index: &str, body: &Value, pipeline: Option<&str>) -> Result<Value>;

    /// Embedding model recorded in the index mapping `_meta.model_id`.
    async fn index_model_id(&self, index: &str) -> Result<Option<String>>;

    /// User-visible index names; system indices (leading `.`) are hidden.
    async fn list_indices(&self) -> Result<Vec<String>>;

    /// Delete an index. Returns `false` if it did not exist.
    async fn delete_index(&self, index: &str) -> Result<bool>;
}

/// Request body with its content type.
struct Payload {
    bytes: Vec<u8>,
    content_type: &'static str,
}

impl Payload {
    fn json(value: &Value) -> Result<Self> {
        Ok(Self {
            bytes: serde_json::to_vec(value)?,
            content_type: "application/json",
        })
    }
}

pub struct OpenSearchClient {
    base_url: String,
    host: String,
    signer: Option<(AwsCredentials, SigningScope)>,
    client: reqwest::Client,
}

impl OpenSearchClient {
    /// Build a client. `creds` is required unless the endpoint is plain `http://`.
    pub fn new(config: &OpenSearchConfig, creds: Option<AwsCredentials>) -> Result<Self> {
        let endpoint = config.endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            bail!("OpenSearch endpoint is empty");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        if let Some(host) = endpoint.strip_prefix("http://") {
            return Ok(Self {
                base_url: endpoint.to_string(),
                host: host.to_string(),
                signer: None,
                client,
            });
        }

        let host = endpoint.trim_start_matches("https://").to_string();
        let region = match config.region {
            Some(ref region) => region.clone(),
            None => region_from_host(&host)
                .ok_or_else(|| anyhow!("cannot derive region from OpenSearch host '{}'", host))?,
        };
        let creds = creds.ok_or_else(|| anyhow!("AWS credentials required for {}", endpoint))?;

        Ok(Self {
            base_url: format!("https://{}", host),
            host,
            signer: Some((creds, SigningScope::new(region, "es"))),
            client,
        })
    }

    /// Build a client, resolving credentials only when the endpoint needs
    /// signing.
    pub async fn from_config(config: &OpenSearchConfig) -> Result<Self> {
        let creds = if config.endpoint.trim().starts_with("http://") {
            None
        } else {
            Some(AwsCredentials::resolve(&reqwest::Client::new()).await?)
        };
        Self::new(config, creds)
    }

    pub fn is_signed(&self) -> bool {
        self.signer.is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        payload: Option<Payload>,
    ) -> Result<reqwest::Response> {
        let mut url = format!("{}{}", self.base_url, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&sigv4::canonical_query_string(query));
        }

        let body: &[u8] = payload.as_ref().map(|p| p.bytes.as_slice()).unwrap_or(&[]);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(ref p) = payload {
            request = request
                .header("content-type", p.content_type)
                .body(p.bytes.clone());
        }

        if let Some((ref creds, ref scope)) = self.signer {
            let headers = sigv4::sign_request(
                creds,
                scope,
                &CanonicalRequest {
                    method: method.as_str(),
                    host: &self.host,
                    path,
                    query,
                    payload: body,
                },
                chrono::Utc::now(),
            );
            request = sigv4::apply(request, headers);
        }

        request
            .send()
            .await
            .with_context(|| format!("OpenSearch {} {} failed", method, path))
    }

    /// Send and require a 2xx status; returns the JSON body (or `null`).
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        payload: Option<Payload>,
    ) -> Result<Value> {
        let resp = self.send(method.clone(), path, query, payload).await?;
        ensure_success(resp, &method, path).await
    }
}

async fn ensure_success(resp: reqwest::Response, method: &Method, path: &str) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!(
            "OpenSearch {} {} returned HTTP {}: {}",
            method,
            path,
            status,
            text.chars().take(500).collect::<String>()
        );
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .with_context(|| format!("OpenSearch {} {} returned invalid JSON", method, path))
}

fn index_path(index: &str) -> String {
    format!("/{}", sigv4::uri_encode(index))
}

/// Second label of a domain host, which AWS uses for the region.
pub fn region_from_host(host: &str) -> Option<String> {
    host.split('.')
        .nth(1)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Encode records as a `_bulk` NDJSON body: an `index` action line followed
/// by the `_source` line, for each record.
pub fn bulk_body(records: &[IndexRecord]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for record in records {
        serde_json::to_writer(&mut body, &json!({ "index": { "_index": record.index } }))?;
        body.push(b'\n');
        serde_json::to_writer(&mut body, record)?;
        body.push(b'\n');
    }
    Ok(body)
}

/// First item-level error in a `_bulk` response that reported `errors: true`.
pub fn first_bulk_error(response: &Value) -> Option<String> {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let reason = response
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| {
            items.iter().find_map(|item| {
                let action = item.as_object()?.values().next()?;
                let error = action.get("error")?;
                Some(
                    error
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string()),
                )
            })
        })
        .unwrap_or_else(|| "unknown item error".to_string());
    Some(reason)
}

#[async_trait]
impl SearchEngine for OpenSearchClient {
    async fn put_cluster_settings(&self, body: &Value) -> Result<()> {
        self.call(Method::PUT, "/_cluster/settings", &[], Some(Payload::json(body)?))
            .await?;
        Ok(())
    }

    async fn put_search_pipeline(&self, name: &str, body: &Value) -> Result<()> {
        let path = format!("/_search/pipeline/{}", sigv4::uri_encode(name));
        self.call(Method::PUT, &path, &[], Some(Payload::json(body)?))
            .await?;
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let path = index_path(index);
        let resp = self.send(Method::HEAD, &path, &[], None).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => bail!("OpenSearch HEAD {} returned HTTP {}", path, s),
        }
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        self.call(Method::PUT, &index_path(index), &[], Some(Payload::json(body)?))
            .await?;
        Ok(())
    }

    async fn put_index_settings(&self, index: &str, body: &Value) -> Result<()> {
        let path = format!("{}/_settings", index_path(index));
        self.call(Method::PUT, &path, &[], Some(Payload::json(body)?))
            .await?;
        Ok(())
    }

    async fn bulk(&self, records: &[IndexRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let payload = Payload {
            bytes: bulk_body(records)?,
            content_type: "application/x-ndjson",
        };
        let response = self.call(Method::POST, "/_bulk", &[], Some(payload)).await?;
        if let Some(reason) = first_bulk_error(&response) {
            bail!("bulk request rejected items: {}", reason);
        }
        Ok(())
    }

    async fn search(&self, index: &str, body: &Value, pipeline: Option<&str>) -> Result<Value> {
        let path = format!("{}/_search", index_path(index));
        let query: Vec<(String, String)> = pipeline
            .map(|p| vec![("search_pipeline".to_string(), p.to_string())])
            .unwrap_or_default();
        self.call(Method::POST, &path, &query, Some(Payload::json(body)?))
            .await
    }

    async fn index_model_id(&self, index: &str) -> Result<Option<String>> {
        let response = self.call(Method::GET, &index_path(index), &[], None).await?;
        // Keyed by concrete index name, which may differ from an alias.
        let model_id = response
            .get(index)
            .or_else(|| response.as_object().and_then(|m| m.values().next()))
            .and_then(|i| i.pointer("/mappings/_meta/model_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(model_id)
    }

    async fn list_indices(&self) -> Result<Vec<String>> {
        let query = vec![("format".to_string(), "json".to_string())];
        let response = self
            .call(Method::GET, "/_cat/indices", &query, None)
            .await?;
        let mut names: Vec<String> = response
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("index").and_then(Value::as_str))
                    .filter(|name| !name.starts_with('.'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn delete_index(&self, index: &str) -> Result<bool> {
        let path = index_path(index);
        let resp = self.send(Method::DELETE, &path, &[], None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(resp, &Method::DELETE, &path).await?;
        Ok(true)
    }
}

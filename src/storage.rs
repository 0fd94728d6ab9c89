//! Object storage access.
//!
//! [`ObjectStore`] is the seam between the pipeline and wherever documents
//! live. [`S3Store`] implements it against the S3 REST API with AWS
//! Signature V4 (see [`crate::sigv4`]); no SDK is involved.
//!
//! Listing uses `ListObjectsV2` with `max-keys=1000` and follows
//! `NextContinuationToken` until the listing is exhausted. Directory marker
//! keys (ending in `/`) are dropped, and optional include/exclude globs are
//! matched against each key relative to the listed prefix.
//!
//! A custom `endpoint_url` switches to path-style addressing for
//! S3-compatible services (MinIO, LocalStack).

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use quick_xml::events::Event;

use crate::config::DocumentsConfig;
use crate::models::{split_uri, DocumentLocator};
use crate::sigv4::{self, AwsCredentials, CanonicalRequest, SigningScope};

/// Document storage collaborator.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All document locators under `prefix_uri` (`s3://bucket/prefix`), in
    /// listing order. Locators that do not follow the root/name convention
    /// are left out.
    async fn list(&self, prefix_uri: &str) -> Result<Vec<DocumentLocator>>;

    /// Raw bytes of one document.
    async fn fetch(&self, locator: &DocumentLocator) -> Result<Vec<u8>>;
}

/// S3 (or S3-compatible) object store.
pub struct S3Store {
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl S3Store {
    pub fn new(
        config: &DocumentsConfig,
        creds: AwsCredentials,
        client: reqwest::Client,
    ) -> Result<Self> {
        Ok(Self {
            region: config.region.clone(),
            endpoint_url: config
                .endpoint_url
                .as_ref()
                .map(|e| e.trim_end_matches('/').to_string()),
            creds,
            client,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
        })
    }

    /// Create a store with resolved credentials.
    pub async fn from_config(config: &DocumentsConfig) -> Result<Self> {
        let client = reqwest::Client::new();
        let creds = AwsCredentials::resolve(&client).await?;
        Self::new(config, creds, client)
    }

    /// Base URL, host header, and path prefix for requests against `bucket`.
    fn target(&self, bucket: &str) -> (String, String, String) {
        match self.endpoint_url {
            Some(ref endpoint) => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                (endpoint.clone(), host, format!("/{}", sigv4::uri_encode(bucket)))
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", bucket, self.region);
                (format!("https://{}", host), host, String::new())
            }
        }
    }

    async fn signed_get(
        &self,
        bucket: &str,
        key: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let (base, host, bucket_path) = self.target(bucket);
        let path = format!("{}/{}", bucket_path, sigv4::encode_path(key));
        let headers = sigv4::sign_request(
            &self.creds,
            &SigningScope::new(&self.region, "s3"),
            &CanonicalRequest {
                method: "GET",
                host: &host,
                path: &path,
                query,
                payload: b"",
            },
            chrono::Utc::now(),
        );

        let mut url = format!("{}{}", base, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&sigv4::canonical_query_string(query));
        }

        let resp = sigv4::apply(self.client.get(&url), headers)
            .send()
            .await
            .map_err(|e| anyhow!("S3 request to s3://{}/{} failed: {}", bucket, key, e))?;
        Ok(resp)
    }

    fn is_wanted(&self, prefix: &str, key: &str) -> bool {
        let rel_key = key
            .strip_prefix(prefix)
            .map(|s| s.trim_start_matches('/'))
            .unwrap_or(key);

        if let Some(ref exclude) = self.exclude {
            if exclude.is_match(rel_key) {
                return false;
            }
        }
        match self.include {
            Some(ref include) => include.is_match(rel_key),
            None => true,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix_uri: &str) -> Result<Vec<DocumentLocator>> {
        let (scheme, bucket, prefix) = split_uri(prefix_uri)
            .ok_or_else(|| anyhow!("document source '{}' is not scheme://bucket/prefix", prefix_uri))?;

        let mut locators = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.signed_get(bucket, "", &query).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml = resp.text().await?;
            let page = parse_list_objects_response(&xml)
                .with_context(|| format!("listing {}", prefix_uri))?;

            for key in page.keys {
                if !self.is_wanted(prefix, &key) {
                    continue;
                }
                let uri = format!("{}://{}/{}", scheme, bucket, key);
                match DocumentLocator::parse(&uri) {
                    Ok(loc) => locators.push(loc),
                    Err(e) => tracing::warn!("skipping {}: {}", uri, e),
                }
            }

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                (true, None) => bail!("S3 listing truncated without a continuation token"),
                (false, _) => break,
            }
        }

        Ok(locators)
    }

    async fn fetch(&self, locator: &DocumentLocator) -> Result<Vec<u8>> {
        let resp = self.signed_get(&locator.bucket, &locator.key, &[]).await?;
        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for {}",
                resp.status(),
                locator.uri
            );
        }
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("reading body of {}", locator.uri))?;
        Ok(bytes.to_vec())
    }
}

/// One page of a `ListObjectsV2` response.
#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

/// Parse one `ListObjectsV2` page. Keys are fully unescaped, including
/// numeric character references (`&#x0D;`); directory markers are dropped.
fn parse_list_objects_response(xml: &str) -> Result<ListPage> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut page = ListPage::default();
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event().context("malformed ListObjectsV2 response")? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                text.clear();
            }
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::End(_) => {
                match path.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                    [_, "Contents", "Key"] => {
                        if !text.is_empty() && !text.ends_with('/') {
                            page.keys.push(std::mem::take(&mut text));
                        }
                    }
                    [_, "IsTruncated"] => page.is_truncated = text.trim() == "true",
                    [_, "NextContinuationToken"] => {
                        page.next_token = Some(text.trim().to_string())
                    }
                    _ => {}
                }
                path.pop();
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(page)
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(Some(builder.build()?))
}

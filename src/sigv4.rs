//! AWS Signature Version 4 request signing.
//!
//! Every AWS service this crate talks to (S3, Bedrock Runtime, OpenSearch
//! Service) is reached over plain HTTPS with `reqwest`, so requests are signed
//! here instead of pulling in an AWS SDK. The implementation is pure Rust
//! (`hmac` + `sha2`).
//!
//! ```text
//! kDate    = HMAC("AWS4" + secret, dateStamp)
//! kRegion  = HMAC(kDate, region)
//! kService = HMAC(kRegion, service)
//! kSigning = HMAC(kService, "aws4_request")
//! ```
//!
//! Path encoding differs per service: S3 object keys are URI-encoded once,
//! every other service gets each path segment encoded twice in the canonical
//! request. [`canonical_uri`] takes care of that.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials, resolved with [`AwsCredentials::resolve`].
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Container credentials endpoint used when only a relative URI is given.
const CONTAINER_CREDENTIALS_HOST: &str = "http://169.254.170.2";

/// Body served by the ECS container credentials endpoint.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

impl AwsCredentials {
    /// Resolve credentials from the process environment.
    pub async fn resolve(client: &reqwest::Client) -> Result<Self> {
        Self::resolve_with(client, |key| std::env::var(key).ok()).await
    }

    /// Resolve credentials in order:
    ///
    /// 1. `AWS_ACCESS_KEY_ID` + `AWS_SECRET_ACCESS_KEY` (+ `AWS_SESSION_TOKEN`)
    /// 2. the container credentials endpoint named by
    ///    `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI` or
    ///    `AWS_CONTAINER_CREDENTIALS_FULL_URI` (ECS task roles), with
    ///    `AWS_CONTAINER_AUTHORIZATION_TOKEN` sent when set
    ///
    /// Credentials are fetched once and not refreshed.
    pub async fn resolve_with<F>(client: &reqwest::Client, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let (Some(access_key_id), Some(secret_access_key)) =
            (get("AWS_ACCESS_KEY_ID"), get("AWS_SECRET_ACCESS_KEY"))
        {
            return Ok(Self {
                access_key_id,
                secret_access_key,
                session_token: get("AWS_SESSION_TOKEN"),
            });
        }

        let url = match (
            get("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI"),
            get("AWS_CONTAINER_CREDENTIALS_FULL_URI"),
        ) {
            (Some(relative), _) => format!("{}{}", CONTAINER_CREDENTIALS_HOST, relative),
            (None, Some(full)) => full,
            (None, None) => bail!(
                "AWS credentials not found (set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY, \
                 or run with a container credentials endpoint)"
            ),
        };
        Self::from_container_endpoint(client, &url, get("AWS_CONTAINER_AUTHORIZATION_TOKEN").as_deref())
            .await
    }

    /// Fetch task-role credentials from a container credentials endpoint.
    pub async fn from_container_endpoint(
        client: &reqwest::Client,
        url: &str,
        authorization: Option<&str>,
    ) -> Result<Self> {
        let mut request = client.get(url);
        if let Some(token) = authorization {
            request = request.header("authorization", token);
        }
        let resp = request
            .send()
            .await
            .with_context(|| format!("fetching container credentials from {}", url))?;
        if !resp.status().is_success() {
            bail!(
                "container credentials endpoint {} returned HTTP {}",
                url,
                resp.status()
            );
        }
        let creds: ContainerCredentials = resp
            .json()
            .await
            .context("malformed container credentials response")?;

        Ok(Self {
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            session_token: creds.token,
        })
    }
}

/// Region and service a signature is scoped to.
#[derive(Debug, Clone)]
pub struct SigningScope {
    pub region: String,
    pub service: String,
}

impl SigningScope {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }
}

/// The parts of an HTTP request that take part in the signature.
///
/// `path` is the request path as sent on the wire (segments encoded once).
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a [(String, String)],
    pub payload: &'a [u8],
}

/// Headers to attach to the outgoing request.
pub type SignedHeaders = Vec<(&'static str, String)>;

/// Sign a request and return the headers that must accompany it:
/// `authorization`, `x-amz-date`, `x-amz-content-sha256`, and
/// `x-amz-security-token` when a session token is present.
pub fn sign_request(
    creds: &AwsCredentials,
    scope: &SigningScope,
    request: &CanonicalRequest<'_>,
    now: DateTime<Utc>,
) -> SignedHeaders {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let payload_hash = hex_sha256(request.payload);

    let mut headers = vec![
        ("host".to_string(), request.host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method,
        canonical_uri(&scope.service, request.path),
        canonical_query_string(request.query),
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, scope.region, scope.service
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        &creds.secret_access_key,
        &date_stamp,
        &scope.region,
        &scope.service,
    );
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    );

    let mut out: SignedHeaders = vec![
        ("authorization", authorization),
        ("x-amz-date", amz_date),
        ("x-amz-content-sha256", payload_hash),
    ];
    if let Some(ref token) = creds.session_token {
        out.push(("x-amz-security-token", token.clone()));
    }
    out
}

/// Attach signed headers to a `reqwest` request builder.
pub fn apply(
    mut builder: reqwest::RequestBuilder,
    headers: SignedHeaders,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
}

/// Canonical URI for the signature. S3 uses the wire path verbatim; other
/// services encode each (already encoded) segment a second time.
pub fn canonical_uri(service: &str, path: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    if service == "s3" {
        path.to_string()
    } else {
        encode_path(path)
    }
}

/// Canonical query string: parameters sorted by key, both sides encoded.
pub fn canonical_query_string(query: &[(String, String)]) -> String {
    let mut sorted = query.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// URI-encode every `/`-separated segment of a path, keeping the separators.
pub fn encode_path(path: &str) -> String {
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// URI-encode a string per RFC 3986.
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
pub fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Hex-encoded SHA-256 of `data`.
pub fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

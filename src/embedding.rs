//! Embedding client.
//!
//! Defines the [`Embedder`] trait and the Bedrock Runtime implementation,
//! [`BedrockEmbedder`]. Two model families are supported; the family is
//! resolved once from the model identifier ([`ModelFamily::from_model_id`])
//! and decides both the request body and the response shape:
//!
//! | Family | Request | Response |
//! |--------|---------|----------|
//! | Titan (default) | `{"inputText": t}` | `{"embedding": [..]}` |
//! | Cohere (`cohere` in id) | `{"texts": [t], "input_type": .., "embedding_types": ["float"]}` | `{"embeddings": {"float": [[..]]}}` |
//!
//! No retries are attempted here. The ingestion pipeline treats any failure
//! as a reason to skip the document.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::EmbeddingConfig;
use crate::sigv4::{self, AwsCredentials, CanonicalRequest, SigningScope};

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("embedding model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed embedding response: {0}")]
    Malformed(String),
}

/// Which side of retrieval a text is embedded for. Only Cohere models
/// distinguish the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPurpose {
    Document,
    Query,
}

/// Embedding model family, keyed off the model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Flat `{embedding: [...]}` responses (Amazon Titan).
    Titan,
    /// Nested `{embeddings: {float: [[...]]}}` responses (Cohere Embed).
    Cohere,
}

impl ModelFamily {
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.contains("cohere") {
            Self::Cohere
        } else {
            Self::Titan
        }
    }

    pub fn request_body(self, text: &str, purpose: EmbedPurpose) -> Value {
        match self {
            Self::Titan => json!({ "inputText": text }),
            Self::Cohere => {
                let input_type = match purpose {
                    EmbedPurpose::Document => "search_document",
                    EmbedPurpose::Query => "search_query",
                };
                json!({
                    "texts": [text],
                    "input_type": input_type,
                    "embedding_types": ["float"],
                })
            }
        }
    }

    pub fn parse_response(self, json: &Value) -> Result<Vec<f32>, EmbeddingError> {
        let values = match self {
            Self::Titan => json.get("embedding"),
            Self::Cohere => json
                .get("embeddings")
                .and_then(|e| e.get("float"))
                .and_then(|f| f.get(0)),
        }
        .and_then(Value::as_array)
        .ok_or_else(|| {
            EmbeddingError::Malformed(match self {
                Self::Titan => "missing embedding array".to_string(),
                Self::Cohere => "missing embeddings.float[0] array".to_string(),
            })
        })?;

        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| EmbeddingError::Malformed(format!("non-numeric value {}", v)))
            })
            .collect()
    }
}

/// Converts text into a vector.
///
/// Implementations are shared across ingestion workers, so they must be
/// usable concurrently through `&self`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded in the index `_meta`.
    fn model_id(&self) -> &str;

    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, EmbeddingError>;
}

/// Builds an [`Embedder`] for a given model id. The query path uses this to
/// embed with whatever model an index was built with.
pub trait EmbedderFactory: Send + Sync {
    fn embedder_for(&self, model_id: &str) -> Result<Arc<dyn Embedder>>;
}

/// Bedrock Runtime `InvokeModel` client.
pub struct BedrockEmbedder {
    model_id: String,
    family: ModelFamily,
    region: String,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl BedrockEmbedder {
    pub fn new(
        model_id: impl Into<String>,
        region: impl Into<String>,
        creds: AwsCredentials,
        client: reqwest::Client,
    ) -> Self {
        let model_id = model_id.into();
        Self {
            family: ModelFamily::from_model_id(&model_id),
            model_id,
            region: region.into(),
            creds,
            client,
        }
    }

    /// Create an embedder from configuration with resolved credentials.
    pub async fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let client = http_client(config)?;
        let creds = AwsCredentials::resolve(&client).await?;
        Ok(Self::new(
            config.model_id.clone(),
            config.region.clone(),
            creds,
            client,
        ))
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    fn host(&self) -> String {
        format!("bedrock-runtime.{}.amazonaws.com", self.region)
    }
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

#[async_trait]
impl Embedder for BedrockEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, EmbeddingError> {
        let host = self.host();
        let path = format!("/model/{}/invoke", sigv4::uri_encode(&self.model_id));
        let body = serde_json::to_vec(&self.family.request_body(text, purpose))
            .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;

        let headers = sigv4::sign_request(
            &self.creds,
            &SigningScope::new(&self.region, "bedrock"),
            &CanonicalRequest {
                method: "POST",
                host: &host,
                path: &path,
                query: &[],
                payload: &body,
            },
            chrono::Utc::now(),
        );

        let request = self
            .client
            .post(format!("https://{}{}", host, path))
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .body(body);
        let response = sigv4::apply(request, headers).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let json: Value = response.json().await?;
        self.family.parse_response(&json)
    }
}

/// Creates [`BedrockEmbedder`]s sharing one HTTP client and credential set.
pub struct BedrockEmbedderFactory {
    region: String,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl BedrockEmbedderFactory {
    pub async fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let client = http_client(config)?;
        Ok(Self {
            region: config.region.clone(),
            creds: AwsCredentials::resolve(&client).await?,
            client,
        })
    }
}

impl EmbedderFactory for BedrockEmbedderFactory {
    fn embedder_for(&self, model_id: &str) -> Result<Arc<dyn Embedder>> {
        Ok(Arc::new(BedrockEmbedder::new(
            model_id,
            self.region.clone(),
            self.creds.clone(),
            self.client.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_model_id() {
        assert_eq!(
            ModelFamily::from_model_id("amazon.titan-embed-text-v2:0"),
            ModelFamily::Titan
        );
        assert_eq!(
            ModelFamily::from_model_id("cohere.embed-multilingual-v3"),
            ModelFamily::Cohere
        );
    }

    #[test]
    fn test_titan_request_and_response() {
        let body = ModelFamily::Titan.request_body("こんにちは", EmbedPurpose::Document);
        assert_eq!(body, json!({ "inputText": "こんにちは" }));

        let resp = json!({ "embedding": [0.25, -1.0, 3], "inputTextTokenCount": 3 });
        let v = ModelFamily::Titan.parse_response(&resp).unwrap();
        assert_eq!(v, vec![0.25, -1.0, 3.0]);
    }

    #[test]
    fn test_cohere_request_and_response() {
        let doc = ModelFamily::Cohere.request_body("hello", EmbedPurpose::Document);
        assert_eq!(doc["input_type"], "search_document");
        assert_eq!(doc["texts"], json!(["hello"]));
        assert_eq!(doc["embedding_types"], json!(["float"]));

        let query = ModelFamily::Cohere.request_body("hello", EmbedPurpose::Query);
        assert_eq!(query["input_type"], "search_query");

        let resp = json!({ "id": "x", "embeddings": { "float": [[0.5, 0.75]] }, "texts": ["hello"] });
        let v = ModelFamily::Cohere.parse_response(&resp).unwrap();
        assert_eq!(v, vec![0.5, 0.75]);
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        let flat = json!({ "embedding": [1.0] });
        assert!(matches!(
            ModelFamily::Cohere.parse_response(&flat),
            Err(EmbeddingError::Malformed(_))
        ));

        let nested = json!({ "embeddings": { "float": [[1.0]] } });
        assert!(matches!(
            ModelFamily::Titan.parse_response(&nested),
            Err(EmbeddingError::Malformed(_))
        ));

        let bad_value = json!({ "embedding": [1.0, "x"] });
        assert!(matches!(
            ModelFamily::Titan.parse_response(&bad_value),
            Err(EmbeddingError::Malformed(_))
        ));
    }

    #[test]
    fn test_bedrock_embedder_resolves_family_once() {
        let creds = AwsCredentials {
            access_key_id: "a".to_string(),
            secret_access_key: "b".to_string(),
            session_token: None,
        };
        let e = BedrockEmbedder::new(
            "cohere.embed-english-v3",
            "us-west-2",
            creds,
            reqwest::Client::new(),
        );
        assert_eq!(e.family(), ModelFamily::Cohere);
        assert_eq!(e.model_id(), "cohere.embed-english-v3");
        assert_eq!(e.host(), "bedrock-runtime.us-west-2.amazonaws.com");
    }
}

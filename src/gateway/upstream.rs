//! The provider side of the relay: a trait the admission core dispatches through and an
//! OpenAI-compatible HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::GatewayError;
use super::config::UpstreamConfig;

/// What kind of call is being relayed, derived from the request path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayFormat {
    ChatCompletions,
    Completions,
    Embeddings,
    Responses,
    Other,
}

impl RelayFormat {
    pub fn from_path(path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        if path.ends_with("/chat/completions") {
            Self::ChatCompletions
        } else if path.ends_with("/completions") {
            Self::Completions
        } else if path.ends_with("/embeddings") {
            Self::Embeddings
        } else if path.ends_with("/responses") {
            Self::Responses
        } else {
            Self::Other
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub format: RelayFormat,
    pub requested_model: Option<String>,
    pub effective_model: Option<String>,
    pub body: Bytes,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl Usage {
    pub fn total(&self) -> i64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    /// Reads `usage` from an OpenAI-style body; `input_tokens`/`output_tokens` also count.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let usage = value.get("usage")?;
        let read = |keys: [&str; 2]| {
            keys.iter()
                .find_map(|key| usage.get(*key).and_then(Value::as_i64))
                .unwrap_or(0)
        };
        Some(Self {
            prompt_tokens: read(["prompt_tokens", "input_tokens"]),
            completion_tokens: read(["completion_tokens", "output_tokens"]),
        })
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub usage: Usage,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    fn provider(&self) -> &str;

    async fn dispatch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, GatewayError>;
}

/// Rewrites the top-level `model` of a JSON body; other bodies pass through.
pub fn with_model(body: &Bytes, model: &str) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    let Some(object) = value.as_object_mut() else {
        return body.clone();
    };
    object.insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&value).map(Bytes::from).unwrap_or_else(|_| body.clone())
}

#[derive(Clone)]
pub struct HttpUpstream {
    base_url: String,
    api_key: Option<String>,
    provider: String,
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        let base_url = config
            .base_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| GatewayError::Upstream {
                message: "upstream base_url is not configured".to_string(),
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|err| GatewayError::Upstream {
                message: format!("upstream http client error: {err}"),
            })?;
        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            provider: config.provider.clone(),
            client,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn dispatch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|err| {
            GatewayError::InvalidRequest {
                reason: format!("unsupported method {}: {err}", request.method),
            }
        })?;
        let body = match request.effective_model.as_deref() {
            Some(model) if request.effective_model != request.requested_model => {
                with_model(&request.body, model)
            }
            _ => request.body.clone(),
        };

        let mut req = self
            .client
            .request(method, join_base_url(&self.base_url, &request.path))
            .header("x-request-id", &request.request_id);
        if let Some(api_key) = self.api_key.as_deref() {
            req = req.bearer_auth(api_key);
        }
        if !body.is_empty() {
            req = req.header("content-type", "application/json").body(body);
        }

        let response = req.send().await.map_err(|err| GatewayError::Upstream {
            message: format!("upstream request failed: {err}"),
        })?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|err| GatewayError::Upstream {
            message: format!("upstream body read failed: {err}"),
        })?;
        let usage = Usage::from_body(&body).unwrap_or_default();
        tracing::debug!(
            request_id = %request.request_id,
            provider = %self.provider,
            status,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "upstream responded"
        );
        Ok(UpstreamResponse {
            status,
            content_type,
            body,
            usage,
        })
    }
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.strip_prefix('/').unwrap_or(path);
    // A base ending in /v1 still accepts /v1/... paths.
    match (base.ends_with("/v1"), path.strip_prefix("v1/")) {
        (true, Some(rest)) => format!("{base}/{rest}"),
        _ => format!("{base}/{path}"),
    }
}

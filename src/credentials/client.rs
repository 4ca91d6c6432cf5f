//! HTTP clients for the supported AI providers
//!
//! Each client wraps a decrypted API key and a shared `reqwest` client.
//! Construction never talks to the network; a handle is cheap to build and
//! cache, and only `generate` performs I/O.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::Provider;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const GEMINI_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

/// A single prompt turn to send to a provider.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub model: String,
}

/// A ready-to-use handle for one provider, bound to one identity's key.
#[async_trait]
pub trait AiClient: Send + Sync {
    fn provider(&self) -> Provider;
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ClientError>;
}

/// Build a client for the given provider around an already-validated key.
pub fn build_client(provider: Provider, api_key: String) -> Arc<dyn AiClient> {
    let http = reqwest::Client::new();
    match provider {
        Provider::OpenAi => Arc::new(OpenAiClient { http, api_key }),
        Provider::Anthropic => Arc::new(AnthropicClient { http, api_key }),
        Provider::Gemini => Arc::new(GeminiClient { http, api_key }),
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ClientError> {
        let body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        let response = self
            .http
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let payload: serde_json::Value = error_for_status(response).await?.json().await?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ClientError::Malformed("missing choices[0].message.content".into()))?
            .to_string();

        Ok(GenerateResponse {
            text,
            model: request.model,
        })
    }
}

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl AiClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ClientError> {
        let body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        let response = self
            .http
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        let payload: serde_json::Value = error_for_status(response).await?.json().await?;

        let text = payload["content"][0]["text"]
            .as_str()
            .ok_or_else(|| ClientError::Malformed("missing content[0].text".into()))?
            .to_string();

        Ok(GenerateResponse {
            text,
            model: request.model,
        })
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl AiClient for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ClientError> {
        let url = format!("{}/{}:generateContent", GEMINI_API_URL, request.model);
        let body = json!({
            "contents": [{"parts": [{"text": request.prompt}]}],
            "generationConfig": {"maxOutputTokens": request.max_tokens},
        });

        // Gemini authenticates through a header rather than the URL so the
        // key cannot leak into access logs.
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let payload: serde_json::Value = error_for_status(response).await?.json().await?;

        let text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                ClientError::Malformed("missing candidates[0].content.parts[0].text".into())
            })?
            .to_string();

        Ok(GenerateResponse {
            text,
            model: request.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_matches_provider() {
        for provider in Provider::ALL {
            let client = build_client(provider, "sk-test-key".to_string());
            assert_eq!(client.provider(), provider);
        }
    }

    #[test]
    fn test_debug_never_prints_key() {
        let key = "sk-supersecret-abcdefghij".to_string();
        let openai = OpenAiClient {
            http: reqwest::Client::new(),
            api_key: key.clone(),
        };
        let anthropic = AnthropicClient {
            http: reqwest::Client::new(),
            api_key: key.clone(),
        };
        let gemini = GeminiClient {
            http: reqwest::Client::new(),
            api_key: key.clone(),
        };

        for rendered in [
            format!("{openai:?}"),
            format!("{anthropic:?}"),
            format!("{gemini:?}"),
        ] {
            assert!(!rendered.contains("supersecret"));
            assert!(rendered.contains("[REDACTED]"));
        }
    }
}

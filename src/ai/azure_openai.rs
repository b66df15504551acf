use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::{AiMessage, AiProvider, AiResponse, Embedder, GenerateOptions, Usage, AZURE_OPENAI};
use crate::config::AzureConfig;

const CONTENT_FILTER_FALLBACK: &str = "I apologize, but I need to rephrase my response. \
     Let me help you with your business technology needs. \
     What specific requirements can I assist you with today?";

#[derive(Clone)]
pub struct AzureOpenAiProvider {
    client: Client,
    api_key: Option<String>,
    endpoint: Option<String>,
    deployment: String,
    api_version: String,
}

impl AzureOpenAiProvider {
    pub fn new(config: &AzureConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            endpoint: config.endpoint.clone(),
            deployment: config.deployment_name.clone(),
            api_version: config.api_version.clone(),
        }
    }

    fn credentials(&self) -> Result<(String, &str)> {
        let (Some(endpoint), Some(key)) = (self.endpoint.as_deref(), self.api_key.as_deref())
        else {
            anyhow::bail!("azure openai provider is not configured (endpoint and api key required)");
        };
        Ok((normalize_endpoint(endpoint)?, key))
    }
}

#[async_trait]
impl AiProvider for AzureOpenAiProvider {
    fn name(&self) -> &'static str {
        AZURE_OPENAI
    }

    fn model(&self) -> &str {
        &self.deployment
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.endpoint.is_some() && !self.deployment.is_empty()
    }

    async fn generate(
        &self,
        messages: &[AiMessage],
        options: &GenerateOptions,
    ) -> Result<AiResponse> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            messages: &'a [AiMessage],
            max_tokens: u32,
            temperature: f32,
            top_p: f32,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            choices: Vec<Choice>,
            usage: Option<Usage>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: Option<ChoiceMessage>,
            finish_reason: Option<String>,
        }

        #[derive(Deserialize)]
        struct ChoiceMessage {
            content: Option<String>,
        }

        let (endpoint, key) = self.credentials()?;
        let url = format!(
            "{endpoint}/openai/deployments/{}/chat/completions?api-version={}",
            self.deployment, self.api_version
        );

        tracing::debug!(deployment = %self.deployment, "calling azure openai chat completions");
        let response = self
            .client
            .post(url)
            .header("api-key", key)
            .json(&ChatReq {
                messages,
                max_tokens: options.max_tokens.unwrap_or(800),
                temperature: options.temperature.unwrap_or(0.7),
                top_p: options.top_p.unwrap_or(1.0),
            })
            .send()
            .await
            .context("failed to call azure openai chat endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if body.contains("content_filter") {
                tracing::warn!("content filter triggered, using fallback response");
                return Ok(AiResponse {
                    content: CONTENT_FILTER_FALLBACK.to_string(),
                    model: self.deployment.clone(),
                    provider: AZURE_OPENAI.to_string(),
                    usage: Some(Usage::new(0, 20)),
                    finish_reason: Some("content_filter_fallback".to_string()),
                });
            }
            anyhow::bail!("azure openai returned {status}: {}", error_message(&body));
        }

        let response = response
            .json::<ChatResp>()
            .await
            .context("failed to decode azure openai chat response")?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("azure openai returned no choices"))?;
        let message = choice
            .message
            .ok_or_else(|| anyhow::anyhow!("azure openai choice has no message"))?;

        Ok(AiResponse {
            content: message.content.unwrap_or_default(),
            model: self.deployment.clone(),
            provider: AZURE_OPENAI.to_string(),
            usage: response.usage,
            finish_reason: choice.finish_reason,
        })
    }
}

/// Embeddings deployment. Falls back to the chat endpoint and key when no
/// dedicated embedding resource is configured.
#[derive(Clone)]
pub struct AzureEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    deployment: String,
    api_version: String,
}

impl AzureEmbedder {
    pub fn from_config(config: &AzureConfig) -> Option<Self> {
        let endpoint = config
            .embedding_endpoint
            .clone()
            .or_else(|| config.endpoint.clone())?;
        let api_key = config
            .embedding_api_key
            .clone()
            .or_else(|| config.api_key.clone())?;

        Some(Self {
            client: Client::new(),
            endpoint,
            api_key,
            deployment: config.embedding_deployment_name.clone(),
            api_version: config.embedding_api_version.clone(),
        })
    }
}

#[async_trait]
impl Embedder for AzureEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            input: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            data: Vec<EmbedItem>,
        }

        #[derive(Deserialize)]
        struct EmbedItem {
            embedding: Vec<f32>,
        }

        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        let endpoint = normalize_endpoint(&self.endpoint)?;
        let url = format!(
            "{endpoint}/openai/deployments/{}/embeddings?api-version={}",
            self.deployment, self.api_version
        );

        let response = self
            .client
            .post(url)
            .header("api-key", &self.api_key)
            .json(&EmbedReq { input })
            .send()
            .await
            .context("failed to call azure embeddings endpoint")?
            .error_for_status()
            .context("azure embeddings returned non-success status")?
            .json::<EmbedResp>()
            .await
            .context("failed to decode azure embeddings response")?;

        response
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| anyhow::anyhow!("azure embeddings returned empty data array"))
    }
}

/// Strips trailing slashes and adds `https://` when no scheme is given.
pub fn normalize_endpoint(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let endpoint = if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&endpoint).with_context(|| format!("invalid endpoint URL: {endpoint}"))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        anyhow::bail!("invalid endpoint URL: {endpoint}");
    }
    Ok(endpoint)
}

fn error_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = json.pointer("/error/message").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(endpoint: &str) -> AzureOpenAiProvider {
        AzureOpenAiProvider::new(&AzureConfig {
            api_key: Some("test-key".into()),
            endpoint: Some(endpoint.into()),
            api_version: "2024-02-15-preview".into(),
            deployment_name: "gpt-test".into(),
            embedding_endpoint: None,
            embedding_api_key: None,
            embedding_deployment_name: "embed-test".into(),
            embedding_api_version: "2023-05-15".into(),
        })
    }

    #[test]
    fn endpoint_gets_scheme_and_loses_trailing_slash() {
        assert_eq!(
            normalize_endpoint("acme.openai.azure.com/").unwrap(),
            "https://acme.openai.azure.com"
        );
        assert_eq!(
            normalize_endpoint("https://acme.openai.azure.com//").unwrap(),
            "https://acme.openai.azure.com"
        );
        assert!(normalize_endpoint("").is_err());
    }

    #[test]
    fn unconfigured_without_key() {
        let mut p = provider("acme.openai.azure.com");
        assert!(p.is_configured());
        p.api_key = None;
        assert!(!p.is_configured());
    }

    #[tokio::test]
    async fn parses_completion_and_usage() {
        let router = Router::new().route(
            "/openai/deployments/gpt-test/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["messages"][0]["role"], "user");
                Json(json!({
                    "choices": [{"message": {"content": "Hello there"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
                }))
            }),
        );
        let base = serve(router).await;

        let response = provider(&base)
            .generate(&[AiMessage::user("hi")], &GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(response.content, "Hello there");
        assert_eq!(response.provider, AZURE_OPENAI);
        assert_eq!(response.usage.unwrap().total_tokens, 10);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn content_filter_returns_fallback() {
        let router = Router::new().route(
            "/openai/deployments/gpt-test/chat/completions",
            post(|| async {
                (
                    HttpStatus::BAD_REQUEST,
                    Json(json!({"error": {"code": "content_filter", "message": "filtered"}})),
                )
            }),
        );
        let base = serve(router).await;

        let response = provider(&base)
            .generate(&[AiMessage::user("hi")], &GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(response.content, CONTENT_FILTER_FALLBACK);
        assert_eq!(
            response.finish_reason.as_deref(),
            Some("content_filter_fallback")
        );
    }

    #[tokio::test]
    async fn other_errors_surface_message() {
        let router = Router::new().route(
            "/openai/deployments/gpt-test/chat/completions",
            post(|| async {
                (
                    HttpStatus::UNAUTHORIZED,
                    Json(json!({"error": {"message": "bad key"}})),
                )
            }),
        );
        let base = serve(router).await;

        let err = provider(&base)
            .generate(&[AiMessage::user("hi")], &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad key"));
    }
}

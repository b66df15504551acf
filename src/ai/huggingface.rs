use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;

use super::{AiMessage, AiProvider, AiResponse, GenerateOptions, Usage, HUGGINGFACE};
use crate::config::HuggingFaceConfig;

const LOAD_RETRIES: u32 = 3;

/// Hosted Inference API. Chat history is flattened into a single prompt.
#[derive(Clone)]
pub struct HuggingFaceProvider {
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    retry_base: Duration,
}

impl HuggingFaceProvider {
    pub fn new(config: &HuggingFaceConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry_base: Duration::from_secs(1),
        }
    }

    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }
}

#[async_trait]
impl AiProvider for HuggingFaceProvider {
    fn name(&self) -> &'static str {
        HUGGINGFACE
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(
        &self,
        messages: &[AiMessage],
        options: &GenerateOptions,
    ) -> Result<AiResponse> {
        #[derive(Serialize)]
        struct InferenceReq<'a> {
            inputs: &'a str,
            parameters: Parameters,
        }

        #[derive(Serialize)]
        struct Parameters {
            max_new_tokens: u32,
            temperature: f32,
            top_p: f32,
            do_sample: bool,
            return_full_text: bool,
        }

        let Some(api_key) = self.api_key.as_deref() else {
            anyhow::bail!("hugging face provider is not configured (api key required)");
        };

        let prompt = format_transcript(messages);
        let url = format!("{}/{}", self.base_url, self.model);
        let request = InferenceReq {
            inputs: &prompt,
            parameters: Parameters {
                max_new_tokens: options.max_tokens.unwrap_or(150),
                temperature: options.temperature.unwrap_or(0.7),
                top_p: options.top_p.unwrap_or(0.9),
                do_sample: true,
                return_full_text: false,
            },
        };

        for attempt in 0..LOAD_RETRIES {
            let response = self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
                .context("failed to call hugging face inference endpoint")?;

            match response.status() {
                StatusCode::SERVICE_UNAVAILABLE => {
                    let wait = self.retry_base * 2u32.pow(attempt);
                    tracing::info!(model = %self.model, attempt, "model loading, retrying in {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
                StatusCode::OK => {
                    let body = response
                        .json::<Value>()
                        .await
                        .context("failed to decode hugging face response")?;
                    let text = generated_text(&body);
                    return Ok(AiResponse {
                        usage: Some(Usage::new(
                            prompt.split_whitespace().count() as u64,
                            text.split_whitespace().count() as u64,
                        )),
                        content: text,
                        model: self.model.clone(),
                        provider: HUGGINGFACE.to_string(),
                        finish_reason: Some("stop".to_string()),
                    });
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    anyhow::bail!("hugging face returned {status}: {}", body.trim());
                }
            }
        }

        anyhow::bail!(
            "hugging face model {} is still loading after {LOAD_RETRIES} attempts",
            self.model
        )
    }
}

/// `System:` / `Human:` / `Assistant:` transcript ending with an open
/// `Assistant:` turn. Messages with any other role are dropped.
pub fn format_transcript(messages: &[AiMessage]) -> String {
    let mut lines: Vec<String> = messages
        .iter()
        .filter_map(|m| {
            let speaker = match m.role.as_str() {
                "system" => "System",
                "user" => "Human",
                "assistant" => "Assistant",
                _ => return None,
            };
            Some(format!("{speaker}: {}", m.content))
        })
        .collect();
    lines.push("Assistant:".to_string());
    lines.join("\n")
}

fn generated_text(body: &Value) -> String {
    let text = match body {
        Value::Array(items) => items.first().and_then(|i| i.get("generated_text")),
        Value::Object(_) => body.get("generated_text"),
        _ => None,
    };
    match text.and_then(Value::as_str) {
        Some(text) => text.trim().to_string(),
        None => "Sorry, I couldn't generate a response.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode as HttpStatus;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(base_url: &str) -> HuggingFaceProvider {
        HuggingFaceProvider::new(&HuggingFaceConfig {
            api_key: Some("hf_test".into()),
            model: "org/model".into(),
            base_url: base_url.into(),
        })
        .with_retry_base(Duration::from_millis(5))
    }

    /// Answers 503 until `ready_after` calls have been made.
    fn loading_model(calls: Arc<AtomicU32>, ready_after: u32) -> Router {
        Router::new()
            .route(
                "/org/model",
                post(move |State(calls): State<Arc<AtomicU32>>| async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= ready_after {
                        HttpStatus::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        Json(json!([{"generated_text": " Sure, happy to help. "}])).into_response()
                    }
                }),
            )
            .with_state(calls)
    }

    #[test]
    fn transcript_labels_each_role() {
        let prompt = format_transcript(&[
            AiMessage::system("Be brief."),
            AiMessage::user("Need a NAS"),
            AiMessage::assistant("How much storage?"),
            AiMessage::new("tool", "ignored"),
        ]);
        assert_eq!(
            prompt,
            "System: Be brief.\nHuman: Need a NAS\nAssistant: How much storage?\nAssistant:"
        );
    }

    #[test]
    fn generated_text_handles_list_object_and_other() {
        assert_eq!(generated_text(&json!([{"generated_text": " a "}])), "a");
        assert_eq!(generated_text(&json!({"generated_text": "b"})), "b");
        assert_eq!(
            generated_text(&json!("weird")),
            "Sorry, I couldn't generate a response."
        );
    }

    #[tokio::test]
    async fn retries_while_model_loads() {
        let calls = Arc::new(AtomicU32::new(0));
        let base = serve(loading_model(calls.clone(), 2)).await;

        let response = provider(&base)
            .generate(&[AiMessage::user("hi")], &GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(response.content, "Sure, happy to help.");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_loading_responses() {
        let calls = Arc::new(AtomicU32::new(0));
        let base = serve(loading_model(calls.clone(), u32::MAX)).await;

        let err = provider(&base)
            .generate(&[AiMessage::user("hi")], &GenerateOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("still loading"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let mut p = provider("http://127.0.0.1:9");
        p.api_key = None;
        assert!(!p.is_configured());
        assert!(p
            .generate(&[AiMessage::user("hi")], &GenerateOptions::default())
            .await
            .is_err());
    }
}

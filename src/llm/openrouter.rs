use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::stream::SseAccumulator;
use super::{ChatMessage, ChatModel};
use crate::config::LlmConfig;

const DEFAULT_HTTP_REFERER: &str = "http://localhost:3003";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(flatten)]
    sampling: &'a Sampling,
    stream: bool,
}

/// Sampling options sent with every request; also part of the cache key.
#[derive(Debug, Clone, Serialize)]
struct Sampling {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat model backed by the OpenRouter chat-completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
    http_referer: String,
    title: String,
    streaming: bool,
    sampling: Sampling,
    cache: Option<Mutex<HashMap<String, String>>>,
}

impl OpenRouterClient {
    pub fn new(config: LlmConfig) -> Self {
        let api_key = if config.api_key.is_empty() {
            std::env::var("OPENROUTER_API_KEY").unwrap_or_default()
        } else {
            config.api_key
        };

        let http_referer = if config.http_referer.is_empty() {
            std::env::var("OPENROUTER_HTTP_REFERER")
                .unwrap_or_else(|_| DEFAULT_HTTP_REFERER.to_string())
        } else {
            config.http_referer
        };

        if config.cache {
            info!("OpenRouter response cache enabled");
        }

        Self {
            client: reqwest::Client::new(),
            model: config.model,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_referer,
            title: config.title,
            streaming: config.streaming,
            sampling: Sampling {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                top_p: config.top_p,
            },
            cache: config.cache.then(|| Mutex::new(HashMap::new())),
        }
    }

    fn cache_key(&self, messages: &[ChatMessage]) -> String {
        format!(
            "{}:{}:{}",
            self.model,
            serde_json::to_string(messages).unwrap_or_default(),
            serde_json::to_string(&self.sampling).unwrap_or_default()
        )
    }

    /// Send `messages` and return the assistant text, calling `on_token`
    /// for every streamed delta.
    pub async fn invoke_with_callback<F>(
        &self,
        messages: &[ChatMessage],
        mut on_token: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let cache_key = self.cache.as_ref().map(|_| self.cache_key(messages));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.lock().await.get(key) {
                debug!("OpenRouter cache hit ({} chars)", hit.len());
                return Ok(hit.clone());
            }
        }

        let request = ChatRequest {
            model: &self.model,
            messages,
            sampling: &self.sampling,
            stream: self.streaming,
        };

        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            "Sending request to OpenRouter: {} (model={}, messages={}, stream={})",
            url,
            self.model,
            messages.len(),
            self.streaming
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", &self.http_referer)
            .header("X-Title", &self.title)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenRouter")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenRouter API error ({}): {}", status, error_body);
        }

        let content = if self.streaming {
            let mut accumulator = SseAccumulator::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.context("Failed to read OpenRouter response stream")?;
                for delta in accumulator.feed(&chunk) {
                    trace!("OpenRouter token: {:?}", delta);
                    on_token(&delta);
                }
                if accumulator.is_done() {
                    break;
                }
            }
            accumulator.finish()
        } else {
            let chat_response: ChatResponse = response
                .json()
                .await
                .context("Failed to parse OpenRouter response")?;
            let content = chat_response
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content.unwrap_or_default())
                .context("No response from OpenRouter")?;
            on_token(&content);
            content
        };

        debug!("Received response from OpenRouter ({} chars)", content.len());

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.lock().await.insert(key, content.clone());
        }

        Ok(content)
    }
}

#[async_trait]
impl ChatModel for OpenRouterClient {
    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String> {
        self.invoke_with_callback(messages, |_| {}).await
    }

    fn model_type(&self) -> &str {
        "openrouter"
    }
}

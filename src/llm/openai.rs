//! OpenAI-compatible chat completions integration.
//!
//! Targets `{base_url}/chat/completions`, so the same client serves
//! OpenAI itself and gateways such as OpenRouter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{send_with_retry, ClientSettings, Completion, LanguageModel};
use crate::retry::RetryPolicy;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u32,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    http: Client,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    url: String,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(api_key: SecretString, settings: ClientSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("Failed to build OpenAI HTTP client")?;

        let base = settings
            .base_url
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());

        Ok(Self {
            http,
            api_key,
            model: settings.model,
            max_tokens: settings.max_tokens,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            retry: settings.retry,
        })
    }

    fn build_request(&self, system: &str, prompt: &str) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Some(system.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Some(prompt.to_string()),
                },
            ],
        }
    }

    fn extract(body: ChatResponse) -> Completion {
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        let tokens_used = body.usage.map(|u| u.total_tokens).unwrap_or(0);
        Completion { text, tokens_used }
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion> {
        let request = self.build_request(system, prompt);

        let response = send_with_retry("OpenAI", &self.retry, || {
            self.http
                .post(&self.url)
                .header(
                    "Authorization",
                    format!("Bearer {}", self.api_key.expose_secret()),
                )
                .header("Content-Type", "application/json")
                .json(&request)
        })
        .await?;

        let body: ChatResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;
        let completion = Self::extract(body);
        debug!(model = %self.model, tokens = completion.tokens_used, "OpenAI call complete");
        Ok(completion)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

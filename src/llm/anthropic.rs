//! Anthropic Claude integration.
//!
//! Uses the Anthropic Messages API with the system prompt passed in the
//! top-level `system` field.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{send_with_retry, ClientSettings, Completion, LanguageModel};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AnthropicClient {
    http: Client,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    url: String,
    retry: RetryPolicy,
}

impl AnthropicClient {
    pub fn new(api_key: SecretString, settings: ClientSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("Failed to build Anthropic HTTP client")?;

        let url = match settings.base_url {
            Some(base) => format!("{}/messages", base.trim_end_matches('/')),
            None => ANTHROPIC_API_URL.to_string(),
        };

        Ok(Self {
            http,
            api_key,
            model: settings.model,
            max_tokens: settings.max_tokens,
            url,
            retry: settings.retry,
        })
    }

    fn build_request(&self, system: &str, prompt: &str) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            system: Some(system.to_string()),
        }
    }

    fn extract(body: MessagesResponse) -> Completion {
        let text = body
            .content
            .iter()
            .filter(|b| b.content_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        let tokens_used = body
            .usage
            .map(|u| u.input_tokens + u.output_tokens)
            .unwrap_or(0);
        Completion { text, tokens_used }
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion> {
        let request = self.build_request(system, prompt);

        let response = send_with_retry("Anthropic", &self.retry, || {
            self.http
                .post(&self.url)
                .header("x-api-key", self.api_key.expose_secret().as_str())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request)
        })
        .await?;

        let body: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;
        let completion = Self::extract(body);
        debug!(model = %self.model, tokens = completion.tokens_used, "Anthropic call complete");
        Ok(completion)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

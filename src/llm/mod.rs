//! Language model integration for trading decisions.
//!
//! Defines the `LanguageModel` trait the decision engine calls, and
//! clients for Gemini (default), Anthropic Claude, and any
//! OpenAI-compatible chat endpoint (OpenAI, OpenRouter).

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod parse;
pub mod prompt;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::LlmConfig;
use crate::retry::RetryPolicy;
use crate::types::TraderError;

/// Text returned by one model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u32,
}

/// A text-in, text-out generative model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send one system + user prompt pair and return the reply text.
    /// Transient HTTP failures are retried inside; an `Err` means the
    /// model was unreachable.
    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion>;

    /// Model identifier string.
    fn model_name(&self) -> &str;
}

/// Settings shared by every client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub base_url: Option<String>,
}

impl ClientSettings {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            timeout: Duration::from_secs(cfg.request_timeout_secs),
            retry: cfg.retry_policy(),
            base_url: cfg.base_url.clone(),
        }
    }
}

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Build the client named by `llm.provider`.
pub fn build_model(cfg: &LlmConfig, api_key: SecretString) -> Result<Arc<dyn LanguageModel>> {
    let settings = ClientSettings::from_config(cfg);
    let model: Arc<dyn LanguageModel> = match cfg.provider.as_str() {
        "gemini" => Arc::new(gemini::GeminiClient::new(api_key, settings)?),
        "anthropic" => Arc::new(anthropic::AnthropicClient::new(api_key, settings)?),
        "openai" => Arc::new(openai::OpenAiClient::new(api_key, settings)?),
        "openrouter" => {
            let mut settings = settings;
            settings
                .base_url
                .get_or_insert_with(|| OPENROUTER_BASE_URL.to_string());
            Arc::new(openai::OpenAiClient::new(api_key, settings)?)
        }
        other => {
            return Err(TraderError::Config(format!("Unknown llm.provider: {other}")).into());
        }
    };
    info!(provider = %cfg.provider, model = %model.model_name(), "Language model configured");
    Ok(model)
}

/// Send a request built by `build`, retrying 429, 5xx and transport
/// errors per `retry`. Returns the first successful response.
pub(crate) async fn send_with_retry<F>(
    provider: &str,
    retry: &RetryPolicy,
    build: F,
) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_error = None;

    for attempt in 1..=retry.max_attempts {
        retry.wait(attempt).await;

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let error_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(provider, status = %status, attempt, "Retryable model API error");
                    last_error = Some(format!("HTTP {status}: {error_text}"));
                    continue;
                }

                anyhow::bail!("{provider} API error {status}: {error_text}");
            }
            Err(e) => {
                warn!(provider, attempt, error = %e, "Model request failed");
                last_error = Some(format!("Request error: {e}"));
            }
        }
    }

    anyhow::bail!(
        "{provider} API failed after {} attempt(s): {}",
        retry.max_attempts,
        last_error.unwrap_or_default()
    )
}

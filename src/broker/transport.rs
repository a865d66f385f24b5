use std::time::Duration;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::{AttemptError, BrokerError, Result, TransportError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Body of a chat completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    /// Single user message, optionally asking for JSON object mode
    pub fn user(model: &str, prompt: &str, json_mode: bool) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            response_format: json_mode.then(|| ResponseFormat {
                kind: "json_object".to_string(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// One round trip to a chat completion endpoint.
///
/// Returns the first choice's message content as opaque text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> std::result::Result<String, TransportError>;
}

/// OpenAI compatible `/v1/chat/completions` client
pub struct OpenAiTransport {
    client: Client,
    url: String,
    api_key: String,
}

impl OpenAiTransport {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("gptlog/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(BrokerError::Http)?;

        Ok(Self {
            client,
            url: config.completions_url(),
            api_key: config.key.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn complete(&self, request: &ChatRequest) -> std::result::Result<String, TransportError> {
        debug!("Sending chat completion request to: {}", self.url);

        let response = self.client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(TransportError::status(status.as_u16(), error_text));
        }

        let completion: ChatCompletionResponse = response.json().await
            .map_err(|e| TransportError::protocol(format!("Failed to parse response: {}", e)))?;

        let content = completion.choices
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::protocol("No choices in response"))?
            .message
            .content
            .unwrap_or_default();

        debug!("Raw completion content: {}", content);
        Ok(content)
    }
}

/// Factory for creating transport instances
pub struct TransportFactory;

impl TransportFactory {
    pub fn create_transport(config: &ApiConfig) -> Result<Box<dyn ChatTransport>> {
        Ok(Box::new(OpenAiTransport::new(config)?))
    }
}

/// Wraps a transport with failure classification and the fixed pause the
/// broker takes before the next attempt. Looping stays with the caller.
pub struct RetryingTransport {
    inner: Box<dyn ChatTransport>,
    retry_delay: Duration,
}

impl RetryingTransport {
    pub fn new(inner: Box<dyn ChatTransport>, retry_delay: Duration) -> Self {
        Self { inner, retry_delay }
    }

    pub async fn call(
        &self,
        request: &ChatRequest,
        attempt: u32,
        max_attempts: u32,
    ) -> std::result::Result<String, AttemptError> {
        match self.inner.complete(request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if e.is_network() {
                    warn!("Request error: {} ({}/{})", e, attempt, max_attempts);
                } else {
                    info!("Unexpected error occurred: {} ({}/{})", e, attempt, max_attempts);
                }
                Err(AttemptError::Transport(e))
            }
        }
    }

    pub async fn backoff(&self) {
        if !self.retry_delay.is_zero() {
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

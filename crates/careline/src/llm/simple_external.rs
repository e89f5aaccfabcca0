//! OpenAI-compatible chat-completions provider.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiStatusError;

use super::{ApiProvider, ChatMessage, GenerationConfig, LLMProvider, ProviderInfo};

pub struct SimpleExternalProvider {
    provider: ApiProvider,
    api_key: String,
    base_url: String,
    model: String,
    client: Client,
}

impl SimpleExternalProvider {
    pub fn new(provider: ApiProvider, api_key: String, base_url: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(120))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        tracing::info!(
            provider = ?provider,
            model = %model,
            "Creating SimpleExternalProvider (connect_timeout=15s)"
        );

        Ok(Self {
            provider,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
        })
    }

    fn endpoint(&self) -> String {
        match &self.provider {
            ApiProvider::OpenAI => format!("{}/chat/completions", self.base_url),
            ApiProvider::Custom { endpoint } => endpoint.clone(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], config: &GenerationConfig) -> serde_json::Value {
        let mut request = json!({
            "model": config.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "stream": false
        });
        if config.force_json {
            request["response_format"] = json!({"type": "json_object"});
        }
        request
    }
}

/// Parse a response body as JSON, returning a clear error if the server returned HTML
/// (e.g. a gateway error page) instead of valid JSON.
pub(crate) async fn parse_json_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;

    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(200).collect();
        return Err(anyhow!(
            "Endpoint {} returned HTML instead of JSON (HTTP {}). Response: {}",
            endpoint,
            status,
            preview
        ));
    }

    serde_json::from_str::<T>(&body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        anyhow!(
            "Failed to parse JSON from {} (HTTP {}): {}. Response body: {}",
            endpoint,
            status,
            e,
            preview
        )
    })
}

/// Send a JSON POST with bearer auth, mapping transport failures to readable errors.
pub(crate) async fn post_json(
    client: &Client,
    endpoint: &str,
    api_key: &str,
    body: &serde_json::Value,
) -> Result<reqwest::Response> {
    let response = client
        .post(endpoint)
        .header("Authorization", format!("Bearer {}", api_key))
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                tracing::error!(endpoint = %endpoint, "Request timed out");
                anyhow!("Request to {} timed out", endpoint)
            } else if e.is_connect() {
                tracing::error!(endpoint = %endpoint, error = %e, "Connection failed");
                anyhow!("Failed to connect to {}: {}", endpoint, e)
            } else {
                tracing::error!(endpoint = %endpoint, error = %e, "Request failed");
                anyhow!("Request to {} failed: {}", endpoint, e)
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let error = response.text().await.unwrap_or_default();
        tracing::error!(endpoint = %endpoint, status = %status, error = %error, "API returned error");
        return Err(ApiStatusError {
            status: status.as_u16(),
            body: error,
        }
        .into());
    }
    Ok(response)
}

#[async_trait]
impl LLMProvider for SimpleExternalProvider {
    async fn chat(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<String> {
        let endpoint = self.endpoint();
        tracing::debug!(
            endpoint = %endpoint,
            model = %config.model.as_deref().unwrap_or(&self.model),
            max_tokens = config.max_tokens,
            messages = messages.len(),
            force_json = config.force_json,
            "Sending OpenAI-compatible request"
        );

        let request = self.request_body(messages, config);
        let response = post_json(&self.client, &endpoint, &self.api_key, &request).await?;
        let result: OpenAIResponse = parse_json_response(response, &endpoint).await?;

        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("No choices returned from API"))?;

        tracing::debug!("API response received, {} chars", content.chars().count());
        Ok(content)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: format!("{:?}", self.provider),
            model: self.model.clone(),
            is_local: false,
        }
    }
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

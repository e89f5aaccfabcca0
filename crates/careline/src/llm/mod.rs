//! LLM Module - chat-completion capability behind a provider trait
//!
//! The core only needs `Generate(messages, params) -> text`. Providers
//! implement [`LLMProvider`]; [`LLMManager`] adds the per-call timeout and
//! the single retry every caller relies on.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub mod simple_external;

pub use simple_external::SimpleExternalProvider;

/// External API providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApiProvider {
    OpenAI,
    Custom { endpoint: String },
}

/// Core trait for LLM providers
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Chat completion over the full message list; returns the assistant text.
    async fn chat(&self, messages: &[ChatMessage], config: &GenerationConfig) -> AnyResult<String>;

    /// Get provider info
    fn info(&self) -> ProviderInfo;
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Overrides the provider's default model when set.
    pub model: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    /// Ask the provider for a syntactically valid JSON object.
    pub force_json: bool,
    pub timeout_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 800,
            temperature: 0.7,
            top_p: 1.0,
            force_json: false,
            timeout_ms: 20_000,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Provider information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
    pub is_local: bool,
}

/// Bounded-time access to a provider.
#[derive(Clone)]
pub struct LLMManager {
    provider: Arc<dyn LLMProvider>,
}

impl LLMManager {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    pub fn info(&self) -> ProviderInfo {
        self.provider.info()
    }

    /// Generate within `config.timeout()`. A failed first attempt is retried
    /// once if time remains; running out of time yields `Error::Timeout`.
    pub async fn generate(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<String> {
        let budget = config.timeout();
        let started = Instant::now();

        let first = match tokio::time::timeout(budget, self.provider.chat(messages, config)).await {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(e)) => Error::from(e),
            Err(_) => return Err(timeout_error(budget)),
        };

        let remaining = budget.saturating_sub(started.elapsed());
        if !first.is_transient() || remaining.is_zero() {
            return Err(first);
        }
        tracing::warn!(error = %first, remaining_ms = remaining.as_millis() as u64, "LLM call failed, retrying once");

        match tokio::time::timeout(remaining, self.provider.chat(messages, config)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(Error::from(e)),
            Err(_) => Err(timeout_error(budget)),
        }
    }
}

fn timeout_error(budget: Duration) -> Error {
    Error::Timeout(format!("LLM call exceeded {} ms", budget.as_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiStatusError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        delay: Duration,
    }

    #[async_trait]
    impl LLMProvider for Flaky {
        async fn chat(&self, _m: &[ChatMessage], _c: &GenerationConfig) -> AnyResult<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.fail_first {
                anyhow::bail!("connection reset");
            }
            Ok("ok".into())
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo { name: "flaky".into(), model: "m".into(), is_local: true }
        }
    }

    fn manager(fail_first: usize, delay: Duration) -> (LLMManager, Arc<Flaky>) {
        let p = Arc::new(Flaky { calls: AtomicUsize::new(0), fail_first, delay });
        (LLMManager::new(p.clone()), p)
    }

    #[tokio::test]
    async fn retries_once_after_failure() {
        let (m, p) = manager(1, Duration::ZERO);
        let out = m.generate(&[ChatMessage::user("hi")], &GenerationConfig::default()).await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_second_failure() {
        let (m, p) = manager(5, Duration::ZERO);
        let out = m.generate(&[ChatMessage::user("hi")], &GenerationConfig::default()).await;
        assert!(matches!(out, Err(Error::External(_))));
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);
    }

    struct Unauthorized {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMProvider for Unauthorized {
        async fn chat(&self, _m: &[ChatMessage], _c: &GenerationConfig) -> AnyResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiStatusError { status: 401, body: "invalid api key".into() }.into())
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo { name: "unauthorized".into(), model: "m".into(), is_local: false }
        }
    }

    #[tokio::test]
    async fn rejected_request_is_not_retried() {
        let p = Arc::new(Unauthorized { calls: AtomicUsize::new(0) });
        let m = LLMManager::new(p.clone());
        let out = m.generate(&[ChatMessage::user("hi")], &GenerationConfig::default()).await;
        assert!(matches!(out, Err(Error::Rejected(_))));
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let (m, _) = manager(0, Duration::from_millis(200));
        let config = GenerationConfig { timeout_ms: 20, ..Default::default() };
        let out = m.generate(&[ChatMessage::user("hi")], &config).await;
        assert!(matches!(out, Err(Error::Timeout(_))));
    }

    #[test]
    fn role_serialises_lowercase() {
        let json = serde_json::to_string(&ChatMessage::system("x")).unwrap();
        assert!(json.contains("\"system\""));
    }
}

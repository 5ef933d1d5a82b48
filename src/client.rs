use crate::config::ClientConfig;
use crate::models::API_ERROR_OUTPUT;
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::warn;

/// Message role for a judge conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

/// One ordered message in a judge conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// The opaque completion operation. Production uses the OpenAI chat API;
/// tests inject fakes.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String>;
}

/// Chat backend over an OpenAI-compatible endpoint.
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
}

impl OpenAiBackend {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let api_key = std::env::var(&config.env_var_api_key)
            .with_context(|| format!("Environment variable {} not found", config.env_var_api_key))?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&config.api_endpoint);

        Ok(Self {
            client: Client::with_config(openai_config),
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn chat(
        &self,
        model: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String> {
        let mut request_messages: Vec<ChatCompletionRequestMessage> = Vec::new();

        let system_message = ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt.to_string())
            .build()
            .context("Failed to build system message")?
            .into();
        request_messages.push(system_message);

        for message in messages {
            let request_message = match message.role {
                ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(message.content.clone())
                    .build()
                    .context("Failed to build user message")?
                    .into(),
                ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(message.content.clone())
                    .build()
                    .context("Failed to build assistant message")?
                    .into(),
            };
            request_messages.push(request_message);
        }

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(request_messages)
            .temperature(temperature as f32)
            .max_tokens(max_tokens as u16)
            .build()
            .context("Failed to build chat completion request")?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .context("Chat completion request failed")?;

        let content = match response.choices.first() {
            Some(choice) => match &choice.message.content {
                Some(content) => content.clone(),
                None => String::new(),
            },
            None => String::new(),
        };

        Ok(content)
    }
}

/// Completion client with bounded retry. Transient backend failures are
/// retried up to `max_retries` with a fixed delay; after exhaustion the
/// sentinel error text is returned so a batch can continue without aborting.
pub struct CompletionClient {
    backend: Arc<dyn ChatBackend>,
    config: ClientConfig,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn ChatBackend>, config: ClientConfig) -> Self {
        Self { backend, config }
    }

    /// Run one judge completion. Never fails on transient errors.
    pub async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> String {
        for attempt in 1..=self.config.max_retries {
            match self
                .backend
                .chat(
                    model,
                    system_prompt,
                    messages,
                    self.config.temperature,
                    self.config.max_tokens,
                )
                .await
            {
                Ok(text) => return text,
                Err(e) => {
                    warn!(attempt, max = self.config.max_retries, error = %e, "judge completion failed");
                    sleep(self.config.retry_delay()).await;
                }
            }
        }
        API_ERROR_OUTPUT.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that fails a fixed number of times before succeeding.
    pub struct FlakyBackend {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatBackend for FlakyBackend {
        async fn chat(
            &self,
            _model: &str,
            _system_prompt: &str,
            _messages: &[ChatMessage],
            _temperature: f64,
            _max_tokens: u32,
        ) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("simulated transient failure");
            }
            Ok("[[8]]".to_string())
        }
    }

    fn fast_config(max_retries: u32) -> ClientConfig {
        ClientConfig {
            max_retries,
            retry_delay_secs: 0,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_complete_succeeds_first_try() {
        let backend = Arc::new(FlakyBackend::new(0));
        let client = CompletionClient::new(backend.clone(), fast_config(16));

        let text = client
            .complete("gpt-4", "system", &[ChatMessage::user("judge this")])
            .await;
        assert_eq!(text, "[[8]]");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_retries_then_succeeds() {
        let backend = Arc::new(FlakyBackend::new(3));
        let client = CompletionClient::new(backend.clone(), fast_config(16));

        let text = client
            .complete("gpt-4", "system", &[ChatMessage::user("judge this")])
            .await;
        assert_eq!(text, "[[8]]");
        assert_eq!(backend.call_count(), 4);
    }

    #[tokio::test]
    async fn test_complete_exhausts_retries_to_sentinel() {
        let backend = Arc::new(FlakyBackend::new(u32::MAX));
        let client = CompletionClient::new(backend.clone(), fast_config(5));

        let text = client
            .complete("gpt-4", "system", &[ChatMessage::user("judge this")])
            .await;
        assert_eq!(text, API_ERROR_OUTPUT);
        assert_eq!(backend.call_count(), 5);
    }
}

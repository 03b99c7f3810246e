//! Embedding providers
//!
//! The primary backend is retried with a doubling delay; once its attempts
//! are exhausted the secondary backend gets one try. A missing embedding is a
//! normal outcome: callers get `None` and carry on without similarity.

use async_openai::config::OpenAIConfig;
use async_openai::types::CreateEmbeddingRequestArgs;
use async_openai::Client;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{EmbeddingConfig, ProviderConfig};
use crate::error::{from_openai_error, Result, TriageError};
use crate::heuristics;
use crate::llm::openai_client;
use crate::models::Embedding;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier attached to every vector this provider returns
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Embedding>;
}

/// `/v1/embeddings` on any OpenAI-compatible endpoint
pub struct OpenAiEmbeddingProvider {
    name: String,
    model: String,
    timeout: Duration,
    client: Client<OpenAIConfig>,
}

impl OpenAiEmbeddingProvider {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            client: openai_client(config),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(text)
            .build()
            .map_err(|e| from_openai_error(&self.name, e))?;

        let response = tokio::time::timeout(self.timeout, self.client.embeddings().create(request))
            .await
            .map_err(|_| {
                TriageError::ProviderUnavailable(format!("{}: embedding timed out", self.name))
            })?
            .map_err(|e| from_openai_error(&self.name, e))?;

        let vector = response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| {
                TriageError::ParseFailure(format!("{}: empty embedding response", self.name))
            })?;

        Ok(Embedding {
            vector,
            model: self.model.clone(),
        })
    }
}

/// Primary with bounded retries, then the secondary backend
pub struct ResilientEmbedder {
    primary: Arc<dyn EmbeddingProvider>,
    secondary: Option<Arc<dyn EmbeddingProvider>>,
    max_attempts: u32,
    initial_delay: Duration,
    max_input_chars: usize,
}

impl ResilientEmbedder {
    pub fn new(primary: Arc<dyn EmbeddingProvider>, secondary: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            primary,
            secondary,
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_input_chars: 2000,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_input_chars(mut self, chars: usize) -> Self {
        self.max_input_chars = chars;
        self
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let primary: Arc<dyn EmbeddingProvider> =
            Arc::new(OpenAiEmbeddingProvider::from_config(&config.primary));
        let secondary = config.secondary.as_ref().map(|provider| {
            Arc::new(OpenAiEmbeddingProvider::from_config(provider)) as Arc<dyn EmbeddingProvider>
        });

        Self::new(primary, secondary)
            .with_retry(config.max_attempts, Duration::from_millis(config.initial_delay_ms))
            .with_max_input_chars(config.max_input_chars)
    }

    /// Model the primary backend tags its vectors with
    pub fn primary_model(&self) -> &str {
        self.primary.model()
    }

    /// Text sent for an email: subject, sender and the head of the body
    pub fn email_text(&self, subject: &str, sender: &str, body: &str) -> String {
        let text = format!("Subject: {}\nFrom: {}\n\n{}", subject, sender, body);
        heuristics::truncate_chars(&text, self.max_input_chars)
    }

    /// Embed `text`, or `None` when both backends failed
    pub async fn embed(&self, text: &str) -> Option<Embedding> {
        let mut delay = self.initial_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.primary.embed(text).await {
                Ok(embedding) => return Some(embedding),
                Err(e) if attempts < self.max_attempts => {
                    debug!(
                        "Embedding failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempts, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!(
                        model = %self.primary.model(),
                        attempts,
                        error = %e,
                        "Primary embedding backend exhausted"
                    );
                    break;
                }
            }
        }

        let secondary = self.secondary.as_ref()?;
        match secondary.embed(text).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!(model = %secondary.model(), error = %e, "Secondary embedding backend failed");
                None
            }
        }
    }
}

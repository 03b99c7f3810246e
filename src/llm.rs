//! LLM classification providers
//!
//! Any OpenAI-compatible chat endpoint can serve as a tier: the hosted API for
//! the primary provider and a local server (Ollama's `/v1`, llama.cpp, vLLM)
//! for the fallback. Model output is untrusted text; it only becomes a
//! [`ClassificationResult`] after [`parse_classification`] validates it.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{from_openai_error, Result, TriageError};
use crate::models::{ClassificationResult, FewShotExample};

const MAX_LABEL_CHARS: usize = 64;
const MAX_REASONING_CHARS: usize = 1000;

const SYSTEM_PROMPT: &str = r#"You classify work email. Reply with a single JSON object and nothing else:
{"is_hierarchy": bool, "is_client": bool, "is_meeting": bool, "is_escalation": bool, "is_urgent": bool, "suggested_label": string, "reasoning": string, "confidence": number}

- is_hierarchy: sent by or about management / reporting lines
- is_client: concerns a client or customer engagement
- is_meeting: schedules, updates or summarizes a meeting
- is_escalation: raises a problem to a higher level
- is_urgent: needs action today
- suggested_label: a short category name (1-3 words, Title Case), or "Uncategorized"
- confidence: 0.0 to 1.0"#;

/// Prompt input for one classification call
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub subject: String,
    /// Already truncated to the tier's context window
    pub body: String,
    pub sender: String,
    pub few_shot: Vec<FewShotExample>,
}

/// A chat model that can classify an email
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Must return [`TriageError::RateLimited`] for rate-limit responses
    async fn classify(&self, request: &LlmRequest) -> Result<ClassificationResult>;
}

/// Render the user message, few-shot examples first
pub fn build_prompt(request: &LlmRequest) -> String {
    let mut prompt = String::new();

    if !request.few_shot.is_empty() {
        prompt.push_str("Labels this user approved for similar mail:\n");
        for example in &request.few_shot {
            prompt.push_str(&format!(
                "- From: {} | Subject: {} => {}\n",
                example.sender, example.subject, example.label
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "From: {}\nSubject: {}\n\n{}",
        request.sender, request.subject, request.body
    ));
    prompt
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    is_hierarchy: bool,
    is_client: bool,
    is_meeting: bool,
    is_escalation: bool,
    is_urgent: bool,
    suggested_label: String,
    reasoning: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Locate the first balanced JSON object in model output
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate model output against the classification schema.
///
/// Missing or mistyped facets, an empty or oversized label and an
/// out-of-range confidence are all [`TriageError::ParseFailure`].
pub fn parse_classification(text: &str) -> Result<ClassificationResult> {
    let json = extract_json(text)
        .ok_or_else(|| TriageError::ParseFailure("no JSON object in response".to_string()))?;

    let raw: RawClassification = serde_json::from_str(json)
        .map_err(|e| TriageError::ParseFailure(format!("schema mismatch: {}", e)))?;

    let label = raw.suggested_label.trim();
    if label.is_empty() {
        return Err(TriageError::ParseFailure("empty suggested_label".to_string()));
    }
    if label.chars().count() > MAX_LABEL_CHARS || label.chars().any(char::is_control) {
        return Err(TriageError::ParseFailure(format!(
            "suggested_label is not a short single-line name: {:?}",
            label
        )));
    }
    if let Some(confidence) = raw.confidence {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(TriageError::ParseFailure(format!(
                "confidence out of range: {}",
                confidence
            )));
        }
    }

    Ok(ClassificationResult {
        is_hierarchy: raw.is_hierarchy,
        is_client: raw.is_client,
        is_meeting: raw.is_meeting,
        is_escalation: raw.is_escalation,
        is_urgent: raw.is_urgent,
        suggested_label: label.to_string(),
        reasoning: raw.reasoning.chars().take(MAX_REASONING_CHARS).collect(),
        confidence: raw.confidence,
        method: None,
    })
}

/// API key from the configured environment variable, if set and non-empty
pub fn resolve_api_key(config: &ProviderConfig) -> Option<String> {
    config
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|key| !key.trim().is_empty())
}

/// Build an async-openai client for an OpenAI-compatible endpoint.
///
/// The client's own retry loop is capped so rate limits surface quickly and
/// the tier cooldown decides what happens next.
pub fn openai_client(config: &ProviderConfig) -> Client<OpenAIConfig> {
    let api_key = resolve_api_key(config).unwrap_or_default();

    let openai_config = OpenAIConfig::new()
        .with_api_base(config.api_base.trim_end_matches('/'))
        .with_api_key(api_key);

    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_elapsed_time(Some(Duration::from_secs(2)))
        .build();

    Client::with_config(openai_config).with_backoff(backoff)
}

/// Chat-completions classifier
pub struct OpenAiCompatibleProvider {
    name: String,
    model: String,
    timeout: Duration,
    client: Client<OpenAIConfig>,
}

impl OpenAiCompatibleProvider {
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
impl LlmProvider for OpenAiCompatibleProvider {
    async fn classify(&self, request: &LlmRequest) -> Result<ClassificationResult> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(SYSTEM_PROMPT)
            .build()
            .map_err(|e| from_openai_error(&self.name, e))?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(build_prompt(request))
            .build()
            .map_err(|e| from_openai_error(&self.name, e))?;

        let messages: Vec<ChatCompletionRequestMessage> = vec![system.into(), user.into()];

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.0_f32)
            .max_tokens(400u16)
            .messages(messages)
            .build()
            .map_err(|e| from_openai_error(&self.name, e))?;

        debug!(provider = %self.name, model = %self.model, "Requesting classification");

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(chat_request))
            .await
            .map_err(|_| {
                TriageError::ProviderUnavailable(format!(
                    "{}: timed out after {}s",
                    self.name,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| from_openai_error(&self.name, e))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                TriageError::ParseFailure(format!("{}: response had no content", self.name))
            })?;

        parse_classification(&content).map_err(|e| {
            warn!(provider = %self.name, error = %e, "Discarding malformed classification");
            e
        })
    }
}

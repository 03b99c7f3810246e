//! Progressive classification waterfall
//!
//! Tiers run in strict cost order and the first one that produces a result
//! wins: cache, sender domain, unambiguous regex, primary LLM, fallback LLM
//! and finally the regex floor, which always answers. Tier failures are
//! recovered locally by moving on to the next tier.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::ClassificationCache;
use crate::config::{ClassificationConfig, ProviderConfig};
use crate::error::{Result, TriageError};
use crate::heuristics;
use crate::llm::{LlmProvider, LlmRequest};
use crate::models::{ClassificationMethod, ClassificationResult, UsageRecord};
use crate::rate_limiter::ProviderHealth;
use crate::store::{self, SqliteStore};
use crate::usage::{self, UsageTracker};

/// Characters of prompt scaffolding sent with every LLM call
const PROMPT_OVERHEAD_CHARS: usize = 900;

/// What a tier sees of an email
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationInput {
    pub email_id: Option<i64>,
    /// Owner of the mailbox, used for few-shot examples
    pub user_id: Option<i64>,
    pub subject: String,
    pub body: String,
    pub sender: String,
}

impl ClassificationInput {
    pub fn new(subject: impl Into<String>, body: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            email_id: None,
            user_id: None,
            subject: subject.into(),
            body: body.into(),
            sender: sender.into(),
        }
    }

    pub fn for_email(mut self, email_id: i64) -> Self {
        self.email_id = Some(email_id);
        self
    }

    pub fn for_user(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// Result of asking one tier
#[derive(Debug)]
pub enum TierOutcome {
    Classified(ClassificationResult),
    /// The tier has nothing to say about this input (or is cooling down)
    NotApplicable,
    Failed(TriageError),
}

/// One step of the waterfall
#[async_trait]
pub trait Classifier: Send + Sync {
    fn method(&self) -> ClassificationMethod;

    /// Estimated cost of invoking this tier for `input`
    fn estimated_cost(&self, _input: &ClassificationInput) -> f64 {
        0.0
    }

    async fn try_classify(&self, input: &ClassificationInput) -> TierOutcome;

    /// Called with the final result after any tier resolved the input
    async fn observe(&self, _input: &ClassificationInput, _result: &ClassificationResult) {}
}

/// Sender-domain table, confirmed by a keyword in the text
pub struct DomainClassifier;

#[async_trait]
impl Classifier for DomainClassifier {
    fn method(&self) -> ClassificationMethod {
        ClassificationMethod::Domain
    }

    async fn try_classify(&self, input: &ClassificationInput) -> TierOutcome {
        match heuristics::match_domain(&input.sender, &input.subject, &input.body) {
            Some(hit) => {
                let mut result = heuristics::facets(&input.subject, &input.body);
                result.suggested_label = hit.label.to_string();
                result.reasoning = format!(
                    "Sender matches {} pattern '{}' with a confirming keyword",
                    hit.category, hit.matched
                );
                TierOutcome::Classified(result)
            }
            None => TierOutcome::NotApplicable,
        }
    }
}

/// Unambiguous subject/body patterns only
pub struct RegexClassifier;

#[async_trait]
impl Classifier for RegexClassifier {
    fn method(&self) -> ClassificationMethod {
        ClassificationMethod::Regex
    }

    async fn try_classify(&self, input: &ClassificationInput) -> TierOutcome {
        match heuristics::match_unambiguous(&input.subject, &input.body) {
            Some((label, reason)) => {
                let mut result = heuristics::facets(&input.subject, &input.body);
                result.suggested_label = label.to_string();
                result.reasoning = reason.to_string();
                TierOutcome::Classified(result)
            }
            None => TierOutcome::NotApplicable,
        }
    }
}

/// Always-succeeds floor: keyword facets and "Uncategorized"
pub struct RegexFloor;

#[async_trait]
impl Classifier for RegexFloor {
    fn method(&self) -> ClassificationMethod {
        ClassificationMethod::RegexFallback
    }

    async fn try_classify(&self, input: &ClassificationInput) -> TierOutcome {
        let mut result = heuristics::facets(&input.subject, &input.body);
        result.reasoning = "No classifier produced a category; keyword facets only".to_string();
        TierOutcome::Classified(result)
    }
}

/// Body window policy for LLM prompts
#[derive(Debug, Clone, Copy)]
pub struct ContextPolicy {
    pub simple_chars: usize,
    pub min_chars: usize,
    pub max_chars: usize,
}

impl ContextPolicy {
    pub fn from_config(config: &ClassificationConfig) -> Self {
        Self {
            simple_chars: config.simple_context_chars,
            min_chars: config.min_context_chars,
            max_chars: config.max_context_chars,
        }
    }

    pub fn window_for(&self, input: &ClassificationInput) -> usize {
        let simple = heuristics::is_simple_email(&input.subject, &input.body, &input.sender);
        heuristics::context_window(
            input.body.chars().count(),
            simple,
            self.simple_chars,
            self.min_chars,
            self.max_chars,
        )
    }
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self::from_config(&ClassificationConfig::default())
    }
}

/// An LLM provider as a waterfall tier, with its own rate-limit cooldown
pub struct LlmClassifier {
    method: ClassificationMethod,
    provider: Arc<dyn LlmProvider>,
    health: ProviderHealth,
    context: ContextPolicy,
    cost_per_1k_tokens: f64,
    examples: Option<(SqliteStore, usize)>,
}

impl LlmClassifier {
    pub fn new(
        method: ClassificationMethod,
        provider: Arc<dyn LlmProvider>,
        health: ProviderHealth,
        context: ContextPolicy,
    ) -> Self {
        Self {
            method,
            provider,
            health,
            context,
            cost_per_1k_tokens: 0.0,
            examples: None,
        }
    }

    pub fn with_pricing(mut self, provider: &ProviderConfig) -> Self {
        self.cost_per_1k_tokens = provider.cost_per_1k_tokens;
        self
    }

    /// Include up to `limit` user-approved examples in each prompt
    pub fn with_examples(mut self, store: SqliteStore, limit: usize) -> Self {
        if limit > 0 {
            self.examples = Some((store, limit));
        }
        self
    }

    pub fn health(&self) -> &ProviderHealth {
        &self.health
    }

    async fn few_shot(&self, input: &ClassificationInput) -> Vec<crate::models::FewShotExample> {
        let (Some((store, limit)), Some(user_id)) = (&self.examples, input.user_id) else {
            return Vec::new();
        };
        let limit = *limit;
        match store
            .with_conn(move |conn| store::few_shot_examples(conn, user_id, limit))
            .await
        {
            Ok(examples) => examples,
            Err(e) => {
                warn!(user_id, error = %e, "Failed to load few-shot examples");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    fn method(&self) -> ClassificationMethod {
        self.method
    }

    fn estimated_cost(&self, input: &ClassificationInput) -> f64 {
        let chars = PROMPT_OVERHEAD_CHARS
            + input.subject.chars().count()
            + input.sender.chars().count()
            + self.context.window_for(input);
        usage::estimate_cost(chars, self.cost_per_1k_tokens)
    }

    async fn try_classify(&self, input: &ClassificationInput) -> TierOutcome {
        if !self.health.is_available().await {
            return TierOutcome::NotApplicable;
        }

        let window = self.context.window_for(input);
        let request = LlmRequest {
            subject: input.subject.clone(),
            body: heuristics::truncate_chars(&input.body, window),
            sender: input.sender.clone(),
            few_shot: self.few_shot(input).await,
        };

        match self.provider.classify(&request).await {
            Ok(result) => TierOutcome::Classified(result),
            Err(e) => {
                if e.is_rate_limit() {
                    self.health.mark_rate_limited().await;
                }
                TierOutcome::Failed(e)
            }
        }
    }
}

/// Runs the tiers in order and reports every invocation to the usage tracker
pub struct ClassificationOrchestrator {
    tiers: Vec<Box<dyn Classifier>>,
    usage: Arc<dyn UsageTracker>,
}

impl ClassificationOrchestrator {
    pub fn new(tiers: Vec<Box<dyn Classifier>>, usage: Arc<dyn UsageTracker>) -> Self {
        Self { tiers, usage }
    }

    /// The standard waterfall: cache, domain, regex, primary LLM, fallback LLM, floor
    pub fn standard(
        cache: Arc<ClassificationCache>,
        primary: LlmClassifier,
        fallback: LlmClassifier,
        usage: Arc<dyn UsageTracker>,
    ) -> Self {
        let tiers: Vec<Box<dyn Classifier>> = vec![
            Box::new(crate::cache::CacheTier::new(cache)),
            Box::new(DomainClassifier),
            Box::new(RegexClassifier),
            Box::new(primary),
            Box::new(fallback),
            Box::new(RegexFloor),
        ];
        Self::new(tiers, usage)
    }

    pub fn tier_methods(&self) -> Vec<ClassificationMethod> {
        self.tiers.iter().map(|tier| tier.method()).collect()
    }

    /// Classify one email. Only fails when the last tier cannot answer.
    pub async fn classify(&self, input: &ClassificationInput) -> Result<ClassificationResult> {
        let reference_cost = self
            .tiers
            .iter()
            .map(|tier| tier.estimated_cost(input))
            .fold(0.0, f64::max);

        for tier in &self.tiers {
            let method = tier.method();
            let cost = tier.estimated_cost(input);

            match tier.try_classify(input).await {
                TierOutcome::Classified(result) => {
                    let result = result.with_method(method);
                    debug!(
                        email_id = ?input.email_id,
                        method = %method,
                        label = %result.suggested_label,
                        "Classified"
                    );
                    self.report(input, method, cost, (reference_cost - cost).max(0.0))
                        .await;
                    for observer in &self.tiers {
                        observer.observe(input, &result).await;
                    }
                    return Ok(result);
                }
                TierOutcome::NotApplicable => {
                    debug!(email_id = ?input.email_id, method = %method, "Tier not applicable");
                }
                TierOutcome::Failed(e) => {
                    if e.is_rate_limit() {
                        info!(email_id = ?input.email_id, method = %method, "Tier rate limited, falling through");
                    } else {
                        warn!(email_id = ?input.email_id, method = %method, error = %e, "Tier failed, falling through");
                    }
                    self.report(input, method, cost, 0.0).await;
                }
            }
        }

        Err(TriageError::ClassificationError(
            "no classification tier produced a result".to_string(),
        ))
    }

    async fn report(&self, input: &ClassificationInput, method: ClassificationMethod, cost: f64, saved: f64) {
        usage::report(
            self.usage.as_ref(),
            UsageRecord {
                email_id: input.email_id,
                method,
                estimated_cost: cost,
                cost_saved: saved,
            },
        )
        .await;
    }
}

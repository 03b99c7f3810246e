//! Per-email processing: classify, embed, persist, label, sync
//!
//! Each email runs the steps strictly in order. Only classification and
//! persistence can fail an email; embedding and mailbox sync degrade to "not
//! done" and are logged. Re-running an email converges on the same rows: the
//! metadata is upserted, assignments are keyed by (email, label) and pending
//! suggestions by (email, label name).

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::{ClassificationInput, ClassificationOrchestrator};
use crate::config::LabelConfig;
use crate::embedding::ResilientEmbedder;
use crate::error::{Result, TriageError};
use crate::heuristics;
use crate::label_registry::LabelRegistry;
use crate::mailbox::{MailboxSession, MailboxSyncAdapter, MessageLocator, SyncOutcome};
use crate::models::{
    is_reserved_label, Account, AssignedBy, ClassificationResult, Embedding, Label, NewSuggestion,
    StoredEmail, SuggestionMethod, SystemLabel,
};
use crate::similarity::SimilarityIndex;
use crate::store::{self, label_key, SqliteStore};

/// Centroid candidates considered for the similarity vote
const CENTROID_CANDIDATES: usize = 5;

/// Called with (done, total) after each email of a batch
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Outcome of the hybrid label step
#[derive(Debug, Clone, PartialEq)]
pub enum LabelDecision {
    /// Nothing to suggest (uncategorized or a system label name)
    NoSuggestion,
    /// The email already carries the winning label
    AlreadyAssigned { label: Label },
    AutoAssigned {
        label: Label,
        method: SuggestionMethod,
        confidence: f32,
    },
    Suggested {
        suggestion_id: i64,
        label: String,
        method: SuggestionMethod,
        confidence: f32,
        created: bool,
    },
}

#[derive(Debug, Clone)]
pub struct EmailReport {
    pub email_id: i64,
    pub classification: ClassificationResult,
    pub embedded: bool,
    pub system_labels: Vec<String>,
    pub decision: LabelDecision,
    pub synced: Vec<(String, SyncOutcome)>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub account_id: i64,
    pub processed: usize,
    pub suggestions: usize,
    pub auto_assigned: usize,
    pub failed: Vec<(i64, String)>,
}

/// A label vote with its provenance
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    label: String,
    method: SuggestionMethod,
    confidence: f32,
}

/// Combine the classifier's label with the best centroid match.
///
/// A strong centroid that agrees raises confidence; one that disagrees
/// replaces the classifier's label. Reserved names are never candidates.
fn choose_candidate(
    result: &ClassificationResult,
    centroid: Option<(&str, f32)>,
    settings: &LabelConfig,
) -> Option<Candidate> {
    let llm_vote = (!result.is_uncategorized() && !is_reserved_label(&result.suggested_label))
        .then(|| result.suggested_label.trim().to_string());
    let centroid_vote = centroid.filter(|(name, similarity)| {
        *similarity >= settings.similarity_threshold && !is_reserved_label(name)
    });

    match (llm_vote, centroid_vote) {
        (Some(llm), Some((name, _))) if label_key(&llm) == label_key(name) => Some(Candidate {
            label: name.to_string(),
            method: SuggestionMethod::Hybrid,
            confidence: settings.agreement_confidence,
        }),
        (_, Some((name, similarity))) => Some(Candidate {
            label: name.to_string(),
            method: SuggestionMethod::Similarity,
            confidence: similarity,
        }),
        (Some(llm), None) => Some(Candidate {
            label: llm,
            method: SuggestionMethod::Llm,
            confidence: settings.llm_base_confidence,
        }),
        (None, None) => None,
    }
}

/// System labels implied by the facets
fn system_labels_for(email: &StoredEmail, result: &ClassificationResult) -> Vec<SystemLabel> {
    let mut labels = Vec::new();
    if result.is_escalation {
        labels.push(SystemLabel::Escalation);
    }
    if result.is_urgent {
        labels.push(SystemLabel::Urgent);
    }
    if result.is_meeting && heuristics::is_minutes_of_meeting(&email.email.subject, &email.email.body) {
        labels.push(SystemLabel::Mom);
    }
    labels
}

pub struct EmailProcessingOrchestrator {
    store: SqliteStore,
    classifier: ClassificationOrchestrator,
    embedder: Option<ResilientEmbedder>,
    index: SimilarityIndex,
    labels: LabelRegistry,
    settings: LabelConfig,
    sync: Option<Arc<MailboxSyncAdapter>>,
    max_concurrent_accounts: usize,
}

impl EmailProcessingOrchestrator {
    pub fn new(
        store: SqliteStore,
        classifier: ClassificationOrchestrator,
        index: SimilarityIndex,
        settings: LabelConfig,
    ) -> Self {
        let labels = LabelRegistry::new(store.clone(), settings.palette.clone());
        Self {
            store,
            classifier,
            embedder: None,
            index,
            labels,
            settings,
            sync: None,
            max_concurrent_accounts: 1,
        }
    }

    pub fn with_embedder(mut self, embedder: ResilientEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_sync(mut self, sync: Arc<MailboxSyncAdapter>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_max_concurrent_accounts(mut self, max: usize) -> Self {
        self.max_concurrent_accounts = max.max(1);
        self
    }

    pub fn labels(&self) -> &LabelRegistry {
        &self.labels
    }

    /// Process one email, syncing over a fresh mailbox session if needed
    pub async fn process_email(&self, email_id: i64) -> Result<EmailReport> {
        self.process_email_in(email_id, None).await
    }

    async fn process_email_in(
        &self,
        email_id: i64,
        session: Option<&mut (dyn MailboxSession + 'static)>,
    ) -> Result<EmailReport> {
        let email = self.store.get_email(email_id).await?;
        let account = self.store.get_account(email.account_id).await?;

        let input = ClassificationInput::new(&email.email.subject, &email.email.body, &email.email.sender)
            .for_email(email_id)
            .for_user(account.user_id);
        let classification = self.classifier.classify(&input).await?;

        let embedding = self.embed(&email).await;

        let meta_result = classification.clone();
        let meta_embedding = embedding.clone();
        self.store
            .with_conn(move |conn| {
                store::upsert_email_meta(conn, email_id, &meta_result, meta_embedding.as_ref(), Utc::now())
            })
            .await?;

        let mut to_sync = Vec::new();
        let mut system_labels = Vec::new();
        for system in system_labels_for(&email, &classification) {
            let label = self.labels.ensure_system_label(system).await?;
            self.labels.assign(email_id, &label, AssignedBy::System, 1.0).await?;
            if system == SystemLabel::Mom {
                self.store
                    .with_conn(move |conn| store::set_mom_received(conn, email_id, Utc::now()))
                    .await?;
            }
            debug!(email_id, label = %label.name, "System label assigned");
            system_labels.push(label.name.clone());
            to_sync.push(label.name);
        }

        let decision = match self
            .assign_hybrid(&email, &account, &classification, embedding.as_ref())
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                // the email will not be picked up again, so mirror what is already stored
                if !to_sync.is_empty() {
                    warn!(email_id, error = %e, "Label step failed, syncing system labels only");
                    self.sync_labels(&account, &email, &to_sync, session).await;
                }
                return Err(e);
            }
        };
        if let LabelDecision::AutoAssigned { label, .. } = &decision {
            to_sync.push(label.name.clone());
        }

        let synced = self.sync_labels(&account, &email, &to_sync, session).await;

        info!(
            email_id,
            method = ?classification.method,
            label = %classification.suggested_label,
            "Email processed"
        );

        Ok(EmailReport {
            email_id,
            classification,
            embedded: embedding.is_some(),
            system_labels,
            decision,
            synced,
        })
    }

    async fn embed(&self, email: &StoredEmail) -> Option<Embedding> {
        let embedder = self.embedder.as_ref()?;
        let text = embedder.email_text(&email.email.subject, &email.email.sender, &email.email.body);
        let embedding = embedder.embed(&text).await;
        if embedding.is_none() {
            warn!(email_id = email.id, "Continuing without embedding");
        }
        embedding
    }

    /// Best visible, non-system centroid match for the user
    async fn centroid_vote(&self, embedding: &Embedding, user_id: i64) -> Result<Option<(Label, f32)>> {
        let visible: HashSet<i64> = self
            .labels
            .labels_for_user(user_id)
            .await?
            .into_iter()
            .map(|label| label.id)
            .collect();

        let matches = self
            .index
            .find_similar(
                &embedding.vector,
                &embedding.model,
                CENTROID_CANDIDATES,
                self.settings.similarity_threshold,
            )
            .await?;

        Ok(matches
            .into_iter()
            .find(|m| {
                !m.label.is_system
                    && (m.label.user_id == Some(user_id) || visible.contains(&m.label.id))
            })
            .map(|m| (m.label, m.similarity)))
    }

    async fn assign_hybrid(
        &self,
        email: &StoredEmail,
        account: &Account,
        result: &ClassificationResult,
        embedding: Option<&Embedding>,
    ) -> Result<LabelDecision> {
        let has_llm_vote = !result.is_uncategorized() && !is_reserved_label(&result.suggested_label);
        if !has_llm_vote && embedding.is_none() {
            return Ok(LabelDecision::NoSuggestion);
        }

        let Some(user_id) = account.user_id else {
            if has_llm_vote {
                return Err(TriageError::MissingOwner { account_id: account.id });
            }
            return Ok(LabelDecision::NoSuggestion);
        };

        let centroid = match embedding {
            Some(embedding) => self.centroid_vote(embedding, user_id).await?,
            None => None,
        };

        let Some(candidate) = choose_candidate(
            result,
            centroid.as_ref().map(|(label, similarity)| (label.name.as_str(), *similarity)),
            &self.settings,
        ) else {
            return Ok(LabelDecision::NoSuggestion);
        };

        let existing = match &centroid {
            Some((label, _)) if label_key(&label.name) == label_key(&candidate.label) => Some(label.clone()),
            _ => self
                .labels
                .find_for_user(&candidate.label, user_id)
                .await?
                .filter(|label| !label.is_system),
        };

        if let Some(label) = existing {
            if candidate.confidence > self.settings.auto_assign_threshold {
                self.auto_assign(email.id, &label, candidate.confidence, embedding)
                    .await?;
                return Ok(LabelDecision::AutoAssigned {
                    label,
                    method: candidate.method,
                    confidence: candidate.confidence,
                });
            }
            if self.is_assigned(email.id, label.id).await? {
                debug!(email_id = email.id, label = %label.name, "Label already assigned, not suggesting");
                return Ok(LabelDecision::AlreadyAssigned { label });
            }
        }

        let (suggestion, created) = self
            .store
            .upsert_pending_suggestion(&NewSuggestion {
                email_id: email.id,
                user_id,
                suggested_label: candidate.label.clone(),
                suggested_by: candidate.method,
                confidence: Some(candidate.confidence),
                reasoning: Some(result.reasoning.clone()).filter(|r| !r.is_empty()),
            })
            .await?;

        if created {
            info!(
                email_id = email.id,
                suggestion_id = suggestion.id,
                label = %candidate.label,
                method = candidate.method.as_str(),
                confidence = candidate.confidence,
                "Label suggested"
            );
        }

        Ok(LabelDecision::Suggested {
            suggestion_id: suggestion.id,
            label: suggestion.suggested_label,
            method: candidate.method,
            confidence: candidate.confidence,
            created,
        })
    }

    /// Assign an existing label and fold the embedding into its centroid once
    async fn auto_assign(
        &self,
        email_id: i64,
        label: &Label,
        confidence: f32,
        embedding: Option<&Embedding>,
    ) -> Result<()> {
        let label_id = label.id;
        let already_assigned = self.is_assigned(email_id, label_id).await?;

        self.labels
            .assign(email_id, label, AssignedBy::Ai, confidence)
            .await?;

        if let (Some(embedding), false) = (embedding, already_assigned) {
            self.index.update_centroid(label_id, embedding).await?;
        }
        info!(email_id, label = %label.name, confidence, "Label auto-assigned");
        Ok(())
    }

    async fn is_assigned(&self, email_id: i64, label_id: i64) -> Result<bool> {
        Ok(self
            .store
            .assignments_for_email(email_id)
            .await?
            .iter()
            .any(|assignment| assignment.label_id == label_id))
    }

    async fn sync_labels(
        &self,
        account: &Account,
        email: &StoredEmail,
        labels: &[String],
        session: Option<&mut (dyn MailboxSession + 'static)>,
    ) -> Vec<(String, SyncOutcome)> {
        let Some(adapter) = &self.sync else {
            return Vec::new();
        };
        if labels.is_empty() {
            return Vec::new();
        }

        let locator = MessageLocator::from_email(&email.email);
        let mut outcomes = Vec::with_capacity(labels.len());
        match session {
            Some(session) => {
                for label in labels {
                    let outcome = adapter.sync_label_with(session, account, &locator, label).await;
                    outcomes.push((label.clone(), outcome));
                }
            }
            None => {
                for label in labels {
                    let outcome = adapter.sync_label(account, &locator, label).await;
                    outcomes.push((label.clone(), outcome));
                }
            }
        }
        outcomes
    }

    pub async fn process_account(&self, account_id: i64) -> Result<BatchReport> {
        self.process_account_with_progress(account_id, None).await
    }

    /// Process an account's unclassified emails in delivery order over one
    /// mailbox session
    pub async fn process_account_with_progress(
        &self,
        account_id: i64,
        progress: Option<ProgressCallback>,
    ) -> Result<BatchReport> {
        let account = self.store.get_account(account_id).await?;
        let email_ids = self.store.unclassified_emails(account_id).await?;
        let total = email_ids.len();
        info!(account = account_id, emails = total, "Processing account");

        let mut session = match &self.sync {
            Some(adapter) if total > 0 => match adapter.open_session(&account).await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(account = account_id, error = %e, "Mailbox unavailable, labels will not be synced");
                    None
                }
            },
            _ => None,
        };

        let mut report = BatchReport {
            account_id,
            ..Default::default()
        };

        for (done, email_id) in email_ids.into_iter().enumerate() {
            match self.process_email_in(email_id, session.as_deref_mut()).await {
                Ok(email_report) => {
                    report.processed += 1;
                    match email_report.decision {
                        LabelDecision::AutoAssigned { .. } => report.auto_assigned += 1,
                        LabelDecision::Suggested { created: true, .. } => report.suggestions += 1,
                        _ => {}
                    }
                }
                Err(e) => {
                    warn!(account = account_id, email_id, error = %e, "Email processing failed");
                    report.failed.push((email_id, e.to_string()));
                }
            }
            if let Some(progress) = &progress {
                progress(done + 1, total);
            }
        }

        if let Some(mut session) = session {
            if let Err(e) = session.logout().await {
                debug!(account = account_id, error = %e, "Logout failed");
            }
        }

        info!(
            account = account_id,
            processed = report.processed,
            failed = report.failed.len(),
            "Account processed"
        );
        Ok(report)
    }

    /// Process several accounts with bounded concurrency
    pub async fn process_accounts(&self, account_ids: &[i64]) -> Vec<Result<BatchReport>> {
        stream::iter(account_ids.iter().copied())
            .map(|account_id| self.process_account(account_id))
            .buffered(self.max_concurrent_accounts)
            .collect()
            .await
    }
}

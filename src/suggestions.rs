//! Human approval of suggested labels
//!
//! A suggestion moves `pending → approved | rejected` exactly once. Approval
//! creates the label if needed, assigns it, records the name on the email and
//! feeds the email's embedding into the label centroid, all in one
//! transaction. Mailbox sync runs afterwards and cannot undo the approval.

use chrono::Utc;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, TriageError};
use crate::label_registry::{assign_label, find_or_create_label};
use crate::mailbox::{MailboxSyncAdapter, MessageLocator, SyncOutcome};
use crate::models::{
    Account, AssignedBy, Label, PendingLabelSuggestion, StoredEmail, SuggestionStatus,
};
use crate::similarity::apply_centroid_update;
use crate::store::{self, SqliteStore};

const DEFAULT_APPROVED_CONFIDENCE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionAction {
    Approve,
    Reject,
}

impl FromStr for SuggestionAction {
    type Err = TriageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "approved" => Ok(SuggestionAction::Approve),
            "reject" | "rejected" => Ok(SuggestionAction::Reject),
            other => Err(TriageError::Unknown(format!("unknown action '{}'", other))),
        }
    }
}

impl fmt::Display for SuggestionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuggestionAction::Approve => f.write_str("approve"),
            SuggestionAction::Reject => f.write_str("reject"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuggestionDecision {
    Approved {
        label: Label,
        label_created: bool,
        sync: Option<SyncOutcome>,
    },
    Rejected,
    /// Nothing changed; the suggestion was already decided
    AlreadyTerminal(SuggestionStatus),
}

/// Caller-facing result of `process_suggestion`
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub success: bool,
    pub message: String,
    pub label_id: Option<i64>,
}

impl From<&SuggestionDecision> for ProcessOutcome {
    fn from(decision: &SuggestionDecision) -> Self {
        match decision {
            SuggestionDecision::Approved { label, sync, .. } => {
                let synced = match sync {
                    Some(outcome) if !outcome.success => " (mailbox sync failed)",
                    _ => "",
                };
                ProcessOutcome {
                    success: true,
                    message: format!("Label '{}' approved{}", label.name, synced),
                    label_id: Some(label.id),
                }
            }
            SuggestionDecision::Rejected => ProcessOutcome {
                success: true,
                message: "Suggestion rejected".to_string(),
                label_id: None,
            },
            SuggestionDecision::AlreadyTerminal(status) => ProcessOutcome {
                success: false,
                message: format!("Suggestion already {}", status),
                label_id: None,
            },
        }
    }
}

enum Approval {
    Terminal(SuggestionStatus),
    Done {
        label: Label,
        created: bool,
        email: StoredEmail,
        account: Account,
    },
}

pub struct SuggestionApprovalEngine {
    store: SqliteStore,
    palette: Vec<String>,
    sync: Option<Arc<MailboxSyncAdapter>>,
}

impl SuggestionApprovalEngine {
    pub fn new(store: SqliteStore, palette: Vec<String>) -> Self {
        Self {
            store,
            palette,
            sync: None,
        }
    }

    pub fn with_sync(mut self, sync: Arc<MailboxSyncAdapter>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub async fn list_pending(&self, user_id: Option<i64>) -> Result<Vec<PendingLabelSuggestion>> {
        self.store.list_pending_suggestions(user_id).await
    }

    pub async fn process_suggestion(
        &self,
        id: i64,
        action: SuggestionAction,
        approver: &str,
    ) -> Result<ProcessOutcome> {
        let decision = match action {
            SuggestionAction::Approve => self.approve(id, approver).await?,
            SuggestionAction::Reject => self.reject(id, approver).await?,
        };
        Ok(ProcessOutcome::from(&decision))
    }

    pub async fn reject(&self, id: i64, approver: &str) -> Result<SuggestionDecision> {
        let approver = approver.to_string();
        let decision = self
            .store
            .transaction(move |tx| {
                let suggestion = load(tx, id)?;
                if suggestion.status.is_terminal() {
                    return Ok(SuggestionDecision::AlreadyTerminal(suggestion.status));
                }
                if !store::transition_suggestion(tx, id, SuggestionStatus::Rejected, &approver, Utc::now())? {
                    return Ok(SuggestionDecision::AlreadyTerminal(load(tx, id)?.status));
                }
                Ok(SuggestionDecision::Rejected)
            })
            .await?;

        if decision == SuggestionDecision::Rejected {
            info!(suggestion_id = id, "Suggestion rejected");
        }
        Ok(decision)
    }

    pub async fn approve(&self, id: i64, approver: &str) -> Result<SuggestionDecision> {
        let approver = approver.to_string();
        let palette = self.palette.clone();

        let approval = self
            .store
            .transaction(move |tx| {
                let suggestion = load(tx, id)?;
                if suggestion.status.is_terminal() {
                    return Ok(Approval::Terminal(suggestion.status));
                }
                if !store::transition_suggestion(tx, id, SuggestionStatus::Approved, &approver, Utc::now())? {
                    return Ok(Approval::Terminal(load(tx, id)?.status));
                }

                let now = Utc::now();
                let (label, created) =
                    find_or_create_label(tx, &suggestion.suggested_label, suggestion.user_id, &palette)?;
                store::add_user_label(tx, suggestion.user_id, label.id)?;
                assign_label(
                    tx,
                    suggestion.email_id,
                    &label,
                    AssignedBy::User,
                    suggestion.confidence.unwrap_or(DEFAULT_APPROVED_CONFIDENCE),
                    now,
                )?;

                if let Some(embedding) = store::get_email_meta(tx, suggestion.email_id)?
                    .and_then(|meta| meta.embedding)
                {
                    apply_centroid_update(tx, label.id, &embedding, now)?;
                }

                let email = store::get_email(tx, suggestion.email_id)?;
                let account = store::get_account(tx, email.account_id)?;
                Ok(Approval::Done {
                    label,
                    created,
                    email,
                    account,
                })
            })
            .await?;

        let (label, created, email, account) = match approval {
            Approval::Terminal(status) => return Ok(SuggestionDecision::AlreadyTerminal(status)),
            Approval::Done {
                label,
                created,
                email,
                account,
            } => (label, created, email, account),
        };

        info!(
            suggestion_id = id,
            email_id = email.id,
            label = %label.name,
            label_created = created,
            "Suggestion approved"
        );

        let sync = match &self.sync {
            Some(adapter) => {
                let locator = MessageLocator::from_email(&email.email);
                let outcome = adapter.sync_label(&account, &locator, &label.name).await;
                if !outcome.success {
                    warn!(
                        account = account.id,
                        email_id = email.id,
                        label = %label.name,
                        error = ?outcome.error,
                        "Approved label not mirrored to mailbox"
                    );
                }
                Some(outcome)
            }
            None => None,
        };

        Ok(SuggestionDecision::Approved {
            label,
            label_created: created,
            sync,
        })
    }
}

fn load(conn: &rusqlite::Connection, id: i64) -> Result<PendingLabelSuggestion> {
    store::get_suggestion(conn, id)?.ok_or_else(|| TriageError::NotFound(format!("suggestion {}", id)))
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TriageError;

/// Label name used when no tier can name a category
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Fixed system labels, exempt from the approval workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemLabel {
    Escalation,
    Urgent,
    Mom,
}

impl SystemLabel {
    pub const ALL: [SystemLabel; 3] = [SystemLabel::Escalation, SystemLabel::Urgent, SystemLabel::Mom];

    pub fn name(&self) -> &'static str {
        match self {
            SystemLabel::Escalation => "Escalation",
            SystemLabel::Urgent => "Urgent",
            SystemLabel::Mom => "MOM",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            SystemLabel::Escalation => "#d93025",
            SystemLabel::Urgent => "#f29900",
            SystemLabel::Mom => "#1a73e8",
        }
    }
}

/// True for names that never go through the suggestion workflow
pub fn is_reserved_label(name: &str) -> bool {
    let trimmed = name.trim();
    trimmed.eq_ignore_ascii_case(UNCATEGORIZED)
        || SystemLabel::ALL
            .iter()
            .any(|label| trimmed.eq_ignore_ascii_case(label.name()))
}

/// Which classification tier produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Cache,
    Domain,
    Regex,
    LlmPrimary,
    LlmFallback,
    RegexFallback,
}

impl ClassificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationMethod::Cache => "cache",
            ClassificationMethod::Domain => "domain",
            ClassificationMethod::Regex => "regex",
            ClassificationMethod::LlmPrimary => "llm_primary",
            ClassificationMethod::LlmFallback => "llm_fallback",
            ClassificationMethod::RegexFallback => "regex_fallback",
        }
    }
}

impl fmt::Display for ClassificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one classification run. Never merged across tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_hierarchy: bool,
    pub is_client: bool,
    pub is_meeting: bool,
    pub is_escalation: bool,
    pub is_urgent: bool,
    pub suggested_label: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<ClassificationMethod>,
}

impl ClassificationResult {
    pub fn is_uncategorized(&self) -> bool {
        let label = self.suggested_label.trim();
        label.is_empty() || label.eq_ignore_ascii_case(UNCATEGORIZED)
    }

    pub fn with_method(mut self, method: ClassificationMethod) -> Self {
        self.method = Some(method);
        self
    }
}

/// Message as delivered by the ingestion collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedEmail {
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub message_id: Option<String>,
    pub imap_uid: Option<u32>,
    pub imap_mailbox: Option<String>,
    #[serde(default)]
    pub imap_uid_validity: Option<u32>,
}

/// Stored email row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEmail {
    pub id: i64,
    pub account_id: i64,
    pub email: ParsedEmail,
    pub label_names: Vec<String>,
}

/// Vector plus the model that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
}

/// Per-email classification metadata (1:1 with the email)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMeta {
    pub email_id: i64,
    pub classification: ClassificationResult,
    pub embedding: Option<Embedding>,
    pub has_mom_received: bool,
    pub related_meeting_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub is_system: bool,
    pub user_id: Option<i64>,
}

/// Provenance of a label assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignedBy {
    System,
    Ai,
    User,
    Admin,
}

impl AssignedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignedBy::System => "system",
            AssignedBy::Ai => "ai",
            AssignedBy::User => "user",
            AssignedBy::Admin => "admin",
        }
    }
}

impl FromStr for AssignedBy {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(AssignedBy::System),
            "ai" => Ok(AssignedBy::Ai),
            "user" => Ok(AssignedBy::User),
            "admin" => Ok(AssignedBy::Admin),
            other => Err(TriageError::Unknown(format!("unknown assigned_by '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailLabelAssignment {
    pub email_id: i64,
    pub label_id: i64,
    pub assigned_by: AssignedBy,
    pub confidence_score: f32,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SuggestionStatus::Pending)
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionStatus {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "approved" => Ok(SuggestionStatus::Approved),
            "rejected" => Ok(SuggestionStatus::Rejected),
            other => Err(TriageError::Unknown(format!("unknown suggestion status '{}'", other))),
        }
    }
}

/// How a suggestion candidate was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionMethod {
    Llm,
    Hybrid,
    Similarity,
}

impl SuggestionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionMethod::Llm => "llm",
            SuggestionMethod::Hybrid => "hybrid",
            SuggestionMethod::Similarity => "similarity",
        }
    }
}

impl FromStr for SuggestionMethod {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm" => Ok(SuggestionMethod::Llm),
            "hybrid" => Ok(SuggestionMethod::Hybrid),
            "similarity" => Ok(SuggestionMethod::Similarity),
            other => Err(TriageError::Unknown(format!("unknown suggestion method '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingLabelSuggestion {
    pub id: i64,
    pub email_id: i64,
    pub user_id: i64,
    pub suggested_label: String,
    pub suggested_by: SuggestionMethod,
    pub confidence: Option<f32>,
    pub reasoning: Option<String>,
    pub status: SuggestionStatus,
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Input to `upsert_pending_suggestion`
#[derive(Debug, Clone)]
pub struct NewSuggestion {
    pub email_id: i64,
    pub user_id: i64,
    pub suggested_label: String,
    pub suggested_by: SuggestionMethod,
    pub confidence: Option<f32>,
    pub reasoning: Option<String>,
}

/// Running mean vector for one label under one embedding model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelCentroid {
    pub label_id: i64,
    pub model: String,
    pub centroid: Vec<f32>,
    pub email_count: i64,
}

/// A user-approved (email, label) pair shown to the LLM as an example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub subject: String,
    pub sender: String,
    pub label: String,
}

/// One row of classification telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub email_id: Option<i64>,
    pub method: ClassificationMethod,
    pub estimated_cost: f64,
    pub cost_saved: f64,
}

/// Aggregated usage per classification method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub rows: Vec<MethodUsage>,
    pub total_cost: f64,
    pub total_saved: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodUsage {
    pub method: String,
    pub calls: i64,
    pub estimated_cost: f64,
    pub cost_saved: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Imap,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Imap => "imap",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gmail" => Ok(ProviderKind::Gmail),
            "imap" => Ok(ProviderKind::Imap),
            other => Err(TriageError::Unknown(format!("unknown provider '{}'", other))),
        }
    }
}

/// Account fields consumed by mailbox sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub user_id: Option<i64>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub encrypted_password: String,
    pub provider: ProviderKind,
}

impl Account {
    /// Gmail-like hosts emulate labels as mailboxes
    pub fn is_gmail_like(&self) -> bool {
        let host = self.host.to_lowercase();
        self.provider == ProviderKind::Gmail
            || host.contains("gmail.com")
            || host.contains("googlemail.com")
    }
}

/// Extract the bare address from a "Name <addr>" header value
pub fn sender_address(sender: &str) -> String {
    match (sender.find('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => sender[start + 1..end].trim().to_lowercase(),
        _ => sender.trim().to_lowercase(),
    }
}

/// Domain part of a sender header value
pub fn sender_domain(sender: &str) -> String {
    sender_address(sender)
        .split('@')
        .nth(1)
        .unwrap_or("")
        .to_string()
}

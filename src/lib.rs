//! Mail Triage
//!
//! Classifies stored emails through a cost-ordered waterfall of classifiers,
//! assigns labels from the classification and from label centroids in
//! embedding space, and mirrors labels back to the user's mailbox.
//!
//! # Overview
//!
//! - **Classification**: cache, domain rules, regex rules, primary LLM,
//!   local fallback LLM and a regex floor, cheapest first
//! - **Similarity**: per-model email embeddings and running-mean label centroids
//! - **Suggestions**: uncertain labels wait for human approval; approval
//!   creates the label, assigns it and updates the centroid atomically
//! - **Mailbox sync**: IMAP copy into a label mailbox, keyword flags, or
//!   `\Flagged`, in that order
//!
//! # Example Usage
//!
//! ```no_run
//! use mail_triage::cli::Services;
//! use mail_triage::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let services = Services::build(config)?;
//!
//!     let report = services.orchestrator.process_account(1).await?;
//!     println!("processed {} emails", report.processed);
//!
//!     for suggestion in services.approvals.list_pending(None).await? {
//!         println!("{} -> {}", suggestion.email_id, suggestion.suggested_label);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`cache`] - Time-windowed classification cache
//! - [`classifier`] - Classifier tiers and the waterfall orchestrator
//! - [`cli`] - Command-line interface and service wiring
//! - [`config`] - Configuration management
//! - [`embedding`] - Embedding providers with retry and secondary fallback
//! - [`error`] - Error types and result aliases
//! - [`heuristics`] - Domain and regex rules, facet detection
//! - [`imap_client`] - IMAP sessions over TLS
//! - [`label_registry`] - Label naming, creation and assignment
//! - [`llm`] - LLM providers and response validation
//! - [`mailbox`] - Message location and label sync strategies
//! - [`models`] - Core data structures
//! - [`pipeline`] - Per-email and per-account processing
//! - [`rate_limiter`] - Provider rate-limit cooldown
//! - [`similarity`] - Vector similarity and label centroids
//! - [`state`] - Run state file
//! - [`store`] - SQLite persistence
//! - [`suggestions`] - Suggestion approval state machine
//! - [`usage`] - Classification cost telemetry

pub mod cache;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod heuristics;
pub mod imap_client;
pub mod label_registry;
pub mod llm;
pub mod mailbox;
pub mod models;
pub mod pipeline;
pub mod rate_limiter;
pub mod similarity;
pub mod state;
pub mod store;
pub mod suggestions;
pub mod usage;

// Re-export commonly used types for convenience
pub use error::{Result, TriageError};

// Core data models
pub use models::{
    Account, ClassificationMethod, ClassificationResult, Embedding, Label, ParsedEmail,
    PendingLabelSuggestion, SuggestionMethod, SuggestionStatus, SystemLabel,
};

// Classification
pub use cache::ClassificationCache;
pub use classifier::{ClassificationInput, ClassificationOrchestrator, Classifier, TierOutcome};

// Providers
pub use embedding::{EmbeddingProvider, ResilientEmbedder};
pub use llm::LlmProvider;

// Config types
pub use config::{ClassificationConfig, Config, LabelConfig};

// Processing and approval
pub use pipeline::{BatchReport, EmailProcessingOrchestrator, LabelDecision};
pub use similarity::{DistanceMetric, SimilarityIndex};
pub use suggestions::{ProcessOutcome, SuggestionAction, SuggestionApprovalEngine};

// Mailbox sync
pub use mailbox::{MailboxConnector, MailboxSession, MailboxSyncAdapter, MessageLocator, SyncMethod};

// State management
pub use state::ProcessingState;
pub use store::SqliteStore;

//! Command-line interface

use clap::{Parser, Subcommand};
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::ClassificationCache;
use crate::classifier::{ClassificationOrchestrator, ContextPolicy, LlmClassifier};
use crate::config::{Config, ProviderConfig};
use crate::embedding::ResilientEmbedder;
use crate::error::{Result, TriageError};
use crate::imap_client::ImapConnector;
use crate::llm::OpenAiCompatibleProvider;
use crate::mailbox::{MailboxSyncAdapter, PlaintextPasswords};
use crate::models::{ClassificationMethod, PendingLabelSuggestion};
use crate::pipeline::{EmailProcessingOrchestrator, ProgressCallback};
use crate::rate_limiter::ProviderHealth;
use crate::similarity::{DistanceMetric, SimilarityIndex};
use crate::state::ProcessingState;
use crate::store::SqliteStore;
use crate::suggestions::{SuggestionAction, SuggestionApprovalEngine};
use crate::usage::StoreUsageTracker;

#[derive(Parser, Debug)]
#[command(name = "mail-triage")]
#[command(version = "0.1.0")]
#[command(about = "Email classification and label assignment", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Classify and label unprocessed emails
    Process {
        /// Account id to process (repeatable)
        #[arg(short, long)]
        account: Vec<i64>,

        /// Process every account in the store
        #[arg(long, conflicts_with = "account")]
        all: bool,
    },

    /// List pending label suggestions
    Suggestions {
        /// Only show suggestions for this user
        #[arg(short, long)]
        user: Option<i64>,
    },

    /// Approve a pending suggestion
    Approve {
        id: i64,

        #[arg(long, default_value = "cli")]
        approver: String,
    },

    /// Reject a pending suggestion
    Reject {
        id: i64,

        #[arg(long, default_value = "cli")]
        approver: String,
    },

    /// Walk through pending suggestions interactively
    Review {
        #[arg(short, long)]
        user: Option<i64>,

        #[arg(long, default_value = "cli")]
        approver: String,
    },

    /// Create the system label mailboxes for an account
    InitMailbox {
        #[arg(short, long)]
        account: i64,
    },

    /// Show the last run and classification usage
    Status {
        /// Show failed email ids
        #[arg(long)]
        detailed: bool,
    },
}

/// Truncate a string to max_len characters, adding "..." if truncated
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share a MultiProgress with the log writer so log lines print above the bars
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::with_template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style =
            ProgressStyle::with_template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the commands need, wired from one config
pub struct Services {
    pub config: Config,
    pub store: SqliteStore,
    pub orchestrator: EmailProcessingOrchestrator,
    pub approvals: SuggestionApprovalEngine,
    pub sync: Option<Arc<MailboxSyncAdapter>>,
}

fn llm_tier(
    method: ClassificationMethod,
    provider: &ProviderConfig,
    config: &Config,
    store: &SqliteStore,
) -> LlmClassifier {
    LlmClassifier::new(
        method,
        Arc::new(OpenAiCompatibleProvider::from_config(provider)),
        ProviderHealth::new(&provider.name, config.classification.rate_limit_cooldown_secs),
        ContextPolicy::from_config(&config.classification),
    )
    .with_pricing(provider)
    .with_examples(store.clone(), config.classification.few_shot_examples)
}

impl Services {
    pub fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let store = SqliteStore::open(&config.storage.database_path)?;

        let cache = Arc::new(ClassificationCache::from_config(store.clone(), &config.classification));
        let primary = llm_tier(ClassificationMethod::LlmPrimary, &config.llm.primary, &config, &store);
        let fallback = llm_tier(ClassificationMethod::LlmFallback, &config.llm.fallback, &config, &store);
        let usage = Arc::new(StoreUsageTracker::new(store.clone()));
        let classifier = ClassificationOrchestrator::standard(cache, primary, fallback, usage);

        let metric: DistanceMetric = config.embedding.metric.parse()?;
        let index = SimilarityIndex::new(store.clone(), metric);

        let sync = config.sync.enabled.then(|| {
            Arc::new(MailboxSyncAdapter::new(
                Arc::new(ImapConnector::new()),
                Arc::new(PlaintextPasswords),
            ))
        });

        let mut orchestrator =
            EmailProcessingOrchestrator::new(store.clone(), classifier, index, config.labels.clone())
                .with_embedder(ResilientEmbedder::from_config(&config.embedding))
                .with_max_concurrent_accounts(config.sync.max_concurrent_accounts);
        let mut approvals = SuggestionApprovalEngine::new(store.clone(), config.labels.palette.clone());
        if let Some(adapter) = &sync {
            orchestrator = orchestrator.with_sync(Arc::clone(adapter));
            approvals = approvals.with_sync(Arc::clone(adapter));
        }

        Ok(Self {
            config,
            store,
            orchestrator,
            approvals,
            sync,
        })
    }
}

/// Process the given accounts, checkpointing the run state after each batch
pub async fn run_process(
    services: &Services,
    account_ids: &[i64],
    state_path: &Path,
    reporter: &ProgressReporter,
) -> Result<ProcessingState> {
    let mut state = ProcessingState::new();
    info!(run_id = %state.run_id, accounts = account_ids.len(), "Starting processing run");

    let concurrency = services.config.sync.max_concurrent_accounts.max(1);
    let mut batches = futures::stream::iter(account_ids.iter().copied())
        .map(|account_id| {
            let pb = reporter.add_progress_bar(0, &format!("Account {}", account_id));
            let bar = pb.clone();
            let progress: ProgressCallback = Arc::new(move |done, total| {
                bar.set_length(total as u64);
                bar.set_position(done as u64);
            });
            async move {
                let result = services
                    .orchestrator
                    .process_account_with_progress(account_id, Some(progress))
                    .await;
                match &result {
                    Ok(batch) => pb.finish_with_message(format!(
                        "Account {}: {} processed, {} failed",
                        account_id,
                        batch.processed,
                        batch.failed.len()
                    )),
                    Err(e) => pb.abandon_with_message(format!("Account {}: {}", account_id, e)),
                }
                (account_id, result)
            }
        })
        .buffered(concurrency);

    while let Some((account_id, result)) = batches.next().await {
        match result {
            Ok(batch) => state.record_batch(&batch),
            Err(e) => {
                warn!(account = account_id, error = %e, "Account processing failed");
                state.record_failed_account(account_id);
            }
        }
        state.checkpoint(state_path).await?;
    }

    state.complete(state_path).await?;
    Ok(state)
}

/// Resolve the account ids a `process` invocation should cover
pub async fn select_accounts(store: &SqliteStore, accounts: Vec<i64>, all: bool) -> Result<Vec<i64>> {
    if all {
        return Ok(store.accounts().await?.into_iter().map(|a| a.id).collect());
    }
    if accounts.is_empty() {
        return Err(TriageError::ConfigError(
            "Specify --account <id> or --all".to_string(),
        ));
    }
    Ok(accounts)
}

pub fn format_suggestion(suggestion: &PendingLabelSuggestion) -> String {
    let confidence = suggestion
        .confidence
        .map(|c| format!("{:.2}", c))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "#{} email={} user={} label='{}' by={} confidence={}",
        suggestion.id,
        suggestion.email_id,
        suggestion.user_id,
        suggestion.suggested_label,
        suggestion.suggested_by.as_str(),
        confidence
    )
}

const REVIEW_APPROVE: &str = "Approve";
const REVIEW_REJECT: &str = "Reject";
const REVIEW_SKIP: &str = "Skip";
const REVIEW_QUIT: &str = "Quit";

/// Prompt for a decision on each pending suggestion
pub async fn review_suggestions(services: &Services, user: Option<i64>, approver: &str) -> Result<usize> {
    let pending = services.approvals.list_pending(user).await?;
    if pending.is_empty() {
        println!("No pending suggestions.");
        return Ok(0);
    }

    let mut decided = 0;
    for suggestion in &pending {
        let email = services.store.get_email(suggestion.email_id).await?;
        println!();
        println!("From:    {}", email.email.sender);
        println!("Subject: {}", truncate_string(&email.email.subject, 80));
        if let Some(reasoning) = &suggestion.reasoning {
            println!("Reason:  {}", truncate_string(reasoning, 80));
        }

        let options = vec![REVIEW_APPROVE, REVIEW_REJECT, REVIEW_SKIP, REVIEW_QUIT];
        let prompt = format!("Label '{}'?", suggestion.suggested_label);
        let choice = inquire::Select::new(&prompt, options)
            .prompt()
            .map_err(|e| TriageError::Unknown(format!("prompt failed: {}", e)))?;

        let action = match choice {
            REVIEW_APPROVE => SuggestionAction::Approve,
            REVIEW_REJECT => SuggestionAction::Reject,
            REVIEW_QUIT => break,
            _ => continue,
        };

        let outcome = services
            .approvals
            .process_suggestion(suggestion.id, action, approver)
            .await?;
        println!("  {}", outcome.message);
        if outcome.success {
            decided += 1;
        }
    }

    Ok(decided)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SuggestionMethod, SuggestionStatus};
    use chrono::Utc;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("a longer subject line", 10), "a longe...");
        assert_eq!(truncate_string("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn test_cli_parses_process_all() {
        let cli = Cli::try_parse_from(["mail-triage", "--verbose", "process", "--all"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Process { account, all } => {
                assert!(all);
                assert!(account.is_empty());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_account_with_all() {
        assert!(Cli::try_parse_from(["mail-triage", "process", "--all", "--account", "1"]).is_err());
    }

    #[test]
    fn test_cli_parses_approve() {
        let cli = Cli::try_parse_from(["mail-triage", "approve", "42", "--approver", "ana"]).unwrap();
        match cli.command {
            Commands::Approve { id, approver } => {
                assert_eq!(id, 42);
                assert_eq!(approver, "ana");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_select_accounts_requires_a_choice() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = select_accounts(&store, Vec::new(), false).await.unwrap_err();
        assert!(matches!(err, TriageError::ConfigError(_)));
        assert_eq!(select_accounts(&store, vec![3, 5], false).await.unwrap(), vec![3, 5]);
        assert!(select_accounts(&store, Vec::new(), true).await.unwrap().is_empty());
    }

    #[test]
    fn test_format_suggestion() {
        let suggestion = PendingLabelSuggestion {
            id: 7,
            email_id: 11,
            user_id: 2,
            suggested_label: "Invoices".to_string(),
            suggested_by: SuggestionMethod::Llm,
            confidence: Some(0.6),
            reasoning: None,
            status: SuggestionStatus::Pending,
            approved_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            processed_at: None,
        };
        assert_eq!(
            format_suggestion(&suggestion),
            "#7 email=11 user=2 label='Invoices' by=llm confidence=0.60"
        );
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::pipeline::BatchReport;

/// Counters for the latest `process` run, kept in a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accounts_processed: Vec<i64>,
    pub emails_processed: usize,
    pub suggestions_created: usize,
    pub labels_auto_assigned: usize,
    pub failed_email_ids: Vec<i64>,
    pub failed_accounts: Vec<i64>,
    pub completed: bool,
    pub checkpoint_count: usize,
}

impl ProcessingState {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
            accounts_processed: Vec::new(),
            emails_processed: 0,
            suggestions_created: 0,
            labels_auto_assigned: 0,
            failed_email_ids: Vec::new(),
            failed_accounts: Vec::new(),
            completed: false,
            checkpoint_count: 0,
        }
    }

    /// Save state to disk
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!("Saved processing state to {:?}", path);
        Ok(())
    }

    /// Load state from disk; a missing file yields a fresh state
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No existing state file found, starting fresh");
            return Ok(Self::new());
        }

        let json = tokio::fs::read_to_string(path).await?;
        let state: Self = serde_json::from_str(&json)?;

        tracing::debug!(
            "Loaded processing state: run_id={}, emails_processed={}",
            state.run_id,
            state.emails_processed
        );

        Ok(state)
    }

    /// Fold one account's batch into the run counters
    pub fn record_batch(&mut self, report: &BatchReport) {
        self.accounts_processed.push(report.account_id);
        self.emails_processed += report.processed;
        self.suggestions_created += report.suggestions;
        self.labels_auto_assigned += report.auto_assigned;
        self.failed_email_ids
            .extend(report.failed.iter().map(|(email_id, _)| *email_id));
        self.updated_at = Utc::now();
    }

    pub fn record_failed_account(&mut self, account_id: i64) {
        self.failed_accounts.push(account_id);
        self.updated_at = Utc::now();
    }

    /// Save after a batch
    pub async fn checkpoint(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        self.checkpoint_count += 1;
        self.save(path).await?;
        tracing::debug!(
            "Checkpoint #{}: emails={}, failed={}",
            self.checkpoint_count,
            self.emails_processed,
            self.failed_email_ids.len()
        );
        Ok(())
    }

    /// Mark as completed
    pub async fn complete(&mut self, path: &Path) -> Result<()> {
        self.completed = true;
        self.updated_at = Utc::now();
        self.save(path).await?;
        tracing::info!("Processing run {} completed", self.run_id);
        Ok(())
    }
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self::new()
    }
}

use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use mail_triage::cli::{self, Cli, Commands, ProgressReporter, Services};
use mail_triage::config::Config;
use mail_triage::error::TriageError;
use mail_triage::state::ProcessingState;
use mail_triage::suggestions::SuggestionAction;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        eprintln!("\nFor help, run: mail-triage --help");
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli, multi: Arc<MultiProgress>) {
    let default_filter = if cli.verbose {
        "mail_triage=debug,info"
    } else {
        "mail_triage=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(MultiProgressMakeWriter { multi })
            .with_target(false)
            .with_thread_ids(false)
            .init();
    }
}

async fn run() -> Result<()> {
    // rustls needs an explicit process-wide crypto provider
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let multi_progress = Arc::new(MultiProgress::new());
    init_tracing(&cli, Arc::clone(&multi_progress));

    match cli.command {
        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                return Err(TriageError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(&output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - llm.primary / llm.fallback: chat endpoints and API key variables");
            println!("  - embedding.primary: embedding endpoint and model");
            println!("  - labels.auto_assign_threshold: confidence needed to skip review");
            println!("  - sync.enabled: mirror labels to the mailbox over IMAP");
            Ok(())
        }

        Commands::Process { account, all } => {
            let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());

            let spinner = reporter.add_spinner("Loading configuration...");
            let config = Config::load(&cli.config).await?;
            let state_path = config.storage.state_path.clone();
            let services = Services::build(config)?;
            reporter.finish_spinner(&spinner, &format!("Configuration loaded from {:?}", cli.config));

            let account_ids = cli::select_accounts(&services.store, account, all).await?;
            let state = cli::run_process(&services, &account_ids, &state_path, &reporter).await?;

            println!("\n========================================");
            println!("Processing Summary");
            println!("========================================");
            println!("Run ID: {}", state.run_id);
            println!("Accounts processed: {}", state.accounts_processed.len());
            println!("Emails processed: {}", state.emails_processed);
            println!("Suggestions created: {}", state.suggestions_created);
            println!("Labels auto-assigned: {}", state.labels_auto_assigned);
            println!("Failed emails: {}", state.failed_email_ids.len());
            if !state.failed_accounts.is_empty() {
                println!("Failed accounts: {:?}", state.failed_accounts);
            }
            println!("========================================");
            Ok(())
        }

        Commands::Suggestions { user } => {
            let services = Services::build(Config::load(&cli.config).await?)?;
            let pending = services.approvals.list_pending(user).await?;
            if pending.is_empty() {
                println!("No pending suggestions.");
            }
            for suggestion in &pending {
                println!("{}", cli::format_suggestion(suggestion));
            }
            Ok(())
        }

        Commands::Approve { id, approver } => {
            decide(&cli.config, id, SuggestionAction::Approve, &approver).await
        }

        Commands::Reject { id, approver } => {
            decide(&cli.config, id, SuggestionAction::Reject, &approver).await
        }

        Commands::Review { user, approver } => {
            let services = Services::build(Config::load(&cli.config).await?)?;
            let decided = cli::review_suggestions(&services, user, &approver).await?;
            println!("\nDecided {} suggestion(s)", decided);
            Ok(())
        }

        Commands::InitMailbox { account } => {
            let services = Services::build(Config::load(&cli.config).await?)?;
            let adapter = services.sync.as_ref().ok_or_else(|| {
                TriageError::ConfigError("Mailbox sync is disabled (sync.enabled = false)".to_string())
            })?;
            let account = services.store.get_account(account).await?;
            let reports = adapter.initialize_system_labels_in_mailbox(&account).await?;
            for report in reports {
                match report.error {
                    None => println!("  ✓ {}", report.label),
                    Some(error) => println!("  ✗ {}: {}", report.label, error),
                }
            }
            Ok(())
        }

        Commands::Status { detailed } => {
            let config = Config::load(&cli.config).await?;
            let state_path = config.storage.state_path.clone();

            if state_path.exists() {
                let state = ProcessingState::load(&state_path).await?;

                println!("\n========================================");
                println!("Last Run");
                println!("========================================");
                println!("Run ID: {}", state.run_id);
                println!("Started: {}", state.started_at.format("%Y-%m-%d %H:%M:%S"));
                println!("Updated: {}", state.updated_at.format("%Y-%m-%d %H:%M:%S"));
                println!("Completed: {}", state.completed);
                println!("Emails processed: {}", state.emails_processed);
                println!("Suggestions created: {}", state.suggestions_created);
                println!("Labels auto-assigned: {}", state.labels_auto_assigned);
                println!("Checkpoints: {}", state.checkpoint_count);

                if detailed && !state.failed_email_ids.is_empty() {
                    println!("\nFailed emails: {}", state.failed_email_ids.len());
                    for id in &state.failed_email_ids {
                        println!("  - {}", id);
                    }
                }
            } else {
                println!("No previous runs found.");
                println!("State file: {:?}", state_path);
            }

            let services = Services::build(config)?;
            let summary = services.store.usage_summary().await?;
            println!("\n========================================");
            println!("Classification Usage");
            println!("========================================");
            for row in &summary.rows {
                println!(
                    "{:<16} calls={:<6} cost=${:.4} saved=${:.4}",
                    row.method, row.calls, row.estimated_cost, row.cost_saved
                );
            }
            println!("Total cost: ${:.4}", summary.total_cost);
            println!("Total saved: ${:.4}", summary.total_saved);
            println!("========================================");
            Ok(())
        }
    }
}

async fn decide(config_path: &std::path::Path, id: i64, action: SuggestionAction, approver: &str) -> Result<()> {
    let services = Services::build(Config::load(config_path).await?)?;
    let outcome = services.approvals.process_suggestion(id, action, approver).await?;
    println!("{}", outcome.message);
    if let Some(label_id) = outcome.label_id {
        println!("Label id: {}", label_id);
    }
    if !outcome.success {
        process::exit(2);
    }
    Ok(())
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(triage_err) = error.downcast_ref::<TriageError>() {
        match triage_err {
            TriageError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: mail-triage init-config --force");
            }
            TriageError::RateLimited { .. } | TriageError::ProviderUnavailable(_) => {
                eprintln!("\nHint: The classification provider is unavailable.");
                eprintln!("      Wait a minute and try again.");
            }
            TriageError::MailboxError(_) => {
                eprintln!("\nHint: Check the account's IMAP host, port and credentials.");
            }
            _ => {}
        }
    }
}

//! Mirror assigned labels into the source mailbox
//!
//! Labels are written with the first strategy that works:
//!
//! 1. copy the message into a mailbox named after the label (this is how
//!    Gmail exposes labels over IMAP, and a plain folder elsewhere)
//! 2. set an IMAP keyword named after the label
//! 3. set `\Flagged`, only for generic IMAP and only for labels that denote
//!    urgency, escalation, priority or criticality
//!
//! A stored UID is only meaningful inside the mailbox it came from, so that
//! mailbox is always reselected before the UID is used. If the UIDVALIDITY
//! changed, or the UID no longer resolves to the same message, the message is
//! looked up again by Message-ID. Sync never fails an email: every outcome is
//! reported as a [`SyncOutcome`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, TriageError};
use crate::heuristics;
use crate::models::{sender_address, Account, ParsedEmail, SystemLabel};

pub const INBOX: &str = "INBOX";
pub const GMAIL_ALL_MAIL: &str = "[Gmail]/All Mail";
const FLAGGED: &str = "\\Flagged";

/// Result of SELECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxStatus {
    pub uid_validity: Option<u32>,
    pub exists: u32,
}

/// Subject and sender address as reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub subject: String,
    pub sender: String,
}

/// One authenticated IMAP connection
#[async_trait]
pub trait MailboxSession: Send {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus>;

    /// UID of the message with this Message-ID in the selected mailbox
    async fn search_message_id(&mut self, message_id: &str) -> Result<Option<u32>>;

    async fn fetch_envelope(&mut self, uid: u32) -> Result<Option<Envelope>>;

    async fn create_mailbox(&mut self, name: &str) -> Result<()>;

    async fn copy_message(&mut self, uid: u32, target: &str) -> Result<()>;

    async fn add_flag(&mut self, uid: u32, flag: &str) -> Result<()>;

    async fn logout(&mut self) -> Result<()>;
}

/// Opens sessions for accounts
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, account: &Account, password: &str) -> Result<Box<dyn MailboxSession>>;
}

/// Turns the stored account secret into a login password
pub trait PasswordDecryptor: Send + Sync {
    fn decrypt(&self, encrypted: &str) -> Result<String>;
}

/// Stored secrets are already plaintext
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextPasswords;

impl PasswordDecryptor for PlaintextPasswords {
    fn decrypt(&self, encrypted: &str) -> Result<String> {
        Ok(encrypted.to_string())
    }
}

/// Where a message lives, plus what it should look like when found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLocator {
    pub uid: Option<u32>,
    pub mailbox: Option<String>,
    pub uid_validity: Option<u32>,
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: String,
}

impl MessageLocator {
    pub fn from_email(email: &ParsedEmail) -> Self {
        Self {
            uid: email.imap_uid,
            mailbox: email.imap_mailbox.clone(),
            uid_validity: email.imap_uid_validity,
            message_id: email.message_id.clone(),
            subject: email.subject.clone(),
            sender: email.sender.clone(),
        }
    }

    /// Envelope subject and sender agree with the stored email.
    ///
    /// Encoded-word subjects are not decoded here, so only the sender is
    /// compared for them.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if sender_address(&envelope.sender) != sender_address(&self.sender) {
            return false;
        }
        let subject = envelope.subject.trim();
        subject.starts_with("=?") || subject == self.subject.trim()
    }
}

impl fmt::Display for MessageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.uid, &self.mailbox) {
            (Some(uid), Some(mailbox)) => write!(f, "{}:{}", mailbox, uid)?,
            _ => f.write_str("-")?,
        }
        if let Some(message_id) = &self.message_id {
            write!(f, " {}", message_id)?;
        }
        Ok(())
    }
}

/// Labeling mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    MailboxCopy,
    KeywordFlag,
    StandardFlag,
}

impl SyncMethod {
    /// Strategies in the order they are tried
    pub const ORDER: [SyncMethod; 3] = [
        SyncMethod::MailboxCopy,
        SyncMethod::KeywordFlag,
        SyncMethod::StandardFlag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::MailboxCopy => "mailbox_copy",
            SyncMethod::KeywordFlag => "keyword_flag",
            SyncMethod::StandardFlag => "standard_flag",
        }
    }

    /// Whether this strategy may be used for `label` on `account`
    pub fn applies_to(&self, account: &Account, label: &str) -> bool {
        match self {
            SyncMethod::MailboxCopy | SyncMethod::KeywordFlag => true,
            SyncMethod::StandardFlag => {
                !account.is_gmail_like() && heuristics::denotes_priority(label)
            }
        }
    }
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub success: bool,
    pub method: Option<SyncMethod>,
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn synced(method: SyncMethod) -> Self {
        Self {
            success: true,
            method: Some(method),
            error: None,
        }
    }

    pub fn failed(method: Option<SyncMethod>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            method,
            error: Some(error.into()),
        }
    }
}

/// Per-label result of mailbox initialization
#[derive(Debug, Clone, PartialEq)]
pub struct LabelInitReport {
    pub label: String,
    pub success: bool,
    pub error: Option<String>,
}

/// IMAP keyword atom for a label name
///
/// Keywords are atoms, so anything outside ASCII alphanumerics, `-` and `_`
/// becomes `_`: "Client Work" is flagged as `Client_Work`, and two labels
/// differing only in those characters share a keyword.
pub fn keyword_for(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Create a mailbox, treating "already exists" as success
async fn ensure_mailbox(session: &mut dyn MailboxSession, name: &str) -> Result<()> {
    match session.create_mailbox(name).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_exists() => {
            debug!(mailbox = name, "Mailbox already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub struct MailboxSyncAdapter {
    connector: Arc<dyn MailboxConnector>,
    passwords: Arc<dyn PasswordDecryptor>,
}

impl MailboxSyncAdapter {
    pub fn new(connector: Arc<dyn MailboxConnector>, passwords: Arc<dyn PasswordDecryptor>) -> Self {
        Self {
            connector,
            passwords,
        }
    }

    pub async fn open_session(&self, account: &Account) -> Result<Box<dyn MailboxSession>> {
        let password = self.passwords.decrypt(&account.encrypted_password)?;
        debug!(account = account.id, host = %account.host, "Opening mailbox session");
        self.connector.connect(account, &password).await
    }

    /// Sync one label over a fresh session
    pub async fn sync_label(&self, account: &Account, locator: &MessageLocator, label: &str) -> SyncOutcome {
        let mut session = match self.open_session(account).await {
            Ok(session) => session,
            Err(e) => {
                warn!(account = account.id, locator = %locator, label, error = %e, "Mailbox connection failed");
                return SyncOutcome::failed(None, e.to_string());
            }
        };

        let outcome = self
            .sync_label_with(session.as_mut(), account, locator, label)
            .await;

        if let Err(e) = session.logout().await {
            debug!(account = account.id, error = %e, "Logout failed");
        }
        outcome
    }

    /// Sync one label over an already open session
    pub async fn sync_label_with(
        &self,
        session: &mut dyn MailboxSession,
        account: &Account,
        locator: &MessageLocator,
        label: &str,
    ) -> SyncOutcome {
        let uid = match self.resolve(session, account, locator).await {
            Ok(uid) => uid,
            Err(e) => {
                warn!(account = account.id, locator = %locator, label, error = %e, "Could not locate message");
                return SyncOutcome::failed(None, e.to_string());
            }
        };

        let mut failures = Vec::new();
        let mut last_tried = None;
        for method in SyncMethod::ORDER {
            if !method.applies_to(account, label) {
                continue;
            }
            last_tried = Some(method);
            match self.apply(session, method, uid, label).await {
                Ok(()) => {
                    info!(account = account.id, locator = %locator, label, method = %method, "Label synced");
                    return SyncOutcome::synced(method);
                }
                Err(e) => {
                    warn!(account = account.id, locator = %locator, label, method = %method, error = %e, "Label sync strategy failed");
                    failures.push(format!("{}: {}", method, e));
                }
            }
        }

        SyncOutcome::failed(last_tried, format!("all labeling strategies failed ({})", failures.join("; ")))
    }

    async fn apply(
        &self,
        session: &mut dyn MailboxSession,
        method: SyncMethod,
        uid: u32,
        label: &str,
    ) -> Result<()> {
        match method {
            SyncMethod::MailboxCopy => {
                ensure_mailbox(session, label).await?;
                session.copy_message(uid, label).await
            }
            SyncMethod::KeywordFlag => session.add_flag(uid, &keyword_for(label)).await,
            SyncMethod::StandardFlag => session.add_flag(uid, FLAGGED).await,
        }
    }

    /// Select the message's mailbox and return a verified UID
    async fn resolve(
        &self,
        session: &mut dyn MailboxSession,
        account: &Account,
        locator: &MessageLocator,
    ) -> Result<u32> {
        let mut drift = None;

        if let (Some(uid), Some(mailbox)) = (locator.uid, locator.mailbox.as_deref()) {
            // a stored mailbox that is gone or unreadable falls through to the Message-ID search
            match session.select(mailbox).await {
                Err(e) => debug!(mailbox, uid, error = %e, "Stored mailbox not selectable"),
                Ok(status) => {
                    let stale = matches!(
                        (locator.uid_validity, status.uid_validity),
                        (Some(stored), Some(current)) if stored != current
                    );

                    if stale {
                        debug!(mailbox, uid, "UIDVALIDITY changed, stored UID is stale");
                    } else {
                        match session.fetch_envelope(uid).await {
                            Ok(Some(envelope)) if locator.matches(&envelope) => return Ok(uid),
                            Ok(Some(envelope)) => {
                                drift = Some(format!(
                                    "{}:{} is '{}' from {}",
                                    mailbox, uid, envelope.subject, envelope.sender
                                ));
                            }
                            Ok(None) => debug!(mailbox, uid, "Stored UID no longer exists"),
                            Err(e) => debug!(mailbox, uid, error = %e, "Cannot fetch stored UID"),
                        }
                    }
                }
            }
        }

        let Some(message_id) = locator.message_id.as_deref() else {
            return Err(match drift {
                Some(detail) => TriageError::LocatorDrift(detail),
                None => TriageError::NotFound(format!("no usable locator for '{}'", locator.subject)),
            });
        };

        let mut candidates = vec![INBOX];
        if account.is_gmail_like() {
            candidates.push(GMAIL_ALL_MAIL);
        }

        for mailbox in candidates {
            if let Err(e) = session.select(mailbox).await {
                debug!(mailbox, error = %e, "Cannot select mailbox for Message-ID search");
                continue;
            }
            let uid = match session.search_message_id(message_id).await {
                Ok(Some(uid)) => uid,
                Ok(None) => continue,
                Err(e) => {
                    debug!(mailbox, message_id, error = %e, "Message-ID search failed");
                    continue;
                }
            };
            match session.fetch_envelope(uid).await {
                Ok(Some(envelope)) if locator.matches(&envelope) => {
                    debug!(mailbox, uid, message_id, "Located message by Message-ID");
                    return Ok(uid);
                }
                Ok(_) => {
                    drift = Some(format!("{}:{} does not match {}", mailbox, uid, message_id));
                }
                Err(e) => debug!(mailbox, uid, error = %e, "Cannot fetch candidate UID"),
            }
        }

        Err(match drift {
            Some(detail) => TriageError::LocatorDrift(detail),
            None => TriageError::NotFound(format!("message {}", message_id)),
        })
    }

    /// Create the system label mailboxes; safe to run repeatedly
    pub async fn initialize_system_labels_in_mailbox(&self, account: &Account) -> Result<Vec<LabelInitReport>> {
        let mut session = self.open_session(account).await?;
        let mut reports = Vec::with_capacity(SystemLabel::ALL.len());

        for system in SystemLabel::ALL {
            let name = system.name();
            let report = match ensure_mailbox(session.as_mut(), name).await {
                Ok(()) => LabelInitReport {
                    label: name.to_string(),
                    success: true,
                    error: None,
                },
                Err(e) => {
                    warn!(account = account.id, label = name, error = %e, "Failed to create label mailbox");
                    LabelInitReport {
                        label: name.to_string(),
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        if let Err(e) = session.logout().await {
            debug!(account = account.id, error = %e, "Logout failed");
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;

    fn account(provider: ProviderKind, host: &str) -> Account {
        Account {
            id: 1,
            user_id: Some(1),
            host: host.to_string(),
            port: 993,
            username: "me".to_string(),
            encrypted_password: "secret".to_string(),
            provider,
        }
    }

    #[test]
    fn test_keyword_for() {
        assert_eq!(keyword_for("Client Work"), "Client_Work");
        assert_eq!(keyword_for("R&D/2024"), "R_D_2024");
        assert_eq!(keyword_for("MOM"), "MOM");
        assert_eq!(keyword_for("Équipe"), "_quipe");
        assert_eq!(keyword_for("Client-Work"), "Client-Work");
    }

    #[test]
    fn test_standard_flag_applicability() {
        let imap = account(ProviderKind::Imap, "mail.example.com");
        let gmail = account(ProviderKind::Gmail, "imap.gmail.com");

        assert!(SyncMethod::StandardFlag.applies_to(&imap, "Urgent"));
        assert!(SyncMethod::StandardFlag.applies_to(&imap, "Critical Bugs"));
        assert!(!SyncMethod::StandardFlag.applies_to(&imap, "Newsletters"));
        assert!(!SyncMethod::StandardFlag.applies_to(&gmail, "Urgent"));
        assert!(SyncMethod::KeywordFlag.applies_to(&gmail, "Newsletters"));
    }

    #[test]
    fn test_locator_matching() {
        let locator = MessageLocator {
            uid: Some(5),
            mailbox: Some("INBOX".to_string()),
            uid_validity: None,
            message_id: None,
            subject: "Quarterly plan".to_string(),
            sender: "Boss <Boss@Corp.io>".to_string(),
        };

        assert!(locator.matches(&Envelope {
            subject: "Quarterly plan".to_string(),
            sender: "boss@corp.io".to_string(),
        }));
        assert!(locator.matches(&Envelope {
            subject: "=?UTF-8?Q?Quarterly_plan?=".to_string(),
            sender: "boss@corp.io".to_string(),
        }));
        assert!(!locator.matches(&Envelope {
            subject: "Quarterly plan".to_string(),
            sender: "other@corp.io".to_string(),
        }));
        assert!(!locator.matches(&Envelope {
            subject: "Something else".to_string(),
            sender: "boss@corp.io".to_string(),
        }));
        assert_eq!(locator.to_string(), "INBOX:5");
    }

    #[test]
    fn test_plaintext_passwords() {
        assert_eq!(PlaintextPasswords.decrypt("hunter2").unwrap(), "hunter2");
    }
}

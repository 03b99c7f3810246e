//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use mail_triage::cache::ClassificationCache;
use mail_triage::classifier::{
    ClassificationInput, ClassificationOrchestrator, Classifier, ContextPolicy, LlmClassifier,
    TierOutcome,
};
use mail_triage::config::LabelConfig;
use mail_triage::embedding::{EmbeddingProvider, ResilientEmbedder};
use mail_triage::error::{Result, TriageError};
use mail_triage::label_registry::find_or_create_label;
use mail_triage::llm::{LlmProvider, LlmRequest};
use mail_triage::mailbox::{Envelope, MailboxConnector, MailboxSession, MailboxStatus};
use mail_triage::models::{
    Account, ClassificationMethod, ClassificationResult, Embedding, Label, ParsedEmail,
    ProviderKind,
};
use mail_triage::rate_limiter::ProviderHealth;
use mail_triage::store::{self, SqliteStore};
use mail_triage::usage::MemoryUsageTracker;
use mockall::mock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const PRIMARY_MODEL: &str = "text-embedding-3-small";

// Mock implementations of the provider seams
mock! {
    pub Llm {}

    #[async_trait]
    impl LlmProvider for Llm {
        async fn classify(&self, request: &LlmRequest) -> Result<ClassificationResult>;
    }
}

mock! {
    pub Embedder {}

    #[async_trait]
    impl EmbeddingProvider for Embedder {
        fn model(&self) -> &str;
        async fn embed(&self, text: &str) -> Result<Embedding>;
    }
}

mock! {
    pub Tier {}

    #[async_trait]
    impl Classifier for Tier {
        fn method(&self) -> ClassificationMethod;
        fn estimated_cost(&self, input: &ClassificationInput) -> f64;
        async fn try_classify(&self, input: &ClassificationInput) -> TierOutcome;
        async fn observe(&self, input: &ClassificationInput, result: &ClassificationResult);
    }
}

/// A tier mock that ignores cost and observation calls
pub fn tier(method: ClassificationMethod, cost: f64) -> MockTier {
    let mut tier = MockTier::new();
    tier.expect_method().return_const(method);
    tier.expect_estimated_cost().return_const(cost);
    tier.expect_observe().returning(|_, _| ());
    tier
}

pub fn test_store() -> SqliteStore {
    SqliteStore::open_in_memory().unwrap()
}

pub fn gmail_account(user_id: Option<i64>) -> Account {
    Account {
        id: 0,
        user_id,
        host: "imap.gmail.com".to_string(),
        port: 993,
        username: "me@gmail.com".to_string(),
        encrypted_password: "app-password".to_string(),
        provider: ProviderKind::Gmail,
    }
}

pub fn imap_account(user_id: Option<i64>) -> Account {
    Account {
        id: 0,
        user_id,
        host: "mail.example.org".to_string(),
        port: 993,
        username: "me@example.org".to_string(),
        encrypted_password: "secret".to_string(),
        provider: ProviderKind::Imap,
    }
}

/// Insert the account and return it with its id
pub async fn add_account(store: &SqliteStore, account: Account) -> Account {
    let id = store.insert_account(&account).await.unwrap();
    Account { id, ..account }
}

/// Create a test email with default values
pub fn parsed_email(subject: &str, body: &str, sender: &str) -> ParsedEmail {
    let slug: String = subject
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(24)
        .collect();
    ParsedEmail {
        subject: subject.to_string(),
        body: body.to_string(),
        sender: sender.to_string(),
        received_at: Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap(),
        message_id: Some(format!("<{}@mail.test>", slug.to_lowercase())),
        imap_uid: None,
        imap_mailbox: None,
        imap_uid_validity: None,
    }
}

/// Email stored at `mailbox:uid` under the given UIDVALIDITY
pub fn located_email(subject: &str, sender: &str, mailbox: &str, uid: u32, uid_validity: u32) -> ParsedEmail {
    ParsedEmail {
        imap_uid: Some(uid),
        imap_mailbox: Some(mailbox.to_string()),
        imap_uid_validity: Some(uid_validity),
        ..parsed_email(subject, "Hello", sender)
    }
}

pub async fn add_email(store: &SqliteStore, account_id: i64, email: &ParsedEmail) -> i64 {
    store.insert_email(account_id, email).await.unwrap()
}

/// Create a user-visible label the way approval does
pub async fn add_user_label(store: &SqliteStore, user_id: i64, name: &str) -> Label {
    let name = name.to_string();
    store
        .transaction(move |tx| {
            let (label, _) = find_or_create_label(tx, &name, user_id, &["#1a73e8".to_string()])?;
            store::add_user_label(tx, user_id, label.id)?;
            Ok(label)
        })
        .await
        .unwrap()
}

pub fn llm_result(label: &str) -> ClassificationResult {
    ClassificationResult {
        is_hierarchy: false,
        is_client: false,
        is_meeting: false,
        is_escalation: false,
        is_urgent: false,
        suggested_label: label.to_string(),
        reasoning: format!("Looks like {}", label),
        confidence: Some(0.7),
        method: None,
    }
}

pub fn embedding(vector: Vec<f32>, model: &str) -> Embedding {
    Embedding {
        vector,
        model: model.to_string(),
    }
}

/// An embedder whose primary backend always returns `vector`
pub fn fixed_embedder(vector: Vec<f32>) -> ResilientEmbedder {
    let mut primary = MockEmbedder::new();
    primary.expect_model().return_const(PRIMARY_MODEL.to_string());
    primary
        .expect_embed()
        .returning(move |_| Ok(embedding(vector.clone(), PRIMARY_MODEL)));
    ResilientEmbedder::new(Arc::new(primary), None).with_retry(1, std::time::Duration::from_millis(1))
}

pub fn llm_tier(method: ClassificationMethod, provider: MockLlm) -> LlmClassifier {
    LlmClassifier::new(
        method,
        Arc::new(provider),
        ProviderHealth::new(method.as_str(), 60),
        ContextPolicy::default(),
    )
}

/// The standard waterfall over mocked LLM tiers
pub fn standard_classifier(
    store: &SqliteStore,
    primary: MockLlm,
    fallback: MockLlm,
    usage: MemoryUsageTracker,
) -> ClassificationOrchestrator {
    let cache = Arc::new(ClassificationCache::new(store.clone(), Duration::days(30), 64));
    ClassificationOrchestrator::standard(
        cache,
        llm_tier(ClassificationMethod::LlmPrimary, primary),
        llm_tier(ClassificationMethod::LlmFallback, fallback),
        Arc::new(usage),
    )
}

/// An LLM mock that answers every call with `label`
pub fn answering_llm(label: &'static str) -> MockLlm {
    let mut llm = MockLlm::new();
    llm.expect_classify().returning(move |_| Ok(llm_result(label)));
    llm
}

/// An LLM mock that must never be called
pub fn silent_llm() -> MockLlm {
    let mut llm = MockLlm::new();
    llm.expect_classify().never();
    llm
}

pub fn label_settings() -> LabelConfig {
    LabelConfig::default()
}

// ---------------------------------------------------------------------------
// Recording mailbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub uid: u32,
    pub message_id: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Default)]
pub struct FakeFolder {
    pub uid_validity: u32,
    pub messages: Vec<FakeMessage>,
}

#[derive(Debug, Default)]
pub struct MailboxState {
    pub folders: HashMap<String, FakeFolder>,
    pub selected: Option<String>,
    pub selects: Vec<String>,
    pub created: Vec<String>,
    /// (selected mailbox, uid, target)
    pub copies: Vec<(String, u32, String)>,
    /// (selected mailbox, uid, flag)
    pub flags: Vec<(String, u32, String)>,
    pub fail_create: bool,
    pub fail_copy: bool,
    pub fail_flags: bool,
    /// Reject keywords but still accept system flags such as `\Flagged`
    pub fail_keywords: bool,
    pub fail_connect: bool,
    /// Mailbox whose Message-ID search answers with `BAD`
    pub fail_search_in: Option<String>,
    pub connects: usize,
    pub logouts: usize,
}

/// In-memory IMAP server shared by every session it hands out
#[derive(Clone, Default)]
pub struct FakeMailbox {
    pub state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        let mailbox = Self::default();
        mailbox.add_folder("INBOX", 1);
        mailbox
    }

    pub fn add_folder(&self, name: &str, uid_validity: u32) {
        self.state.lock().unwrap().folders.insert(
            name.to_string(),
            FakeFolder {
                uid_validity,
                messages: Vec::new(),
            },
        );
    }

    pub fn deliver(&self, folder: &str, uid: u32, email: &ParsedEmail) {
        let mut state = self.state.lock().unwrap();
        let folder = state.folders.entry(folder.to_string()).or_default();
        folder.messages.push(FakeMessage {
            uid,
            message_id: email.message_id.clone().unwrap_or_default(),
            envelope: Envelope {
                subject: email.subject.clone(),
                sender: email.sender.clone(),
            },
        });
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut MailboxState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl MailboxConnector for FakeMailbox {
    async fn connect(&self, _account: &Account, password: &str) -> Result<Box<dyn MailboxSession>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect || password.is_empty() {
            return Err(TriageError::MailboxError("connection refused".to_string()));
        }
        state.connects += 1;
        state.selected = None;
        Ok(Box::new(RecordingSession {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct RecordingSession {
    state: Arc<Mutex<MailboxState>>,
}

fn selected_message(state: &MailboxState, uid: u32) -> Option<FakeMessage> {
    let selected = state.selected.as_ref()?;
    state
        .folders
        .get(selected)?
        .messages
        .iter()
        .find(|m| m.uid == uid)
        .cloned()
}

#[async_trait]
impl MailboxSession for RecordingSession {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let mut state = self.state.lock().unwrap();
        state.selects.push(mailbox.to_string());
        let Some(folder) = state.folders.get(mailbox).cloned() else {
            return Err(TriageError::MailboxError(format!("NO [NONEXISTENT] {}", mailbox)));
        };
        state.selected = Some(mailbox.to_string());
        Ok(MailboxStatus {
            uid_validity: Some(folder.uid_validity),
            exists: folder.messages.len() as u32,
        })
    }

    async fn search_message_id(&mut self, message_id: &str) -> Result<Option<u32>> {
        let state = self.state.lock().unwrap();
        let Some(selected) = state.selected.as_ref() else {
            return Err(TriageError::MailboxError("no mailbox selected".to_string()));
        };
        if state.fail_search_in.as_ref() == Some(selected) {
            return Err(TriageError::MailboxError("BAD search failed".to_string()));
        }
        Ok(state.folders.get(selected).and_then(|folder| {
            folder
                .messages
                .iter()
                .filter(|m| m.message_id == message_id)
                .map(|m| m.uid)
                .max()
        }))
    }

    async fn fetch_envelope(&mut self, uid: u32) -> Result<Option<Envelope>> {
        let state = self.state.lock().unwrap();
        Ok(selected_message(&state, uid).map(|m| m.envelope))
    }

    async fn create_mailbox(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(TriageError::MailboxError("NO [CANNOT] permission denied".to_string()));
        }
        if state.folders.contains_key(name) {
            return Err(TriageError::MailboxError("NO [ALREADYEXISTS] Mailbox already exists".to_string()));
        }
        state.folders.insert(
            name.to_string(),
            FakeFolder {
                uid_validity: 1,
                messages: Vec::new(),
            },
        );
        state.created.push(name.to_string());
        Ok(())
    }

    async fn copy_message(&mut self, uid: u32, target: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_copy {
            return Err(TriageError::MailboxError("NO [CANNOT] copy refused".to_string()));
        }
        let Some(message) = selected_message(&state, uid) else {
            return Err(TriageError::MailboxError(format!("NO no message with UID {}", uid)));
        };
        let selected = state.selected.clone().unwrap_or_default();
        if let Some(folder) = state.folders.get_mut(target) {
            let next_uid = folder.messages.len() as u32 + 1;
            folder.messages.push(FakeMessage {
                uid: next_uid,
                ..message
            });
        }
        state.copies.push((selected, uid, target.to_string()));
        Ok(())
    }

    async fn add_flag(&mut self, uid: u32, flag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_flags {
            return Err(TriageError::MailboxError("NO [CANNOT] flags not permitted".to_string()));
        }
        if state.fail_keywords && !flag.starts_with('\\') {
            return Err(TriageError::MailboxError("NO [CANNOT] keywords not permitted".to_string()));
        }
        if selected_message(&state, uid).is_none() {
            return Err(TriageError::MailboxError(format!("NO no message with UID {}", uid)));
        }
        let selected = state.selected.clone().unwrap_or_default();
        state.flags.push((selected, uid, flag.to_string()));
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.state.lock().unwrap().logouts += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_email_defaults() {
        let email = parsed_email("Quarterly Review", "Body", "boss@corp.io");
        assert_eq!(email.message_id.as_deref(), Some("<quarterlyreview@mail.test>"));
        assert!(email.imap_uid.is_none());
    }

    #[tokio::test]
    async fn test_fake_mailbox_records_copies() {
        let mailbox = FakeMailbox::new();
        let email = parsed_email("Hi", "Body", "a@b.c");
        mailbox.deliver("INBOX", 7, &email);

        let mut session = mailbox.connect(&imap_account(Some(1)), "pw").await.unwrap();
        session.select("INBOX").await.unwrap();
        session.create_mailbox("Work").await.unwrap();
        session.copy_message(7, "Work").await.unwrap();
        assert!(session.create_mailbox("Work").await.unwrap_err().is_already_exists());
        session.logout().await.unwrap();

        mailbox.with_state(|state| {
            assert_eq!(state.copies, vec![("INBOX".to_string(), 7, "Work".to_string())]);
            assert_eq!(state.connects, 1);
            assert_eq!(state.logouts, 1);
        });
    }
}

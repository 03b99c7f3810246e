//! Label lookup, creation and assignment
//!
//! System labels are process-wide singletons created on first use and cached
//! by lowercase name. User labels are only ever created through the approval
//! workflow; everything else looks labels up.
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use rusqlite::Connection;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, TriageError};
use crate::models::{AssignedBy, Label, SystemLabel};
use crate::store::{self, SqliteStore};

const FALLBACK_COLOR: &str = "#616161";

static INVALID_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s/&\-\.]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static SLASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*/+\s*").unwrap());

/// Normalize a label name for storage and for use as a mailbox name.
///
/// Keeps letters, digits, spaces, `/`, `&`, `-` and `.`; collapses runs of
/// whitespace and slashes and strips leading/trailing separators. Case is
/// preserved.
pub fn sanitize_label_name(name: &str) -> Result<String> {
    let sanitized = INVALID_CHARS.replace_all(name.trim(), " ");
    let sanitized = WHITESPACE.replace_all(&sanitized, " ");
    let sanitized = SLASHES.replace_all(&sanitized, "/");
    let sanitized = sanitized.trim_matches(|c: char| c == '/' || c.is_whitespace());

    if sanitized.is_empty() {
        return Err(TriageError::ConfigError(format!(
            "Label name '{}' is empty after sanitizing",
            name
        )));
    }
    Ok(sanitized.to_string())
}

/// Random color from the palette
pub fn pick_color(palette: &[String]) -> String {
    palette
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_else(|| FALLBACK_COLOR.to_string())
}

/// Find the user's label by name or create it with a palette color.
/// Returns the label and whether it was created.
pub fn find_or_create_label(
    conn: &Connection,
    name: &str,
    user_id: i64,
    palette: &[String],
) -> Result<(Label, bool)> {
    let name = sanitize_label_name(name)?;
    if let Some(label) = store::find_label(conn, &name, Some(user_id))? {
        return Ok((label, false));
    }

    match store::insert_label(conn, &name, &pick_color(palette), false, Some(user_id)) {
        Ok(label) => {
            info!(label = %label.name, label_id = label.id, user_id, "Created label");
            Ok((label, true))
        }
        Err(e @ TriageError::ConstraintViolation(_)) => store::find_label(conn, &name, Some(user_id))?
            .map(|label| (label, false))
            .ok_or(e),
        Err(e) => Err(e),
    }
}

/// Attach `label` to an email and record its name on the email row
pub fn assign_label(
    conn: &Connection,
    email_id: i64,
    label: &Label,
    assigned_by: AssignedBy,
    confidence: f32,
    now: DateTime<Utc>,
) -> Result<()> {
    store::upsert_assignment(conn, email_id, label.id, assigned_by, confidence, now)?;
    store::add_label_name(conn, email_id, &label.name)?;
    Ok(())
}

pub struct LabelRegistry {
    store: SqliteStore,
    palette: Vec<String>,
    system_cache: Mutex<HashMap<String, Label>>,
}

impl LabelRegistry {
    pub fn new(store: SqliteStore, palette: Vec<String>) -> Self {
        Self {
            store,
            palette,
            system_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn palette(&self) -> &[String] {
        &self.palette
    }

    /// Get or lazily create a system label
    pub async fn ensure_system_label(&self, system: SystemLabel) -> Result<Label> {
        let key = system.name().to_lowercase();
        if let Some(label) = self.system_cache.lock().await.get(&key) {
            return Ok(label.clone());
        }

        let label = self
            .store
            .transaction(move |tx| {
                if let Some(label) = store::find_label(tx, system.name(), None)? {
                    return Ok(label);
                }
                debug!(label = system.name(), "Creating system label");
                store::insert_label(tx, system.name(), system.color(), true, None)
            })
            .await?;

        self.system_cache.lock().await.insert(key, label.clone());
        Ok(label)
    }

    pub async fn ensure_system_labels(&self) -> Result<Vec<Label>> {
        let mut labels = Vec::with_capacity(SystemLabel::ALL.len());
        for system in SystemLabel::ALL {
            labels.push(self.ensure_system_label(system).await?);
        }
        Ok(labels)
    }

    /// Existing label visible to the user (their own or a system label)
    pub async fn find_for_user(&self, name: &str, user_id: i64) -> Result<Option<Label>> {
        let name = sanitize_label_name(name)?;
        self.store
            .with_conn(move |conn| store::find_label(conn, &name, Some(user_id)))
            .await
    }

    pub async fn labels_for_user(&self, user_id: i64) -> Result<Vec<Label>> {
        self.store
            .with_conn(move |conn| store::labels_for_user(conn, user_id))
            .await
    }

    pub async fn assign(
        &self,
        email_id: i64,
        label: &Label,
        assigned_by: AssignedBy,
        confidence: f32,
    ) -> Result<()> {
        let owned = label.clone();
        self.store
            .transaction(move |tx| {
                assign_label(tx, email_id, &owned, assigned_by, confidence, Utc::now())
            })
            .await?;
        debug!(email_id, label = %label.name, assigned_by = assigned_by.as_str(), "Assigned label");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, ParsedEmail, ProviderKind};

    #[test]
    fn test_sanitize_label_name() {
        let test_cases = vec![
            ("  Client Work ", "Client Work"),
            ("Finance/Invoices", "Finance/Invoices"),
            ("a // b", "a/b"),
            ("/Projects/", "Projects"),
            ("R&D  team", "R&D team"),
            ("Hello: World!", "Hello World"),
            ("MOM", "MOM"),
        ];

        for (input, expected) in test_cases {
            assert_eq!(sanitize_label_name(input).unwrap(), expected, "input: {:?}", input);
        }

        assert!(sanitize_label_name("   ").is_err());
        assert!(sanitize_label_name("!!!").is_err());
    }

    #[test]
    fn test_pick_color() {
        let palette = vec!["#111111".to_string(), "#222222".to_string()];
        assert!(palette.contains(&pick_color(&palette)));
        assert_eq!(pick_color(&[]), FALLBACK_COLOR);
    }

    #[tokio::test]
    async fn test_system_labels_are_singletons() {
        let store = SqliteStore::open_in_memory().unwrap();
        let registry = LabelRegistry::new(store.clone(), vec![]);

        let first = registry.ensure_system_label(SystemLabel::Urgent).await.unwrap();
        let again = registry.ensure_system_label(SystemLabel::Urgent).await.unwrap();
        assert_eq!(first.id, again.id);
        assert!(first.is_system);

        // A fresh registry over the same store finds the stored row
        let other = LabelRegistry::new(store, vec![]);
        let found = other.ensure_system_label(SystemLabel::Urgent).await.unwrap();
        assert_eq!(found.id, first.id);

        let all = other.ensure_system_labels().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].name, "MOM");
    }

    #[tokio::test]
    async fn test_find_or_create_is_case_insensitive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let palette = vec!["#123456".to_string()];

        let (created, was_created) = store
            .with_conn(|conn| find_or_create_label(conn, "Client Work", 7, &palette))
            .await
            .unwrap();
        assert!(was_created);
        assert_eq!(created.color, "#123456");

        let (found, was_created) = store
            .with_conn(|conn| find_or_create_label(conn, "client  work", 7, &palette))
            .await
            .unwrap();
        assert!(!was_created);
        assert_eq!(found.id, created.id);

        // Another user gets their own label
        let (theirs, was_created) = store
            .with_conn(|conn| find_or_create_label(conn, "Client Work", 8, &palette))
            .await
            .unwrap();
        assert!(was_created);
        assert_ne!(theirs.id, created.id);
    }

    #[tokio::test]
    async fn test_assign_records_name_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let account_id = store
            .insert_account(&Account {
                id: 0,
                user_id: Some(1),
                host: "imap.example.com".to_string(),
                port: 993,
                username: "u".to_string(),
                encrypted_password: "p".to_string(),
                provider: ProviderKind::Imap,
            })
            .await
            .unwrap();
        let email_id = store
            .insert_email(
                account_id,
                &ParsedEmail {
                    subject: "s".to_string(),
                    body: "b".to_string(),
                    sender: "a@b.c".to_string(),
                    received_at: Utc::now(),
                    message_id: None,
                    imap_uid: None,
                    imap_mailbox: None,
                    imap_uid_validity: None,
                },
            )
            .await
            .unwrap();

        let registry = LabelRegistry::new(store.clone(), vec![]);
        let urgent = registry.ensure_system_label(SystemLabel::Urgent).await.unwrap();
        registry.assign(email_id, &urgent, AssignedBy::System, 1.0).await.unwrap();
        registry.assign(email_id, &urgent, AssignedBy::Admin, 0.5).await.unwrap();

        let assignments = store.assignments_for_email(email_id).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].assigned_by, AssignedBy::Admin);

        let email = store.get_email(email_id).await.unwrap();
        assert_eq!(email.label_names, vec!["Urgent".to_string()]);
    }
}

//! SQLite persistence for emails, classification metadata, labels, suggestions
//! and label centroids.
//!
//! A single connection sits behind a `tokio::sync::Mutex`; every operation
//! takes the lock for the duration of one synchronous rusqlite call sequence.
//! Multi-step mutations go through [`SqliteStore::transaction`], which opens an
//! IMMEDIATE transaction so concurrent writers serialize instead of racing.
//!
//! The free functions in this module take `&Connection` so they compose inside
//! a transaction (a `Transaction` derefs to `Connection`).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, TriageError};
use crate::models::{
    Account, AssignedBy, ClassificationResult, EmailLabelAssignment,
    EmailMeta, Embedding, FewShotExample, Label, LabelCentroid, MethodUsage, NewSuggestion,
    ParsedEmail, PendingLabelSuggestion, StoredEmail, SuggestionStatus, UsageRecord, UsageSummary,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    username TEXT NOT NULL,
    encrypted_password TEXT NOT NULL,
    provider TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS emails (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    sender TEXT NOT NULL,
    received_at TEXT NOT NULL,
    message_id TEXT,
    imap_uid INTEGER,
    imap_mailbox TEXT,
    imap_uid_validity INTEGER,
    label_names TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_emails_subject_sender ON emails(subject, sender);
CREATE INDEX IF NOT EXISTS idx_emails_account ON emails(account_id, received_at);

CREATE TABLE IF NOT EXISTS email_meta (
    email_id INTEGER PRIMARY KEY REFERENCES emails(id),
    classification TEXT NOT NULL,
    is_hierarchy INTEGER NOT NULL,
    is_client INTEGER NOT NULL,
    is_meeting INTEGER NOT NULL,
    is_escalation INTEGER NOT NULL,
    is_urgent INTEGER NOT NULL,
    suggested_label TEXT NOT NULL,
    method TEXT,
    embedding TEXT,
    embedding_model TEXT,
    has_mom_received INTEGER NOT NULL DEFAULT 0,
    related_meeting_id INTEGER,
    classified_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_email_meta_model ON email_meta(embedding_model);

CREATE TABLE IF NOT EXISTS labels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL,
    color TEXT NOT NULL,
    is_system INTEGER NOT NULL DEFAULT 0,
    user_id INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_labels_scope ON labels(name_key, IFNULL(user_id, 0));

CREATE TABLE IF NOT EXISTS user_labels (
    user_id INTEGER NOT NULL,
    label_id INTEGER NOT NULL REFERENCES labels(id),
    PRIMARY KEY (user_id, label_id)
);

CREATE TABLE IF NOT EXISTS email_labels (
    email_id INTEGER NOT NULL REFERENCES emails(id),
    label_id INTEGER NOT NULL REFERENCES labels(id),
    assigned_by TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    assigned_at TEXT NOT NULL,
    PRIMARY KEY (email_id, label_id)
);

CREATE TABLE IF NOT EXISTS pending_label_suggestions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email_id INTEGER NOT NULL REFERENCES emails(id),
    user_id INTEGER NOT NULL,
    suggested_label TEXT NOT NULL,
    label_key TEXT NOT NULL,
    suggested_by TEXT NOT NULL,
    confidence REAL,
    reasoning TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    approved_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    processed_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_suggestion_unique
    ON pending_label_suggestions(email_id, label_key) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_suggestions_user_status
    ON pending_label_suggestions(user_id, status);

CREATE TABLE IF NOT EXISTS label_centroids (
    label_id INTEGER NOT NULL REFERENCES labels(id),
    model TEXT NOT NULL,
    centroid TEXT NOT NULL,
    email_count INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (label_id, model)
);

CREATE TABLE IF NOT EXISTS classification_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email_id INTEGER,
    method TEXT NOT NULL,
    estimated_cost REAL NOT NULL,
    cost_saved REAL NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Shared handle over the SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        debug!("Opening database at {:?}", path);
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        info!("Database ready at {:?}", path);
        Ok(store)
    }

    /// In-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send,
        T: Send,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction; any error rolls back
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send,
        T: Send,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub async fn insert_account(&self, account: &Account) -> Result<i64> {
        self.with_conn(|conn| insert_account(conn, account)).await
    }

    pub async fn get_account(&self, account_id: i64) -> Result<Account> {
        self.with_conn(move |conn| get_account(conn, account_id)).await
    }

    pub async fn accounts(&self) -> Result<Vec<Account>> {
        self.with_conn(list_accounts).await
    }

    pub async fn insert_email(&self, account_id: i64, email: &ParsedEmail) -> Result<i64> {
        self.with_conn(move |conn| insert_email(conn, account_id, email))
            .await
    }

    pub async fn get_email(&self, email_id: i64) -> Result<StoredEmail> {
        self.with_conn(move |conn| get_email(conn, email_id)).await
    }

    pub async fn unclassified_emails(&self, account_id: i64) -> Result<Vec<i64>> {
        self.with_conn(move |conn| unclassified_email_ids(conn, account_id))
            .await
    }

    pub async fn get_email_meta(&self, email_id: i64) -> Result<Option<EmailMeta>> {
        self.with_conn(move |conn| get_email_meta(conn, email_id)).await
    }

    pub async fn assignments_for_email(&self, email_id: i64) -> Result<Vec<EmailLabelAssignment>> {
        self.with_conn(move |conn| assignments_for_email(conn, email_id))
            .await
    }

    pub async fn list_pending_suggestions(
        &self,
        user_id: Option<i64>,
    ) -> Result<Vec<PendingLabelSuggestion>> {
        self.with_conn(move |conn| list_pending_suggestions(conn, user_id))
            .await
    }

    pub async fn get_suggestion(&self, id: i64) -> Result<Option<PendingLabelSuggestion>> {
        self.with_conn(move |conn| get_suggestion(conn, id)).await
    }

    /// Idempotent: an existing pending suggestion for the same (email, label)
    /// is returned as-is. The bool is true when a new row was created.
    pub async fn upsert_pending_suggestion(
        &self,
        suggestion: &NewSuggestion,
    ) -> Result<(PendingLabelSuggestion, bool)> {
        self.transaction(|tx| upsert_pending_suggestion(tx, suggestion, Utc::now()))
            .await
    }

    pub async fn usage_summary(&self) -> Result<UsageSummary> {
        self.with_conn(usage_summary).await
    }
}

/// Case- and whitespace-insensitive key for label-name comparisons.
///
/// Stored as `labels.name_key`; SQLite's `lower()` only folds ASCII.
pub fn label_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = TriageError>,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ---------------------------------------------------------------------------
// Accounts and emails
// ---------------------------------------------------------------------------

pub fn insert_account(conn: &Connection, account: &Account) -> Result<i64> {
    conn.execute(
        "INSERT INTO accounts (user_id, host, port, username, encrypted_password, provider)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            account.user_id,
            account.host,
            account.port,
            account.username,
            account.encrypted_password,
            account.provider.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_account(row: &Row) -> rusqlite::Result<Account> {
    let provider: String = row.get(6)?;
    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        encrypted_password: row.get(5)?,
        provider: parse_column(6, &provider)?,
    })
}

const ACCOUNT_COLUMNS: &str = "id, user_id, host, port, username, encrypted_password, provider";

pub fn get_account(conn: &Connection, account_id: i64) -> Result<Account> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
        params![account_id],
        row_to_account,
    )
    .optional()?
    .ok_or_else(|| TriageError::NotFound(format!("account {}", account_id)))
}

pub fn list_accounts(conn: &Connection) -> Result<Vec<Account>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS))?;
    let accounts = stmt
        .query_map([], row_to_account)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(accounts)
}

/// Owning user of an account, if any
pub fn account_owner(conn: &Connection, account_id: i64) -> Result<Option<i64>> {
    let owner: Option<Option<i64>> = conn
        .query_row(
            "SELECT user_id FROM accounts WHERE id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        Some(user_id) => Ok(user_id),
        None => Err(TriageError::NotFound(format!("account {}", account_id))),
    }
}

pub fn insert_email(conn: &Connection, account_id: i64, email: &ParsedEmail) -> Result<i64> {
    conn.execute(
        "INSERT INTO emails (account_id, subject, body, sender, received_at, message_id,
                             imap_uid, imap_mailbox, imap_uid_validity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            account_id,
            email.subject,
            email.body,
            email.sender,
            email.received_at,
            email.message_id,
            email.imap_uid,
            email.imap_mailbox,
            email.imap_uid_validity,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_email(conn: &Connection, email_id: i64) -> Result<StoredEmail> {
    conn.query_row(
        "SELECT id, account_id, subject, body, sender, received_at, message_id,
                imap_uid, imap_mailbox, imap_uid_validity, label_names
         FROM emails WHERE id = ?1",
        params![email_id],
        |row| {
            let label_names: String = row.get(10)?;
            Ok(StoredEmail {
                id: row.get(0)?,
                account_id: row.get(1)?,
                email: ParsedEmail {
                    subject: row.get(2)?,
                    body: row.get(3)?,
                    sender: row.get(4)?,
                    received_at: row.get(5)?,
                    message_id: row.get(6)?,
                    imap_uid: row.get(7)?,
                    imap_mailbox: row.get(8)?,
                    imap_uid_validity: row.get(9)?,
                },
                label_names: json_column(10, &label_names)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| TriageError::NotFound(format!("email {}", email_id)))
}

/// Emails of one account without classification metadata, in delivery order
pub fn unclassified_email_ids(conn: &Connection, account_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT e.id FROM emails e
         LEFT JOIN email_meta m ON m.email_id = e.id
         WHERE e.account_id = ?1 AND m.email_id IS NULL
         ORDER BY e.received_at, e.id",
    )?;
    let ids = stmt
        .query_map(params![account_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// Append a label name to the email's denormalized list. Returns false when
/// the name (case-insensitively) was already present.
pub fn add_label_name(conn: &Connection, email_id: i64, name: &str) -> Result<bool> {
    let raw: String = conn
        .query_row(
            "SELECT label_names FROM emails WHERE id = ?1",
            params![email_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| TriageError::NotFound(format!("email {}", email_id)))?;

    let mut names: Vec<String> = serde_json::from_str(&raw)?;
    let key = label_key(name);
    if names.iter().any(|existing| label_key(existing) == key) {
        return Ok(false);
    }
    names.push(name.to_string());

    conn.execute(
        "UPDATE emails SET label_names = ?1 WHERE id = ?2",
        params![serde_json::to_string(&names)?, email_id],
    )?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Classification metadata
// ---------------------------------------------------------------------------

/// Insert or update the 1:1 metadata row. A missing embedding keeps any
/// previously stored vector together with its model tag.
pub fn upsert_email_meta(
    conn: &Connection,
    email_id: i64,
    result: &ClassificationResult,
    embedding: Option<&Embedding>,
    now: DateTime<Utc>,
) -> Result<()> {
    let classification = serde_json::to_string(result)?;
    let vector = embedding
        .map(|e| serde_json::to_string(&e.vector))
        .transpose()?;
    let model = embedding.map(|e| e.model.clone());

    conn.execute(
        "INSERT INTO email_meta (email_id, classification, is_hierarchy, is_client, is_meeting,
                                 is_escalation, is_urgent, suggested_label, method, embedding,
                                 embedding_model, classified_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?12)
         ON CONFLICT(email_id) DO UPDATE SET
            classification = excluded.classification,
            is_hierarchy = excluded.is_hierarchy,
            is_client = excluded.is_client,
            is_meeting = excluded.is_meeting,
            is_escalation = excluded.is_escalation,
            is_urgent = excluded.is_urgent,
            suggested_label = excluded.suggested_label,
            method = excluded.method,
            embedding = CASE WHEN excluded.embedding IS NULL
                             THEN email_meta.embedding ELSE excluded.embedding END,
            embedding_model = CASE WHEN excluded.embedding IS NULL
                                   THEN email_meta.embedding_model ELSE excluded.embedding_model END,
            classified_at = CASE WHEN excluded.method = 'cache'
                                 THEN email_meta.classified_at ELSE excluded.classified_at END,
            updated_at = excluded.updated_at",
        params![
            email_id,
            classification,
            result.is_hierarchy,
            result.is_client,
            result.is_meeting,
            result.is_escalation,
            result.is_urgent,
            result.suggested_label,
            result.method.map(|m| m.as_str()),
            vector,
            model,
            now,
        ],
    )?;
    Ok(())
}

pub fn set_mom_received(conn: &Connection, email_id: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE email_meta SET has_mom_received = 1, updated_at = ?1 WHERE email_id = ?2",
        params![now, email_id],
    )?;
    Ok(())
}

pub fn get_email_meta(conn: &Connection, email_id: i64) -> Result<Option<EmailMeta>> {
    let meta = conn
        .query_row(
            "SELECT email_id, classification, embedding, embedding_model, has_mom_received,
                    related_meeting_id, created_at, updated_at
             FROM email_meta WHERE email_id = ?1",
            params![email_id],
            |row| {
                let classification: String = row.get(1)?;
                let vector: Option<String> = row.get(2)?;
                let model: Option<String> = row.get(3)?;
                let embedding = match (vector, model) {
                    (Some(vector), Some(model)) => Some(Embedding {
                        vector: json_column(2, &vector)?,
                        model,
                    }),
                    _ => None,
                };
                Ok(EmailMeta {
                    email_id: row.get(0)?,
                    classification: json_column(1, &classification)?,
                    embedding,
                    has_mom_received: row.get(4)?,
                    related_meeting_id: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(meta)
}

/// Most recent original classification of an email with the same subject
/// and sender, classified at or after `since`, with its classification time.
///
/// Floor results and cache replays are skipped, so a replay never extends
/// the life of the result it copied.
pub fn find_cached_classification(
    conn: &Connection,
    subject: &str,
    sender: &str,
    since: DateTime<Utc>,
) -> Result<Option<(ClassificationResult, DateTime<Utc>)>> {
    let row: Option<(String, DateTime<Utc>)> = conn
        .query_row(
            "SELECT m.classification, m.classified_at FROM email_meta m
             JOIN emails e ON e.id = m.email_id
             WHERE e.subject = ?1 AND e.sender = ?2 AND m.classified_at >= ?3
               AND (m.method IS NULL OR m.method NOT IN ('regex_fallback', 'cache'))
             ORDER BY m.classified_at DESC
             LIMIT 1",
            params![subject, sender, since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(json, classified_at)| {
        serde_json::from_str(&json)
            .map(|result| (result, classified_at))
            .map_err(TriageError::from)
    })
    .transpose()
}

/// (email_id, vector) for every stored embedding produced by `model`
pub fn email_embeddings_for_model(conn: &Connection, model: &str) -> Result<Vec<(i64, Vec<f32>)>> {
    let mut stmt = conn.prepare(
        "SELECT email_id, embedding FROM email_meta
         WHERE embedding IS NOT NULL AND embedding_model = ?1",
    )?;
    let rows = stmt
        .query_map(params![model], |row| {
            let raw: String = row.get(1)?;
            Ok((row.get(0)?, json_column(1, &raw)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Labels and assignments
// ---------------------------------------------------------------------------

const LABEL_COLUMNS: &str = "id, name, color, is_system, user_id";

fn row_to_label(row: &Row) -> rusqlite::Result<Label> {
    Ok(Label {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        is_system: row.get(3)?,
        user_id: row.get(4)?,
    })
}

/// Look up a label by name. With a user, the user's own labels and system
/// labels are visible; without one, only unowned labels.
pub fn find_label(conn: &Connection, name: &str, user_id: Option<i64>) -> Result<Option<Label>> {
    let key = label_key(name);
    let label = match user_id {
        Some(user_id) => conn
            .query_row(
                &format!(
                    "SELECT {} FROM labels
                     WHERE name_key = ?1 AND (user_id = ?2 OR is_system = 1)
                     ORDER BY is_system DESC LIMIT 1",
                    LABEL_COLUMNS
                ),
                params![key, user_id],
                row_to_label,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!(
                    "SELECT {} FROM labels WHERE name_key = ?1 AND user_id IS NULL",
                    LABEL_COLUMNS
                ),
                params![key],
                row_to_label,
            )
            .optional()?,
    };
    Ok(label)
}

pub fn get_label(conn: &Connection, label_id: i64) -> Result<Label> {
    conn.query_row(
        &format!("SELECT {} FROM labels WHERE id = ?1", LABEL_COLUMNS),
        params![label_id],
        row_to_label,
    )
    .optional()?
    .ok_or_else(|| TriageError::NotFound(format!("label {}", label_id)))
}

pub fn insert_label(
    conn: &Connection,
    name: &str,
    color: &str,
    is_system: bool,
    user_id: Option<i64>,
) -> Result<Label> {
    match conn.execute(
        "INSERT INTO labels (name, name_key, color, is_system, user_id) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![name, label_key(name), color, is_system, user_id],
    ) {
        Ok(_) => Ok(Label {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            color: color.to_string(),
            is_system,
            user_id,
        }),
        Err(e) if is_constraint_violation(&e) => Err(TriageError::ConstraintViolation(format!(
            "label '{}' already exists",
            name
        ))),
        Err(e) => Err(e.into()),
    }
}

/// System labels plus the user's label set
pub fn labels_for_user(conn: &Connection, user_id: i64) -> Result<Vec<Label>> {
    let mut stmt = conn.prepare(
        "SELECT l.id, l.name, l.color, l.is_system, l.user_id FROM labels l
         WHERE l.is_system = 1
            OR l.id IN (SELECT label_id FROM user_labels WHERE user_id = ?1)
         ORDER BY l.is_system DESC, l.name",
    )?;
    let labels = stmt
        .query_map(params![user_id], row_to_label)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(labels)
}

pub fn add_user_label(conn: &Connection, user_id: i64, label_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_labels (user_id, label_id) VALUES (?1, ?2)",
        params![user_id, label_id],
    )?;
    Ok(())
}

/// Insert or update the (email, label) edge
pub fn upsert_assignment(
    conn: &Connection,
    email_id: i64,
    label_id: i64,
    assigned_by: AssignedBy,
    confidence: f32,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO email_labels (email_id, label_id, assigned_by, confidence_score, assigned_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(email_id, label_id) DO UPDATE SET
            assigned_by = excluded.assigned_by,
            confidence_score = excluded.confidence_score",
        params![email_id, label_id, assigned_by.as_str(), confidence, now],
    )?;
    Ok(())
}

pub fn assignments_for_email(conn: &Connection, email_id: i64) -> Result<Vec<EmailLabelAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT email_id, label_id, assigned_by, confidence_score, assigned_at
         FROM email_labels WHERE email_id = ?1 ORDER BY label_id",
    )?;
    let rows = stmt
        .query_map(params![email_id], |row| {
            let assigned_by: String = row.get(2)?;
            Ok(EmailLabelAssignment {
                email_id: row.get(0)?,
                label_id: row.get(1)?,
                assigned_by: parse_column(2, &assigned_by)?,
                confidence_score: row.get(3)?,
                assigned_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Recent user-approved (email, label) pairs for one user
pub fn few_shot_examples(conn: &Connection, user_id: i64, limit: usize) -> Result<Vec<FewShotExample>> {
    let mut stmt = conn.prepare(
        "SELECT e.subject, e.sender, l.name FROM email_labels el
         JOIN emails e ON e.id = el.email_id
         JOIN labels l ON l.id = el.label_id
         JOIN accounts a ON a.id = e.account_id
         WHERE el.assigned_by = 'user' AND l.is_system = 0 AND a.user_id = ?1
         ORDER BY el.assigned_at DESC
         LIMIT ?2",
    )?;
    let examples = stmt
        .query_map(params![user_id, limit as i64], |row| {
            Ok(FewShotExample {
                subject: row.get(0)?,
                sender: row.get(1)?,
                label: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(examples)
}

// ---------------------------------------------------------------------------
// Pending suggestions
// ---------------------------------------------------------------------------

const SUGGESTION_COLUMNS: &str = "id, email_id, user_id, suggested_label, suggested_by, confidence,
     reasoning, status, approved_by, created_at, updated_at, processed_at";

fn row_to_suggestion(row: &Row) -> rusqlite::Result<PendingLabelSuggestion> {
    let suggested_by: String = row.get(4)?;
    let status: String = row.get(7)?;
    Ok(PendingLabelSuggestion {
        id: row.get(0)?,
        email_id: row.get(1)?,
        user_id: row.get(2)?,
        suggested_label: row.get(3)?,
        suggested_by: parse_column(4, &suggested_by)?,
        confidence: row.get(5)?,
        reasoning: row.get(6)?,
        status: parse_column(7, &status)?,
        approved_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        processed_at: row.get(11)?,
    })
}

pub fn get_suggestion(conn: &Connection, id: i64) -> Result<Option<PendingLabelSuggestion>> {
    let suggestion = conn
        .query_row(
            &format!(
                "SELECT {} FROM pending_label_suggestions WHERE id = ?1",
                SUGGESTION_COLUMNS
            ),
            params![id],
            row_to_suggestion,
        )
        .optional()?;
    Ok(suggestion)
}

fn find_pending_suggestion(
    conn: &Connection,
    email_id: i64,
    key: &str,
) -> Result<Option<PendingLabelSuggestion>> {
    let suggestion = conn
        .query_row(
            &format!(
                "SELECT {} FROM pending_label_suggestions
                 WHERE email_id = ?1 AND label_key = ?2 AND status = 'pending'",
                SUGGESTION_COLUMNS
            ),
            params![email_id, key],
            row_to_suggestion,
        )
        .optional()?;
    Ok(suggestion)
}

pub fn upsert_pending_suggestion(
    conn: &Connection,
    suggestion: &NewSuggestion,
    now: DateTime<Utc>,
) -> Result<(PendingLabelSuggestion, bool)> {
    let name = suggestion.suggested_label.trim();
    let key = label_key(name);

    if let Some(existing) = find_pending_suggestion(conn, suggestion.email_id, &key)? {
        debug!(
            suggestion_id = existing.id,
            email_id = suggestion.email_id,
            label = %name,
            "Pending suggestion already exists"
        );
        return Ok((existing, false));
    }

    let inserted = conn.execute(
        "INSERT INTO pending_label_suggestions
            (email_id, user_id, suggested_label, label_key, suggested_by, confidence, reasoning,
             status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
        params![
            suggestion.email_id,
            suggestion.user_id,
            name,
            key,
            suggestion.suggested_by.as_str(),
            suggestion.confidence,
            suggestion.reasoning,
            now,
        ],
    );

    match inserted {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            let created = get_suggestion(conn, id)?
                .ok_or_else(|| TriageError::NotFound(format!("suggestion {}", id)))?;
            Ok((created, true))
        }
        Err(e) if is_constraint_violation(&e) => {
            // Lost a race against another writer; hand back the winner's row
            let existing = find_pending_suggestion(conn, suggestion.email_id, &key)?.ok_or_else(
                || TriageError::ConstraintViolation(format!("pending suggestion '{}'", name)),
            )?;
            Ok((existing, false))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn list_pending_suggestions(
    conn: &Connection,
    user_id: Option<i64>,
) -> Result<Vec<PendingLabelSuggestion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM pending_label_suggestions
         WHERE status = 'pending' AND (?1 IS NULL OR user_id = ?1)
         ORDER BY created_at, id",
        SUGGESTION_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![user_id], row_to_suggestion)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Move a pending suggestion to a terminal status. Returns false (and
/// changes nothing) when the suggestion is not pending.
pub fn transition_suggestion(
    conn: &Connection,
    id: i64,
    status: SuggestionStatus,
    approver: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE pending_label_suggestions
         SET status = ?1, approved_by = ?2, processed_at = ?3, updated_at = ?3
         WHERE id = ?4 AND status = 'pending'",
        params![status.as_str(), approver, now, id],
    )?;
    Ok(changed == 1)
}

// ---------------------------------------------------------------------------
// Centroids
// ---------------------------------------------------------------------------

pub fn get_centroid(conn: &Connection, label_id: i64, model: &str) -> Result<Option<LabelCentroid>> {
    let centroid = conn
        .query_row(
            "SELECT label_id, model, centroid, email_count FROM label_centroids
             WHERE label_id = ?1 AND model = ?2",
            params![label_id, model],
            |row| {
                let raw: String = row.get(2)?;
                Ok(LabelCentroid {
                    label_id: row.get(0)?,
                    model: row.get(1)?,
                    centroid: json_column(2, &raw)?,
                    email_count: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(centroid)
}

pub fn put_centroid(conn: &Connection, centroid: &LabelCentroid, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO label_centroids (label_id, model, centroid, email_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(label_id, model) DO UPDATE SET
            centroid = excluded.centroid,
            email_count = excluded.email_count,
            updated_at = excluded.updated_at",
        params![
            centroid.label_id,
            centroid.model,
            serde_json::to_string(&centroid.centroid)?,
            centroid.email_count,
            now,
        ],
    )?;
    Ok(())
}

/// Centroids produced by `model`, with their label
pub fn centroids_for_model(conn: &Connection, model: &str) -> Result<Vec<(LabelCentroid, Label)>> {
    let mut stmt = conn.prepare(
        "SELECT c.label_id, c.model, c.centroid, c.email_count,
                l.id, l.name, l.color, l.is_system, l.user_id
         FROM label_centroids c JOIN labels l ON l.id = c.label_id
         WHERE c.model = ?1",
    )?;
    let rows = stmt
        .query_map(params![model], |row| {
            let raw: String = row.get(2)?;
            let centroid = LabelCentroid {
                label_id: row.get(0)?,
                model: row.get(1)?,
                centroid: json_column(2, &raw)?,
                email_count: row.get(3)?,
            };
            let label = Label {
                id: row.get(4)?,
                name: row.get(5)?,
                color: row.get(6)?,
                is_system: row.get(7)?,
                user_id: row.get(8)?,
            };
            Ok((centroid, label))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

pub fn insert_usage(conn: &Connection, record: &UsageRecord, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO classification_usage (email_id, method, estimated_cost, cost_saved, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.email_id,
            record.method.as_str(),
            record.estimated_cost,
            record.cost_saved,
            now,
        ],
    )?;
    Ok(())
}

pub fn usage_summary(conn: &Connection) -> Result<UsageSummary> {
    let mut stmt = conn.prepare(
        "SELECT method, COUNT(*), SUM(estimated_cost), SUM(cost_saved)
         FROM classification_usage GROUP BY method ORDER BY method",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(MethodUsage {
                method: row.get(0)?,
                calls: row.get(1)?,
                estimated_cost: row.get(2)?,
                cost_saved: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let total_cost = rows.iter().map(|r| r.estimated_cost).sum();
    let total_saved = rows.iter().map(|r| r.cost_saved).sum();
    Ok(UsageSummary {
        rows,
        total_cost,
        total_saved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClassificationMethod, ProviderKind, SuggestionMethod};
    use chrono::Duration;

    fn account(user_id: Option<i64>) -> Account {
        Account {
            id: 0,
            user_id,
            host: "imap.example.com".to_string(),
            port: 993,
            username: "me@example.com".to_string(),
            encrypted_password: "secret".to_string(),
            provider: ProviderKind::Imap,
        }
    }

    fn email(subject: &str, sender: &str) -> ParsedEmail {
        ParsedEmail {
            subject: subject.to_string(),
            body: "body".to_string(),
            sender: sender.to_string(),
            received_at: Utc::now(),
            message_id: Some("<m1@example.com>".to_string()),
            imap_uid: Some(42),
            imap_mailbox: Some("Archived".to_string()),
            imap_uid_validity: Some(7),
        }
    }

    fn result(label: &str) -> ClassificationResult {
        ClassificationResult {
            is_hierarchy: false,
            is_client: false,
            is_meeting: true,
            is_escalation: false,
            is_urgent: false,
            suggested_label: label.to_string(),
            reasoning: "test".to_string(),
            confidence: None,
            method: Some(ClassificationMethod::LlmPrimary),
        }
    }

    async fn seeded() -> (SqliteStore, i64, i64) {
        let store = SqliteStore::open_in_memory().unwrap();
        let account_id = store.insert_account(&account(Some(1))).await.unwrap();
        let email_id = store
            .insert_email(account_id, &email("Meeting tomorrow", "boss@corp.io"))
            .await
            .unwrap();
        (store, account_id, email_id)
    }

    #[tokio::test]
    async fn test_email_round_trip() {
        let (store, account_id, email_id) = seeded().await;

        let stored = store.get_email(email_id).await.unwrap();
        assert_eq!(stored.account_id, account_id);
        assert_eq!(stored.email.imap_uid, Some(42));
        assert_eq!(stored.email.imap_mailbox.as_deref(), Some("Archived"));
        assert!(stored.label_names.is_empty());

        assert!(matches!(
            store.get_email(999).await,
            Err(TriageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_meta_upsert_is_one_row() {
        let (store, _, email_id) = seeded().await;
        let embedding = Embedding {
            vector: vec![1.0, 0.0],
            model: "m1".to_string(),
        };

        store
            .with_conn(|c| upsert_email_meta(c, email_id, &result("A"), Some(&embedding), Utc::now()))
            .await
            .unwrap();
        store
            .with_conn(|c| upsert_email_meta(c, email_id, &result("B"), None, Utc::now()))
            .await
            .unwrap();

        let count: i64 = store
            .with_conn(|c| {
                Ok(c.query_row("SELECT COUNT(*) FROM email_meta", [], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);

        let meta = store.get_email_meta(email_id).await.unwrap().unwrap();
        assert_eq!(meta.classification.suggested_label, "B");
        // Earlier embedding survives a run without one
        assert_eq!(meta.embedding, Some(embedding));
    }

    #[tokio::test]
    async fn test_unclassified_emails_in_delivery_order() {
        let (store, account_id, first) = seeded().await;
        let mut later = email("Second", "a@b.c");
        later.received_at = Utc::now() + Duration::minutes(5);
        let second = store.insert_email(account_id, &later).await.unwrap();

        assert_eq!(store.unclassified_emails(account_id).await.unwrap(), vec![first, second]);

        store
            .with_conn(|c| upsert_email_meta(c, first, &result("A"), None, Utc::now()))
            .await
            .unwrap();
        assert_eq!(store.unclassified_emails(account_id).await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_label_names_deduplicated() {
        let (store, _, email_id) = seeded().await;

        assert!(store.with_conn(|c| add_label_name(c, email_id, "Invoices")).await.unwrap());
        assert!(!store.with_conn(|c| add_label_name(c, email_id, "invoices ")).await.unwrap());

        let stored = store.get_email(email_id).await.unwrap();
        assert_eq!(stored.label_names, vec!["Invoices".to_string()]);
    }

    #[tokio::test]
    async fn test_label_scope_uniqueness() {
        let store = SqliteStore::open_in_memory().unwrap();

        store
            .with_conn(|c| insert_label(c, "Invoices", "#fff", false, Some(1)))
            .await
            .unwrap();
        // Same name for another user is fine
        store
            .with_conn(|c| insert_label(c, "Invoices", "#fff", false, Some(2)))
            .await
            .unwrap();
        let duplicate = store
            .with_conn(|c| insert_label(c, "invoices", "#000", false, Some(1)))
            .await;
        assert!(matches!(duplicate, Err(TriageError::ConstraintViolation(_))));

        let found = store.with_conn(|c| find_label(c, "INVOICES", Some(2))).await.unwrap();
        assert_eq!(found.unwrap().user_id, Some(2));
        assert!(store.with_conn(|c| find_label(c, "Invoices", Some(3))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_assignment_upsert_updates_provenance() {
        let (store, _, email_id) = seeded().await;
        let label = store
            .with_conn(|c| insert_label(c, "Urgent", "#f00", true, None))
            .await
            .unwrap();

        store
            .with_conn(|c| upsert_assignment(c, email_id, label.id, AssignedBy::Ai, 0.9, Utc::now()))
            .await
            .unwrap();
        store
            .with_conn(|c| upsert_assignment(c, email_id, label.id, AssignedBy::User, 1.0, Utc::now()))
            .await
            .unwrap();

        let assignments = store.assignments_for_email(email_id).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].assigned_by, AssignedBy::User);
        assert_eq!(assignments[0].confidence_score, 1.0);
    }

    #[tokio::test]
    async fn test_pending_suggestion_upsert_returns_existing() {
        let (store, _, email_id) = seeded().await;
        let new = NewSuggestion {
            email_id,
            user_id: 1,
            suggested_label: "Client Work".to_string(),
            suggested_by: SuggestionMethod::Llm,
            confidence: Some(0.6),
            reasoning: Some("client thread".to_string()),
        };

        let (first, created) = store.upsert_pending_suggestion(&new).await.unwrap();
        assert!(created);

        let mut again = new.clone();
        again.suggested_label = " client work".to_string();
        let (second, created) = store.upsert_pending_suggestion(&again).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_pending_suggestions(Some(1)).await.unwrap().len(), 1);
        assert!(store.list_pending_suggestions(Some(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_unique_index_rejects_second_pending_row() {
        let (store, _, email_id) = seeded().await;
        let insert = |c: &Connection| -> Result<usize> {
            Ok(c.execute(
                "INSERT INTO pending_label_suggestions
                    (email_id, user_id, suggested_label, label_key, suggested_by, status,
                     created_at, updated_at)
                 VALUES (?1, 1, 'X', 'x', 'llm', 'pending', ?2, ?2)",
                params![email_id, Utc::now()],
            )?)
        };

        store.with_conn(insert).await.unwrap();
        assert!(store.with_conn(insert).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_only_from_pending() {
        let (store, _, email_id) = seeded().await;
        let (suggestion, _) = store
            .upsert_pending_suggestion(&NewSuggestion {
                email_id,
                user_id: 1,
                suggested_label: "Travel".to_string(),
                suggested_by: SuggestionMethod::Llm,
                confidence: None,
                reasoning: None,
            })
            .await
            .unwrap();

        let id = suggestion.id;
        assert!(store
            .with_conn(move |c| transition_suggestion(c, id, SuggestionStatus::Rejected, "admin", Utc::now()))
            .await
            .unwrap());
        assert!(!store
            .with_conn(move |c| transition_suggestion(c, id, SuggestionStatus::Approved, "admin", Utc::now()))
            .await
            .unwrap());

        let stored = store.get_suggestion(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Rejected);
        assert_eq!(stored.approved_by.as_deref(), Some("admin"));
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_cache_query_respects_window_and_floor() {
        let (store, account_id, email_id) = seeded().await;
        let twin = store
            .insert_email(account_id, &email("Meeting tomorrow", "boss@corp.io"))
            .await
            .unwrap();
        store
            .with_conn(|c| upsert_email_meta(c, email_id, &result("Meetings"), None, Utc::now()))
            .await
            .unwrap();

        let since = Utc::now() - Duration::days(30);
        let hit = store
            .with_conn(|c| find_cached_classification(c, "Meeting tomorrow", "boss@corp.io", since))
            .await
            .unwrap();
        assert_eq!(hit.unwrap().0.suggested_label, "Meetings");

        let future = Utc::now() + Duration::days(1);
        let stale = store
            .with_conn(|c| find_cached_classification(c, "Meeting tomorrow", "boss@corp.io", future))
            .await
            .unwrap();
        assert!(stale.is_none());

        // Floor results are never served from the cache
        let floor = result("Uncategorized").with_method(ClassificationMethod::RegexFallback);
        store
            .with_conn(|c| upsert_email_meta(c, twin, &floor, None, Utc::now()))
            .await
            .unwrap();
        store
            .with_conn(|c| upsert_email_meta(c, email_id, &floor, None, Utc::now()))
            .await
            .unwrap();
        let none = store
            .with_conn(|c| find_cached_classification(c, "Meeting tomorrow", "boss@corp.io", since))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_cache_replay_keeps_classification_time() {
        let (store, account_id, email_id) = seeded().await;
        let twin = store
            .insert_email(account_id, &email("Meeting tomorrow", "boss@corp.io"))
            .await
            .unwrap();
        let then = Utc::now() - Duration::days(29);
        let original = result("Meetings").with_method(ClassificationMethod::LlmPrimary);
        store
            .with_conn(move |c| upsert_email_meta(c, email_id, &original, None, then))
            .await
            .unwrap();

        // replays and later touches must not refresh the window
        let replay = result("Meetings").with_method(ClassificationMethod::Cache);
        store
            .with_conn(move |c| upsert_email_meta(c, twin, &replay, None, Utc::now()))
            .await
            .unwrap();
        store
            .with_conn(move |c| set_mom_received(c, email_id, Utc::now()))
            .await
            .unwrap();

        let since = Utc::now() - Duration::days(30);
        let (hit, classified_at) = store
            .with_conn(move |c| find_cached_classification(c, "Meeting tomorrow", "boss@corp.io", since))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.suggested_label, "Meetings");
        assert_eq!(classified_at.timestamp(), then.timestamp());

        let later = since + Duration::days(10);
        let expired = store
            .with_conn(move |c| find_cached_classification(c, "Meeting tomorrow", "boss@corp.io", later))
            .await
            .unwrap();
        assert!(expired.is_none());
    }

    #[tokio::test]
    async fn test_account_owner() {
        let store = SqliteStore::open_in_memory().unwrap();
        let owned = store.insert_account(&account(Some(5))).await.unwrap();
        let orphan = store.insert_account(&account(None)).await.unwrap();

        assert_eq!(store.with_conn(|c| account_owner(c, owned)).await.unwrap(), Some(5));
        assert_eq!(store.with_conn(|c| account_owner(c, orphan)).await.unwrap(), None);
        assert!(store.with_conn(|c| account_owner(c, 99)).await.is_err());
    }

    #[tokio::test]
    async fn test_usage_summary() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (method, cost, saved) in [
            (ClassificationMethod::Cache, 0.0, 1.0),
            (ClassificationMethod::Cache, 0.0, 1.0),
            (ClassificationMethod::LlmPrimary, 1.0, 0.0),
        ] {
            let record = UsageRecord {
                email_id: None,
                method,
                estimated_cost: cost,
                cost_saved: saved,
            };
            store
                .with_conn(|c| insert_usage(c, &record, Utc::now()))
                .await
                .unwrap();
        }

        let summary = store.usage_summary().await.unwrap();
        assert_eq!(summary.rows.len(), 2);
        assert_eq!(summary.total_cost, 1.0);
        assert_eq!(summary.total_saved, 2.0);
        let cache = summary.rows.iter().find(|r| r.method == "cache").unwrap();
        assert_eq!(cache.calls, 2);
    }

    #[test]
    fn test_label_key_normalization() {
        assert_eq!(label_key("  Client   Work "), "client work");
        assert_eq!(label_key("MOM"), "mom");
        assert_eq!(label_key("ÉQUIPE  Nord"), "équipe nord");
    }

    #[tokio::test]
    async fn test_non_ascii_label_names_fold() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store
            .with_conn(|conn| insert_label(conn, "Équipe", "#000000", false, Some(1)))
            .await
            .unwrap();

        let found = store
            .with_conn(|conn| find_label(conn, "équipe", Some(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);

        let duplicate = store
            .with_conn(|conn| insert_label(conn, "ÉQUIPE", "#000000", false, Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(duplicate, TriageError::ConstraintViolation(_)));
    }
}

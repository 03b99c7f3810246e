use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Type alias for Result with TriageError
pub type Result<T> = std::result::Result<T, TriageError>;

/// Error types for the classification and label pipeline
#[derive(Error, Debug)]
pub enum TriageError {
    /// Provider signalled a rate limit; the caller should cool down and fall back
    #[error("Rate limited by {provider}, retry after {retry_after_secs} seconds")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    /// Network, auth or server failure talking to a provider
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider returned output that failed schema validation
    #[error("Malformed provider output: {0}")]
    ParseFailure(String),

    /// Message, account, email or label missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-level uniqueness violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Account cannot be resolved to an owning user
    #[error("Account {account_id} has no owning user")]
    MissingOwner { account_id: i64 },

    /// IMAP command failed
    #[error("Mailbox error: {0}")]
    MailboxError(String),

    /// Located message does not match the stored subject/sender
    #[error("Message locator drift: {0}")]
    LocatorDrift(String),

    /// No tier produced a classification
    #[error("Classification error: {0}")]
    ClassificationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// SQLite error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error (file operations, sockets)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl TriageError {
    /// Check if the error is a provider rate limit
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TriageError::RateLimited { .. })
    }

    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TriageError::RateLimited { .. }
                | TriageError::ProviderUnavailable(_)
                | TriageError::IoError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Check if an IMAP failure just reports an existing mailbox
    pub fn is_already_exists(&self) -> bool {
        match self {
            TriageError::MailboxError(message) => {
                let lower = message.to_lowercase();
                lower.contains("already exists") || lower.contains("alreadyexists")
            }
            _ => false,
        }
    }
}

/// Default cooldown reported when a provider does not say how long to wait
const DEFAULT_RETRY_AFTER: u64 = 60;

/// Classify an OpenAI-compatible client error.
///
/// HTTP 429 responses, "rate limit" messages and exhausted quota are all
/// reported as [`TriageError::RateLimited`]; malformed payloads are parse
/// failures; everything else is an unavailable provider.
pub fn from_openai_error(provider: &str, error: async_openai::error::OpenAIError) -> TriageError {
    use async_openai::error::OpenAIError;

    let message = error.to_string();
    if looks_rate_limited(&message) {
        return TriageError::RateLimited {
            provider: provider.to_string(),
            retry_after_secs: DEFAULT_RETRY_AFTER,
        };
    }

    match error {
        OpenAIError::JSONDeserialize(err) => {
            TriageError::ParseFailure(format!("{}: {}", provider, err))
        }
        OpenAIError::InvalidArgument(msg) => {
            TriageError::ConfigError(format!("{}: {}", provider, msg))
        }
        _ => TriageError::ProviderUnavailable(format!("{}: {}", provider, message)),
    }
}

/// A 429 status code, not any number that happens to contain the digits
static HTTP_429: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\b(status|http|code|error)\b[\s:=\x22/]*|^\s*|\(|\[)429\b").unwrap()
});

fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    HTTP_429.is_match(message)
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
}

impl From<async_imap::error::Error> for TriageError {
    fn from(error: async_imap::error::Error) -> Self {
        TriageError::MailboxError(error.to_string())
    }
}

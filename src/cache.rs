//! Recent-classification cache
//!
//! An email with the same subject and sender as one classified inside the
//! cache window reuses that result. Lookups hit a small in-process LRU first
//! and fall back to the stored metadata. Floor results are never reused.
//! Entries age from when the result was first produced, not from when it was
//! last served.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::classifier::{ClassificationInput, Classifier, TierOutcome};
use crate::config::ClassificationConfig;
use crate::error::Result;
use crate::models::{ClassificationMethod, ClassificationResult};
use crate::store::{self, SqliteStore};

type CacheKey = (String, String);

pub struct ClassificationCache {
    store: SqliteStore,
    window: Duration,
    recent: Mutex<LruCache<CacheKey, (ClassificationResult, DateTime<Utc>)>>,
}

impl ClassificationCache {
    pub fn new(store: SqliteStore, window: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            window,
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn from_config(store: SqliteStore, config: &ClassificationConfig) -> Self {
        Self::new(
            store,
            Duration::days(config.cache_window_days),
            config.cache_capacity,
        )
    }

    fn key(subject: &str, sender: &str) -> CacheKey {
        (subject.to_string(), sender.to_string())
    }

    /// Cached result for (subject, sender), tagged with the cache method
    pub async fn lookup(&self, subject: &str, sender: &str) -> Result<Option<ClassificationResult>> {
        self.lookup_at(subject, sender, Utc::now()).await
    }

    pub async fn lookup_at(
        &self,
        subject: &str,
        sender: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ClassificationResult>> {
        let since = now - self.window;
        let key = Self::key(subject, sender);

        {
            let mut recent = self.recent.lock().await;
            match recent.get(&key) {
                Some((result, at)) if *at >= since => {
                    debug!(subject, "Classification cache hit (memory)");
                    return Ok(Some(result.clone().with_method(ClassificationMethod::Cache)));
                }
                Some(_) => {
                    recent.pop(&key);
                }
                None => {}
            }
        }

        let (s, f) = (subject.to_string(), sender.to_string());
        let stored = self
            .store
            .with_conn(move |conn| store::find_cached_classification(conn, &s, &f, since))
            .await?;

        match stored {
            Some((result, classified_at)) => {
                debug!(subject, %classified_at, "Classification cache hit (store)");
                self.recent.lock().await.put(key, (result.clone(), classified_at));
                Ok(Some(result.with_method(ClassificationMethod::Cache)))
            }
            None => Ok(None),
        }
    }

    /// Remember a fresh result. Floor results and cache replays are ignored.
    pub async fn remember(&self, subject: &str, sender: &str, result: &ClassificationResult) {
        self.remember_at(subject, sender, result, Utc::now()).await
    }

    pub async fn remember_at(
        &self,
        subject: &str,
        sender: &str,
        result: &ClassificationResult,
        now: DateTime<Utc>,
    ) {
        if matches!(
            result.method,
            Some(ClassificationMethod::Cache) | Some(ClassificationMethod::RegexFallback)
        ) {
            return;
        }
        self.recent
            .lock()
            .await
            .put(Self::key(subject, sender), (result.clone(), now));
    }

    pub async fn len(&self) -> usize {
        self.recent.lock().await.len()
    }
}

/// The cache as the first waterfall tier
pub struct CacheTier {
    cache: Arc<ClassificationCache>,
}

impl CacheTier {
    pub fn new(cache: Arc<ClassificationCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Classifier for CacheTier {
    fn method(&self) -> ClassificationMethod {
        ClassificationMethod::Cache
    }

    async fn try_classify(&self, input: &ClassificationInput) -> TierOutcome {
        match self.cache.lookup(&input.subject, &input.sender).await {
            Ok(Some(result)) => TierOutcome::Classified(result),
            Ok(None) => TierOutcome::NotApplicable,
            Err(e) => {
                warn!(error = %e, "Classification cache lookup failed");
                TierOutcome::Failed(e)
            }
        }
    }

    async fn observe(&self, input: &ClassificationInput, result: &ClassificationResult) {
        self.cache
            .remember(&input.subject, &input.sender, result)
            .await;
    }
}

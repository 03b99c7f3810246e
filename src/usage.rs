//! Classification cost telemetry
//!
//! Every tier invocation is reported with its estimated cost and the cost it
//! saved compared to running the primary LLM. Reporting is best-effort: a
//! failing tracker is logged and never interrupts classification.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::models::UsageRecord;
use crate::store::{self, SqliteStore};

#[async_trait]
pub trait UsageTracker: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<()>;
}

/// Persists usage rows in `classification_usage`
pub struct StoreUsageTracker {
    store: SqliteStore,
}

impl StoreUsageTracker {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UsageTracker for StoreUsageTracker {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        self.store
            .with_conn(move |conn| store::insert_usage(conn, &record, Utc::now()))
            .await
    }
}

/// Keeps records in memory; used by tests and dry runs
#[derive(Default, Clone)]
pub struct MemoryUsageTracker {
    records: Arc<Mutex<Vec<UsageRecord>>>,
}

impl MemoryUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl UsageTracker for MemoryUsageTracker {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// Record usage, swallowing tracker failures
pub async fn report(tracker: &dyn UsageTracker, record: UsageRecord) {
    let method = record.method;
    if let Err(e) = tracker.record(record).await {
        warn!(method = %method, error = %e, "Failed to record classification usage");
    }
}

/// Rough token estimate for a prompt of `chars` characters
pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

/// Estimated cost of a call with `chars` prompt characters
pub fn estimate_cost(chars: usize, cost_per_1k_tokens: f64) -> f64 {
    estimate_tokens(chars) as f64 / 1000.0 * cost_per_1k_tokens
}

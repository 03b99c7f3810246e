//! Provider rate-limit tracking
//!
//! Each LLM tier owns one [`ProviderHealth`] handle. When a provider reports a
//! rate limit the handle enters a fixed cooldown; while cooling down the tier
//! is skipped outright and the waterfall routes to the next provider:
//! - a rate-limit error sets the flag and a reset horizon (60s by default)
//! - any other failure leaves the flag untouched
//! - the flag is cleared lazily by the first check made after the horizon

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Rate-limit state of a single provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderHealthState {
    pub rate_limited: bool,
    pub reset_at: Option<DateTime<Utc>>,
}

impl ProviderHealthState {
    /// Returns true when the provider may be called at `now`.
    ///
    /// Clears the rate-limit flag once `now` is past the reset horizon.
    pub fn check_and_maybe_reset(&mut self, now: DateTime<Utc>) -> bool {
        if !self.rate_limited {
            return true;
        }

        match self.reset_at {
            Some(reset_at) if now > reset_at => {
                self.rate_limited = false;
                self.reset_at = None;
                true
            }
            Some(_) => false,
            // A flag with no horizon never expires on its own
            None => false,
        }
    }

    pub fn mark_rate_limited(&mut self, now: DateTime<Utc>, cooldown: Duration) {
        self.rate_limited = true;
        self.reset_at = Some(now + cooldown);
    }
}

/// Shared, clonable handle over a provider's health state
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    provider: String,
    cooldown: Duration,
    inner: Arc<Mutex<HealthInner>>,
}

#[derive(Debug, Default)]
struct HealthInner {
    state: ProviderHealthState,
    /// Calls refused because of an active cooldown (for stats)
    skipped_calls: u64,
    /// Rate-limit signals received (for stats)
    rate_limit_hits: u64,
}

impl ProviderHealth {
    pub fn new(provider: impl Into<String>, cooldown_secs: i64) -> Self {
        Self {
            provider: provider.into(),
            cooldown: Duration::seconds(cooldown_secs),
            inner: Arc::new(Mutex::new(HealthInner::default())),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Check whether the provider may be called now
    pub async fn is_available(&self) -> bool {
        self.is_available_at(Utc::now()).await
    }

    pub async fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        let was_limited = inner.state.rate_limited;
        let available = inner.state.check_and_maybe_reset(now);

        if was_limited && available {
            info!(provider = %self.provider, "Rate-limit cooldown expired");
        } else if !available {
            inner.skipped_calls += 1;
            debug!(
                provider = %self.provider,
                reset_at = ?inner.state.reset_at,
                "Provider in rate-limit cooldown, skipping"
            );
        }
        available
    }

    /// Record a rate-limit signal from the provider
    pub async fn mark_rate_limited(&self) {
        self.mark_rate_limited_at(Utc::now()).await
    }

    pub async fn mark_rate_limited_at(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        inner.state.mark_rate_limited(now, self.cooldown);
        inner.rate_limit_hits += 1;
        info!(
            provider = %self.provider,
            reset_at = ?inner.state.reset_at,
            "Provider rate limited, entering cooldown"
        );
    }

    pub async fn snapshot(&self) -> ProviderHealthState {
        self.inner.lock().await.state.clone()
    }

    pub async fn stats(&self) -> HealthStats {
        let inner = self.inner.lock().await;
        HealthStats {
            rate_limited: inner.state.rate_limited,
            skipped_calls: inner.skipped_calls,
            rate_limit_hits: inner.rate_limit_hits,
        }
    }
}

/// Statistics about a provider's cooldowns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStats {
    pub rate_limited: bool,
    pub skipped_calls: u64,
    pub rate_limit_hits: u64,
}

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use common::error::FailureReason;
use serde::Serialize;
use tracing::{debug, warn};

use super::policy::RetryPolicy;

/// Health bookkeeping for one backend, created on first use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub consecutive_failures: u32,
    pub last_failure_reason: Option<FailureReason>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_failures: u64,
    pub total_successes: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            consecutive_failures: 0,
            last_failure_reason: None,
            last_failure_at: None,
            total_failures: 0,
            total_successes: 0,
            cooldown_until: None,
        }
    }

    pub fn in_cooldown_at(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn cooldown_remaining_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.cooldown_until
            .and_then(|until| (until - now).to_std().ok())
            .unwrap_or_default()
    }

    /// Share of successful calls. A provider that was never called counts as fully healthy.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            1.0
        } else {
            self.total_successes as f64 / total as f64
        }
    }
}

/// Point-in-time view of a provider for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub cooldown_remaining_seconds: f64,
    pub last_failure_reason: Option<FailureReason>,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Tracks per-provider health and applies cooldowns after failures.
#[derive(Debug, Default)]
pub struct ProviderHealthRegistry {
    providers: RwLock<HashMap<String, ProviderHealth>>,
    policy: RetryPolicy,
}

impl ProviderHealthRegistry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            providers: RwLock::default(),
            policy,
        }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_available(&self, provider_id: &str) -> bool {
        self.is_available_at(provider_id, Utc::now())
    }

    pub fn is_available_at(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .map_or(true, |health| !health.in_cooldown_at(now))
    }

    pub fn record_success(&self, provider_id: &str) {
        self.record_success_at(provider_id, Utc::now());
    }

    /// Resets the failure streak and clears any cooldown.
    pub fn record_success_at(&self, provider_id: &str, now: DateTime<Utc>) {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        let health = providers
            .entry(provider_id.to_owned())
            .or_insert_with(|| ProviderHealth::new(provider_id));

        if health.cooldown_until.is_some_and(|until| until > now) {
            debug!(provider_id, "Provider recovered before cooldown elapsed");
        }
        health.consecutive_failures = 0;
        health.cooldown_until = None;
        health.total_successes += 1;
    }

    pub fn record_failure(&self, provider_id: &str, reason: FailureReason) -> DateTime<Utc> {
        self.record_failure_at(provider_id, reason, Utc::now())
    }

    /// Extends the provider's cooldown and returns when it ends.
    ///
    /// The cooldown never moves earlier: a shorter cooldown computed for a milder
    /// failure leaves a longer pending one in place.
    pub fn record_failure_at(
        &self,
        provider_id: &str,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        let health = providers
            .entry(provider_id.to_owned())
            .or_insert_with(|| ProviderHealth::new(provider_id));

        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.total_failures += 1;
        health.last_failure_reason = Some(reason);
        health.last_failure_at = Some(now);

        let cooldown = self.policy.cooldown_for(reason, health.consecutive_failures);
        let candidate = chrono::Duration::from_std(cooldown)
            .ok()
            .and_then(|cooldown| now.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let until = health
            .cooldown_until
            .map_or(candidate, |existing| existing.max(candidate));
        health.cooldown_until = Some(until);

        warn!(
            provider_id,
            reason = %reason,
            consecutive_failures = health.consecutive_failures,
            cooldown_seconds = cooldown.as_secs(),
            "Provider entered cooldown"
        );
        until
    }

    pub fn snapshot(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }

    /// Forgets everything recorded about `provider_id`.
    pub fn reset(&self, provider_id: &str) -> bool {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_id)
            .is_some()
    }

    pub fn status(&self) -> Vec<ProviderStatus> {
        self.status_at(Utc::now())
    }

    /// Status of every provider seen so far, sorted by id.
    pub fn status_at(&self, now: DateTime<Utc>) -> Vec<ProviderStatus> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let mut statuses: Vec<ProviderStatus> = providers
            .values()
            .map(|health| ProviderStatus {
                provider_id: health.provider_id.clone(),
                healthy: !health.in_cooldown_at(now),
                consecutive_failures: health.consecutive_failures,
                success_rate: health.success_rate(),
                cooldown_remaining_seconds: health.cooldown_remaining_at(now).as_secs_f64(),
                last_failure_reason: health.last_failure_reason,
                total_successes: health.total_successes,
                total_failures: health.total_failures,
            })
            .collect();
        statuses.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        statuses
    }
}

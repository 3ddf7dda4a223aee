use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use common::error::{AppError, AttemptError, FailureReason};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::health::ProviderHealthRegistry;

/// Outcome of walking a category's provider chain.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackResult<T> {
    pub category: String,
    pub success: bool,
    pub result: Option<T>,
    pub provider_used: Option<String>,
    pub attempts: usize,
    pub errors: Vec<AttemptError>,
    pub used_fallback: bool,
}

impl<T> FallbackResult<T> {
    /// Converts a failed run into [`AppError::FallbackExhausted`] carrying every attempt error.
    pub fn into_result(self) -> Result<T, AppError> {
        match self.result {
            Some(value) if self.success => Ok(value),
            _ => Err(AppError::FallbackExhausted {
                category: self.category,
                errors: self.errors,
            }),
        }
    }
}

/// Runs an operation across an ordered list of interchangeable providers.
pub struct FallbackExecutor {
    registry: Arc<ProviderHealthRegistry>,
    chains: HashMap<String, Vec<String>>,
}

impl FallbackExecutor {
    pub const fn new(
        registry: Arc<ProviderHealthRegistry>,
        chains: HashMap<String, Vec<String>>,
    ) -> Self {
        Self { registry, chains }
    }

    pub const fn registry(&self) -> &Arc<ProviderHealthRegistry> {
        &self.registry
    }

    /// Preference order for `category`, with `primary` moved or prepended to the front.
    pub fn candidates(&self, category: &str, primary: Option<&str>) -> Vec<String> {
        let mut candidates = self.chains.get(category).cloned().unwrap_or_default();
        if let Some(primary) = primary {
            candidates.retain(|id| id != primary);
            candidates.insert(0, primary.to_owned());
        }
        candidates
    }

    /// Tries providers in order until one succeeds or `max_attempts` providers have failed.
    ///
    /// Providers in cooldown are skipped unless no candidate follows them. Every call is
    /// bounded by `timeout`; an elapsed timeout counts as a [`FailureReason::Timeout`]
    /// failure. `max_attempts == 0` allows the whole chain.
    pub async fn execute<T, F, Fut>(
        &self,
        category: &str,
        mut operation: F,
        primary: Option<&str>,
        max_attempts: usize,
        timeout: Duration,
    ) -> Result<FallbackResult<T>, AppError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let candidates = self.candidates(category, primary);
        if candidates.is_empty() {
            return Err(AppError::Validation(format!(
                "no providers configured for category '{category}'"
            )));
        }
        let max_attempts = if max_attempts == 0 {
            candidates.len()
        } else {
            max_attempts
        };

        let mut attempts = 0usize;
        let mut errors = Vec::new();
        let last_index = candidates.len() - 1;

        for (index, provider_id) in candidates.into_iter().enumerate() {
            if attempts >= max_attempts {
                break;
            }

            if !self.registry.is_available(&provider_id) {
                if index < last_index {
                    debug!(category, %provider_id, "Skipping provider in cooldown");
                    continue;
                }
                warn!(
                    category,
                    %provider_id,
                    "All remaining providers cooling down; trying last candidate anyway"
                );
            }

            attempts += 1;
            let outcome = tokio::time::timeout(timeout, operation(provider_id.clone())).await;
            let (reason, message) = match outcome {
                Ok(Ok(value)) => {
                    self.registry.record_success(&provider_id);
                    if attempts > 1 {
                        info!(category, %provider_id, attempts, "Fallback provider succeeded");
                    }
                    return Ok(FallbackResult {
                        category: category.to_owned(),
                        success: true,
                        result: Some(value),
                        provider_used: Some(provider_id),
                        attempts,
                        errors,
                        used_fallback: attempts > 1,
                    });
                }
                Ok(Err(err)) => (self.registry.policy().classify(&err), err.to_string()),
                Err(_) => (
                    FailureReason::Timeout,
                    format!("call timed out after {}s", timeout.as_secs_f64()),
                ),
            };

            warn!(category, %provider_id, reason = %reason, error = %message, "Provider call failed");
            self.registry.record_failure(&provider_id, reason);
            errors.push(AttemptError {
                provider_id,
                reason,
                message,
            });
        }

        warn!(category, attempts, "Fallback chain exhausted");
        Ok(FallbackResult {
            category: category.to_owned(),
            success: false,
            result: None,
            provider_used: None,
            attempts,
            errors,
            used_fallback: attempts > 1,
        })
    }
}

use std::time::Duration;

use common::{
    error::{classify_failure, AppError, FailureReason, ProviderError},
    utils::config::{CooldownSettings, FallbackSettings},
};

/// Maps a failure message and optional HTTP status onto a [`FailureReason`].
pub type FailureClassifier = fn(&str, Option<u16>) -> FailureReason;

/// Shared cooldown rules for every provider category.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    cooldowns: CooldownSettings,
    max_backoff_exponent: u32,
    classifier: FailureClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&FallbackSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &FallbackSettings) -> Self {
        Self {
            cooldowns: settings.cooldowns.clone(),
            max_backoff_exponent: settings.max_backoff_exponent,
            classifier: classify_failure,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn base_cooldown(&self, reason: FailureReason) -> Duration {
        self.cooldowns.base_for(reason)
    }

    /// `base(reason) * 2^min(consecutive_failures - 1, max_backoff_exponent)`.
    pub fn cooldown_for(&self, reason: FailureReason, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures
            .saturating_sub(1)
            .min(self.max_backoff_exponent)
            .min(31);
        self.base_cooldown(reason)
            .saturating_mul(2u32.saturating_pow(exponent))
    }

    /// Categorizes an operation error. Provider errors keep the reason they were
    /// raised with; anything else goes through the classifier.
    pub fn classify(&self, error: &AppError) -> FailureReason {
        match error {
            AppError::Provider(provider) => provider.reason,
            AppError::OpenAI(openai) => ProviderError::from(openai).reason,
            other => (self.classifier)(&other.to_string(), None),
        }
    }
}

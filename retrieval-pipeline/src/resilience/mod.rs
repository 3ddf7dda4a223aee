mod executor;
mod health;
mod policy;

pub use executor::{FallbackExecutor, FallbackResult};
pub use health::{ProviderHealth, ProviderHealthRegistry, ProviderStatus};
pub use policy::{FailureClassifier, RetryPolicy};

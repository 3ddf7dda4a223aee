mod openai;

pub use openai::OpenAiScoringProvider;

use async_trait::async_trait;
use common::error::ProviderError;
use serde::Serialize;
use serde_json::Value;

/// JSON schema the backend is asked to answer with.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseSchema {
    pub name: String,
    pub description: Option<String>,
    pub schema: Value,
}

/// A single chat-style request sent to whichever provider the fallback chain picks.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderPayload {
    pub system_prompt: String,
    pub user_message: String,
    pub response_schema: Option<ResponseSchema>,
}

impl ProviderPayload {
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            response_schema: None,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Calls an external model by provider id.
///
/// Failures must carry a [`ProviderError`] so the fallback executor can tell rate
/// limits, timeouts and malformed responses apart.
#[async_trait]
pub trait ScoringProvider: Send + Sync {
    async fn invoke(
        &self,
        provider_id: &str,
        payload: &ProviderPayload,
    ) -> Result<String, ProviderError>;
}

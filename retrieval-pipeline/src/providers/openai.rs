use std::{collections::HashMap, env};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use common::{
    error::{FailureReason, ProviderError},
    utils::config::{AppConfig, ProviderEndpoint},
};
use tracing::debug;

use super::{ProviderPayload, ScoringProvider};

struct Endpoint {
    client: Client<OpenAIConfig>,
    model: String,
}

/// [`ScoringProvider`] backed by OpenAI-compatible chat completion endpoints.
pub struct OpenAiScoringProvider {
    endpoints: HashMap<String, Endpoint>,
}

impl OpenAiScoringProvider {
    pub fn from_config(config: &AppConfig) -> Self {
        let endpoints = config
            .fallback
            .providers
            .iter()
            .map(|(id, endpoint)| {
                let api_key = resolve_api_key(endpoint, &config.openai_api_key);
                let client = Client::with_config(
                    OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(&endpoint.base_url),
                );
                (
                    id.clone(),
                    Endpoint {
                        client,
                        model: endpoint.model.clone(),
                    },
                )
            })
            .collect();

        Self { endpoints }
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}

fn resolve_api_key(endpoint: &ProviderEndpoint, fallback: &str) -> String {
    endpoint
        .api_key_env
        .as_deref()
        .and_then(|name| env::var(name).ok())
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| fallback.to_owned())
}

pub fn create_chat_request(
    model: &str,
    payload: &ProviderPayload,
) -> Result<CreateChatCompletionRequest, ProviderError> {
    let mut args = CreateChatCompletionRequestArgs::default();
    args.model(model).messages([
        ChatCompletionRequestSystemMessage::from(payload.system_prompt.clone()).into(),
        ChatCompletionRequestUserMessage::from(payload.user_message.clone()).into(),
    ]);

    if let Some(schema) = &payload.response_schema {
        args.response_format(ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: schema.description.clone(),
                name: schema.name.clone(),
                schema: Some(schema.schema.clone()),
                strict: Some(true),
            },
        });
    }

    args.build()
        .map_err(|err| ProviderError::new(FailureReason::ApiError, err.to_string()))
}

#[async_trait]
impl ScoringProvider for OpenAiScoringProvider {
    async fn invoke(
        &self,
        provider_id: &str,
        payload: &ProviderPayload,
    ) -> Result<String, ProviderError> {
        let endpoint = self.endpoints.get(provider_id).ok_or_else(|| {
            ProviderError::new(
                FailureReason::ApiError,
                format!("unknown provider '{provider_id}'"),
            )
        })?;

        let request = create_chat_request(&endpoint.model, payload)?;
        let response = endpoint.client.chat().create(request).await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ProviderError::invalid_response("empty response from provider"))?;

        debug!(provider_id, chars = content.len(), "Provider responded");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ResponseSchema;
    use serde_json::json;

    #[test]
    fn chat_request_carries_schema_when_present() {
        let payload = ProviderPayload::new("system", "user").with_schema(ResponseSchema {
            name: "relevance".into(),
            description: None,
            schema: json!({"type": "object"}),
        });
        let request = create_chat_request("gpt-4o-mini", &payload).expect("request");
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 2);
        assert!(matches!(
            request.response_format,
            Some(ResponseFormat::JsonSchema { .. })
        ));

        let plain = create_chat_request("m", &ProviderPayload::new("s", "u")).expect("request");
        assert!(plain.response_format.is_none());
    }

    #[tokio::test]
    async fn unknown_provider_is_an_api_error() {
        let provider = OpenAiScoringProvider::from_config(&AppConfig::default());
        let mut ids: Vec<&str> = provider.provider_ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["ollama", "openai", "openrouter"]);

        let err = provider
            .invoke("missing", &ProviderPayload::new("s", "u"))
            .await
            .expect_err("unknown provider");
        assert_eq!(err.reason, FailureReason::ApiError);
    }

    #[test]
    fn api_key_falls_back_to_shared_key() {
        let endpoint = ProviderEndpoint {
            base_url: "http://localhost".into(),
            model: "m".into(),
            api_key_env: Some("RETRIEVAL_TEST_KEY_THAT_IS_NOT_SET".into()),
        };
        assert_eq!(resolve_api_key(&endpoint, "shared"), "shared");
    }
}

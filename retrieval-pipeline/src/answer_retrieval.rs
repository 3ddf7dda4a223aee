use common::{error::ProviderError, types::FusedResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::providers::{ProviderPayload, ResponseSchema};

pub const GENERATION_CATEGORY: &str = "generation";

pub const ANSWER_SYSTEM_PROMPT: &str = "You answer questions using only the supplied context. \
Each context item has an `id`. Reply with a JSON object holding the `answer` and the ids of the \
context items you relied on in `references`. If the context does not contain the answer, say so \
and return no references.";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Reference {
    pub reference: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LLMResponseFormat {
    pub answer: String,
    #[serde(default)]
    pub references: Vec<Reference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Answer {
    pub content: String,
    pub references: Vec<String>,
}

impl From<LLMResponseFormat> for Answer {
    fn from(response: LLMResponseFormat) -> Self {
        Self {
            content: response.answer,
            references: response
                .references
                .into_iter()
                .map(|reference| reference.reference)
                .collect(),
        }
    }
}

pub fn get_query_response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "answer": { "type": "string" },
            "references": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "reference": { "type": "string" }
                    },
                    "required": ["reference"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["answer", "references"],
        "additionalProperties": false
    })
}

pub fn create_user_message(context_json: &Value, query: &str) -> String {
    format!(
        r"
        Context Information:
        ==================
        {context_json}

        User Question:
        ==================
        {query}
        "
    )
}

/// Convert fused retrieval results to JSON format for LLM context
pub fn chunks_to_chat_context(results: &[FusedResult]) -> Value {
    fn round_score(value: f32) -> f64 {
        (f64::from(value) * 1000.0).round() / 1000.0
    }

    json!(results
        .iter()
        .map(|result| {
            json!({
                "id": result.doc_id(),
                "content": result.content(),
                "metadata": result.metadata(),
                "score": round_score(result.final_score),
            })
        })
        .collect::<Vec<_>>())
}

pub fn generation_payload(query: &str, results: &[FusedResult]) -> ProviderPayload {
    let context = chunks_to_chat_context(results);
    ProviderPayload::new(ANSWER_SYSTEM_PROMPT, create_user_message(&context, query)).with_schema(
        ResponseSchema {
            name: "query_answering_with_ids".into(),
            description: Some("Query answering AI".into()),
            schema: get_query_response_schema(),
        },
    )
}

pub fn process_llm_response(content: &str) -> Result<Answer, ProviderError> {
    serde_json::from_str::<LLMResponseFormat>(content.trim())
        .map(Answer::from)
        .map_err(|e| {
            ProviderError::invalid_response(format!("Failed to parse LLM response into answer: {e}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{error::FailureReason, types::Chunk};
    use std::sync::Arc;

    fn fused(id: &str, content: &str, score: f32) -> FusedResult {
        let mut result = FusedResult::new(Arc::new(
            Chunk::new(id, "scope", content).with_metadata("source", "notes.md"),
        ));
        result.final_score = score;
        result
    }

    #[test]
    fn context_rounds_scores_and_keeps_order() {
        let context = chunks_to_chat_context(&[
            fused("a", "first", 0.123_456),
            fused("b", "second", 0.5),
        ]);
        let items = context.as_array().expect("array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], "a");
        assert_eq!(items[0]["score"], json!(0.123));
        assert_eq!(items[1]["metadata"]["source"], "notes.md");
    }

    #[test]
    fn payload_embeds_context_and_question() {
        let payload = generation_payload("what is tokio?", &[fused("a", "Tokio is a runtime", 0.9)]);
        assert!(payload.user_message.contains("Tokio is a runtime"));
        assert!(payload.user_message.contains("what is tokio?"));
        assert_eq!(payload.system_prompt, ANSWER_SYSTEM_PROMPT);
        assert!(payload.response_schema.is_some());
    }

    #[test]
    fn parses_structured_answer() {
        let answer = process_llm_response(
            r#"{"answer": "A runtime.", "references": [{"reference": "a"}]}"#,
        )
        .expect("answer");
        assert_eq!(answer.content, "A runtime.");
        assert_eq!(answer.references, vec!["a".to_string()]);
    }

    #[test]
    fn malformed_answer_is_an_invalid_response() {
        let err = process_llm_response("Sure! Here is the answer").expect_err("not json");
        assert_eq!(err.reason, FailureReason::InvalidResponse);
    }
}

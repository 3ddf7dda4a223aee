use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Metadata = serde_json::Map<String, Value>;

/// A unit of already-extracted text handed to the retrieval layer by a collaborator.
///
/// Chunks are immutable once indexed. Everything downstream refers to them by `id`
/// and shares them behind an `Arc` instead of copying content around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub scope_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    pub fn new(id: impl Into<String>, scope_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scope_id: scope_id.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Flattens a metadata field into plain text.
    ///
    /// Strings are returned as-is, arrays are joined with spaces and scalars are
    /// rendered. Missing, null or empty values yield `None`.
    pub fn metadata_text(&self, key: &str) -> Option<String> {
        let text = match self.metadata.get(key)? {
            Value::Null => return None,
            Value::String(value) => value.clone(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(value) => Some(value.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect::<Vec<_>>()
                .join(" "),
            other => other.to_string(),
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_text_flattens_values() {
        let chunk = Chunk::new("c1", "s1", "body")
            .with_metadata("candidate_name", "Ada Lovelace")
            .with_metadata("skills", json!(["rust", "sql", null]))
            .with_metadata("years", 7)
            .with_metadata("empty", "   ");

        assert_eq!(
            chunk.metadata_text("candidate_name").as_deref(),
            Some("Ada Lovelace")
        );
        assert_eq!(chunk.metadata_text("skills").as_deref(), Some("rust sql"));
        assert_eq!(chunk.metadata_text("years").as_deref(), Some("7"));
        assert_eq!(chunk.metadata_text("empty"), None);
        assert_eq!(chunk.metadata_text("missing"), None);
    }

    #[test]
    fn deserializes_without_metadata() {
        let chunk: Chunk =
            serde_json::from_str(r#"{"id":"c1","scope_id":"s1","content":"hello"}"#)
                .expect("chunk should deserialize");
        assert!(chunk.metadata.is_empty());
    }
}

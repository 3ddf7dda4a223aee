use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use common::types::Chunk;
use tracing::info;

/// Reads a JSON array of chunks from `path`.
pub async fn load_chunks(path: &Path) -> Result<Vec<Arc<Chunk>>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading chunk corpus {}", path.display()))?;
    let chunks: Vec<Chunk> = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing chunk corpus {}", path.display()))?;

    info!(path = %path.display(), chunks = chunks.len(), "Loaded chunk corpus");
    Ok(chunks.into_iter().map(Arc::new).collect())
}

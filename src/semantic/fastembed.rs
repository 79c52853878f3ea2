use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::info;

use super::{Embedder, EmbeddingError};

/// Local ONNX embedder (BGE-Small-En-V1.5).
///
/// The model is loaded lazily on first use; inference runs on the blocking pool.
pub struct FastEmbedder {
    model: Arc<Mutex<Option<TextEmbedding>>>,
    show_download_progress: bool,
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("model", &"BGESmallENV15")
            .finish()
    }
}

impl Default for FastEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl FastEmbedder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            show_download_progress: false,
        }
    }

    /// Load the model now instead of on the first request.
    pub async fn initialize(&self) -> Result<(), EmbeddingError> {
        let mut guard = self.model.lock().await;
        if guard.is_none() {
            info!("Initializing fastembed model (BG-Small-En-V1.5)...");
            let mut options = InitOptions::new(EmbeddingModel::BGESmallENV15);
            options.show_download_progress = self.show_download_progress;
            let model = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                .await
                .map_err(|e| EmbeddingError::Backend(e.to_string()))?
                .map_err(|e| EmbeddingError::Backend(e.to_string()))?;
            *guard = Some(model);
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.initialize().await?;

        let mut guard = self.model.lock().await;
        let mut owned_model = guard
            .take()
            .ok_or_else(|| EmbeddingError::Backend("model unexpectedly missing".to_string()))?;

        let (result, returned_model) = tokio::task::spawn_blocking(move || {
            let res = owned_model.embed(texts, None);
            (res, owned_model)
        })
        .await
        .map_err(|e| EmbeddingError::Backend(e.to_string()))?;

        *guard = Some(returned_model);
        result.map_err(|e| EmbeddingError::Backend(e.to_string()))
    }
}

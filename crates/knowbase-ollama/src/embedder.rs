//! `Embedder` adapter backed by a local or remote Ollama instance.

use ollama_rs::generation::embeddings::request::GenerateEmbeddingsRequest;
use ollama_rs::Ollama;

use knowbase_core::cancel::CancellationToken;
use knowbase_core::error::{KbError, KbResult};
use knowbase_core::ports::Embedder;

/// Wraps the async `ollama-rs` client behind the synchronous `Embedder`
/// port, spinning up a fresh current-thread runtime per call.
pub struct OllamaEmbedder {
    client: Ollama,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    /// `dimensions` is resolved once at startup (spec §6: embedding model
    /// dimensionality is fixed for the lifetime of a store) by generating a
    /// probe embedding.
    pub fn connect(base_url: &str, model: impl Into<String>) -> KbResult<Self> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(KbError::input_invalid("embedding model name must not be empty"));
        }

        let client = build_client(base_url)?;
        let cancel = CancellationToken::new();
        let probe = Self {
            client,
            model,
            dimensions: 0,
        };
        let dimensions = probe.embed("probe", &cancel)?.len();
        if dimensions == 0 {
            return Err(KbError::embedding("ollama returned a zero-dimensional embedding"));
        }
        tracing::info!(model = %probe.model, dimensions, "resolved embedding model dimensionality");

        Ok(Self {
            dimensions,
            ..probe
        })
    }

    fn run_blocking<F, T>(&self, future: F) -> KbResult<T>
    where
        F: std::future::Future<Output = KbResult<T>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| KbError::storage(format!("failed to start embedding runtime: {e}")))?;
        runtime.block_on(future)
    }
}

fn build_client(base_url: &str) -> KbResult<Ollama> {
    let url = url::Url::parse(base_url)
        .map_err(|e| KbError::input_invalid(format!("invalid ollama base url: {e}")))?;
    let host = format!(
        "{}://{}",
        url.scheme(),
        url.host_str().unwrap_or("localhost")
    );
    let port = url.port_or_known_default().unwrap_or(11434);
    Ok(Ollama::new(host, port))
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, text: &str, cancel: &CancellationToken) -> KbResult<Vec<f32>> {
        cancel.check()?;

        let model = self.model.clone();
        let prompt = text.to_string();

        let mut vector = self.run_blocking(async move {
            let request = GenerateEmbeddingsRequest::new(model, prompt.into());
            let response = self
                .client
                .generate_embeddings(request)
                .await
                .map_err(|e| KbError::embedding(format!("ollama embeddings request failed: {e}")))?;

            response
                .embeddings
                .into_iter()
                .next()
                .ok_or_else(|| KbError::embedding("ollama returned an empty embeddings list"))
        })?;

        if vector.is_empty() {
            return Err(KbError::embedding(format!(
                "ollama returned an embedding with zero dimensions for model '{}'",
                self.model
            )));
        }

        if self.dimensions != 0 && vector.len() != self.dimensions {
            return Err(KbError::integrity(format!(
                "embedding dimension changed from {} to {} for model '{}'",
                self.dimensions,
                vector.len(),
                self.model
            )));
        }

        knowbase_core::vector::normalize(&mut vector)?;
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

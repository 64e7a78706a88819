// Provider traits and registry for routable capabilities
//
// The embedding and text-analysis models are external collaborators: local
// backends are injected by the host application, external backends are HTTP
// clients built from environment credentials. The router only ever sees
// availability through this registry.

pub mod external;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use super::errors::Result;
use super::types::{Capability, IdentificationCandidate, LabeledUtterance};

pub use external::{ExternalEmbeddingProvider, ExternalTranscriptAnalyzer};
pub use local::LocalPatternAnalyzer;

/// A fixed-length analysis window handed to an embedding provider
#[derive(Debug, Clone)]
pub struct AudioWindow {
    /// Start time in seconds
    pub start_time: f64,
    /// End time in seconds
    pub end_time: f64,
    /// Mono f32 samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioWindow {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Produces a fixed-dimension voice embedding for an audio window
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for logging (e.g., "local-onnx", "hf-inference")
    fn provider_name(&self) -> &'static str;

    /// Compute the embedding vector for one window
    async fn embed(&self, window: &AudioWindow) -> Result<Vec<f32>>;
}

/// Extracts speaker name candidates from labeled transcript text
#[async_trait]
pub trait TranscriptAnalyzer: Send + Sync {
    /// Provider name for logging
    fn provider_name(&self) -> &'static str;

    /// Scan the utterances for self-introductions
    async fn extract_candidates(
        &self,
        utterances: &[LabeledUtterance],
    ) -> Result<Vec<IdentificationCandidate>>;
}

/// Registry of installed providers, local and external, per capability
///
/// Absence of a slot is what the router's availability checks observe: an
/// empty external slot under PreferExternal routes local, under ExternalOnly
/// it is an ExternalRequired error.
#[derive(Default)]
pub struct ProviderRegistry {
    local_embedding: Option<Arc<dyn EmbeddingProvider>>,
    external_embedding: Option<Arc<dyn EmbeddingProvider>>,
    local_analyzer: Option<Arc<dyn TranscriptAnalyzer>>,
    external_analyzer: Option<Arc<dyn TranscriptAnalyzer>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with the built-in local analyzer and any external
    /// providers that can be constructed from environment credentials.
    ///
    /// The local embedding backend is the host's model integration and must
    /// be supplied through [`with_local_embedding`](Self::with_local_embedding).
    pub fn from_env(external_timeout_secs: u64) -> Self {
        let external_embedding = ExternalEmbeddingProvider::from_env(external_timeout_secs)
            .map(|p| Arc::new(p) as Arc<dyn EmbeddingProvider>);
        let external_analyzer = ExternalTranscriptAnalyzer::from_env(external_timeout_secs)
            .map(|p| Arc::new(p) as Arc<dyn TranscriptAnalyzer>);

        info!(
            "Provider registry from environment: external embedding {}, external analysis {}",
            if external_embedding.is_some() { "configured" } else { "absent" },
            if external_analyzer.is_some() { "configured" } else { "absent" },
        );

        Self {
            local_embedding: None,
            external_embedding,
            local_analyzer: Some(Arc::new(LocalPatternAnalyzer::new())),
            external_analyzer,
        }
    }

    pub fn with_local_embedding(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.local_embedding = Some(provider);
        self
    }

    pub fn with_external_embedding(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.external_embedding = Some(provider);
        self
    }

    pub fn with_local_analyzer(mut self, provider: Arc<dyn TranscriptAnalyzer>) -> Self {
        self.local_analyzer = Some(provider);
        self
    }

    pub fn with_external_analyzer(mut self, provider: Arc<dyn TranscriptAnalyzer>) -> Self {
        self.external_analyzer = Some(provider);
        self
    }

    /// Whether a local provider is installed for the capability
    pub fn has_local(&self, capability: Capability) -> bool {
        match capability {
            Capability::Segmentation => self.local_embedding.is_some(),
            Capability::Identification => self.local_analyzer.is_some(),
        }
    }

    /// Whether an external provider is configured for the capability
    pub fn has_external(&self, capability: Capability) -> bool {
        match capability {
            Capability::Segmentation => self.external_embedding.is_some(),
            Capability::Identification => self.external_analyzer.is_some(),
        }
    }

    pub fn local_embedding(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.local_embedding.clone()
    }

    pub fn external_embedding(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.external_embedding.clone()
    }

    pub fn local_analyzer(&self) -> Option<Arc<dyn TranscriptAnalyzer>> {
        self.local_analyzer.clone()
    }

    pub fn external_analyzer(&self) -> Option<Arc<dyn TranscriptAnalyzer>> {
        self.external_analyzer.clone()
    }
}

// External providers for embedding extraction and transcript analysis
//
// Credentials are read from the environment once, at construction time.
// Every request carries the client-level timeout; a timeout surfaces as an
// ExternalProviderError so the router can count it toward the circuit
// breaker and fall back per privacy mode.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{AudioWindow, TranscriptAnalyzer};
use crate::diarization::errors::{DiarizationError, Result};
use crate::diarization::merger::UNKNOWN_SPEAKER_LABEL;
use crate::diarization::types::{IdentificationCandidate, LabeledUtterance};

/// Default hosted embedding endpoint (Hugging Face Inference API)
const DEFAULT_EMBEDDING_ENDPOINT: &str =
    "https://api-inference.huggingface.co/models/pyannote/embedding";

/// Hosted voice-embedding provider
pub struct ExternalEmbeddingProvider {
    endpoint: String,
    api_key: String,
    client: Client,
}

/// Request body for the embedding endpoint
#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    inputs: EmbeddingInputs<'a>,
}

#[derive(Debug, Serialize)]
struct EmbeddingInputs<'a> {
    samples: &'a [f32],
    sample_rate: u32,
}

impl ExternalEmbeddingProvider {
    pub fn new(endpoint: String, api_key: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            endpoint,
            api_key,
            client,
        }
    }

    /// Build from environment credentials, or None when unconfigured
    pub fn from_env(timeout_secs: u64) -> Option<Self> {
        let api_key = std::env::var("HUGGINGFACE_API_KEY")
            .or_else(|_| std::env::var("HF_TOKEN"))
            .ok()?;
        let endpoint = std::env::var("DIARIZATION_EMBEDDING_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_EMBEDDING_ENDPOINT.to_string());
        Some(Self::new(endpoint, api_key, timeout_secs))
    }

    /// Accept either a bare vector, a nested batch, or {"embedding": [...]}
    fn parse_embedding(value: serde_json::Value) -> Result<Vec<f32>> {
        let array = match value {
            serde_json::Value::Object(mut map) => map
                .remove("embedding")
                .ok_or_else(|| {
                    DiarizationError::ExternalProviderError(
                        "embedding response missing 'embedding' field".to_string(),
                    )
                })?,
            other => other,
        };

        let vector: Vec<serde_json::Value> = match array {
            serde_json::Value::Array(items) => {
                // Nested batch shape: take the first row
                if items.len() == 1 && items[0].is_array() {
                    items[0].as_array().cloned().unwrap_or_default()
                } else {
                    items
                }
            }
            _ => {
                return Err(DiarizationError::ExternalProviderError(
                    "embedding response is not an array".to_string(),
                ))
            }
        };

        let embedding: Option<Vec<f32>> = vector
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        embedding.filter(|e| !e.is_empty()).ok_or_else(|| {
            DiarizationError::ExternalProviderError(
                "embedding response contained non-numeric values".to_string(),
            )
        })
    }
}

#[async_trait]
impl super::EmbeddingProvider for ExternalEmbeddingProvider {
    fn provider_name(&self) -> &'static str {
        "external-embedding"
    }

    async fn embed(&self, window: &AudioWindow) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            inputs: EmbeddingInputs {
                samples: &window.samples,
                sample_rate: window.sample_rate,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                DiarizationError::ExternalProviderError(format!("embedding request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(DiarizationError::ExternalProviderError(format!(
                "embedding endpoint returned status {}",
                response.status()
            )));
        }

        let value: serde_json::Value = response.json().await.map_err(|e| {
            DiarizationError::ExternalProviderError(format!("invalid embedding response: {}", e))
        })?;

        Self::parse_embedding(value)
    }
}

/// Which chat API shape the external analyzer speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiFlavor {
    OpenAi,
    Anthropic,
}

/// Hosted LLM transcript analyzer
pub struct ExternalTranscriptAnalyzer {
    flavor: ApiFlavor,
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

/// Expected JSON payload inside the model response
#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    identifications: Vec<AnalysisEntry>,
}

#[derive(Debug, Deserialize)]
struct AnalysisEntry {
    speaker_label: String,
    name: Option<String>,
    confidence: f32,
    #[serde(default)]
    source_index: Option<usize>,
}

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a helpful assistant that identifies speaker names \
from meeting transcripts. You always respond with valid JSON only, no markdown formatting.";

impl ExternalTranscriptAnalyzer {
    /// Build from environment credentials, or None when unconfigured
    pub fn from_env(timeout_secs: u64) -> Option<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();

        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            return Some(Self {
                flavor: ApiFlavor::OpenAi,
                endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
                api_key,
                model: "gpt-4o-mini".to_string(),
                client,
            });
        }

        if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
            return Some(Self {
                flavor: ApiFlavor::Anthropic,
                endpoint: "https://api.anthropic.com/v1/messages".to_string(),
                api_key,
                model: "claude-3-5-haiku-latest".to_string(),
                client,
            });
        }

        None
    }

    fn build_prompt(utterances: &[LabeledUtterance]) -> String {
        let mut transcript = String::new();
        for utterance in utterances {
            transcript.push_str(&format!("{}: {}\n", utterance.speaker_label, utterance.text));
        }

        format!(
            r#"Analyze the following meeting transcript and identify speaker names from introductions.

Look for patterns like:
- "I'm [name]" or "I am [name]"
- "This is [name]"
- "My name is [name]"
- "[name] here" or "[name] speaking"

Transcript:
{}

For each speaker label, provide the identified name (or null), a confidence
score from 0 to 100, and the zero-based index of the transcript line where the
name was mentioned.

Return ONLY valid JSON in this exact format (no markdown, no code blocks):
{{
  "identifications": [
    {{"speaker_label": "Speaker 1", "name": "John Smith", "confidence": 95, "source_index": 0}}
  ]
}}"#,
            transcript
        )
    }

    async fn call_model(&self, prompt: &str) -> Result<String> {
        let response = match self.flavor {
            ApiFlavor::OpenAi => {
                let body = OpenAiChatRequest {
                    model: self.model.clone(),
                    messages: vec![
                        ChatMessage {
                            role: "system".to_string(),
                            content: ANALYSIS_SYSTEM_PROMPT.to_string(),
                        },
                        ChatMessage {
                            role: "user".to_string(),
                            content: prompt.to_string(),
                        },
                    ],
                    max_tokens: 2000,
                    temperature: 0.3,
                };
                let response = self
                    .client
                    .post(&self.endpoint)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| {
                        DiarizationError::ExternalProviderError(format!(
                            "analysis request failed: {}",
                            e
                        ))
                    })?;
                if !response.status().is_success() {
                    return Err(DiarizationError::ExternalProviderError(format!(
                        "analysis endpoint returned status {}",
                        response.status()
                    )));
                }
                let parsed: OpenAiChatResponse = response.json().await.map_err(|e| {
                    DiarizationError::ExternalProviderError(format!(
                        "invalid analysis response: {}",
                        e
                    ))
                })?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .unwrap_or_default()
            }
            ApiFlavor::Anthropic => {
                let body = AnthropicRequest {
                    model: self.model.clone(),
                    max_tokens: 2000,
                    system: ANALYSIS_SYSTEM_PROMPT.to_string(),
                    messages: vec![ChatMessage {
                        role: "user".to_string(),
                        content: prompt.to_string(),
                    }],
                };
                let response = self
                    .client
                    .post(&self.endpoint)
                    .header("x-api-key", self.api_key.clone())
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| {
                        DiarizationError::ExternalProviderError(format!(
                            "analysis request failed: {}",
                            e
                        ))
                    })?;
                if !response.status().is_success() {
                    return Err(DiarizationError::ExternalProviderError(format!(
                        "analysis endpoint returned status {}",
                        response.status()
                    )));
                }
                let parsed: AnthropicResponse = response.json().await.map_err(|e| {
                    DiarizationError::ExternalProviderError(format!(
                        "invalid analysis response: {}",
                        e
                    ))
                })?;
                parsed
                    .content
                    .into_iter()
                    .next()
                    .map(|c| c.text)
                    .unwrap_or_default()
            }
        };

        Ok(response)
    }

    /// Parse the model's JSON, tolerating markdown code fences
    fn parse_response(
        response: &str,
        utterances: &[LabeledUtterance],
    ) -> Result<Vec<IdentificationCandidate>> {
        let cleaned = response
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        debug!("Parsing analysis response ({} chars)", cleaned.len());

        let parsed: AnalysisResponse = serde_json::from_str(cleaned).map_err(|e| {
            warn!("Analysis response was not valid JSON: {}", e);
            DiarizationError::IdentificationError(format!("invalid JSON response: {}", e))
        })?;

        // Fallback source index: the first utterance carrying each label
        let mut first_index: HashMap<&str, usize> = HashMap::new();
        for (idx, utterance) in utterances.iter().enumerate() {
            first_index
                .entry(utterance.speaker_label.as_str())
                .or_insert(idx);
        }

        let mut candidates = Vec::new();
        for entry in parsed.identifications {
            let name = match entry.name {
                Some(name) if !name.trim().is_empty() => name.trim().to_string(),
                _ => continue,
            };
            if entry.speaker_label == UNKNOWN_SPEAKER_LABEL {
                continue;
            }
            let source_index = entry
                .source_index
                .filter(|idx| *idx < utterances.len())
                .or_else(|| first_index.get(entry.speaker_label.as_str()).copied())
                .unwrap_or(0);

            candidates.push(IdentificationCandidate {
                speaker_label: entry.speaker_label,
                name,
                confidence: (entry.confidence / 100.0).clamp(0.0, 1.0),
                source_index,
            });
        }

        Ok(candidates)
    }
}

#[async_trait]
impl TranscriptAnalyzer for ExternalTranscriptAnalyzer {
    fn provider_name(&self) -> &'static str {
        "external-analysis"
    }

    async fn extract_candidates(
        &self,
        utterances: &[LabeledUtterance],
    ) -> Result<Vec<IdentificationCandidate>> {
        if utterances.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = Self::build_prompt(utterances);
        debug!("Built analysis prompt ({} chars)", prompt.len());

        let response = self.call_model(&prompt).await?;
        Self::parse_response(&response, utterances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(text: &str, label: &str, idx: usize) -> LabeledUtterance {
        let start = idx as f64 * 5.0;
        LabeledUtterance {
            text: text.to_string(),
            start_time: start,
            end_time: start + 4.0,
            speaker_label: label.to_string(),
            alignment_confidence: 1.0,
            is_overlapping: false,
        }
    }

    #[test]
    fn test_parse_embedding_shapes() {
        let bare = serde_json::json!([0.1, 0.2, 0.3]);
        assert_eq!(
            ExternalEmbeddingProvider::parse_embedding(bare).unwrap(),
            vec![0.1, 0.2, 0.3]
        );

        let nested = serde_json::json!([[0.5, 0.6]]);
        assert_eq!(
            ExternalEmbeddingProvider::parse_embedding(nested).unwrap(),
            vec![0.5, 0.6]
        );

        let keyed = serde_json::json!({"embedding": [1.0, 2.0]});
        assert_eq!(
            ExternalEmbeddingProvider::parse_embedding(keyed).unwrap(),
            vec![1.0, 2.0]
        );

        let bad = serde_json::json!({"error": "loading"});
        assert!(ExternalEmbeddingProvider::parse_embedding(bad).is_err());
    }

    #[test]
    fn test_parse_response_with_markdown_fences() {
        let utterances = vec![utterance("I'm Alice", "Speaker 1", 0)];
        let response = r#"```json
{"identifications": [{"speaker_label": "Speaker 1", "name": "Alice", "confidence": 90, "source_index": 0}]}
```"#;

        let candidates =
            ExternalTranscriptAnalyzer::parse_response(response, &utterances).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "Alice");
        assert!((candidates[0].confidence - 0.9).abs() < 0.001);
    }

    #[test]
    fn test_parse_response_skips_null_names() {
        let utterances = vec![
            utterance("Hello", "Speaker 1", 0),
            utterance("Hi", "Speaker 2", 1),
        ];
        let response = r#"{"identifications": [
            {"speaker_label": "Speaker 1", "name": null, "confidence": 0},
            {"speaker_label": "Speaker 2", "name": "Bob", "confidence": 120}
        ]}"#;

        let candidates =
            ExternalTranscriptAnalyzer::parse_response(response, &utterances).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "Bob");
        // Out-of-range confidence is clamped, missing index falls back to
        // the label's first utterance
        assert!((candidates[0].confidence - 1.0).abs() < 0.001);
        assert_eq!(candidates[0].source_index, 1);
    }

    #[test]
    fn test_parse_response_rejects_invalid_json() {
        let utterances = vec![utterance("Hello", "Speaker 1", 0)];
        let result = ExternalTranscriptAnalyzer::parse_response("not json at all", &utterances);
        assert!(result.is_err());
    }

    #[test]
    fn test_prompt_contains_labeled_lines() {
        let utterances = vec![
            utterance("Hello, I'm John", "Speaker 1", 0),
            utterance("Hi, this is Sarah", "Speaker 2", 1),
        ];
        let prompt = ExternalTranscriptAnalyzer::build_prompt(&utterances);
        assert!(prompt.contains("Speaker 1: Hello, I'm John"));
        assert!(prompt.contains("Speaker 2: Hi, this is Sarah"));
        assert!(prompt.contains("JSON"));
    }
}

use serde::{Deserialize, Serialize};

use crate::types::Content;

/// Sampling and length controls for a generation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling probability mass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-k sampling limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Upper bound on generated tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Sequences that stop generation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl GenerationConfig {
    /// True when no field is set, in which case the config is left out of the request.
    pub fn is_empty(&self) -> bool {
        self == &GenerationConfig::default()
    }
}

/// Body of a `generateContent` or `streamGenerateContent` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    /// The conversation so far, ending with the newest user turn.
    pub contents: Vec<Content>,

    /// Developer-set system instruction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,

    /// Sampling and length controls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl GenerateContentRequest {
    /// Create a request for the given contents.
    pub fn new(contents: Vec<Content>) -> Self {
        Self {
            contents,
            system_instruction: None,
            generation_config: None,
        }
    }

    /// Attach a system instruction.
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(Content::instruction(instruction));
        self
    }

    /// Attach generation controls, dropping them when empty.
    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = if config.is_empty() {
            None
        } else {
            Some(config)
        };
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    /// Natural stop point or a stop sequence.
    Stop,
    /// Hit the output token limit.
    MaxTokens,
    /// Flagged by safety filters.
    Safety,
    /// Flagged for recitation.
    Recitation,
    /// Any reason this crate does not distinguish.
    #[serde(other)]
    Other,
}

/// One generated response candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Generated content; absent on some terminal chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,

    /// Set on the final chunk for this candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,

    /// Index of the candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// Feedback about the prompt itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    /// Present when the prompt was blocked and no candidates were generated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

/// Token accounting for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    /// Tokens in the prompt, including history and system instruction.
    #[serde(default)]
    pub prompt_token_count: u32,

    /// Tokens across all generated candidates.
    #[serde(default)]
    pub candidates_token_count: u32,

    /// Tokens spent on thinking.
    #[serde(default)]
    pub thoughts_token_count: u32,

    /// Total tokens for the request.
    #[serde(default)]
    pub total_token_count: u32,
}

/// A full response, or one chunk of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    /// Candidate responses.
    #[serde(default)]
    pub candidates: Vec<Candidate>,

    /// Feedback on the prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_feedback: Option<PromptFeedback>,

    /// Token accounting; usually only meaningful on the last chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,

    /// The model version that produced the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl GenerateContentResponse {
    /// The answer text of the first candidate, thoughts excluded.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(Content::text)
            .unwrap_or_default()
    }

    /// The reason the prompt was blocked, if it was.
    pub fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.as_deref())
    }

    /// The finish reason of the first candidate, if this chunk carries one.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.candidates
            .first()
            .and_then(|candidate| candidate.finish_reason)
    }
}

//! Configuration types for the chat application.

use crate::types::{GenerationConfig, KnownModel, Model};

/// System instruction every chat session is created with.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful and friendly AI assistant. Keep your responses concise and informative.";

/// Configuration for a chat session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// The model to use for generating responses.
    pub model: Model,

    /// Optional system instruction to set conversation context.
    pub system_instruction: Option<String>,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,

    /// Optional sampling temperature.
    pub temperature: Option<f32>,

    /// Optional top-p nucleus sampling value.
    pub top_p: Option<f32>,

    /// Optional top-k sampling limit.
    pub top_k: Option<u32>,

    /// Optional cap on generated tokens per reply.
    pub max_output_tokens: Option<u32>,

    /// Custom stop sequences supplied on every request.
    pub stop_sequences: Vec<String>,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Model: gemini-2.5-flash
    /// - System instruction: [`DEFAULT_SYSTEM_INSTRUCTION`]
    /// - Color: enabled
    /// - Sampling: server defaults
    pub fn new() -> Self {
        Self {
            model: Model::Known(KnownModel::Gemini25Flash),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            use_color: true,
            temperature: None,
            top_p: None,
            top_k: None,
            max_output_tokens: None,
            stop_sequences: Vec::new(),
        }
    }

    /// Sets the model to use.
    pub fn with_model(mut self, model: impl Into<Model>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the system instruction.  `None` sends no instruction at all.
    pub fn with_system_instruction(mut self, instruction: Option<String>) -> Self {
        self.system_instruction = instruction;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the top-p value.
    pub fn with_top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }

    /// Sets the top-k value.
    pub fn with_top_k(mut self, top_k: Option<u32>) -> Self {
        self.top_k = top_k;
        self
    }

    /// Sets the per-reply output token cap.
    pub fn with_max_output_tokens(mut self, max_output_tokens: Option<u32>) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Sets the stop sequences.
    pub fn with_stop_sequences(mut self, stop_sequences: Vec<String>) -> Self {
        self.stop_sequences = stop_sequences;
        self
    }

    /// The generation parameters to attach to each request.
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            max_output_tokens: self.max_output_tokens,
            stop_sequences: self.stop_sequences.clone(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

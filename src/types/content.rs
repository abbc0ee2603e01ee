use serde::{Deserialize, Serialize};

/// The producer of a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Content written by the person chatting.
    User,
    /// Content generated by the model.
    Model,
}

/// A single part of a multi-part [`Content`].
///
/// Only text parts are modelled; other part kinds the API may return (inline data, function
/// calls) deserialize as a part with no text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Inline text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Set when the part is a thought summary rather than answer text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
}

impl Part {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            thought: None,
        }
    }

    /// True if this part carries a thought summary.
    pub fn is_thought(&self) -> bool {
        self.thought.unwrap_or(false)
    }
}

/// The base structured datatype containing multi-part content of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// The producer of the content; absent for system instructions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Ordered parts that constitute a single message.
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// Create a single-part text content for `role`.
    pub fn new_with_text(text: impl Into<String>, role: Role) -> Self {
        Self {
            role: Some(role),
            parts: vec![Part::text(text)],
        }
    }

    /// Create a role-less content, as used for system instructions.
    pub fn instruction(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }

    /// Concatenate the answer text of every part, skipping thoughts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|part| !part.is_thought())
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

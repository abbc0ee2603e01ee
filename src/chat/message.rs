use std::fmt;

pub use crate::types::Role;

/// Text of the message every conversation starts with.
pub const GREETING: &str = "Hello! How can I help you today?";

/// Text that replaces a reply whose stream failed.
pub const ERROR_REPLY: &str = "Sorry, something went wrong. Please try again.";

/// Identifies one message for the lifetime of its conversation.
///
/// Ids are minted once, when the message is created, and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// One entry of the visible transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::Model,
            text: text.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_model(&self) -> bool {
        self.role == Role::Model
    }
}

/// Where the conversation is in its send cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Nothing in flight; a new message may be submitted.
    #[default]
    Idle,
    /// A reply was requested and no fragment has arrived yet.
    Sending,
    /// At least one fragment of the reply has arrived.
    Streaming,
}

/// A snapshot of the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    messages: Vec<Message>,
    phase: Phase,
}

impl ConversationState {
    pub(crate) fn seeded(greeting: Message) -> Self {
        Self {
            messages: vec![greeting],
            phase: Phase::Idle,
        }
    }

    /// Messages in creation order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True from the moment a send is accepted until its reply completes or fails.
    pub fn is_pending(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Append `fragment` to the message with `id`.  Returns false when no such message exists.
    pub(crate) fn append(&mut self, id: MessageId, fragment: &str) -> bool {
        match self.messages.iter_mut().find(|message| message.id == id) {
            Some(message) => {
                message.text.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Remove the message with `id`, returning it.
    pub(crate) fn remove(&mut self, id: MessageId) -> Option<Message> {
        let index = self.messages.iter().position(|message| message.id == id)?;
        Some(self.messages.remove(index))
    }
}

//! Streaming chat on top of the Gemini client.
//!
//! # Architecture
//!
//! - [`config`]: model and generation settings for a session
//! - [`message`]: the transcript and its send phase
//! - [`session`]: the session seam and its Gemini implementation
//! - [`controller`]: the state machine that turns a submitted line into a streamed reply
//! - [`render`]: terminal output driven by transcript snapshots

mod config;
mod controller;
mod message;
mod render;
mod session;

pub use config::{ChatConfig, DEFAULT_SYSTEM_INSTRUCTION};
pub use controller::{ConversationController, SendHandle};
pub use message::{ConversationState, ERROR_REPLY, GREETING, Message, MessageId, Phase, Role};
pub use render::{PlainTextRenderer, Renderer};
pub use session::{ChatSession, FragmentStream, GeminiChat, GeminiProvider, SessionProvider};

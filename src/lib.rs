// Public modules
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod sse;
pub mod types;

mod observability;

// Re-exports
pub use chat::{
    ChatConfig, ChatSession, ConversationController, ConversationState, FragmentStream,
    GeminiChat, GeminiProvider, Message, MessageId, Phase, SendHandle, SessionProvider,
};
pub use client::Gemini;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use observability::register_biometrics;
pub use types::*;

//! The conversation state machine.
//!
//! A [`ConversationController`] owns the transcript and the single chat session behind it.  The
//! transcript lives in a `watch` channel: every mutation publishes a new snapshot, and renderers
//! redraw from whatever snapshot is current.
//!
//! ```text
//! Idle --send--> Sending --first fragment--> Streaming --end--> Idle
//!                   |                            |
//!                   +-----------failure----------+--> Idle (reply replaced by ERROR_REPLY)
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::{FutureExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::chat::message::{ERROR_REPLY, GREETING, Message, MessageId, Phase};
use crate::chat::{ChatConfig, ChatSession, ConversationState, SessionProvider};
use crate::observability::{
    CONVERSATION_FAILURES, CONVERSATION_FRAGMENTS, CONVERSATION_SENDS,
    CONVERSATION_SENDS_IGNORED, CONVERSATION_TURN_DURATION,
};
use crate::{Error, Result};

type SharedSession = Arc<Mutex<Box<dyn ChatSession>>>;

struct Inner {
    state: watch::Sender<ConversationState>,
    session: OnceLock<SharedSession>,
    next_id: AtomicU64,
}

/// Drives one conversation.  Clones share the same conversation.
#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<Inner>,
}

impl ConversationController {
    /// Create a controller holding only the greeting and no session.
    pub fn new() -> Self {
        let next_id = AtomicU64::new(0);
        let greeting = Message::model(
            MessageId::new(next_id.fetch_add(1, Ordering::Relaxed)),
            GREETING,
        );
        let (state, _) = watch::channel(ConversationState::seeded(greeting));
        Self {
            inner: Arc::new(Inner {
                state,
                session: OnceLock::new(),
                next_id,
            }),
        }
    }

    /// Create a controller with a session from `provider` already attached.
    pub fn bootstrap(provider: &dyn SessionProvider, config: &ChatConfig) -> Result<Self> {
        let controller = Self::new();
        controller.attach_session(provider.create_session(config)?)?;
        Ok(controller)
    }

    /// Attach the session replies come from.  A controller accepts exactly one session.
    pub fn attach_session(&self, session: Box<dyn ChatSession>) -> Result<()> {
        self.inner
            .session
            .set(Arc::new(Mutex::new(session)))
            .map_err(|_| {
                Error::validation(
                    "a chat session is already attached",
                    Some("session".to_string()),
                )
            })
    }

    pub fn has_session(&self) -> bool {
        self.inner.session.get().is_some()
    }

    /// A copy of the current conversation.
    pub fn snapshot(&self) -> ConversationState {
        self.inner.state.borrow().clone()
    }

    /// A receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.inner.state.subscribe()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.borrow().is_pending()
    }

    /// True when [`send`](Self::send) would accept `text` right now.
    pub fn can_submit(&self, text: &str) -> bool {
        !text.trim().is_empty() && self.has_session() && !self.is_pending()
    }

    /// Wait until no reply is in flight and return that snapshot.
    pub async fn wait_idle(&self) -> ConversationState {
        let mut updates = self.subscribe();
        match updates.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Submit `text` and start streaming the reply.
    ///
    /// Returns `None` without touching the conversation when the trimmed text is empty, a reply
    /// is already pending, or no session is attached.  Otherwise the user message and an empty
    /// model message are appended immediately and the reply streams in on a background task.
    /// Must be called from within a Tokio runtime.
    pub fn send(&self, text: &str) -> Option<SendHandle> {
        let text = text.trim();
        if text.is_empty() {
            return self.ignore("empty message");
        }
        let Some(session) = self.inner.session.get().cloned() else {
            return self.ignore("no session attached");
        };
        let Ok(runtime) = Handle::try_current() else {
            return self.ignore("no Tokio runtime");
        };

        let mut reply_id = None;
        self.inner.state.send_if_modified(|state| {
            if state.is_pending() {
                return false;
            }
            state.push(Message::user(self.mint(), text));
            let id = self.mint();
            state.push(Message::model(id, ""));
            state.set_phase(Phase::Sending);
            reply_id = Some(id);
            true
        });
        let Some(reply_id) = reply_id else {
            return self.ignore("a reply is already pending");
        };

        CONVERSATION_SENDS.click();
        tracing::debug!(message_id = %reply_id, "sending message");
        let controller = self.clone();
        let text = text.to_string();
        let task = runtime.spawn(async move {
            controller.run_turn(session, text, reply_id).await;
        });
        Some(SendHandle { reply_id, task })
    }

    fn ignore(&self, reason: &str) -> Option<SendHandle> {
        CONVERSATION_SENDS_IGNORED.click();
        tracing::debug!(reason, "send ignored");
        None
    }

    fn mint(&self) -> MessageId {
        MessageId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn run_turn(self, session: SharedSession, text: String, reply_id: MessageId) {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.stream_reply(&session, &text, reply_id))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(fragments)) => {
                tracing::debug!(message_id = %reply_id, fragments, "reply complete");
                self.inner.state.send_modify(|state| state.set_phase(Phase::Idle));
            }
            Ok(Err(err)) => {
                tracing::warn!(message_id = %reply_id, error = %err, "reply failed");
                self.substitute_error(reply_id);
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(message_id = %reply_id, reason = %reason, "reply panicked");
                self.substitute_error(reply_id);
            }
        }
        CONVERSATION_TURN_DURATION.add(start.elapsed().as_secs_f64());
    }

    /// Replace the reply with [`ERROR_REPLY`] and return to idle.
    fn substitute_error(&self, reply_id: MessageId) {
        CONVERSATION_FAILURES.click();
        self.inner.state.send_modify(|state| {
            state.remove(reply_id);
            state.push(Message::model(self.mint(), ERROR_REPLY));
            state.set_phase(Phase::Idle);
        });
    }

    async fn stream_reply(
        &self,
        session: &SharedSession,
        text: &str,
        reply_id: MessageId,
    ) -> Result<usize> {
        let mut fragments = {
            let mut session = session.lock().await;
            session.send_streaming(text).await?
        };
        let mut applied = 0;
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            CONVERSATION_FRAGMENTS.click();
            self.inner.state.send_if_modified(|state| {
                if !state.append(reply_id, &fragment) {
                    return false;
                }
                state.set_phase(Phase::Streaming);
                true
            });
            applied += 1;
        }
        Ok(applied)
    }
}

impl Default for ConversationController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConversationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationController")
            .field("state", &*self.inner.state.borrow())
            .field("has_session", &self.has_session())
            .finish()
    }
}

/// The background reply started by [`ConversationController::send`].
///
/// Dropping the handle leaves the reply running.
#[derive(Debug)]
pub struct SendHandle {
    reply_id: MessageId,
    task: JoinHandle<()>,
}

impl SendHandle {
    /// Id of the model message the reply streams into.
    ///
    /// If the reply fails, that message is replaced by one with a new id.
    pub fn reply_id(&self) -> MessageId {
        self.reply_id
    }

    /// Wait for the reply to complete or fail.
    pub async fn finished(self) {
        if let Err(err) = self.task.await {
            tracing::error!(message_id = %self.reply_id, error = %err, "reply task aborted");
        }
    }
}

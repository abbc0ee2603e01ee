use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::oneshot;

use crate::chat::ChatConfig;
use crate::{
    Content, Error, Gemini, GenerateContentRequest, GenerateContentResponse, Result, Role,
};

////////////////////////////////////////// FragmentStream //////////////////////////////////////////

/// The incremental text of one reply.
///
/// A fragment stream is finite and cannot be restarted.  It may fail on any item, including after
/// some fragments were delivered, and yields nothing after its first error.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

//////////////////////////////////////////// ChatSession ///////////////////////////////////////////

/// A conversation with a model that answers one message at a time.
#[async_trait::async_trait]
pub trait ChatSession: Send {
    /// Send `text` and return the stream of reply fragments.
    async fn send_streaming(&mut self, text: &str) -> Result<FragmentStream>;
}

////////////////////////////////////////// SessionProvider /////////////////////////////////////////

/// Creates chat sessions.
pub trait SessionProvider: Send + Sync {
    fn create_session(&self, config: &ChatConfig) -> Result<Box<dyn ChatSession>>;
}

//////////////////////////////////////////// GeminiChat ////////////////////////////////////////////

struct PendingTurn {
    user: Content,
    reply_rx: oneshot::Receiver<Content>,
}

/// A multi-turn chat backed by `streamGenerateContent`.
///
/// Every send carries the whole history.  A turn joins the history only once its reply stream
/// has completed with some text; failed or abandoned turns are forgotten.
pub struct GeminiChat {
    client: Gemini,
    config: ChatConfig,
    history: Vec<Content>,
    in_flight: Option<PendingTurn>,
}

impl GeminiChat {
    pub fn new(client: Gemini, config: ChatConfig) -> Self {
        Self {
            client,
            config,
            history: Vec::new(),
            in_flight: None,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// The completed turns of this chat, oldest first.
    pub fn history(&mut self) -> &[Content] {
        self.settle();
        &self.history
    }

    fn request_for(&self, user: &Content) -> GenerateContentRequest {
        let mut contents = self.history.clone();
        contents.push(user.clone());
        let mut request = GenerateContentRequest::new(contents)
            .with_generation_config(self.config.generation_config());
        if let Some(instruction) = &self.config.system_instruction {
            request = request.with_system_instruction(instruction.clone());
        }
        request
    }

    fn track<S>(&mut self, user: Content, chunks: S) -> FragmentStream
    where
        S: Stream<Item = Result<GenerateContentResponse>> + Send + 'static,
    {
        let (recorder, reply_rx) = ReplyRecorder::new(chunks);
        self.in_flight = Some(PendingTurn { user, reply_rx });
        Box::pin(recorder)
    }

    /// Fold the previous turn into the history if its reply completed.
    fn settle(&mut self) {
        let Some(mut turn) = self.in_flight.take() else {
            return;
        };
        match turn.reply_rx.try_recv() {
            Ok(reply) => {
                self.history.push(turn.user);
                self.history.push(reply);
            }
            Err(_) => {
                tracing::debug!("previous turn did not complete; leaving it out of the history");
            }
        }
    }
}

#[async_trait::async_trait]
impl ChatSession for GeminiChat {
    async fn send_streaming(&mut self, text: &str) -> Result<FragmentStream> {
        self.settle();
        let user = Content::new_with_text(text, Role::User);
        let request = self.request_for(&user);
        let chunks = self
            .client
            .stream_generate_content(&self.config.model, &request)
            .await?;
        Ok(self.track(user, chunks))
    }
}

////////////////////////////////////////// GeminiProvider //////////////////////////////////////////

/// Hands out [`GeminiChat`] sessions that share one client.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Gemini,
}

impl GeminiProvider {
    pub fn new(client: Gemini) -> Self {
        Self { client }
    }
}

impl SessionProvider for GeminiProvider {
    fn create_session(&self, config: &ChatConfig) -> Result<Box<dyn ChatSession>> {
        tracing::debug!(model = %config.model, "creating chat session");
        Ok(Box::new(GeminiChat::new(self.client.clone(), config.clone())))
    }
}

/////////////////////////////////////////// ReplyRecorder //////////////////////////////////////////

/// Turns response chunks into text fragments while recording the full reply.
///
/// When the inner stream ends cleanly with non-empty text, the reply is sent on the oneshot
/// channel returned by `new()`.  An error drops the sender instead.
struct ReplyRecorder {
    inner: Pin<Box<dyn Stream<Item = Result<GenerateContentResponse>> + Send>>,
    reply_tx: Option<oneshot::Sender<Content>>,
    text: String,
    done: bool,
}

impl ReplyRecorder {
    fn new<S>(stream: S) -> (Self, oneshot::Receiver<Content>)
    where
        S: Stream<Item = Result<GenerateContentResponse>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let this = Self {
            inner: Box::pin(stream),
            reply_tx: Some(tx),
            text: String::new(),
            done: false,
        };
        (this, rx)
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(tx) = self.reply_tx.take()
            && !self.text.is_empty()
        {
            let reply = Content::new_with_text(std::mem::take(&mut self.text), Role::Model);
            let _ = tx.send(reply);
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.done = true;
        self.reply_tx.take();
        err
    }
}

impl Stream for ReplyRecorder {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let fragment = chunk.text();
                    if fragment.is_empty() {
                        continue;
                    }
                    self.text.push_str(&fragment);
                    return Poll::Ready(Some(Ok(fragment)));
                }
                Poll::Ready(Some(Err(e))) => {
                    let e = self.fail(e);
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.finish();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

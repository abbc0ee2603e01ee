//! Output rendering for the chat application.
//!
//! Renderers are fed conversation snapshots and print whatever changed since the previous one.
//! Messages are append-only apart from the reply being streamed, so a renderer only needs to
//! remember how much of the open message it already printed.

use std::io::{self, Stdout, Write};

use crate::chat::{ConversationState, ERROR_REPLY, Message, MessageId, Role};

/// ANSI escape code for dim text (used for informational lines).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for the user label).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for green text (used for the model label).
const ANSI_GREEN: &str = "\x1b[32m";

/// ANSI escape code for red text (used for failed replies and errors).
const ANSI_RED: &str = "\x1b[31m";

/// Trait for rendering a conversation.
pub trait Renderer: Send {
    /// Bring the output up to date with `state`.
    ///
    /// Called with successive snapshots of the same conversation.  Intermediate snapshots may be
    /// skipped.
    fn render(&mut self, state: &ConversationState);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer<W: Write + Send = Stdout> {
    out: W,
    use_color: bool,
    echo_user: bool,
    /// The message currently being printed and how many bytes of it are out.
    open: Option<(MessageId, usize)>,
    /// Every message with an id at or below this one has been printed in full.
    closed_through: Option<MessageId>,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer on stdout with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer on stdout with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self::with_writer(io::stdout(), use_color)
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> PlainTextRenderer<W> {
    /// Creates a renderer that writes to `out`.
    pub fn with_writer(out: W, use_color: bool) -> Self {
        Self {
            out,
            use_color,
            echo_user: true,
            open: None,
            closed_through: None,
        }
    }

    /// Whether to print user messages.  A line editor has usually shown them already.
    pub fn with_user_echo(mut self, echo_user: bool) -> Self {
        self.echo_user = echo_user;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn is_closed(&self, id: MessageId) -> bool {
        self.closed_through.is_some_and(|through| id <= through)
    }

    fn close_open(&mut self) {
        if let Some((id, _)) = self.open.take() {
            if self.use_color {
                let _ = write!(self.out, "{ANSI_RESET}");
            }
            let _ = writeln!(self.out);
            self.closed_through = Some(id);
        }
    }

    /// Mark the open message as cut short.  Its text stays on screen and is never extended.
    fn interrupt_open(&mut self) {
        if let Some((id, printed)) = self.open.take() {
            let gap = if printed == 0 { "" } else { " " };
            if self.use_color {
                let _ = writeln!(self.out, "{ANSI_RESET}{gap}{ANSI_DIM}[interrupted]{ANSI_RESET}");
            } else {
                let _ = writeln!(self.out, "{gap}[interrupted]");
            }
            self.closed_through = Some(id);
        }
    }

    fn start(&mut self, message: &Message) {
        self.close_open();
        if message.role == Role::User && !self.echo_user {
            self.closed_through = Some(message.id);
            return;
        }
        let (label, color) = match message.role {
            Role::User => ("You", ANSI_CYAN),
            Role::Model => ("Gemini", ANSI_GREEN),
        };
        if self.use_color {
            let _ = write!(self.out, "{color}{label}:{ANSI_RESET} ");
            if message.text == ERROR_REPLY {
                let _ = write!(self.out, "{ANSI_RED}");
            }
        } else {
            let _ = write!(self.out, "{label}: ");
        }
        let _ = write!(self.out, "{}", message.text);
        self.open = Some((message.id, message.text.len()));
    }

    fn extend(&mut self, message: &Message, printed: usize) {
        let rest = message.text.get(printed..).unwrap_or("");
        let _ = write!(self.out, "{rest}");
        self.open = Some((message.id, message.text.len().max(printed)));
    }

    /// Flushes output to ensure immediate display of streamed content.
    fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

impl<W: Write + Send> Renderer for PlainTextRenderer<W> {
    fn render(&mut self, state: &ConversationState) {
        if let Some((id, _)) = self.open
            && state.get(id).is_none()
        {
            self.interrupt_open();
        }
        for message in state.messages() {
            if self.is_closed(message.id) {
                continue;
            }
            match self.open {
                Some((id, printed)) if id == message.id => self.extend(message, printed),
                _ => self.start(message),
            }
        }
        if !state.is_pending() {
            self.close_open();
        }
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        self.close_open();
        if self.use_color {
            let _ = writeln!(self.out, "{ANSI_RED}Error: {error}{ANSI_RESET}");
        } else {
            let _ = writeln!(self.out, "Error: {error}");
        }
        self.flush();
    }

    fn print_info(&mut self, info: &str) {
        self.close_open();
        if self.use_color {
            let _ = writeln!(self.out, "{ANSI_DIM}{info}{ANSI_RESET}");
        } else {
            let _ = writeln!(self.out, "{info}");
        }
        self.flush();
    }
}

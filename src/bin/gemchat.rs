//! Interactive chat with Gemini.
//!
//! Reads the credential from `API_KEY` (or `GEMINI_API_KEY`), then opens a line-editing prompt.
//! Each submitted line is sent to `gemini-2.5-flash` and the reply is printed as it streams in.
//!
//! ```bash
//! API_KEY=... gemchat
//!
//! # Diagnostics go to stderr
//! RUST_LOG=gemchat=debug API_KEY=... gemchat
//! ```
//!
//! Set `NO_COLOR` to disable ANSI styling.  Ctrl+D exits.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use gemchat::chat::{
    ChatConfig, ConversationController, GeminiProvider, PlainTextRenderer, Renderer,
};
use gemchat::{ClientConfig, Gemini};

/// Main entry point for the gemchat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")),
        )
        .with_target(false)
        .compact()
        .init();

    let client_config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gemchat: {err}");
            std::process::exit(1);
        }
    };

    let mut chat_config = ChatConfig::default();
    if std::env::var_os("NO_COLOR").is_some() {
        chat_config = chat_config.without_color();
    }

    let provider = GeminiProvider::new(Gemini::new(client_config)?);
    let controller = ConversationController::bootstrap(&provider, &chat_config)?;
    let mut renderer = PlainTextRenderer::with_color(chat_config.use_color).with_user_echo(false);
    let mut rl = DefaultEditor::new()?;

    renderer.print_info(&format!(
        "Gemini Chat (model: {}). Ctrl+D to exit.\n",
        chat_config.model
    ));
    let mut updates = controller.subscribe();
    let greeting = updates.borrow_and_update().clone();
    renderer.render(&greeting);

    loop {
        match rl.readline("You: ") {
            Ok(line) => {
                if !controller.can_submit(&line) {
                    continue;
                }
                let _ = rl.add_history_entry(line.trim());
                if controller.send(&line).is_none() {
                    continue;
                }

                loop {
                    let state = updates.borrow_and_update().clone();
                    renderer.render(&state);
                    if !state.is_pending() || updates.changed().await.is_err() {
                        break;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Failed to read input: {err}"));
                break;
            }
        }
    }

    Ok(())
}

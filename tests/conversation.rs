use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::{StreamExt, stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use gemchat::chat::{
    ChatConfig, ChatSession, ConversationController, ERROR_REPLY, FragmentStream, GREETING,
    GeminiProvider, Phase, Role, SessionProvider,
};
use gemchat::{ClientConfig, Error, Gemini, Result};

enum Script {
    Fragments(Vec<Result<String>>),
    Fail(Error),
    Live(UnboundedReceiver<Result<String>>),
    PanicOnSend,
    PanicMidStream(Vec<Result<String>>),
}

struct ScriptedSession {
    scripts: VecDeque<Script>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl ChatSession for ScriptedSession {
    async fn send_streaming(&mut self, text: &str) -> Result<FragmentStream> {
        self.sent.lock().unwrap().push(text.to_string());
        match self.scripts.pop_front() {
            Some(Script::Fragments(fragments)) => Ok(Box::pin(stream::iter(fragments))),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Live(rx)) => Ok(Box::pin(rx)),
            Some(Script::PanicOnSend) => panic!("session refused to send"),
            Some(Script::PanicMidStream(fragments)) => Ok(Box::pin(stream::iter(fragments).chain(
                stream::poll_fn(|_| -> Poll<Option<Result<String>>> {
                    panic!("stream exploded")
                }),
            ))),
            None => Err(Error::streaming("script exhausted", None)),
        }
    }
}

fn ok(fragments: &[&str]) -> Script {
    Script::Fragments(fragments.iter().map(|f| Ok(f.to_string())).collect())
}

fn live() -> (Script, UnboundedSender<Result<String>>) {
    let (tx, rx) = unbounded();
    (Script::Live(rx), tx)
}

fn controller(scripts: Vec<Script>) -> (ConversationController, Arc<Mutex<Vec<String>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let controller = ConversationController::new();
    controller
        .attach_session(Box::new(ScriptedSession {
            scripts: scripts.into(),
            sent: Arc::clone(&sent),
        }))
        .unwrap();
    (controller, sent)
}

fn texts(controller: &ConversationController) -> Vec<(Role, String)> {
    controller
        .snapshot()
        .messages()
        .iter()
        .map(|m| (m.role, m.text.clone()))
        .collect()
}

#[tokio::test]
async fn fragments_accumulate_into_the_reply() {
    let (controller, _) = controller(vec![ok(&["Hel", "lo"])]);
    controller.send("hi").unwrap().finished().await;

    let state = controller.snapshot();
    assert_eq!(state.last().unwrap().text, "Hello");
    assert!(!state.is_pending());
    assert_eq!(state.phase(), Phase::Idle);
}

#[tokio::test]
async fn blank_text_is_ignored() {
    let (controller, sent) = controller(vec![ok(&["unused"])]);
    for text in ["", "   ", "\n\t "] {
        assert!(!controller.can_submit(text));
        assert!(controller.send(text).is_none());
    }
    let state = controller.snapshot();
    assert_eq!(state.len(), 1);
    assert!(!state.is_pending());
    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn send_while_pending_is_ignored() {
    let (script, tx) = live();
    let (controller, sent) = controller(vec![script, ok(&["second reply"])]);

    let handle = controller.send("first").unwrap();
    assert!(controller.is_pending());
    let before = texts(&controller);

    assert!(!controller.can_submit("second"));
    assert!(controller.send("second").is_none());
    assert_eq!(texts(&controller), before);

    tx.unbounded_send(Ok("done".to_string())).unwrap();
    drop(tx);
    handle.finished().await;

    assert_eq!(controller.snapshot().last().unwrap().text, "done");
    assert_eq!(*sent.lock().unwrap(), vec!["first".to_string()]);
}

#[tokio::test]
async fn failure_after_fragments_replaces_the_partial_reply() {
    let (controller, _) = controller(vec![Script::Fragments(vec![
        Ok("Par".to_string()),
        Ok("tial".to_string()),
        Err(Error::streaming("connection reset", None)),
    ])]);
    let handle = controller.send("hi").unwrap();
    let reply_id = handle.reply_id();
    handle.finished().await;

    let state = controller.snapshot();
    assert!(state.messages().iter().all(|m| m.text != "Partial"));
    assert!(state.get(reply_id).is_none());
    let last = state.last().unwrap();
    assert_eq!(last.role, Role::Model);
    assert_eq!(last.text, ERROR_REPLY);
    assert_ne!(last.id, reply_id);
    assert!(!state.is_pending());
}

#[tokio::test]
async fn fragments_after_an_error_are_never_applied() {
    let (controller, _) = controller(vec![Script::Fragments(vec![
        Ok("Par".to_string()),
        Err(Error::streaming("connection reset", None)),
        Ok("tial".to_string()),
    ])]);
    controller.send("hi").unwrap().finished().await;

    let state = controller.snapshot();
    assert!(state.messages().iter().all(|m| !m.text.contains("tial")));
    assert!(state.messages().iter().all(|m| m.text != "Par"));
    assert_eq!(state.last().unwrap().text, ERROR_REPLY);
    assert!(!state.is_pending());
}

#[tokio::test]
async fn panicking_stream_is_treated_as_a_failure() {
    let (controller, _) = controller(vec![
        Script::PanicMidStream(vec![Ok("Par".to_string())]),
        ok(&["recovered"]),
    ]);
    let handle = controller.send("hi").unwrap();
    let reply_id = handle.reply_id();
    handle.finished().await;

    let state = controller.snapshot();
    assert!(!state.is_pending());
    assert!(state.get(reply_id).is_none());
    assert_eq!(state.last().unwrap().text, ERROR_REPLY);

    assert!(controller.can_submit("again"));
    controller.send("again").unwrap().finished().await;
    assert_eq!(controller.snapshot().last().unwrap().text, "recovered");
}

#[tokio::test]
async fn panicking_session_is_treated_as_a_failure() {
    let (controller, sent) = controller(vec![Script::PanicOnSend, ok(&["fine"])]);
    controller.send("hi").unwrap().finished().await;

    let state = controller.wait_idle().await;
    assert_eq!(state.last().unwrap().text, ERROR_REPLY);

    controller.send("again").unwrap().finished().await;
    assert_eq!(controller.snapshot().last().unwrap().text, "fine");
    assert_eq!(sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn failure_before_any_fragment_replaces_the_placeholder() {
    let (controller, _) = controller(vec![Script::Fail(Error::authentication(
        "API key not valid",
    ))]);
    controller.send("hi").unwrap().finished().await;

    assert_eq!(
        texts(&controller),
        vec![
            (Role::Model, GREETING.to_string()),
            (Role::User, "hi".to_string()),
            (Role::Model, ERROR_REPLY.to_string()),
        ]
    );
    assert!(!controller.is_pending());
}

#[tokio::test]
async fn conversation_recovers_after_a_failure() {
    let (controller, sent) = controller(vec![
        Script::Fail(Error::service_unavailable("overloaded", None)),
        ok(&["fine now"]),
    ]);
    controller.send("one").unwrap().finished().await;
    assert!(controller.can_submit("two"));
    controller.send("two").unwrap().finished().await;

    let state = controller.snapshot();
    assert_eq!(state.len(), 5);
    assert_eq!(state.messages()[2].text, ERROR_REPLY);
    assert_eq!(state.last().unwrap().text, "fine now");
    assert_eq!(sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn ids_are_unique_across_cycles() {
    let (controller, _) = controller(vec![
        ok(&["a"]),
        Script::Fragments(vec![Ok("b".to_string()), Err(Error::streaming("cut", None))]),
        Script::Fail(Error::bad_request("bad")),
        ok(&["c", "d"]),
    ]);
    for text in ["1", "2", "3", "4"] {
        controller.send(text).unwrap().finished().await;
    }

    let state = controller.snapshot();
    let ids: HashSet<_> = state.messages().iter().map(|m| m.id).collect();
    assert_eq!(ids.len(), state.len());
    assert_eq!(state.len(), 9);
}

#[tokio::test]
async fn final_text_is_the_fragments_in_order() {
    let fragments = ["Gr", "\u{fc}", "\u{df}e", "", " aus ", "K\u{f6}ln", "!"];
    let (controller, _) = controller(vec![ok(&fragments)]);
    controller.send("hallo").unwrap().finished().await;
    assert_eq!(
        controller.snapshot().last().unwrap().text,
        fragments.concat()
    );
}

#[tokio::test]
async fn greeting_then_one_exchange() {
    let (controller, _) = controller(vec![ok(&["hi there"])]);
    assert_eq!(texts(&controller), vec![(Role::Model, GREETING.to_string())]);

    controller.send("hi").unwrap().finished().await;

    assert_eq!(
        texts(&controller),
        vec![
            (Role::Model, GREETING.to_string()),
            (Role::User, "hi".to_string()),
            (Role::Model, "hi there".to_string()),
        ]
    );
    assert!(!controller.is_pending());
}

#[tokio::test]
async fn user_text_is_trimmed() {
    let (controller, sent) = controller(vec![ok(&["ok"])]);
    controller.send("  spaced out \n").unwrap().finished().await;
    assert_eq!(controller.snapshot().messages()[1].text, "spaced out");
    assert_eq!(*sent.lock().unwrap(), vec!["spaced out".to_string()]);
}

#[tokio::test]
async fn phases_follow_the_stream() {
    let (script, tx) = live();
    let (controller, _) = controller(vec![script]);
    let mut updates = controller.subscribe();

    let handle = controller.send("hi").unwrap();
    let state = controller.snapshot();
    assert_eq!(state.phase(), Phase::Sending);
    assert_eq!(state.last().unwrap().text, "");
    assert_eq!(state.last().unwrap().id, handle.reply_id());

    tx.unbounded_send(Ok("Hel".to_string())).unwrap();
    let streaming = updates
        .wait_for(|state| state.phase() == Phase::Streaming)
        .await
        .unwrap()
        .clone();
    assert_eq!(streaming.last().unwrap().text, "Hel");

    tx.unbounded_send(Ok("lo".to_string())).unwrap();
    drop(tx);
    let idle = controller.wait_idle().await;
    assert_eq!(idle.phase(), Phase::Idle);
    assert_eq!(idle.last().unwrap().text, "Hello");
    handle.finished().await;
}

#[tokio::test]
async fn reply_with_no_fragments_stays_empty() {
    let (controller, _) = controller(vec![ok(&[])]);
    controller.send("hi").unwrap().finished().await;
    let state = controller.snapshot();
    assert_eq!(state.len(), 3);
    assert_eq!(state.last().unwrap().text, "");
    assert!(!state.is_pending());
}

#[tokio::test]
async fn no_session_means_no_send() {
    let controller = ConversationController::new();
    assert!(controller.send("hi").is_none());
    assert_eq!(controller.snapshot().len(), 1);
}

/// Serve one streamed reply whose events arrive `gap` apart.
async fn trickling_server(events: &'static [&'static str], gap: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before sending a request");
            request.extend_from_slice(&buf[..n]);
            if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&request[..head_end]).to_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .map(|len| len.trim().parse::<usize>().unwrap())
            .unwrap_or(0);
        while request.len() < head_end + body_len {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed mid-request");
            request.extend_from_slice(&buf[..n]);
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        for text in events {
            tokio::time::sleep(gap).await;
            let event = format!(
                "data: {{\"candidates\": [{{\"content\": {{\"parts\": [{{\"text\": \"{text}\"}}], \"role\": \"model\"}}}}]}}\r\n\r\n"
            );
            socket.write_all(event.as_bytes()).await.unwrap();
        }
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}/v1beta/")
}

#[tokio::test]
async fn slow_reply_is_not_cut_off_by_the_client_timeout() {
    let base = trickling_server(&["Hel", "lo", " world"], Duration::from_millis(400)).await;
    let config = ClientConfig::new("test-key")
        .unwrap()
        .with_base_url(&base)
        .unwrap()
        .with_timeout(Duration::from_secs(1));
    let provider = GeminiProvider::new(Gemini::new(config).unwrap());
    let controller =
        ConversationController::bootstrap(&provider, &ChatConfig::default()).unwrap();

    controller.send("hi").unwrap().finished().await;

    let state = controller.snapshot();
    assert_eq!(state.last().unwrap().text, "Hello world");
    assert!(!state.is_pending());
}

struct FailingProvider;

impl SessionProvider for FailingProvider {
    fn create_session(&self, _: &ChatConfig) -> Result<Box<dyn ChatSession>> {
        Err(Error::configuration("no credential", Some("API_KEY".to_string())))
    }
}

#[test]
fn bootstrap_surfaces_provider_errors() {
    let err = ConversationController::bootstrap(&FailingProvider, &ChatConfig::default())
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn only_one_session_per_controller() {
    let (controller, _) = controller(Vec::new());
    let again = controller.attach_session(Box::new(ScriptedSession {
        scripts: VecDeque::new(),
        sent: Arc::new(Mutex::new(Vec::new())),
    }));
    assert!(again.unwrap_err().is_validation());
}

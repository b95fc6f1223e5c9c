//! Offline tests of the send flow against a scripted transport and a view
//! that records everything done to it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;

use chatbox::{
    Attachment, BubbleId, ChatRequest, ChatSession, ChatTransport, ChatView, ControlState,
    EchoPolicy, Error, IgnoreReason, MemoryClipboard, Message, POLICY_ALERT, RateLimitState,
    RenderGateway, ReplyMode, Result, Role, SendOutcome, SendState, SessionBootstrap,
    SessionSelector, ByteStream,
};

//////////////////////////////////////////// Fakes /////////////////////////////////////////////

enum Scripted {
    Body(Vec<Result<Bytes>>),
    Fail(Error),
}

#[derive(Default)]
struct FakeTransport {
    replies: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<(ChatRequest, ReplyMode)>>,
    calls: AtomicUsize,
    reload: Mutex<Option<SessionBootstrap>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn reply_json(&self, json: &str) {
        self.replies
            .lock()
            .push_back(Scripted::Body(vec![Ok(Bytes::from(json.to_string()))]));
    }

    fn reply_chunks(&self, chunks: &[&str]) {
        self.replies.lock().push_back(Scripted::Body(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from(c.to_string())))
                .collect(),
        ));
    }

    fn reply_body(&self, body: Vec<Result<Bytes>>) {
        self.replies.lock().push_back(Scripted::Body(body));
    }

    fn fail(&self, err: Error) {
        self.replies.lock().push_back(Scripted::Fail(err));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send(&self, request: &ChatRequest, mode: ReplyMode) -> Result<ByteStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((request.clone(), mode));
        // Suspend like a real request so concurrent submits interleave.
        tokio::task::yield_now().await;
        let scripted = self.replies.lock().pop_front();
        match scripted {
            Some(Scripted::Body(chunks)) => Ok(Box::pin(stream::iter(chunks))),
            Some(Scripted::Fail(err)) => Err(err),
            None => Err(Error::connection("no scripted reply", None)),
        }
    }

    async fn load_session(&self, _: &SessionSelector) -> Result<SessionBootstrap> {
        self.reload
            .lock()
            .clone()
            .ok_or_else(|| Error::connection("no scripted page", None))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Controls(ControlState),
    Append(BubbleId, Role, String),
    Update(BubbleId, String, bool),
    ShowTyping,
    HideTyping,
    Alert(String),
    Notice(String),
    TimeLeft(String),
    Reload,
    ClearInput,
}

#[derive(Default)]
struct RecordingView {
    events: Mutex<Vec<Event>>,
    next_bubble: AtomicUsize,
    interrupt: AtomicBool,
}

impl RecordingView {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn last_controls(&self) -> Option<ControlState> {
        self.events.lock().iter().rev().find_map(|e| match e {
            Event::Controls(state) => Some(*state),
            _ => None,
        })
    }

    fn appended_roles(&self) -> Vec<Role> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Append(_, role, _) => Some(*role),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl ChatView for RecordingView {
    fn set_controls(&self, state: ControlState) {
        self.push(Event::Controls(state));
    }
    fn append_message(&self, message: &Message) -> BubbleId {
        let bubble = BubbleId(self.next_bubble.fetch_add(1, Ordering::SeqCst));
        self.push(Event::Append(bubble, message.role, message.content.clone()));
        bubble
    }
    fn update_message(&self, bubble: BubbleId, message: &Message) {
        self.push(Event::Update(
            bubble,
            message.content.clone(),
            message.complete,
        ));
    }
    fn show_typing(&self) {
        self.push(Event::ShowTyping);
    }
    fn hide_typing(&self) {
        self.push(Event::HideTyping);
    }
    fn alert(&self, message: &str) {
        self.push(Event::Alert(message.to_string()));
    }
    fn has_limit_notice(&self) -> bool {
        self.count(|e| matches!(e, Event::Notice(_))) > 0
    }
    fn show_limit_notice(&self, text: &str) {
        self.push(Event::Notice(text.to_string()));
    }
    fn show_time_left(&self, text: &str) {
        self.push(Event::TimeLeft(text.to_string()));
    }
    fn reload(&self) {
        self.push(Event::Reload);
    }
    fn clear_input(&self) {
        self.push(Event::ClearInput);
    }
    fn print_error(&self, _: &str) {}
    fn print_info(&self, _: &str) {}
    fn should_interrupt(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

fn session(
    limits: RateLimitState,
    transport: &Arc<FakeTransport>,
    view: &Arc<RecordingView>,
) -> ChatSession {
    let transport: Arc<dyn ChatTransport> = transport.clone();
    let view: Arc<dyn ChatView> = view.clone();
    ChatSession::new(
        SessionBootstrap {
            chat_id: "chat-1".to_string(),
            limits,
        },
        transport,
        view,
    )
}

//////////////////////////////////////////// Tests /////////////////////////////////////////////

#[tokio::test]
async fn rapid_submits_send_once() {
    let transport = FakeTransport::new();
    transport.reply_json(r#"{"reply": "one", "limit_reached": false}"#);
    transport.reply_json(r#"{"reply": "two", "limit_reached": false}"#);
    let view = RecordingView::new();
    let session = session(RateLimitState::full(), &transport, &view);

    let (a, b, c) = tokio::join!(
        session.submit("hi"),
        session.submit("hi"),
        session.submit("hi")
    );
    let outcomes = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    assert_eq!(outcomes[0], SendOutcome::Replied);
    assert_eq!(outcomes[1], SendOutcome::Ignored(IgnoreReason::Busy));
    assert_eq!(outcomes[2], SendOutcome::Ignored(IgnoreReason::Busy));
    assert_eq!(transport.calls(), 1);
    assert_eq!(view.count(|e| *e == Event::Controls(ControlState::Busy)), 1);
    assert!(!session.is_busy());
    assert_eq!(session.state(), SendState::Idle);
}

#[tokio::test]
async fn buffered_reply_renders_once_after_user_bubble() {
    let transport = FakeTransport::new();
    transport.reply_json(r#"{"reply": "**hi** there", "limit_reached": false}"#);
    let view = RecordingView::new();
    let session = session(RateLimitState::new(5, 0), &transport, &view);

    assert_eq!(session.submit("  hello  ").await.unwrap(), SendOutcome::Replied);

    let (request, mode) = transport.requests.lock()[0].clone();
    assert_eq!(mode, ReplyMode::Buffered);
    assert_eq!(request.message, "hello");
    assert_eq!(request.chat_id, "chat-1");
    assert_eq!(request.model, "openai/gpt-4o-mini");

    assert_eq!(view.appended_roles(), vec![Role::User, Role::Bot]);
    let messages = session.messages();
    assert_eq!(messages[1].html, RenderGateway::new().render("**hi** there"));
    assert!(messages[1].complete);
    assert_eq!(session.tracker().remaining_messages(), 4);
    assert_eq!(view.last_controls(), Some(ControlState::Enabled));
    assert_eq!(view.count(|e| *e == Event::ClearInput), 1);
    assert_eq!(view.count(|e| matches!(e, Event::Update(..))), 0);
}

#[tokio::test]
async fn streamed_chunks_render_like_the_whole_reply() {
    let transport = FakeTransport::new();
    transport.reply_chunks(&["Hel", "lo **wo", "rld**"]);
    let view = RecordingView::new();
    let session =
        session(RateLimitState::full(), &transport, &view).with_mode(ReplyMode::Streaming);

    let outcome = session.submit("greet me").await.unwrap();
    assert_eq!(
        outcome,
        SendOutcome::Streamed {
            chunks: 3,
            bytes: 15
        }
    );
    assert_eq!(transport.requests.lock()[0].1, ReplyMode::Streaming);

    let bot = session.messages().pop().unwrap();
    assert_eq!(bot.role, Role::Bot);
    assert_eq!(bot.content, "Hello **world**");
    assert_eq!(bot.html, RenderGateway::new().render("Hello **world**"));
    assert!(bot.complete);

    let events = view.events();
    let typing_shown = events.iter().position(|e| *e == Event::ShowTyping).unwrap();
    let bot_bubble = events
        .iter()
        .position(|e| matches!(e, Event::Append(_, Role::Bot, _)))
        .unwrap();
    let first_render = events
        .iter()
        .position(|e| matches!(e, Event::Update(_, text, false) if text == "Hel"))
        .unwrap();
    let typing_hidden = events.iter().position(|e| *e == Event::HideTyping).unwrap();
    assert!(typing_shown < bot_bubble);
    assert!(typing_hidden < first_render);
    assert_eq!(view.count(|e| *e == Event::HideTyping), 1);
    assert!(matches!(
        events.iter().rev().find(|e| matches!(e, Event::Update(..))),
        Some(Event::Update(_, text, true)) if text == "Hello **world**"
    ));
    assert_eq!(session.tracker().remaining_messages(), 9);
}

#[tokio::test]
async fn whitespace_chunks_do_not_hide_typing_early() {
    let transport = FakeTransport::new();
    transport.reply_chunks(&["  ", "\n", "ok"]);
    let view = RecordingView::new();
    let session =
        session(RateLimitState::full(), &transport, &view).with_mode(ReplyMode::Streaming);

    session.submit("hi").await.unwrap();
    let events = view.events();
    let typing_hidden = events.iter().position(|e| *e == Event::HideTyping).unwrap();
    let whitespace_render = events
        .iter()
        .position(|e| matches!(e, Event::Update(_, text, false) if text == "  \n"))
        .unwrap();
    assert!(whitespace_render < typing_hidden);
}

#[tokio::test]
async fn last_message_then_local_refusal() {
    let transport = FakeTransport::new();
    transport.reply_json(r#"{"reply": "done", "limit_reached": false}"#);
    let view = RecordingView::new();
    let session = session(RateLimitState::new(1, 0), &transport, &view);

    assert_eq!(session.submit("first").await.unwrap(), SendOutcome::Replied);
    assert_eq!(session.tracker().remaining_messages(), 0);

    assert_eq!(session.submit("second").await.unwrap(), SendOutcome::RateLimited);
    assert_eq!(session.submit("third").await.unwrap(), SendOutcome::RateLimited);
    assert_eq!(transport.calls(), 1);
    assert_eq!(view.count(|e| matches!(e, Event::Notice(_))), 1);
    assert_eq!(view.count(|e| *e == Event::Controls(ControlState::Busy)), 1);
    assert_eq!(view.last_controls(), Some(ControlState::Locked));
}

#[tokio::test]
async fn policy_rejection_alerts_only() {
    let transport = FakeTransport::new();
    transport.fail(Error::permission(POLICY_ALERT));
    let view = RecordingView::new();
    let session = session(RateLimitState::new(3, 0), &transport, &view);
    session.stage_attachment(Attachment::new("a.txt", "text/plain", b"x".to_vec()).unwrap());

    let outcome = session.submit("something bad").await.unwrap();
    assert_eq!(
        outcome,
        SendOutcome::Rejected {
            message: POLICY_ALERT.to_string()
        }
    );
    assert_eq!(
        view.count(|e| *e == Event::Alert(POLICY_ALERT.to_string())),
        1
    );
    assert!(view.appended_roles().is_empty());
    assert!(!session.is_busy());
    assert_eq!(view.last_controls(), Some(ControlState::Enabled));
    assert_eq!(view.count(|e| *e == Event::ShowTyping), 0);
    assert_eq!(view.count(|e| *e == Event::ClearInput), 0);
    assert_eq!(session.staged_attachment().as_deref(), Some("a.txt"));
    assert_eq!(session.tracker().remaining_messages(), 3);
}

#[tokio::test]
async fn echo_before_dispatch_shows_user_bubble_even_when_rejected() {
    let transport = FakeTransport::new();
    transport.fail(Error::permission(POLICY_ALERT));
    let view = RecordingView::new();
    let session = session(RateLimitState::full(), &transport, &view)
        .with_echo_policy(EchoPolicy::BeforeDispatch);

    session.submit("hello").await.unwrap();
    assert_eq!(view.appended_roles(), vec![Role::User]);
}

#[tokio::test]
async fn stream_failure_keeps_partial_text() {
    let transport = FakeTransport::new();
    transport.reply_body(vec![
        Ok(Bytes::from_static(b"partial ")),
        Ok(Bytes::from_static(b"answer")),
        Err(Error::streaming("connection reset", None)),
    ]);
    let view = RecordingView::new();
    let session =
        session(RateLimitState::new(4, 0), &transport, &view).with_mode(ReplyMode::Streaming);
    session.stage_attachment(Attachment::new("a.png", "image/png", vec![1u8]).unwrap());

    let err = session.submit("tell me").await.unwrap_err();
    assert!(err.is_streaming());
    assert!(!session.is_busy());
    assert_eq!(session.state(), SendState::Idle);
    assert_eq!(view.last_controls(), Some(ControlState::Enabled));

    let events = view.events();
    let last_show = events.iter().rposition(|e| *e == Event::ShowTyping).unwrap();
    let last_hide = events.iter().rposition(|e| *e == Event::HideTyping).unwrap();
    assert!(last_hide > last_show);

    let bot = session.messages().pop().unwrap();
    assert_eq!(bot.content, "partial answer");
    assert_eq!(bot.html, RenderGateway::new().render("partial answer"));
    assert_eq!(session.tracker().remaining_messages(), 4);
    assert_eq!(session.staged_attachment(), None);
}

#[tokio::test]
async fn transport_failure_before_reply() {
    let transport = FakeTransport::new();
    transport.fail(Error::timeout("Request timed out", Some(60.0)));
    let view = RecordingView::new();
    let session = session(RateLimitState::full(), &transport, &view);

    let err = session.submit("hello").await.unwrap_err();
    assert!(err.is_timeout());
    assert!(view.appended_roles().is_empty());
    assert!(!session.is_busy());
    assert_eq!(session.tracker().remaining_messages(), 10);
}

#[tokio::test]
async fn malformed_buffered_body_cleans_up() {
    let transport = FakeTransport::new();
    transport.reply_json("<html>Server error</html>");
    let view = RecordingView::new();
    let session = session(RateLimitState::full(), &transport, &view);

    let err = session.submit("hello").await.unwrap_err();
    assert!(err.is_serialization());
    assert!(!session.is_busy());
    assert_eq!(view.last_controls(), Some(ControlState::Enabled));
    assert_eq!(view.appended_roles(), vec![Role::User]);
    assert_eq!(view.events().iter().rev().find(|e| matches!(e, Event::ShowTyping | Event::HideTyping)), Some(&Event::HideTyping));
}

#[tokio::test(start_paused = true)]
async fn server_limit_locks_and_counts_down() {
    let transport = FakeTransport::new();
    transport.reply_json(r#"{"limit_reached": true, "remaining_seconds": 120}"#);
    let view = RecordingView::new();
    let session = session(RateLimitState::new(2, 0), &transport, &view);

    let outcome = session.submit("hello").await.unwrap();
    assert_eq!(
        outcome,
        SendOutcome::LimitReached {
            remaining_seconds: 120
        }
    );
    assert_eq!(view.last_controls(), Some(ControlState::Locked));
    assert!(!session.tracker().is_send_allowed());
    assert!(!view.appended_roles().contains(&Role::Bot));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let times: Vec<_> = view
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::TimeLeft(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(times, vec!["0h 2m 0s remaining", "0h 1m 59s remaining"]);

    assert_eq!(session.submit("again").await.unwrap(), SendOutcome::RateLimited);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_at_load_reloads_after_countdown() {
    let transport = FakeTransport::new();
    let view = RecordingView::new();
    let session = session(RateLimitState::new(0, 2), &transport, &view);

    assert!(session.on_load());
    assert_eq!(view.last_controls(), Some(ControlState::Locked));
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(view.count(|e| *e == Event::Reload), 1);
    assert!(session.tracker().needs_reload());
    let times = view.count(|e| matches!(e, Event::TimeLeft(_)));
    assert_eq!(times, 3);

    assert!(!session.reload(SessionBootstrap {
        chat_id: "chat-1".to_string(),
        limits: RateLimitState::full(),
    }));
    assert_eq!(view.last_controls(), Some(ControlState::Enabled));
    transport.reply_json(r#"{"reply": "back", "limit_reached": false}"#);
    assert_eq!(session.submit("hi").await.unwrap(), SendOutcome::Replied);
}

#[tokio::test(start_paused = true)]
async fn submit_after_expiry_waits_for_reload() {
    let transport = FakeTransport::new();
    let view = RecordingView::new();
    let session = session(RateLimitState::new(0, 2), &transport, &view);

    assert!(session.on_load());
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(session.tracker().needs_reload());

    assert_eq!(session.submit("hi").await.unwrap(), SendOutcome::RateLimited);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(session.tracker().needs_reload());
    assert!(!session.tracker().is_counting_down());

    let times: Vec<_> = view
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::TimeLeft(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(
        times,
        vec![
            "0h 0m 2s remaining",
            "0h 0m 1s remaining",
            "0h 0m 0s remaining"
        ]
    );
    assert_eq!(view.count(|e| *e == Event::Reload), 1);
    assert_eq!(view.count(|e| matches!(e, Event::Notice(_))), 1);
    assert_eq!(view.count(|e| *e == Event::Controls(ControlState::Busy)), 0);
    assert_eq!(view.last_controls(), Some(ControlState::Locked));
    assert_eq!(transport.calls(), 0);
    assert!(!session.is_busy());
}

#[tokio::test]
async fn empty_submit_is_ignored() {
    let transport = FakeTransport::new();
    let view = RecordingView::new();
    let session = session(RateLimitState::full(), &transport, &view);

    assert_eq!(
        session.submit("   \n").await.unwrap(),
        SendOutcome::Ignored(IgnoreReason::Empty)
    );
    assert_eq!(transport.calls(), 0);
    assert!(view.events().is_empty());
}

#[tokio::test]
async fn attachment_alone_is_sent_and_then_cleared() {
    let transport = FakeTransport::new();
    transport.reply_json(r#"{"reply": "a cat", "limit_reached": false}"#);
    let view = RecordingView::new();
    let session = session(RateLimitState::full(), &transport, &view).with_inline_images(true);
    session.stage_attachment(Attachment::new("cat.png", "image/png", vec![1u8, 2, 3]).unwrap());

    assert_eq!(session.submit("").await.unwrap(), SendOutcome::Replied);
    let (request, _) = transport.requests.lock()[0].clone();
    assert_eq!(request.message, "");
    assert!(request.inline_image);
    assert_eq!(
        request.attachment.as_ref().map(|a| a.file_name.as_str()),
        Some("cat.png")
    );
    assert!(
        request
            .form_fields()
            .iter()
            .any(|(name, value)| *name == "image_base64" && value == "AQID")
    );
    assert_eq!(session.staged_attachment(), None);
    assert_eq!(session.messages()[0].attachment.as_deref(), Some("cat.png"));
}

#[tokio::test]
async fn interrupt_abandons_stream() {
    let transport = FakeTransport::new();
    transport.reply_chunks(&["never", "shown"]);
    let view = RecordingView::new();
    view.interrupt.store(true, Ordering::SeqCst);
    let session =
        session(RateLimitState::full(), &transport, &view).with_mode(ReplyMode::Streaming);

    let err = session.submit("hi").await.unwrap_err();
    assert!(err.is_abort());
    assert!(!session.is_busy());
    assert_eq!(session.tracker().remaining_messages(), 10);
    let bot = session.messages().pop().unwrap();
    assert_eq!(bot.content, "");
}

#[tokio::test]
async fn copy_puts_reply_text_on_clipboard() {
    let transport = FakeTransport::new();
    transport.reply_json(r#"{"reply": "Hello **world**\n\n- a\n- b", "limit_reached": false}"#);
    let view = RecordingView::new();
    let session = session(RateLimitState::full(), &transport, &view);
    session.submit("hi").await.unwrap();

    let clipboard = MemoryClipboard::new();
    let index = session.last_reply_index().unwrap();
    let copied = session.copy_message(index, &clipboard).unwrap();
    assert_eq!(copied, "Hello world\na\nb");
    assert_eq!(clipboard.text().as_deref(), Some("Hello world\na\nb"));
    assert_eq!(session.copy_message(0, &clipboard).unwrap(), "hi");
    assert!(session.copy_message(9, &clipboard).unwrap_err().is_validation());
}

#[tokio::test]
async fn reload_into_another_chat_clears_transcript() {
    let transport = FakeTransport::new();
    transport.reply_json(r#"{"reply": "hi", "limit_reached": false}"#);
    let view = RecordingView::new();
    let session = session(RateLimitState::full(), &transport, &view);
    session.submit("hello").await.unwrap();
    assert_eq!(session.messages().len(), 2);

    *transport.reload.lock() = Some(SessionBootstrap {
        chat_id: "chat-2".to_string(),
        limits: RateLimitState::new(7, 0),
    });
    let page = transport.load_session(&SessionSelector::New).await.unwrap();
    session.reload(page);
    assert_eq!(session.chat_id(), "chat-2");
    assert!(session.messages().is_empty());
    assert_eq!(session.tracker().remaining_messages(), 7);
}

#[test]
fn user_text_is_escaped_not_rendered() {
    let gateway = RenderGateway::new();
    let html = gateway.escape("<img src=x onerror=alert(1)> **bold**");
    assert!(!html.as_str().contains("<img"));
    assert!(html.as_str().contains("**bold**"));
}

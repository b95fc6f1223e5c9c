//! The chat send orchestrator.
//!
//! [`ChatSession::submit`] takes a message from the input box through
//! validation, the rate-limit check and the single-flight lock, dispatches
//! it, and renders the reply either in one piece or as it streams.  Every
//! exit path returns the session to [`SendState::Idle`] with the lock
//! released and the controls restored.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;

use crate::bootstrap::SessionBootstrap;
use crate::client_logger::ClientLogger;
use crate::clipboard::Clipboard;
use crate::error::{Error, Result};
use crate::message::{BubbleId, ControlState, Message, Role};
use crate::observability::{
    SEND_ATTEMPTS, SEND_DURATION, SEND_FAILURES, SEND_IGNORED, SEND_RATE_LIMITED, SEND_REJECTED,
};
use crate::rate_limit::RateLimitTracker;
use crate::render::{RenderGateway, SafeHtml, html_to_text};
use crate::send_lock::SendLock;
use crate::stream::{ByteStream, StreamSummary, StreamTarget, consume};
use crate::transport::{
    Attachment, BufferedReply, ChatRequest, ChatTransport, DEFAULT_MODEL, POLICY_ALERT, ReplyMode,
};
use crate::view::ChatView;

/// Why a submit did nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No text and no attachment.
    Empty,
    /// Another send is in flight.
    Busy,
}

/// How a submit ended, when it did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing happened.
    Ignored(IgnoreReason),
    /// The local allowance is exhausted; nothing was sent.
    RateLimited,
    /// The server refused the message on policy grounds.
    Rejected {
        /// What the server said.
        message: String,
    },
    /// A buffered reply was rendered.
    Replied,
    /// A streamed reply was rendered.
    Streamed {
        /// Chunks read.
        chunks: usize,
        /// Body bytes read.
        bytes: usize,
    },
    /// The server reported the window full; the page is now locked.
    LimitReached {
        /// Seconds until the window reopens.
        remaining_seconds: u64,
    },
}

/// Where the orchestrator is in a send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendState {
    /// No send in progress.
    Idle,
    /// Checking input and allowance.
    Validating,
    /// Holding the lock, waiting on the response head.
    LockedSending,
    /// Reading a streamed body.
    Streaming,
    /// Reading a buffered body.
    AwaitingFullReply,
    /// The server refused; about to return to idle.
    Rejected,
}

/// When the user's own message appears in the transcript.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EchoPolicy {
    /// As soon as the message is dispatched.
    BeforeDispatch,
    /// Once the server has accepted it, so refused messages never appear.
    #[default]
    AfterAcceptance,
}

/// One user-initiated send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendOperation {
    /// Trimmed message text.
    pub text: String,
    /// File sent with the message.
    pub attachment: Option<Attachment>,
    /// How the reply is delivered.
    pub mode: ReplyMode,
    /// True once any reply text was observed.
    pub started: bool,
}

enum Exchange {
    Rejected(String),
    Replied,
    Streamed(StreamSummary),
    LimitReached(u64),
}

/// A chat page: transcript, staged input, limits and the send machinery.
pub struct ChatSession {
    chat_id: Mutex<String>,
    transport: Arc<dyn ChatTransport>,
    view: Arc<dyn ChatView>,
    gateway: RenderGateway,
    tracker: RateLimitTracker,
    lock: SendLock,
    state: Mutex<SendState>,
    transcript: Mutex<Vec<Message>>,
    staged: Mutex<Option<Attachment>>,
    model: Mutex<String>,
    mode: Mutex<ReplyMode>,
    echo: EchoPolicy,
    inline_images: bool,
    logger: Option<Arc<dyn ClientLogger>>,
}

impl ChatSession {
    /// A session seeded from the page's bootstrap values.
    pub fn new(
        bootstrap: SessionBootstrap,
        transport: Arc<dyn ChatTransport>,
        view: Arc<dyn ChatView>,
    ) -> Self {
        Self {
            chat_id: Mutex::new(bootstrap.chat_id),
            transport,
            view,
            gateway: RenderGateway::new(),
            tracker: RateLimitTracker::new(bootstrap.limits),
            lock: SendLock::new(),
            state: Mutex::new(SendState::Idle),
            transcript: Mutex::new(Vec::new()),
            staged: Mutex::new(None),
            model: Mutex::new(DEFAULT_MODEL.to_string()),
            mode: Mutex::new(ReplyMode::default()),
            echo: EchoPolicy::default(),
            inline_images: false,
            logger: None,
        }
    }

    /// Sets the model.
    pub fn with_model(self, model: impl Into<String>) -> Self {
        *self.model.lock() = model.into();
        self
    }

    /// Sets the reply mode.
    pub fn with_mode(self, mode: ReplyMode) -> Self {
        *self.mode.lock() = mode;
        self
    }

    /// Sets when the user's message is echoed.
    pub fn with_echo_policy(mut self, echo: EchoPolicy) -> Self {
        self.echo = echo;
        self
    }

    /// Also send image attachments inline as base64.
    pub fn with_inline_images(mut self, inline_images: bool) -> Self {
        self.inline_images = inline_images;
        self
    }

    /// Sets the exchange logger.
    pub fn with_logger(mut self, logger: Arc<dyn ClientLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Sets the render gateway.
    pub fn with_gateway(mut self, gateway: RenderGateway) -> Self {
        self.gateway = gateway;
        self
    }

    /// Identifier of the chat.
    pub fn chat_id(&self) -> String {
        self.chat_id.lock().clone()
    }

    /// Where the send machinery is.
    pub fn state(&self) -> SendState {
        *self.state.lock()
    }

    /// True while a send holds the lock.
    pub fn is_busy(&self) -> bool {
        self.lock.is_held()
    }

    /// The rate-limit tracker.
    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    /// The render gateway.
    pub fn gateway(&self) -> &RenderGateway {
        &self.gateway
    }

    /// Current model.
    pub fn model(&self) -> String {
        self.model.lock().clone()
    }

    /// Choose the model for subsequent sends.
    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.lock() = model.into();
    }

    /// Current reply mode.
    pub fn mode(&self) -> ReplyMode {
        *self.mode.lock()
    }

    /// Choose the reply mode for subsequent sends.
    pub fn set_mode(&self, mode: ReplyMode) {
        *self.mode.lock() = mode;
    }

    /// Stage a file for the next send, replacing any staged file.
    pub fn stage_attachment(&self, attachment: Attachment) {
        *self.staged.lock() = Some(attachment);
    }

    /// Drop the staged file, returning it.
    pub fn clear_attachment(&self) -> Option<Attachment> {
        self.staged.lock().take()
    }

    /// Name of the staged file.
    pub fn staged_attachment(&self) -> Option<String> {
        self.staged.lock().as_ref().map(|a| a.file_name.clone())
    }

    /// Snapshot of the transcript.
    pub fn messages(&self) -> Vec<Message> {
        self.transcript.lock().clone()
    }

    /// Index of the most recent bot message.
    pub fn last_reply_index(&self) -> Option<usize> {
        self.transcript
            .lock()
            .iter()
            .rposition(|m| m.role == Role::Bot)
    }

    /// Put the visible text of message `index` on the clipboard.
    pub fn copy_message(&self, index: usize, clipboard: &dyn Clipboard) -> Result<String> {
        let text = {
            let transcript = self.transcript.lock();
            let message = transcript.get(index).ok_or_else(|| {
                Error::validation(
                    format!("no message {index}; the chat has {}", transcript.len()),
                    Some("index".to_string()),
                )
            })?;
            match message.role {
                Role::Bot => html_to_text(message.html.as_str()),
                Role::User | Role::System => message.content.clone(),
            }
        };
        clipboard.set_text(&text)?;
        Ok(text)
    }

    /// Apply the load-time limit policy.  Returns true if the page locked.
    pub fn on_load(&self) -> bool {
        if self.tracker.on_session_load(Arc::clone(&self.view)) {
            return true;
        }
        self.view.set_controls(ControlState::Enabled);
        false
    }

    /// Install freshly loaded page values.
    ///
    /// Loading a different chat starts an empty transcript.  The load-time
    /// limit policy is applied again.
    pub fn reload(&self, bootstrap: SessionBootstrap) -> bool {
        {
            let mut chat_id = self.chat_id.lock();
            if *chat_id != bootstrap.chat_id {
                *chat_id = bootstrap.chat_id;
                self.transcript.lock().clear();
            }
        }
        self.tracker.reseed(bootstrap.limits);
        self.on_load()
    }

    /// Submit the text in the input box.
    ///
    /// Ordinary refusals are outcomes, not errors.  Errors are transport
    /// failures and malformed bodies, reported after the lock is released
    /// and the pending indicator hidden.
    pub async fn submit(&self, text: &str) -> Result<SendOutcome> {
        SEND_ATTEMPTS.click();
        let message = text.trim().to_string();
        let attachment = self.staged.lock().clone();
        if message.is_empty() && attachment.is_none() {
            return Ok(ignored(IgnoreReason::Empty));
        }
        let Some(reservation) = self.lock.try_reserve() else {
            return Ok(ignored(IgnoreReason::Busy));
        };

        self.set_state(SendState::Validating);
        if !self.tracker.is_send_allowed() {
            SEND_RATE_LIMITED.click();
            // After an expired countdown this only re-locks; the page needs
            // fresh values before anything is counted again.
            self.tracker
                .force_limit_reached(self.tracker.seconds_left(), Arc::clone(&self.view));
            self.set_state(SendState::Idle);
            drop(reservation);
            return Ok(SendOutcome::RateLimited);
        }

        let permit = reservation.engage(self.view.as_ref());
        self.set_state(SendState::LockedSending);
        let start = Instant::now();
        let mut op = SendOperation {
            text: message,
            attachment,
            mode: self.mode(),
            started: false,
        };

        let result = self.exchange(&mut op).await;
        SEND_DURATION.add(start.elapsed().as_secs_f64());
        let outcome = match result {
            Ok(Exchange::Rejected(message)) => {
                SEND_REJECTED.click();
                self.set_state(SendState::Rejected);
                permit.release();
                self.view.alert(POLICY_ALERT);
                SendOutcome::Rejected { message }
            }
            Ok(Exchange::LimitReached(remaining_seconds)) => {
                permit.release();
                self.reset_input();
                self.tracker
                    .force_limit_reached(remaining_seconds, Arc::clone(&self.view));
                SendOutcome::LimitReached { remaining_seconds }
            }
            Ok(Exchange::Replied) => {
                self.tracker.on_message_sent();
                permit.release();
                self.reset_input();
                SendOutcome::Replied
            }
            Ok(Exchange::Streamed(summary)) => {
                self.tracker.on_message_sent();
                permit.release();
                self.reset_input();
                SendOutcome::Streamed {
                    chunks: summary.chunks,
                    bytes: summary.bytes,
                }
            }
            Err(err) => {
                SEND_FAILURES.click();
                self.view.hide_typing();
                permit.release();
                self.reset_input();
                if let Some(logger) = &self.logger {
                    logger.log_failure(&err);
                }
                self.set_state(SendState::Idle);
                return Err(err);
            }
        };
        self.set_state(SendState::Idle);
        Ok(outcome)
    }

    async fn exchange(&self, op: &mut SendOperation) -> Result<Exchange> {
        let request = ChatRequest {
            message: op.text.clone(),
            chat_id: self.chat_id(),
            model: self.model(),
            attachment: op.attachment.clone(),
            inline_image: self.inline_images,
        };
        if let Some(logger) = &self.logger {
            logger.log_request(&request, op.mode);
        }
        if self.echo == EchoPolicy::BeforeDispatch {
            self.echo_user(op);
        }

        let body = match self.transport.send(&request, op.mode).await {
            Ok(body) => body,
            Err(err) if err.is_permission() => {
                if let Some(logger) = &self.logger {
                    logger.log_failure(&err);
                }
                let message = match err {
                    Error::Permission { message } => message,
                    other => other.to_string(),
                };
                return Ok(Exchange::Rejected(message));
            }
            Err(err) => return Err(err),
        };

        if self.echo == EchoPolicy::AfterAcceptance {
            self.echo_user(op);
        }
        self.view.show_typing();
        match op.mode {
            ReplyMode::Buffered => self.read_buffered(body).await,
            ReplyMode::Streaming => self.read_streaming(body, op).await,
        }
    }

    async fn read_buffered(&self, mut body: ByteStream) -> Result<Exchange> {
        self.set_state(SendState::AwaitingFullReply);
        let mut bytes = Vec::new();
        while let Some(chunk) = body.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        self.view.hide_typing();
        let reply = BufferedReply::from_slice(&bytes)?;
        if let Some(logger) = &self.logger {
            logger.log_reply(&reply);
        }
        if reply.limit_reached {
            return Ok(Exchange::LimitReached(reply.lockout_seconds()));
        }
        let markdown = reply.reply.unwrap_or_default();
        let html = self.gateway.render(&markdown);
        let message = Message::new(Role::Bot, markdown, html);
        self.view.append_message(&message);
        self.transcript.lock().push(message);
        Ok(Exchange::Replied)
    }

    async fn read_streaming(&self, body: ByteStream, op: &mut SendOperation) -> Result<Exchange> {
        self.set_state(SendState::Streaming);
        let pending = Message::pending_bot();
        let bubble = self.view.append_message(&pending);
        let index = {
            let mut transcript = self.transcript.lock();
            transcript.push(pending);
            transcript.len() - 1
        };
        let mut target = SessionTarget {
            session: self,
            index,
            bubble,
            started: &mut op.started,
            rendered_len: 0,
        };
        let result = consume(&self.gateway, body, &mut target).await;
        if !op.started {
            self.view.hide_typing();
        }
        self.complete_message(index, bubble);
        let summary = result?;
        if let Some(logger) = &self.logger {
            logger.log_stream_complete(&summary);
        }
        Ok(Exchange::Streamed(summary))
    }

    fn echo_user(&self, op: &SendOperation) {
        let html = self.gateway.escape(&op.text);
        let message = Message::new(Role::User, op.text.clone(), html)
            .with_attachment(op.attachment.as_ref().map(|a| a.file_name.clone()));
        self.view.append_message(&message);
        self.transcript.lock().push(message);
    }

    fn complete_message(&self, index: usize, bubble: BubbleId) {
        let snapshot = {
            let mut transcript = self.transcript.lock();
            let Some(message) = transcript.get_mut(index) else {
                return;
            };
            message.complete = true;
            message.clone()
        };
        self.view.update_message(bubble, &snapshot);
    }

    fn update_streaming(&self, index: usize, bubble: BubbleId, markdown: &str, html: &SafeHtml) {
        let snapshot = {
            let mut transcript = self.transcript.lock();
            let Some(message) = transcript.get_mut(index) else {
                return;
            };
            message.content.clear();
            message.content.push_str(markdown);
            message.html = html.clone();
            message.clone()
        };
        self.view.update_message(bubble, &snapshot);
    }

    fn reset_input(&self) {
        self.view.clear_input();
        self.staged.lock().take();
    }

    fn set_state(&self, state: SendState) {
        *self.state.lock() = state;
    }
}

fn ignored(reason: IgnoreReason) -> SendOutcome {
    SEND_IGNORED.click();
    SendOutcome::Ignored(reason)
}

struct SessionTarget<'a> {
    session: &'a ChatSession,
    index: usize,
    bubble: BubbleId,
    started: &'a mut bool,
    rendered_len: usize,
}

impl StreamTarget for SessionTarget<'_> {
    fn first_output(&mut self) {
        if !*self.started {
            *self.started = true;
            self.session.view.hide_typing();
        }
    }

    fn render(&mut self, markdown: &str, html: &SafeHtml) {
        if let Some(logger) = &self.session.logger {
            if let Some(delta) = markdown.get(self.rendered_len..) {
                logger.log_stream_chunk(delta);
            }
        }
        self.rendered_len = markdown.len();
        self.session
            .update_streaming(self.index, self.bubble, markdown, html);
    }

    fn hide_pending(&mut self) {
        self.session.view.hide_typing();
    }

    fn should_interrupt(&self) -> bool {
        self.session.view.should_interrupt()
    }
}

//! Client core for the Chatbox conversational endpoint.
//!
//! A [`ChatSession`] sends messages through a [`ChatTransport`], renders
//! replies through a [`RenderGateway`] and drives a [`ChatView`].  Replies
//! arrive whole or as a stream of markdown chunks; a [`RateLimitTracker`]
//! mirrors the server's message allowance.

// Public modules
pub mod bootstrap;
pub mod client_logger;
pub mod clipboard;
pub mod commands;
pub mod config;
pub mod cookie;
pub mod decoder;
pub mod error;
pub mod message;
pub mod rate_limit;
pub mod render;
pub mod send_lock;
pub mod session;
pub mod stream;
pub mod transport;
pub mod view;

mod observability;

// Re-exports
pub use bootstrap::{SessionBootstrap, parse_session_bootstrap};
pub use client_logger::{ClientLogger, JsonLinesLogger};
pub use clipboard::{Clipboard, MemoryClipboard, SystemClipboard};
pub use config::{ChatArgs, ChatConfig, ChatFileConfig};
pub use cookie::{CookieSource, CookieString};
pub use decoder::IncrementalDecoder;
pub use error::{Error, Result};
pub use message::{BubbleId, ControlState, Message, Role};
pub use observability::register_biometrics;
pub use rate_limit::{RateLimitState, RateLimitTracker, format_time_left};
pub use render::{RenderGateway, SafeHtml, html_to_text};
pub use send_lock::{Reservation, SendLock, SendPermit};
pub use session::{
    ChatSession, EchoPolicy, IgnoreReason, SendOperation, SendOutcome, SendState,
};
pub use stream::{ByteStream, StreamSummary, StreamTarget, consume};
pub use transport::{
    Attachment, BufferedReply, ChatRequest, ChatTransport, HttpTransport, POLICY_ALERT, ReplyMode,
    SessionSelector,
};
pub use view::{ChatView, TerminalView};

use serde::Serialize;

use crate::render::SafeHtml;

/// Who authored a transcript entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person at the keyboard.
    User,
    /// The conversational endpoint.
    Bot,
    /// Notices generated by the client itself.
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Bot => write!(f, "bot"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One entry of the chat transcript.
///
/// `content` is the markdown source (or the literal text for user messages)
/// and `html` is what the view displays.  While a reply streams, `content`
/// only ever grows; once `complete` is set the message no longer changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Author of the message.
    pub role: Role,
    /// Markdown so far.
    pub content: String,
    /// Sanitized rendering of `content`.
    pub html: SafeHtml,
    /// File name of the attachment sent with a user message.
    pub attachment: Option<String>,
    /// False only while a reply is still streaming.
    pub complete: bool,
}

impl Message {
    /// A finished message.
    pub fn new(role: Role, content: impl Into<String>, html: SafeHtml) -> Self {
        Self {
            role,
            content: content.into(),
            html,
            attachment: None,
            complete: true,
        }
    }

    /// An empty bot message that a stream will fill in.
    pub fn pending_bot() -> Self {
        Self {
            role: Role::Bot,
            content: String::new(),
            html: SafeHtml::empty(),
            attachment: None,
            complete: false,
        }
    }

    /// Attach a file name to the message.
    pub fn with_attachment(mut self, file_name: Option<String>) -> Self {
        self.attachment = file_name;
        self
    }
}

/// Handle to a message bubble inside a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BubbleId(pub usize);

/// Interactive state of the input box and send button.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    /// Accepting input.
    Enabled,
    /// A send is in flight: disabled and dimmed.
    Busy,
    /// The rate limit is exhausted: disabled until the page reloads.
    Locked,
}

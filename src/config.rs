//! Configuration types for the chat front end.
//!
//! This module provides CLI argument parsing via `arrrg`, an optional YAML
//! configuration file, and the resolved [`ChatConfig`].  Values given on the
//! command line win over the file; the session cookie may also come from the
//! `CHATBOX_COOKIE` environment variable.

use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::session::EchoPolicy;
use crate::transport::{DEFAULT_MODEL, ReplyMode, SessionSelector};

/// Environment variable consulted when no cookie is configured.
pub const COOKIE_ENV: &str = "CHATBOX_COOKIE";

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Command-line arguments for the chatbox-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Server to talk to.
    #[arrrg(optional, "Base URL of the server (default: http://127.0.0.1:8000/)", "URL")]
    pub base_url: Option<String>,

    /// Model to use for chat.
    #[arrrg(optional, "Model to use (default: openai/gpt-4o-mini)", "MODEL")]
    pub model: Option<String>,

    /// Chat to resume.
    #[arrrg(optional, "Resume the chat with this id", "ID")]
    pub chat_id: Option<String>,

    /// Start a fresh chat.
    #[arrrg(flag, "Start a new chat")]
    pub new_chat: bool,

    /// Stream replies.
    #[arrrg(flag, "Stream replies as they are generated")]
    pub stream: bool,

    /// Show the user's message before the server accepts it.
    #[arrrg(flag, "Echo messages before the server accepts them")]
    pub echo_first: bool,

    /// Session cookie string.
    #[arrrg(optional, "Cookie header to forward (default: $CHATBOX_COOKIE)", "COOKIE")]
    pub cookie: Option<String>,

    /// YAML configuration file.
    #[arrrg(optional, "Read defaults from this YAML file", "PATH")]
    pub config: Option<String>,

    /// Request timeout in seconds.
    #[arrrg(optional, "Request timeout in seconds (default: 60)", "SECONDS")]
    pub timeout: Option<u64>,

    /// Send image attachments inline.
    #[arrrg(flag, "Also send image attachments as base64")]
    pub inline_images: bool,

    /// Exchange log.
    #[arrrg(optional, "Append a JSON line per exchange event to this file", "PATH")]
    pub log_file: Option<String>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

/// Defaults read from a YAML file.  Every key is optional.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChatFileConfig {
    /// Base URL of the server.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model identifier.
    #[serde(default)]
    pub model: Option<String>,
    /// Chat to resume.
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Stream replies.
    #[serde(default)]
    pub stream: Option<bool>,
    /// Echo before acceptance.
    #[serde(default)]
    pub echo_first: Option<bool>,
    /// Cookie header to forward.
    #[serde(default)]
    pub cookie: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Send images inline.
    #[serde(default)]
    pub inline_images: Option<bool>,
    /// Exchange log path.
    #[serde(default)]
    pub log_file: Option<String>,
    /// Use ANSI colors.
    #[serde(default)]
    pub color: Option<bool>,
}

impl ChatFileConfig {
    /// Parse YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("cannot read config {path}: {e}"), e))?;
        Self::from_yaml(&yaml)
    }
}

/// Configuration for a chat session.
///
/// This struct holds the resolved configuration values after processing
/// command-line arguments, the config file and the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Base URL of the server, ending in `/`.
    pub base_url: String,

    /// The model to use for generating responses.
    pub model: String,

    /// Chat to resume, if any.
    pub chat_id: Option<String>,

    /// Whether to start a new chat.
    pub new_chat: bool,

    /// How replies are delivered.
    pub mode: ReplyMode,

    /// When the user's message is echoed.
    pub echo: EchoPolicy,

    /// Cookie header to forward.
    pub cookie: Option<String>,

    /// Request timeout.
    pub timeout: Duration,

    /// Whether image attachments are also sent as base64.
    pub inline_images: bool,

    /// Exchange log path.
    pub log_file: Option<String>,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Base URL: http://127.0.0.1:8000/
    /// - Model: openai/gpt-4o-mini
    /// - Buffered replies, echo after acceptance
    /// - Timeout: 60 seconds
    /// - Color: enabled
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            chat_id: None,
            new_chat: false,
            mode: ReplyMode::Buffered,
            echo: EchoPolicy::AfterAcceptance,
            cookie: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            inline_images: false,
            log_file: None,
            use_color: true,
        }
    }

    /// Resolve arguments over the file over the environment.
    pub fn resolve(
        args: ChatArgs,
        file: Option<ChatFileConfig>,
        env_cookie: Option<String>,
    ) -> Self {
        let file = file.unwrap_or_default();
        let defaults = ChatConfig::new();
        let streaming = args.stream || file.stream.unwrap_or(false);
        let echo_first = args.echo_first || file.echo_first.unwrap_or(false);
        ChatConfig {
            base_url: args.base_url.or(file.base_url).unwrap_or(defaults.base_url),
            model: args.model.or(file.model).unwrap_or(defaults.model),
            chat_id: args.chat_id.or(file.chat_id),
            new_chat: args.new_chat,
            mode: if streaming {
                ReplyMode::Streaming
            } else {
                ReplyMode::Buffered
            },
            echo: if echo_first {
                EchoPolicy::BeforeDispatch
            } else {
                EchoPolicy::AfterAcceptance
            },
            cookie: args
                .cookie
                .or(file.cookie)
                .or(env_cookie)
                .filter(|c| !c.trim().is_empty()),
            timeout: args
                .timeout
                .or(file.timeout)
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            inline_images: args.inline_images || file.inline_images.unwrap_or(false),
            log_file: args.log_file.or(file.log_file),
            use_color: !args.no_color && file.color.unwrap_or(true),
        }
    }

    /// Resolve arguments, reading the config file and environment they name.
    pub fn load(args: ChatArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => Some(ChatFileConfig::load(path)?),
            None => None,
        };
        let env_cookie = std::env::var(COOKIE_ENV).ok();
        Ok(Self::resolve(args, file, env_cookie))
    }

    /// Which page to load at start-up.
    pub fn session_selector(&self) -> SessionSelector {
        if self.new_chat {
            SessionSelector::New
        } else if let Some(chat_id) = &self.chat_id {
            SessionSelector::Existing(chat_id.clone())
        } else {
            SessionSelector::Current
        }
    }

    /// Sets the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the chat to resume.
    pub fn with_chat_id(mut self, chat_id: Option<String>) -> Self {
        self.chat_id = chat_id;
        self
    }

    /// Sets the reply mode.
    pub fn with_mode(mut self, mode: ReplyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the echo policy.
    pub fn with_echo(mut self, echo: EchoPolicy) -> Self {
        self.echo = echo;
        self
    }

    /// Sets the cookie to forward.
    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ChatArgs> for ChatConfig {
    fn from(args: ChatArgs) -> Self {
        ChatConfig::resolve(args, None, None)
    }
}

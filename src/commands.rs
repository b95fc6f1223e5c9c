//! Slash command parsing for the chat front end.
//!
//! Input starting with `/` controls the page instead of being sent: it
//! stands in for the page's buttons (stream toggle, model picker, file
//! picker, copy button, new chat) in a terminal.

use crate::transport::ReplyMode;

/// A parsed chat command.
///
/// These commands control the chat session and are not sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Display help information.
    Help,

    /// Exit the chat application.
    Quit,

    /// Switch between buffered and streamed replies.
    Stream(ReplyMode),

    /// Change the model.
    Model(String),

    /// Stage a file for the next message.
    Attach(String),

    /// Drop the staged file.
    Detach,

    /// Copy a message to the clipboard; `None` copies the last reply.
    Copy(Option<usize>),

    /// Show the remaining allowance.
    Limits,

    /// List the transcript.
    History,

    /// Start a new chat.
    New,

    /// Reload the page values from the server.
    Reload,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a command, or `None` if it
/// should be sent as a message.
///
/// # Examples
///
/// ```
/// # use chatbox::commands::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("/model openai/gpt-4o").is_some());
/// assert!(parse_command("Hello there").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        "stream" => match argument.and_then(parse_on_off) {
            Some(true) => ChatCommand::Stream(ReplyMode::Streaming),
            Some(false) => ChatCommand::Stream(ReplyMode::Buffered),
            None => ChatCommand::Invalid("/stream expects 'on' or 'off'".to_string()),
        },
        "model" => match argument {
            Some(model) => ChatCommand::Model(model.to_string()),
            None => ChatCommand::Invalid("/model requires a model name".to_string()),
        },
        "attach" => match argument {
            Some(path) => ChatCommand::Attach(path.to_string()),
            None => ChatCommand::Invalid("/attach requires a file path".to_string()),
        },
        "detach" => ChatCommand::Detach,
        "copy" => match argument {
            None => ChatCommand::Copy(None),
            Some(arg) => match arg.parse::<usize>() {
                Ok(n) if n > 0 => ChatCommand::Copy(Some(n)),
                _ => ChatCommand::Invalid("/copy expects a message number".to_string()),
            },
        },
        "limits" | "limit" => ChatCommand::Limits,
        "history" => ChatCommand::History,
        "new" => ChatCommand::New,
        "reload" => ChatCommand::Reload,
        _ => ChatCommand::Invalid(format!("Unknown command: /{command}")),
    };

    Some(result)
}

fn parse_on_off(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "on" | "true" | "yes" => Some(true),
        "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /stream on|off         Stream replies or wait for the whole reply
  /model <name>          Change the model (e.g., /model openai/gpt-4o-mini)
  /attach <path>         Send a file with the next message (2 MB max)
  /detach                Drop the staged file
  /copy [n]              Copy message n (default: the last reply)
  /history               List the messages in this chat
  /limits                Show the remaining messages
  /new                   Start a new chat
  /reload                Reload the chat from the server
  /help                  Show this help message
  /quit                  Exit the chat"#
}

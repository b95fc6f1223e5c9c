//! The chat page surface.
//!
//! [`ChatView`] is everything the send orchestrator and the rate-limit
//! tracker do to the page: toggling the input controls, appending and
//! updating message bubbles, the typing indicator, alerts and the
//! limit-reached notice.  [`TerminalView`] is the implementation used by
//! `chatbox-chat`; tests provide recording implementations.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::message::{BubbleId, ControlState, Message, Role};

/// ANSI escape code for dim text (used for the typing indicator).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code for italic text (used for attachments).
const ANSI_ITALIC: &str = "\x1b[3m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for the bot label).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for yellow text (used for system notices).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI escape code for red text (used for alerts).
const ANSI_RED: &str = "\x1b[31m";

/// ANSI sequence that returns to column zero and clears the line.
const ANSI_CLEAR_LINE: &str = "\r\x1b[2K";

/// Trait for the chat page surface.
///
/// Methods take `&self` because the countdown task and the send
/// orchestrator hold the same view.
pub trait ChatView: Send + Sync {
    /// Enable, busy-disable or lock the input and send controls.
    fn set_controls(&self, state: ControlState);

    /// Append a bubble for `message` and return its handle.
    fn append_message(&self, message: &Message) -> BubbleId;

    /// Replace the content of an existing bubble.
    fn update_message(&self, bubble: BubbleId, message: &Message);

    /// Show the typing indicator below the transcript.
    fn show_typing(&self);

    /// Hide the typing indicator.  Hiding a hidden indicator is a no-op.
    fn hide_typing(&self);

    /// Show a one-shot modal alert.
    fn alert(&self, message: &str);

    /// True once the limit-reached notice is on the page.
    fn has_limit_notice(&self) -> bool;

    /// Append the limit-reached notice.
    fn show_limit_notice(&self, text: &str);

    /// Update the countdown text inside the notice.
    fn show_time_left(&self, text: &str);

    /// Reload the page so the server can re-seed the limits.
    fn reload(&self);

    /// Clear the input box and any file picker selection.
    fn clear_input(&self);

    /// Print an error message.
    fn print_error(&self, error: &str);

    /// Print an informational message.
    fn print_info(&self, info: &str);

    /// Returns true if an in-flight stream should be abandoned.
    fn should_interrupt(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct TerminalState {
    next_bubble: usize,
    // Bubble currently being streamed and how many bytes of it are printed.
    streaming: Option<(BubbleId, usize)>,
    typing: bool,
    // The streaming bubble's label waits for the typing indicator to go.
    label_pending: bool,
    limit_notice: bool,
    time_left: Option<String>,
    controls: ControlState,
}

/// Terminal implementation of [`ChatView`] with optional ANSI styling.
///
/// Bot replies are printed incrementally: each update writes only the part of
/// the markdown accumulator that has not been printed yet, which works
/// because a streaming message's content only grows.
pub struct TerminalView {
    use_color: bool,
    state: Mutex<TerminalState>,
    interrupted: Option<Arc<AtomicBool>>,
    reload_requested: AtomicBool,
}

impl TerminalView {
    /// Creates a new TerminalView with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new TerminalView with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            use_color,
            state: Mutex::new(TerminalState {
                next_bubble: 0,
                streaming: None,
                typing: false,
                label_pending: false,
                limit_notice: false,
                time_left: None,
                controls: ControlState::Enabled,
            }),
            interrupted: None,
            reload_requested: AtomicBool::new(false),
        }
    }

    /// Attaches an interrupt flag to the view.
    pub fn with_interrupt(mut self, interrupted: Arc<AtomicBool>) -> Self {
        self.interrupted = Some(interrupted);
        self
    }

    /// Returns and clears a pending reload request.
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }

    /// The latest countdown text, if a countdown has rendered.
    pub fn time_left(&self) -> Option<String> {
        self.state.lock().time_left.clone()
    }

    /// Current state of the input controls.
    pub fn controls(&self) -> ControlState {
        self.state.lock().controls
    }

    /// Forget the limit notice after the page state was reloaded.
    pub fn reset_limit_notice(&self) {
        let mut state = self.state.lock();
        state.limit_notice = false;
        state.time_left = None;
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }

    fn styled(&self, style: &str, text: &str) -> String {
        if self.use_color {
            format!("{style}{text}{ANSI_RESET}")
        } else {
            text.to_string()
        }
    }

    fn clear_typing(&self, state: &mut TerminalState) {
        if state.typing {
            if self.use_color {
                print!("{ANSI_CLEAR_LINE}");
            } else {
                println!();
            }
            state.typing = false;
        }
        if state.label_pending {
            println!("{}", self.styled(ANSI_CYAN, "Bot:"));
            state.label_pending = false;
        }
    }
}

impl Default for TerminalView {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatView for TerminalView {
    fn set_controls(&self, controls: ControlState) {
        self.state.lock().controls = controls;
    }

    fn append_message(&self, message: &Message) -> BubbleId {
        let mut state = self.state.lock();
        let bubble = BubbleId(state.next_bubble);
        state.next_bubble += 1;
        if message.role == Role::Bot && !message.complete && state.typing {
            state.streaming = Some((bubble, 0));
            state.label_pending = true;
            return bubble;
        }
        self.clear_typing(&mut state);
        match message.role {
            Role::User => {
                if let Some(name) = &message.attachment {
                    println!("{}", self.styled(ANSI_ITALIC, &format!("[attached: {name}]")));
                }
            }
            Role::Bot => {
                println!("{}", self.styled(ANSI_CYAN, "Bot:"));
                print!("{}", message.content);
                if message.complete {
                    println!();
                } else {
                    state.streaming = Some((bubble, message.content.len()));
                }
            }
            Role::System => {
                println!("{}", self.styled(ANSI_YELLOW, &message.content));
            }
        }
        self.flush();
        bubble
    }

    fn update_message(&self, bubble: BubbleId, message: &Message) {
        let mut state = self.state.lock();
        let Some((streaming, printed)) = state.streaming else {
            return;
        };
        if streaming != bubble {
            return;
        }
        // Nothing is printed over the typing indicator; the text so far
        // follows once it is hidden.
        if state.typing && !message.complete {
            return;
        }
        self.clear_typing(&mut state);
        if let Some(delta) = message.content.get(printed..) {
            print!("{delta}");
        }
        if message.complete {
            println!();
            state.streaming = None;
        } else {
            state.streaming = Some((bubble, message.content.len()));
        }
        self.flush();
    }

    fn show_typing(&self) {
        let mut state = self.state.lock();
        if state.typing {
            return;
        }
        state.typing = true;
        if self.use_color {
            print!("{ANSI_DIM}typing...{ANSI_RESET}");
        } else {
            print!("typing...");
        }
        self.flush();
    }

    fn hide_typing(&self) {
        let mut state = self.state.lock();
        self.clear_typing(&mut state);
        self.flush();
    }

    fn alert(&self, message: &str) {
        let mut state = self.state.lock();
        self.clear_typing(&mut state);
        println!("{}", self.styled(ANSI_RED, &format!("[!] {message}")));
        self.flush();
    }

    fn has_limit_notice(&self) -> bool {
        self.state.lock().limit_notice
    }

    fn show_limit_notice(&self, text: &str) {
        let mut state = self.state.lock();
        state.limit_notice = true;
        println!("{}", self.styled(ANSI_YELLOW, &format!("⚠ {text}")));
        self.flush();
    }

    fn show_time_left(&self, text: &str) {
        let mut state = self.state.lock();
        let first = state.time_left.is_none();
        state.time_left = Some(text.to_string());
        if first {
            println!("{}", self.styled(ANSI_YELLOW, text));
            self.flush();
        }
    }

    fn reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    fn clear_input(&self) {}

    fn print_error(&self, error: &str) {
        let mut state = self.state.lock();
        self.clear_typing(&mut state);
        eprintln!("\nError: {error}");
    }

    fn print_info(&self, info: &str) {
        println!("{info}");
    }

    fn should_interrupt(&self) -> bool {
        self.interrupted
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

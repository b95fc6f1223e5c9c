//! Interactive terminal client for the Chatbox server.
//!
//! This binary plays the role of the chat page: it loads the page values
//! for a chat, then reads messages in a REPL and renders the replies.
//!
//! # Usage
//!
//! ```bash
//! # Resume the current chat on a local server, forwarding a session cookie
//! CHATBOX_COOKIE='sessionid=...; csrftoken=...' chatbox-chat
//!
//! # Start a new chat and stream replies
//! chatbox-chat --new-chat --stream --base-url https://chat.example/
//!
//! # Read defaults from a file and log every exchange
//! chatbox-chat --config chatbox.yaml --log-file exchanges.jsonl
//! ```
//!
//! # Commands
//!
//! While chatting, you can use slash commands:
//! - `/help` - Show available commands
//! - `/stream on|off` - Toggle streamed replies
//! - `/attach <path>` - Send a file with the next message
//! - `/copy [n]` - Copy a message to the clipboard
//! - `/new` - Start a new chat
//! - `/quit` - Exit the application

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use utf8path::Path;

use chatbox::commands::{ChatCommand, help_text, parse_command};
use chatbox::{
    Attachment, ChatArgs, ChatConfig, ChatSession, ChatTransport, ChatView, ClientLogger,
    CookieString, HttpTransport, IgnoreReason, JsonLinesLogger, Role, SendOutcome,
    SessionBootstrap, SessionSelector, SystemClipboard, TerminalView, format_time_left,
    html_to_text,
};

/// Everything needed to rebuild a session for another chat.
struct Context {
    config: ChatConfig,
    transport: Arc<dyn ChatTransport>,
    view: Arc<TerminalView>,
    logger: Option<Arc<dyn ClientLogger>>,
}

impl Context {
    fn session(&self, bootstrap: SessionBootstrap) -> ChatSession {
        let view: Arc<dyn ChatView> = self.view.clone();
        let mut session = ChatSession::new(bootstrap, Arc::clone(&self.transport), view)
            .with_model(self.config.model.clone())
            .with_mode(self.config.mode)
            .with_echo_policy(self.config.echo)
            .with_inline_images(self.config.inline_images);
        if let Some(logger) = &self.logger {
            session = session.with_logger(Arc::clone(logger));
        }
        session
    }

    async fn open(&self, selector: &SessionSelector) -> chatbox::Result<ChatSession> {
        let bootstrap = self.transport.load_session(selector).await?;
        self.view.reset_limit_notice();
        let session = self.session(bootstrap);
        session.on_load();
        Ok(session)
    }
}

/// Main entry point for the chatbox-chat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, _) = ChatArgs::from_command_line_relaxed("chatbox-chat [OPTIONS]");
    let config = ChatConfig::load(args)?;

    let cookies = Arc::new(CookieString::new(config.cookie.clone().unwrap_or_default()));
    let transport: Arc<dyn ChatTransport> = Arc::new(HttpTransport::with_options(
        Some(&config.base_url),
        cookies,
        Some(config.timeout),
    )?);
    let logger: Option<Arc<dyn ClientLogger>> = match &config.log_file {
        Some(path) => Some(Arc::new(JsonLinesLogger::open(&Path::from(path.as_str()))?)),
        None => None,
    };

    // Flag for interrupt handling during streaming
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::Relaxed);
    })?;

    let view = Arc::new(TerminalView::with_color(config.use_color).with_interrupt(interrupted.clone()));
    let context = Context {
        transport,
        view: Arc::clone(&view),
        logger,
        config,
    };
    let mut session = context.open(&context.config.session_selector()).await?;
    let clipboard = SystemClipboard::new();
    let mut rl = DefaultEditor::new()?;

    println!(
        "Chatbox (chat: {}, model: {}, {} replies)",
        session.chat_id(),
        session.model(),
        session.mode()
    );
    println!(
        "{} messages left. Type /help for commands, /quit to exit\n",
        session.tracker().remaining_messages()
    );

    loop {
        // Reset interrupt flag before each input
        interrupted.store(false, Ordering::Relaxed);

        if view.take_reload_request() || session.tracker().needs_reload() {
            match context
                .open(&SessionSelector::Existing(session.chat_id()))
                .await
            {
                Ok(reloaded) => {
                    session = reloaded;
                    view.print_info(&format!(
                        "Reloaded: {} messages left.",
                        session.tracker().remaining_messages()
                    ));
                }
                Err(err) => view.print_error(&format!("Reload failed: {err}")),
            }
        }

        let readline = rl.readline("You: ");

        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() && session.staged_attachment().is_none() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    match cmd {
                        ChatCommand::Quit => {
                            println!("Goodbye!");
                            break;
                        }
                        ChatCommand::Help => {
                            for line in help_text().lines() {
                                println!("    {line}");
                            }
                        }
                        ChatCommand::Stream(mode) => {
                            session.set_mode(mode);
                            view.print_info(&format!("Replies are now {mode}."));
                        }
                        ChatCommand::Model(model) => {
                            session.set_model(model.clone());
                            view.print_info(&format!("Model changed to: {model}"));
                        }
                        ChatCommand::Attach(path) => {
                            match Attachment::from_path(&Path::from(path.as_str())).await {
                                Ok(attachment) => {
                                    view.print_info(&format!(
                                        "Attached {} ({} bytes, {}).",
                                        attachment.file_name,
                                        attachment.len(),
                                        attachment.content_type
                                    ));
                                    session.stage_attachment(attachment);
                                }
                                Err(err) => view.print_error(&err.to_string()),
                            }
                        }
                        ChatCommand::Detach => match session.clear_attachment() {
                            Some(attachment) => {
                                view.print_info(&format!("Dropped {}.", attachment.file_name))
                            }
                            None => view.print_info("Nothing attached."),
                        },
                        ChatCommand::Copy(number) => {
                            let index = match number {
                                Some(n) => Some(n - 1),
                                None => session.last_reply_index(),
                            };
                            match index {
                                Some(index) => match session.copy_message(index, &clipboard) {
                                    Ok(_) => view.print_info("Copied."),
                                    Err(err) => view.print_error(&err.to_string()),
                                },
                                None => view.print_info("No reply to copy yet."),
                            }
                        }
                        ChatCommand::Limits => print_limits(&session),
                        ChatCommand::History => print_history(&session),
                        ChatCommand::New => match context.open(&SessionSelector::New).await {
                            Ok(fresh) => {
                                session = fresh;
                                view.print_info(&format!("Started chat {}.", session.chat_id()));
                            }
                            Err(err) => view.print_error(&err.to_string()),
                        },
                        ChatCommand::Reload => view.reload(),
                        ChatCommand::Invalid(message) => view.print_error(&message),
                    }
                    continue;
                }

                match session.submit(line).await {
                    Ok(SendOutcome::Ignored(IgnoreReason::Busy)) => {
                        view.print_info("A message is already being sent.")
                    }
                    Ok(SendOutcome::RateLimited) => {
                        view.print_info("No messages left in this window; try /reload later.")
                    }
                    Ok(SendOutcome::LimitReached { remaining_seconds }) => {
                        view.print_info(&format_time_left(remaining_seconds))
                    }
                    Ok(_) => {}
                    Err(err) if err.is_abort() => view.print_info("[interrupted]"),
                    Err(err) => view.print_error(&err.to_string()),
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                view.print_error(&format!("Input error: {err}"));
                break;
            }
        }
    }

    Ok(())
}

fn print_limits(session: &ChatSession) {
    let tracker = session.tracker();
    println!("    Chat {}:", session.chat_id());
    println!("      Messages left: {}", tracker.remaining_messages());
    if tracker.is_counting_down() {
        println!("      Window reopens: {}", format_time_left(tracker.seconds_left()));
    }
    match session.staged_attachment() {
        Some(name) => println!("      Attached: {name}"),
        None => println!("      Attached: (none)"),
    }
}

fn print_history(session: &ChatSession) {
    let messages = session.messages();
    if messages.is_empty() {
        println!("    (no messages)");
        return;
    }
    for (i, message) in messages.iter().enumerate() {
        let text = match message.role {
            Role::Bot => html_to_text(message.html.as_str()),
            Role::User | Role::System => message.content.clone(),
        };
        let first_line = text.lines().next().unwrap_or("");
        println!("    {:>3}. {:<4} {first_line}", i + 1, message.role.to_string());
    }
}

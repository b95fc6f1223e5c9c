//! Clipboard access for the copy action.

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Somewhere copied message text can go.
pub trait Clipboard: Send + Sync {
    /// Replace the clipboard contents with `text`.
    fn set_text(&self, text: &str) -> Result<()>;
}

/// The desktop clipboard, opened for each copy.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClipboard;

impl SystemClipboard {
    /// A handle to the desktop clipboard.
    pub fn new() -> Self {
        Self
    }
}

fn clipboard_error(err: arboard::Error) -> Error {
    Error::io(
        format!("clipboard unavailable: {err}"),
        std::io::Error::other(err.to_string()),
    )
}

impl Clipboard for SystemClipboard {
    fn set_text(&self, text: &str) -> Result<()> {
        let mut clipboard = arboard::Clipboard::new().map_err(clipboard_error)?;
        clipboard.set_text(text).map_err(clipboard_error)
    }
}

/// A clipboard that only remembers the last copy.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    text: Mutex<Option<String>>,
}

impl MemoryClipboard {
    /// An empty clipboard.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last copied text.
    pub fn text(&self) -> Option<String> {
        self.text.lock().clone()
    }
}

impl Clipboard for MemoryClipboard {
    fn set_text(&self, text: &str) -> Result<()> {
        *self.text.lock() = Some(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_clipboard_keeps_last_copy() {
        let clipboard = MemoryClipboard::new();
        assert_eq!(clipboard.text(), None);
        clipboard.set_text("first").unwrap();
        clipboard.set_text("second").unwrap();
        assert_eq!(clipboard.text().as_deref(), Some("second"));
    }
}

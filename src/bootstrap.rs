//! Values the server embeds into the chat page at load.
//!
//! The page carries three globals in an inline script:
//!
//! ```text
//! window.CHAT_ID = "4f1c...";
//! window.REMAINING_MESSAGES = 7;
//! window.REMAINING_SECONDS = 0;
//! ```
//!
//! They seed the session and the rate-limit tracker.  A reload is simply a
//! new fetch of the page and a new parse.

use crate::error::{Error, Result};
use crate::rate_limit::{MAX_MESSAGES, RateLimitState};

/// The per-page state the server hands to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionBootstrap {
    /// Opaque identifier of the chat.
    pub chat_id: String,
    /// The allowance at load.
    pub limits: RateLimitState,
}

/// Find `window.NAME = value` in `html` and return the unquoted value.
fn find_global<'a>(html: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("window.{name}");
    let mut haystack = html;
    while let Some(at) = haystack.find(&needle) {
        let after = &haystack[at + needle.len()..];
        // Reject longer names sharing the prefix, e.g. CHAT_ID_OLD.
        if after
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            haystack = after;
            continue;
        }
        let Some(value) = after.trim_start().strip_prefix('=') else {
            haystack = after;
            continue;
        };
        let end = value.find([';', '\n', '<']).unwrap_or(value.len());
        let value = value[..end].trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        return Some(value);
    }
    None
}

fn parse_count(html: &str, name: &str) -> Result<Option<i64>> {
    let Some(value) = find_global(html, name) else {
        return Ok(None);
    };
    // Templates may render numbers quoted; `null`/empty mean unknown.
    if value.is_empty() || value == "null" || value == "undefined" {
        return Ok(None);
    }
    value.parse::<i64>().map(Some).map_err(|e| {
        Error::serialization(
            format!("window.{name} is not an integer: {value:?}"),
            Some(Box::new(e)),
        )
    })
}

/// Parse the page globals out of the chat page.
///
/// A missing `CHAT_ID` is an error.  Missing counts default to a fresh
/// window; negative counts are clamped to zero.
pub fn parse_session_bootstrap(html: &str) -> Result<SessionBootstrap> {
    let chat_id = find_global(html, "CHAT_ID")
        .filter(|id| !id.is_empty() && *id != "null")
        .ok_or_else(|| Error::serialization("page does not define window.CHAT_ID", None))?
        .to_string();
    let remaining_messages = parse_count(html, "REMAINING_MESSAGES")?
        .map(|n| n.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or(MAX_MESSAGES);
    let remaining_seconds = parse_count(html, "REMAINING_SECONDS")?
        .map(|n| n.max(0) as u64)
        .unwrap_or(0);
    Ok(SessionBootstrap {
        chat_id,
        limits: RateLimitState::new(remaining_messages, remaining_seconds),
    })
}

//! Logging trait for chat exchanges.
//!
//! This module provides the [`ClientLogger`] trait that lets a front end
//! capture every exchange passing through a [`crate::ChatSession`], and
//! [`JsonLinesLogger`], which appends one JSON object per event to a file.

use std::fs::{File, OpenOptions};
use std::io::Write;

use parking_lot::Mutex;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use utf8path::Path;

use crate::error::{Error, Result};
use crate::stream::StreamSummary;
use crate::transport::{BufferedReply, ChatRequest, ReplyMode};

/// A trait for logging chat exchanges.
///
/// Every method has an empty default so implementations can pick the
/// events they care about.
pub trait ClientLogger: Send + Sync {
    /// Log a request just before it is dispatched.
    fn log_request(&self, _request: &ChatRequest, _mode: ReplyMode) {}

    /// Log the parsed body of a buffered reply.
    fn log_reply(&self, _reply: &BufferedReply) {}

    /// Log the text one streamed chunk added to the reply.
    fn log_stream_chunk(&self, _text: &str) {}

    /// Log a stream that completed.
    fn log_stream_complete(&self, _summary: &StreamSummary) {}

    /// Log a failed or rejected exchange.
    fn log_failure(&self, _error: &Error) {}
}

/// Appends events to a file as JSON lines.
pub struct JsonLinesLogger {
    file: Mutex<File>,
}

impl JsonLinesLogger {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path<'_>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_str())
            .map_err(|e| Error::io(format!("cannot open log {}: {e}", path.as_str()), e))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write(&self, event: &str, mut body: Value) {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        if let Value::Object(map) = &mut body {
            map.insert("ts".to_string(), json!(ts));
            map.insert("event".to_string(), json!(event));
        }
        let mut file = self.file.lock();
        // A failing log must never fail the exchange.
        let _ = writeln!(file, "{body}");
    }
}

impl ClientLogger for JsonLinesLogger {
    fn log_request(&self, request: &ChatRequest, mode: ReplyMode) {
        self.write(
            "request",
            json!({
                "mode": mode,
                "chat_id": request.chat_id,
                "model": request.model,
                "message": request.message,
                "attachment": request.attachment.as_ref().map(|a| &a.file_name),
            }),
        );
    }

    fn log_reply(&self, reply: &BufferedReply) {
        self.write("reply", json!({ "reply": reply }));
    }

    fn log_stream_chunk(&self, text: &str) {
        self.write("chunk", json!({ "text": text }));
    }

    fn log_stream_complete(&self, summary: &StreamSummary) {
        self.write(
            "stream_complete",
            json!({
                "markdown": summary.markdown,
                "chunks": summary.chunks,
                "bytes": summary.bytes,
            }),
        );
    }

    fn log_failure(&self, error: &Error) {
        self.write(
            "failure",
            json!({
                "error": error.to_string(),
                "status": error.status_code(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DEFAULT_MODEL;

    #[test]
    fn writes_one_object_per_line() {
        let path = std::env::temp_dir().join(format!("chatbox-log-{}.jsonl", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&path);
        {
            let logger = JsonLinesLogger::open(&Path::from(path_str.as_str())).unwrap();
            logger.log_request(
                &ChatRequest {
                    message: "hi".to_string(),
                    chat_id: "c1".to_string(),
                    model: DEFAULT_MODEL.to_string(),
                    attachment: None,
                    inline_image: false,
                },
                ReplyMode::Streaming,
            );
            logger.log_stream_chunk("Hel");
            logger.log_failure(&Error::permission("blocked"));
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "request");
        assert_eq!(lines[0]["mode"], "streaming");
        assert_eq!(lines[1]["text"], "Hel");
        assert_eq!(lines[2]["status"], 403);
        for line in &lines {
            let ts = line["ts"].as_str().unwrap();
            assert!(OffsetDateTime::parse(ts, &Rfc3339).is_ok(), "bad ts {ts}");
        }
        let _ = std::fs::remove_file(&path);
    }
}

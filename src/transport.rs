//! The wire side of a send.
//!
//! A send is a multipart `POST` to `chatbot/` (one JSON reply) or
//! `chatbot/stream/` (chunked `text/plain`).  Both carry the anti-forgery
//! token from the `csrftoken` cookie and `X-Requested-With`.  The page that
//! bootstraps a session is a `GET` on `chatbot/`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client as ReqwestClient, Response};
use serde::{Deserialize, Serialize};
use url::Url;
use utf8path::Path;

use crate::bootstrap::{SessionBootstrap, parse_session_bootstrap};
use crate::cookie::CookieSource;
use crate::error::{Error, Result};
use crate::observability::{REQUEST_ERRORS, REQUESTS};
use crate::stream::ByteStream;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest attachment the server accepts.
pub const MAX_ATTACHMENT_BYTES: usize = 2 * 1024 * 1024;

/// What the page tells the user when the server refuses a message.
pub const POLICY_ALERT: &str = "Don't share illegal content or personal info";

/// The model used when none is chosen.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/////////////////////////////////////////// Attachment /////////////////////////////////////////

/// A file sent along with a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    /// File name as shown to the server.
    pub file_name: String,
    /// MIME type.
    pub content_type: String,
    /// File contents.
    pub bytes: Bytes,
}

impl Attachment {
    /// Wrap in-memory contents; fails if they exceed the size cap.
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(Error::validation(
                format!(
                    "attachment is {} bytes; the limit is {MAX_ATTACHMENT_BYTES}",
                    bytes.len()
                ),
                Some("file".to_string()),
            ));
        }
        Ok(Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        })
    }

    /// Read a file from disk, guessing its type from the extension.
    pub async fn from_path(path: &Path<'_>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_str())
            .await
            .map_err(|e| Error::io(format!("cannot read {}: {e}", path.as_str()), e))?;
        let file_name = path
            .as_str()
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("upload")
            .to_string();
        let content_type = guess_content_type(&file_name);
        Self::new(file_name, content_type, bytes)
    }

    /// True for `image/*`.
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    /// True for `text/*`.
    pub fn is_text(&self) -> bool {
        self.content_type.starts_with("text/")
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for an empty file.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Standard base64 of the contents, as sent in `image_base64`.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" | "md" | "log" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

//////////////////////////////////////////// Requests //////////////////////////////////////////

/// How the reply comes back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// One JSON body with the whole reply.
    #[default]
    Buffered,
    /// Chunked plain text.
    Streaming,
}

impl ReplyMode {
    /// Endpoint path relative to the base URL.
    pub fn path(&self) -> &'static str {
        match self {
            ReplyMode::Buffered => "chatbot/",
            ReplyMode::Streaming => "chatbot/stream/",
        }
    }
}

impl std::fmt::Display for ReplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyMode::Buffered => write!(f, "buffered"),
            ReplyMode::Streaming => write!(f, "streaming"),
        }
    }
}

/// One outgoing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    /// Trimmed message text; may be empty when a file is attached.
    pub message: String,
    /// Chat the message belongs to.
    pub chat_id: String,
    /// Model identifier.
    pub model: String,
    /// Optional file.
    pub attachment: Option<Attachment>,
    /// Also send image attachments as `image_base64`.
    pub inline_image: bool,
}

impl ChatRequest {
    /// The plain form fields, in the order the page sends them.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("message", self.message.clone()),
            ("chat_id", self.chat_id.clone()),
            ("model", self.model.clone()),
        ];
        if self.inline_image {
            if let Some(attachment) = self.attachment.as_ref().filter(|a| a.is_image()) {
                fields.push(("image_base64", attachment.to_base64()));
            }
        }
        fields
    }

    /// Build the multipart body.
    pub fn to_multipart(&self) -> Result<Form> {
        let mut form = Form::new();
        for (name, value) in self.form_fields() {
            form = form.text(name, value);
        }
        if let Some(attachment) = &self.attachment {
            let part = Part::bytes(attachment.bytes.to_vec())
                .file_name(attachment.file_name.clone())
                .mime_str(&attachment.content_type)
                .map_err(|e| {
                    Error::validation(
                        format!("invalid content type {:?}: {e}", attachment.content_type),
                        Some("file".to_string()),
                    )
                })?;
            form = form.part("file", part);
        }
        Ok(form)
    }
}

/// Body of a buffered reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedReply {
    /// Markdown of the reply; absent when the limit was reached.
    #[serde(default)]
    pub reply: Option<String>,
    /// True when the server refused because the window is full.
    #[serde(default)]
    pub limit_reached: bool,
    /// Seconds until the window reopens, when `limit_reached`.
    #[serde(default)]
    pub remaining_seconds: i64,
}

impl BufferedReply {
    /// Parse a reply body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| {
            Error::serialization(format!("malformed reply: {e}"), Some(Box::new(e)))
        })
    }

    /// `remaining_seconds` clamped to zero.
    pub fn lockout_seconds(&self) -> u64 {
        self.remaining_seconds.max(0) as u64
    }
}

/// Which chat page to load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionSelector {
    /// Whatever chat the server's session points at.
    Current,
    /// A specific chat.
    Existing(String),
    /// A brand new chat (`?action=new`).
    New,
}

//////////////////////////////////////////// Transport /////////////////////////////////////////

/// The network seam of the client.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Dispatch `request` and return the body of a successful response.
    ///
    /// Non-success statuses become errors; `403` is
    /// [`Error::Permission`] carrying [`POLICY_ALERT`].
    async fn send(&self, request: &ChatRequest, mode: ReplyMode) -> Result<ByteStream>;

    /// Load the chat page and read its bootstrap values.
    async fn load_session(&self, selector: &SessionSelector) -> Result<SessionBootstrap>;
}

/// [`ChatTransport`] over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
    base_url: Url,
    cookies: Arc<dyn CookieSource>,
    timeout: Duration,
}

impl HttpTransport {
    /// A transport for the default local server.
    pub fn new(cookies: Arc<dyn CookieSource>) -> Result<Self> {
        Self::with_options(None, cookies, None)
    }

    /// A transport with custom settings.
    ///
    /// `timeout` bounds connecting and the whole of a buffered exchange;
    /// streamed bodies may take longer.
    pub fn with_options(
        base_url: Option<&str>,
        cookies: Arc<dyn CookieSource>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let mut base = base_url.unwrap_or(DEFAULT_BASE_URL).to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;
        let client = ReqwestClient::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self {
            client,
            base_url,
            cookies,
            timeout,
        })
    }

    /// The base URL all endpoints are relative to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn cookie_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = self.cookies.header() {
            headers.insert(
                header::COOKIE,
                HeaderValue::from_str(&cookie).map_err(|e| {
                    Error::validation(
                        format!("cookie is not a valid header: {e}"),
                        Some("cookie".to_string()),
                    )
                })?,
            );
        }
        Ok(headers)
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = self.cookie_headers()?;
        headers.insert(
            "X-Requested-With",
            HeaderValue::from_static("XMLHttpRequest"),
        );
        if let Some(token) = self.cookies.csrf_token() {
            headers.insert(
                "X-CSRFToken",
                HeaderValue::from_str(&token).map_err(|e| {
                    Error::validation(
                        format!("csrf token is not a valid header: {e}"),
                        Some("csrftoken".to_string()),
                    )
                })?,
            );
        }
        Ok(headers)
    }

    fn map_send_error(&self, e: reqwest::Error) -> Error {
        REQUEST_ERRORS.click();
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(self.timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }

    /// Process error responses and convert to our Error type.
    async fn process_error_response(response: Response) -> Error {
        REQUEST_ERRORS.click();
        let status_code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        #[derive(Deserialize)]
        struct ErrorResponse {
            #[serde(default)]
            error: Option<serde_json::Value>,
            #[serde(default)]
            detail: Option<String>,
            #[serde(default)]
            blocked: bool,
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };
        let parsed = serde_json::from_str::<ErrorResponse>(&body).ok();
        let blocked = parsed.as_ref().is_some_and(|p| p.blocked);
        let message = parsed
            .as_ref()
            .and_then(|p| p.error.as_ref())
            .map(|error| match error {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .map(|message| match parsed.as_ref().and_then(|p| p.detail.as_ref()) {
                Some(detail) => format!("{message}: {detail}"),
                None => message,
            })
            .unwrap_or_else(|| body.trim().to_string());

        match status_code {
            403 if blocked || message.is_empty() => Error::permission(POLICY_ALERT),
            403 => Error::permission(message),
            400 => Error::bad_request(message),
            408 => Error::timeout(message, None),
            429 => Error::rate_limit(message, retry_after),
            500 => Error::internal_server(message),
            502..=504 => Error::service_unavailable(message, retry_after),
            _ => Error::api(status_code, message),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest, mode: ReplyMode) -> Result<ByteStream> {
        REQUESTS.click();
        let url = self.endpoint(mode.path())?;
        let mut builder = self
            .client
            .post(url)
            .headers(self.default_headers()?)
            .multipart(request.to_multipart()?);
        if mode == ReplyMode::Buffered {
            builder = builder.timeout(self.timeout);
        }
        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;
        if !response.status().is_success() {
            return Err(Self::process_error_response(response).await);
        }
        let timeout = self.timeout;
        let body = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(
                        format!("Reading reply timed out: {e}"),
                        Some(timeout.as_secs_f64()),
                    )
                } else {
                    Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e)))
                }
            })
        });
        Ok(Box::pin(body))
    }

    async fn load_session(&self, selector: &SessionSelector) -> Result<SessionBootstrap> {
        REQUESTS.click();
        let mut url = self.endpoint(ReplyMode::Buffered.path())?;
        match selector {
            SessionSelector::Current => {}
            SessionSelector::Existing(chat_id) => {
                url.query_pairs_mut().append_pair("chat_id", chat_id);
            }
            SessionSelector::New => {
                url.query_pairs_mut().append_pair("action", "new");
            }
        }
        let response = self
            .client
            .get(url)
            .headers(self.cookie_headers()?)
            .header(header::ACCEPT, "text/html")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        if !response.status().is_success() {
            return Err(Self::process_error_response(response).await);
        }
        let page = response.text().await.map_err(|e| self.map_send_error(e))?;
        parse_session_bootstrap(&page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::CookieString;

    fn request(attachment: Option<Attachment>, inline_image: bool) -> ChatRequest {
        ChatRequest {
            message: "hello".to_string(),
            chat_id: "c1".to_string(),
            model: DEFAULT_MODEL.to_string(),
            attachment,
            inline_image,
        }
    }

    #[test]
    fn form_fields_in_page_order() {
        let fields = request(None, true).form_fields();
        let names: Vec<_> = fields.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["message", "chat_id", "model"]);
        assert_eq!(fields[2].1, "openai/gpt-4o-mini");
    }

    #[test]
    fn inline_image_adds_base64() {
        let png = Attachment::new("cat.png", "image/png", vec![1u8, 2, 3]).unwrap();
        let fields = request(Some(png.clone()), true).form_fields();
        assert_eq!(fields.last().unwrap(), &("image_base64", "AQID".to_string()));
        let fields = request(Some(png), false).form_fields();
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn inline_image_ignores_text_files() {
        let txt = Attachment::new("notes.txt", "text/plain", b"hi".to_vec()).unwrap();
        assert_eq!(request(Some(txt), true).form_fields().len(), 3);
    }

    #[test]
    fn oversized_attachment_rejected_locally() {
        let err = Attachment::new(
            "big.png",
            "image/png",
            vec![0u8; MAX_ATTACHMENT_BYTES + 1],
        )
        .unwrap_err();
        assert!(err.is_validation());
        assert!(Attachment::new("ok.png", "image/png", vec![0u8; MAX_ATTACHMENT_BYTES]).is_ok());
    }

    #[test]
    fn content_type_guessing() {
        assert_eq!(guess_content_type("photo.JPG"), "image/jpeg");
        assert_eq!(guess_content_type("readme.md"), "text/plain");
        assert_eq!(guess_content_type("archive"), "application/octet-stream");
    }

    #[test]
    fn multipart_builds_with_file() {
        let png = Attachment::new("cat.png", "image/png", vec![1u8, 2, 3]).unwrap();
        assert!(request(Some(png), true).to_multipart().is_ok());
        let bad = Attachment::new("x", "not a mime", vec![1u8]).unwrap();
        assert!(request(Some(bad), false).to_multipart().is_err());
    }

    #[test]
    fn buffered_reply_shapes() {
        let ok = BufferedReply::from_slice(br#"{"reply": "**hi**", "limit_reached": false}"#)
            .unwrap();
        assert_eq!(ok.reply.as_deref(), Some("**hi**"));
        assert!(!ok.limit_reached);

        let limited =
            BufferedReply::from_slice(br#"{"limit_reached": true, "remaining_seconds": 120}"#)
                .unwrap();
        assert!(limited.limit_reached);
        assert_eq!(limited.lockout_seconds(), 120);
        assert_eq!(limited.reply, None);

        let negative = BufferedReply::from_slice(br#"{"limit_reached": true, "remaining_seconds": -5}"#)
            .unwrap();
        assert_eq!(negative.lockout_seconds(), 0);

        assert!(BufferedReply::from_slice(b"<html>oops</html>")
            .unwrap_err()
            .is_serialization());
    }

    #[test]
    fn endpoints_resolve_against_base() {
        let cookies = Arc::new(CookieString::new("csrftoken=tok"));
        let transport =
            HttpTransport::with_options(Some("http://example.test/app"), cookies, None).unwrap();
        assert_eq!(
            transport.endpoint(ReplyMode::Streaming.path()).unwrap().as_str(),
            "http://example.test/app/chatbot/stream/"
        );
        assert_eq!(
            transport.endpoint(ReplyMode::Buffered.path()).unwrap().as_str(),
            "http://example.test/app/chatbot/"
        );
    }

    #[test]
    fn headers_carry_token_and_cookie() {
        let cookies = Arc::new(CookieString::new("sessionid=s; csrftoken=a%20b"));
        let transport = HttpTransport::new(cookies).unwrap();
        let headers = transport.default_headers().unwrap();
        assert_eq!(headers.get("X-CSRFToken").unwrap(), "a b");
        assert_eq!(headers.get("X-Requested-With").unwrap(), "XMLHttpRequest");
        assert_eq!(
            headers.get(header::COOKIE).unwrap(),
            "sessionid=s; csrftoken=a%20b"
        );
    }

    #[test]
    fn missing_cookie_sends_no_token() {
        let transport = HttpTransport::new(Arc::new(CookieString::default())).unwrap();
        let headers = transport.default_headers().unwrap();
        assert!(headers.get("X-CSRFToken").is_none());
        assert!(headers.get(header::COOKIE).is_none());
    }
}

//! Access to the session cookies the client forwards.

/// Name of the cookie holding the anti-forgery token.
pub const CSRF_COOKIE: &str = "csrftoken";

/// A source of cookies for outgoing requests.
pub trait CookieSource: Send + Sync {
    /// The URL-decoded value of cookie `name`, if present.
    fn get(&self, name: &str) -> Option<String>;

    /// The raw `Cookie` header to forward, if any.
    fn header(&self) -> Option<String>;

    /// The anti-forgery token.
    fn csrf_token(&self) -> Option<String> {
        self.get(CSRF_COOKIE)
    }
}

/// Cookies held as a `name=value; name=value` string, the shape of both
/// `document.cookie` and a browser's `Cookie` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CookieString {
    raw: String,
}

impl CookieString {
    /// Wrap a cookie string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// True if there are no cookies at all.
    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty()
    }

    /// Iterate over `(name, raw value)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw.split(';').filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                None
            } else {
                Some((name, value.trim()))
            }
        })
    }
}

impl CookieSource for CookieString {
    fn get(&self, name: &str) -> Option<String> {
        let (_, value) = self.pairs().find(|(n, _)| *n == name)?;
        Some(match urlencoding::decode(value) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => value.to_string(),
        })
    }

    fn header(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.raw.trim().to_string())
        }
    }
}

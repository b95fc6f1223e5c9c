//! Markdown rendering gateway.
//!
//! Every piece of markup that reaches a [`crate::ChatView`] passes through
//! [`RenderGateway`]: the markdown converter produces HTML and the sanitizer
//! cleans it before it is wrapped in [`SafeHtml`].  `SafeHtml` can only be
//! built here, so an unsanitized string cannot be handed to a view by
//! accident.

use std::fmt;

use pulldown_cmark::{Options, Parser, html};
use serde::Serialize;

/// HTML that has passed through the sanitizer (or was escaped from text).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SafeHtml(String);

impl SafeHtml {
    /// The empty fragment.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Borrow the markup.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Take ownership of the markup.
    pub fn into_string(self) -> String {
        self.0
    }

    /// True when the fragment contains no markup at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for SafeHtml {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SafeHtml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

///////////////////////////////////////// Collaborators ////////////////////////////////////////

/// Converts markdown source into (untrusted) HTML.
pub trait MarkdownConverter: Send + Sync {
    /// Convert `markdown` to HTML.
    fn to_html(&self, markdown: &str) -> String;
}

/// Removes anything unsafe from an HTML fragment.
pub trait HtmlSanitizer: Send + Sync {
    /// Return a cleaned copy of `html`.
    fn sanitize(&self, html: &str) -> String;
}

/// CommonMark converter with the GitHub extensions chat replies rely on.
#[derive(Clone, Debug)]
pub struct CommonMarkConverter {
    options: Options,
}

impl CommonMarkConverter {
    /// Tables, strikethrough and task lists enabled.
    pub fn new() -> Self {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);
        Self { options }
    }

    /// Use a caller-chosen option set.
    pub fn with_options(options: Options) -> Self {
        Self { options }
    }
}

impl Default for CommonMarkConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownConverter for CommonMarkConverter {
    fn to_html(&self, markdown: &str) -> String {
        let parser = Parser::new_ext(markdown, self.options);
        let mut out = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut out, parser);
        out
    }
}

/// Sanitizer backed by ammonia's allow-list.
pub struct AmmoniaSanitizer {
    builder: ammonia::Builder<'static>,
}

impl AmmoniaSanitizer {
    /// ammonia's defaults, plus `class` on `code` so fenced code keeps its
    /// `language-*` hint.
    pub fn new() -> Self {
        let mut builder = ammonia::Builder::default();
        builder.add_tag_attributes("code", &["class"]);
        Self { builder }
    }

    /// Use a caller-configured builder.
    pub fn with_builder(builder: ammonia::Builder<'static>) -> Self {
        Self { builder }
    }
}

impl Default for AmmoniaSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl HtmlSanitizer for AmmoniaSanitizer {
    fn sanitize(&self, html: &str) -> String {
        self.builder.clean(html).to_string()
    }
}

//////////////////////////////////////////// Gateway ///////////////////////////////////////////

/// The single path from markdown to insertable markup.
pub struct RenderGateway {
    converter: Box<dyn MarkdownConverter>,
    sanitizer: Box<dyn HtmlSanitizer>,
}

impl RenderGateway {
    /// pulldown-cmark followed by ammonia.
    pub fn new() -> Self {
        Self::with_components(
            Box::new(CommonMarkConverter::new()),
            Box::new(AmmoniaSanitizer::new()),
        )
    }

    /// Build a gateway around other collaborators.
    pub fn with_components(
        converter: Box<dyn MarkdownConverter>,
        sanitizer: Box<dyn HtmlSanitizer>,
    ) -> Self {
        Self {
            converter,
            sanitizer,
        }
    }

    /// Render markdown to sanitized HTML.  Empty input yields empty output.
    pub fn render(&self, markdown: &str) -> SafeHtml {
        if markdown.is_empty() {
            return SafeHtml::empty();
        }
        let raw = self.converter.to_html(markdown);
        SafeHtml(self.sanitizer.sanitize(&raw))
    }

    /// Render a value that may be absent, e.g. a missing `reply` field.
    pub fn render_optional(&self, markdown: Option<&str>) -> SafeHtml {
        markdown.map(|md| self.render(md)).unwrap_or_default()
    }

    /// Escape plain text (user input) so it displays literally.
    pub fn escape(&self, text: &str) -> SafeHtml {
        SafeHtml(ammonia::clean_text(text))
    }
}

impl Default for RenderGateway {
    fn default() -> Self {
        Self::new()
    }
}

//////////////////////////////////////////// Text //////////////////////////////////////////////

/// Approximate the visible text of an HTML fragment.
///
/// Block-level closing tags and `<br>` become line breaks, entities are
/// decoded and runs of blank lines collapse to one.  This is what the copy
/// button puts on the clipboard.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        push_text_segment(&mut text, &rest[..start]);
        let tag_and_rest = &rest[start + 1..];
        let Some(end) = tag_and_rest.find('>') else {
            rest = "";
            break;
        };
        if breaks_line(&tag_and_rest[..end]) {
            text.push('\n');
        }
        rest = &tag_and_rest[end + 1..];
    }
    push_text_segment(&mut text, rest);
    normalize_lines(&decode_entities(&text))
}

// Newline-only runs between block tags are layout from the converter, not
// content; block boundaries come from `breaks_line` instead.
fn push_text_segment(text: &mut String, segment: &str) {
    if segment.contains('\n') && segment.trim().is_empty() {
        return;
    }
    text.push_str(segment);
}

fn breaks_line(tag: &str) -> bool {
    let closing = tag.starts_with('/');
    let name = tag
        .trim_start_matches('/')
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match name.as_str() {
        "br" | "hr" => true,
        "p" | "div" | "li" | "pre" | "blockquote" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5"
        | "h6" => closing,
        _ => false,
    }
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        let decoded = candidate
            .char_indices()
            .take(12)
            .find(|(_, c)| *c == ';')
            .and_then(|(semi, _)| decode_entity(&candidate[1..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &candidate[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn normalize_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 || out.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

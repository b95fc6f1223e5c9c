//! Consumption of a streamed reply.
//!
//! The body of a streaming reply is plain text in arbitrary chunks whose
//! concatenation is the markdown of the reply.  Each chunk is decoded with a
//! decoder that belongs to this one stream, appended to an accumulator, and
//! the whole accumulator is re-rendered, so the displayed HTML always equals
//! the rendering of everything received so far.

use std::pin::Pin;
use std::time::Instant;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::decoder::IncrementalDecoder;
use crate::error::{Error, Result};
use crate::observability::{
    STREAM_BYTES, STREAM_CHUNKS, STREAM_DURATION, STREAM_ERRORS, STREAM_FIRST_OUTPUT,
};
use crate::render::{RenderGateway, SafeHtml};

/// A response body as a stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Where a consumed stream shows up.
pub trait StreamTarget: Send {
    /// Called once, for the first chunk with non-whitespace text.
    fn first_output(&mut self);

    /// Called after every chunk with the accumulated markdown and its
    /// rendering.
    fn render(&mut self, markdown: &str, html: &SafeHtml);

    /// Called when the stream fails; removes any pending indicator.
    fn hide_pending(&mut self);

    /// Polled before every read; returning true abandons the stream.
    fn should_interrupt(&self) -> bool {
        false
    }
}

/// What a completed stream produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    /// The full markdown of the reply.
    pub markdown: String,
    /// Its final rendering.
    pub html: SafeHtml,
    /// Number of chunks read.
    pub chunks: usize,
    /// Number of body bytes read.
    pub bytes: usize,
    /// True if any chunk had non-whitespace text.
    pub first_output_observed: bool,
}

/// Synchronous core of the consumer: feed it chunks, then finish it.
pub struct StreamConsumer<'a> {
    gateway: &'a RenderGateway,
    decoder: IncrementalDecoder,
    accumulator: String,
    html: SafeHtml,
    first_output_observed: bool,
    chunks: usize,
    bytes: usize,
}

impl<'a> StreamConsumer<'a> {
    /// A consumer at the start of a stream.
    pub fn new(gateway: &'a RenderGateway) -> Self {
        Self {
            gateway,
            decoder: IncrementalDecoder::new(),
            accumulator: String::new(),
            html: SafeHtml::empty(),
            first_output_observed: false,
            chunks: 0,
            bytes: 0,
        }
    }

    /// The markdown accumulated so far.
    pub fn markdown(&self) -> &str {
        &self.accumulator
    }

    /// True once the first-output signal has fired.
    pub fn first_output_observed(&self) -> bool {
        self.first_output_observed
    }

    /// Consume one chunk and re-render the accumulator.
    pub fn push(&mut self, chunk: &[u8], target: &mut dyn StreamTarget) {
        self.chunks += 1;
        self.bytes += chunk.len();
        let text = self.decoder.decode(chunk);
        self.append(&text, target);
        self.publish(target);
    }

    /// End of stream: flush the decoder and return the summary.
    pub fn finish(mut self, target: &mut dyn StreamTarget) -> StreamSummary {
        let tail = self.decoder.finish();
        if !tail.is_empty() {
            self.append(&tail, target);
            self.publish(target);
        }
        StreamSummary {
            markdown: self.accumulator,
            html: self.html,
            chunks: self.chunks,
            bytes: self.bytes,
            first_output_observed: self.first_output_observed,
        }
    }

    fn append(&mut self, text: &str, target: &mut dyn StreamTarget) {
        if !self.first_output_observed && !text.trim().is_empty() {
            self.first_output_observed = true;
            target.first_output();
        }
        self.accumulator.push_str(text);
    }

    fn publish(&mut self, target: &mut dyn StreamTarget) {
        self.html = self.gateway.render(&self.accumulator);
        target.render(&self.accumulator, &self.html);
    }
}

/// Read `stream` to the end, rendering into `target` after every chunk.
///
/// A failed read, or an interrupt requested by the target, calls
/// [`StreamTarget::hide_pending`] and returns the error; whatever was
/// rendered before the failure remains with the target.
///
/// ```
/// # use bytes::Bytes;
/// # use chatbox::{RenderGateway, SafeHtml, StreamTarget, consume};
/// struct Last(String);
///
/// impl StreamTarget for Last {
///     fn first_output(&mut self) {}
///     fn render(&mut self, _: &str, html: &SafeHtml) {
///         self.0 = html.as_str().to_string();
///     }
///     fn hide_pending(&mut self) {}
/// }
///
/// # tokio_test::block_on(async {
/// let chunks = vec![Ok(Bytes::from("**bo")), Ok(Bytes::from("ld**"))];
/// let mut target = Last(String::new());
/// let summary = consume(&RenderGateway::new(), futures::stream::iter(chunks), &mut target)
///     .await
///     .unwrap();
/// assert_eq!(summary.markdown, "**bold**");
/// assert_eq!(target.0, "<p><strong>bold</strong></p>\n");
/// # });
/// ```
pub async fn consume<S>(
    gateway: &RenderGateway,
    mut stream: S,
    target: &mut dyn StreamTarget,
) -> Result<StreamSummary>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let start = Instant::now();
    let mut consumer = StreamConsumer::new(gateway);
    loop {
        if target.should_interrupt() {
            STREAM_ERRORS.click();
            target.hide_pending();
            return Err(Error::abort("stream interrupted"));
        }
        match stream.next().await {
            Some(Ok(chunk)) => {
                STREAM_CHUNKS.click();
                STREAM_BYTES.count(chunk.len() as u64);
                let had_output = consumer.first_output_observed();
                consumer.push(&chunk, target);
                if !had_output && consumer.first_output_observed() {
                    STREAM_FIRST_OUTPUT.add(start.elapsed().as_secs_f64());
                }
            }
            Some(Err(err)) => {
                STREAM_ERRORS.click();
                target.hide_pending();
                return Err(err);
            }
            None => break,
        }
    }
    STREAM_DURATION.add(start.elapsed().as_secs_f64());
    Ok(consumer.finish(target))
}

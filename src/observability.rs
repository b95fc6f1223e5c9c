use biometrics::{Collector, Counter, Moments};

pub(crate) static SEND_ATTEMPTS: Counter = Counter::new("chatbox.send.attempts");
pub(crate) static SEND_IGNORED: Counter = Counter::new("chatbox.send.ignored");
pub(crate) static SEND_RATE_LIMITED: Counter = Counter::new("chatbox.send.rate_limited");
pub(crate) static SEND_REJECTED: Counter = Counter::new("chatbox.send.rejected");
pub(crate) static SEND_FAILURES: Counter = Counter::new("chatbox.send.failures");
pub(crate) static SEND_DURATION: Moments = Moments::new("chatbox.send.duration_seconds");

pub(crate) static REQUESTS: Counter = Counter::new("chatbox.transport.requests");
pub(crate) static REQUEST_ERRORS: Counter = Counter::new("chatbox.transport.request_errors");

pub(crate) static STREAM_CHUNKS: Counter = Counter::new("chatbox.stream.chunks");
pub(crate) static STREAM_BYTES: Counter = Counter::new("chatbox.stream.bytes");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("chatbox.stream.errors");
pub(crate) static STREAM_FIRST_OUTPUT: Moments =
    Moments::new("chatbox.stream.first_output_seconds");
pub(crate) static STREAM_DURATION: Moments = Moments::new("chatbox.stream.duration_seconds");

pub(crate) static COUNTDOWN_STARTED: Counter = Counter::new("chatbox.limit.countdown_started");
pub(crate) static COUNTDOWN_EXPIRED: Counter = Counter::new("chatbox.limit.countdown_expired");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&SEND_ATTEMPTS);
    collector.register_counter(&SEND_IGNORED);
    collector.register_counter(&SEND_RATE_LIMITED);
    collector.register_counter(&SEND_REJECTED);
    collector.register_counter(&SEND_FAILURES);
    collector.register_moments(&SEND_DURATION);

    collector.register_counter(&REQUESTS);
    collector.register_counter(&REQUEST_ERRORS);

    collector.register_counter(&STREAM_CHUNKS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_moments(&STREAM_FIRST_OUTPUT);
    collector.register_moments(&STREAM_DURATION);

    collector.register_counter(&COUNTDOWN_STARTED);
    collector.register_counter(&COUNTDOWN_EXPIRED);
}

//! Client-side view of the server's message limit.
//!
//! The server decides how many messages remain in the rolling window and how
//! long until the window reopens; it embeds both numbers into the page.  The
//! tracker only consumes them: it refuses sends once the count reaches zero,
//! locks the controls, and counts the lockout down once per second.  When
//! the countdown runs out the tracker asks the view to reload, because the
//! true reset time is only known to the server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::message::ControlState;
use crate::observability::{COUNTDOWN_EXPIRED, COUNTDOWN_STARTED};
use crate::view::ChatView;

/// Messages allowed per window on the reference server.
pub const MAX_MESSAGES: u32 = 10;

/// Length of the rolling window in hours.
pub const WINDOW_HOURS: u64 = 24;

/// Remaining allowance as reported by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Messages that may still be sent in the current window.
    pub remaining_messages: u32,
    /// Seconds until the window reopens; zero unless the limit is reached.
    pub remaining_seconds: u64,
}

impl RateLimitState {
    /// State with the given allowance.
    pub fn new(remaining_messages: u32, remaining_seconds: u64) -> Self {
        Self {
            remaining_messages,
            remaining_seconds,
        }
    }

    /// A fresh window.
    pub fn full() -> Self {
        Self::new(MAX_MESSAGES, 0)
    }

    /// True when no messages remain.
    pub fn is_exhausted(&self) -> bool {
        self.remaining_messages == 0
    }
}

/// Format seconds the way the limit notice shows them.
pub fn format_time_left(seconds: u64) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    format!("{h}h {m}m {s}s remaining")
}

/// The default text of the limit-reached notice.
pub fn limit_notice_text() -> String {
    format!("Chat limit reached ({MAX_MESSAGES} messages / {WINDOW_HOURS} hours)")
}

/// Result of advancing a [`Countdown`] by one second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountdownTick {
    /// Seconds left after this tick.
    Remaining(u64),
    /// The countdown reached zero on a previous tick and is now over.
    Expired,
}

/// Pure countdown state; the timer lives in [`RateLimitTracker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Countdown {
    remaining: u64,
}

impl Countdown {
    /// Count down from `seconds`.
    pub fn new(seconds: u64) -> Self {
        Self { remaining: seconds }
    }

    /// Seconds left.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Advance one second.  Never goes below zero: the tick after reaching
    /// zero reports expiry.
    pub fn tick(&mut self) -> CountdownTick {
        if self.remaining == 0 {
            return CountdownTick::Expired;
        }
        self.remaining -= 1;
        CountdownTick::Remaining(self.remaining)
    }
}

/// Holds the remaining allowance and drives the lockout countdown.
pub struct RateLimitTracker {
    state: Mutex<RateLimitState>,
    seconds_left: Arc<AtomicU64>,
    expired: Arc<AtomicBool>,
    countdown: Mutex<Option<JoinHandle<()>>>,
    notice: String,
}

impl RateLimitTracker {
    /// Track the allowance the server reported at load.
    pub fn new(state: RateLimitState) -> Self {
        Self {
            seconds_left: Arc::new(AtomicU64::new(state.remaining_seconds)),
            state: Mutex::new(state),
            expired: Arc::new(AtomicBool::new(false)),
            countdown: Mutex::new(None),
            notice: limit_notice_text(),
        }
    }

    /// Use a different limit-reached notice.
    pub fn with_notice(mut self, notice: impl Into<String>) -> Self {
        self.notice = notice.into();
        self
    }

    /// Snapshot of the allowance.
    pub fn state(&self) -> RateLimitState {
        *self.state.lock()
    }

    /// Messages that may still be sent.
    pub fn remaining_messages(&self) -> u32 {
        self.state.lock().remaining_messages
    }

    /// True iff at least one message remains.
    pub fn is_send_allowed(&self) -> bool {
        self.state.lock().remaining_messages > 0
    }

    /// Record one confirmed, successful exchange.
    pub fn on_message_sent(&self) {
        let mut state = self.state.lock();
        state.remaining_messages = state.remaining_messages.saturating_sub(1);
    }

    /// Seconds shown by the countdown (the server value before it starts).
    pub fn seconds_left(&self) -> u64 {
        self.seconds_left.load(Ordering::Relaxed)
    }

    /// True while a countdown task is running.
    pub fn is_counting_down(&self) -> bool {
        self.countdown
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// True once the countdown ran out; the state must be re-seeded.
    pub fn needs_reload(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Start the once-per-second countdown from `seconds`.
    ///
    /// The initial value is shown immediately.  Every second after that the
    /// local copy drops by one and is re-rendered; the tick that finds it at
    /// zero stops the timer and calls [`ChatView::reload`].  Returns false
    /// (and does nothing) if a countdown is already running or has expired.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_countdown(&self, seconds: u64, view: Arc<dyn ChatView>) -> bool {
        let mut slot = self.countdown.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        if self.needs_reload() {
            return false;
        }
        COUNTDOWN_STARTED.click();
        self.seconds_left.store(seconds, Ordering::Relaxed);
        let seconds_left = Arc::clone(&self.seconds_left);
        let expired = Arc::clone(&self.expired);
        *slot = Some(tokio::spawn(async move {
            let mut countdown = Countdown::new(seconds);
            view.show_time_left(&format_time_left(countdown.remaining()));
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // The first tick of an interval completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                match countdown.tick() {
                    CountdownTick::Remaining(left) => {
                        seconds_left.store(left, Ordering::Relaxed);
                        view.show_time_left(&format_time_left(left));
                    }
                    CountdownTick::Expired => {
                        expired.store(true, Ordering::SeqCst);
                        COUNTDOWN_EXPIRED.click();
                        view.reload();
                        break;
                    }
                }
            }
        }));
        true
    }

    /// Cancel a running countdown.
    pub fn stop_countdown(&self) {
        if let Some(handle) = self.countdown.lock().take() {
            handle.abort();
        }
    }

    /// Disable the controls and show the limit notice once.
    pub fn lock_ui(&self, view: &dyn ChatView) {
        view.set_controls(ControlState::Locked);
        if !view.has_limit_notice() {
            view.show_limit_notice(&self.notice);
        }
    }

    /// The server says the limit is reached: record it, lock the controls
    /// and count down `seconds` if there is anything to count.
    ///
    /// Once a countdown has expired only the controls are locked; nothing
    /// is counted again until [`RateLimitTracker::reseed`].
    pub fn force_limit_reached(&self, seconds: u64, view: Arc<dyn ChatView>) {
        if self.needs_reload() {
            self.lock_ui(view.as_ref());
            return;
        }
        {
            let mut state = self.state.lock();
            state.remaining_messages = 0;
            state.remaining_seconds = seconds;
        }
        self.lock_ui(view.as_ref());
        if seconds > 0 {
            self.start_countdown(seconds, view);
        }
    }

    /// Apply the load-time policy: an exhausted allowance locks the page
    /// immediately and starts the countdown without waiting for a send.
    /// Returns true if the page was locked.
    pub fn on_session_load(&self, view: Arc<dyn ChatView>) -> bool {
        let state = self.state();
        if !state.is_exhausted() {
            return false;
        }
        self.force_limit_reached(state.remaining_seconds, view);
        true
    }

    /// Install freshly loaded state after a reload.
    pub fn reseed(&self, state: RateLimitState) {
        self.stop_countdown();
        self.expired.store(false, Ordering::SeqCst);
        self.seconds_left
            .store(state.remaining_seconds, Ordering::Relaxed);
        *self.state.lock() = state;
    }
}

impl Drop for RateLimitTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.countdown.get_mut().take() {
            handle.abort();
        }
    }
}

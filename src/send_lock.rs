//! Single-flight guard for chat sends.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::message::ControlState;
use crate::view::ChatView;

/// Allows at most one send to be in flight, however many triggers fire.
#[derive(Debug, Default)]
pub struct SendLock {
    held: AtomicBool,
}

impl SendLock {
    /// An unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a send holds the lock.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Take the lock without touching any controls.  Returns false if it is
    /// already held.
    pub fn try_acquire_raw(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release a lock taken with [`SendLock::try_acquire_raw`].
    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Take the lock before deciding whether the send goes ahead.
    ///
    /// Dropping the reservation releases the lock and leaves the controls
    /// alone; [`Reservation::engage`] turns it into a [`SendPermit`].
    pub fn try_reserve(&self) -> Option<Reservation<'_>> {
        if !self.try_acquire_raw() {
            return None;
        }
        Some(Reservation {
            lock: self,
            engaged: false,
        })
    }

    /// Take the lock and mark `view`'s controls busy.
    ///
    /// The lock is released and the controls re-enabled when the returned
    /// permit is dropped, on every exit path of the send.
    pub fn try_acquire<'a>(&'a self, view: &'a dyn ChatView) -> Option<SendPermit<'a>> {
        self.try_reserve().map(|reservation| reservation.engage(view))
    }
}

/// A held lock whose send has not been dispatched yet.
pub struct Reservation<'a> {
    lock: &'a SendLock,
    engaged: bool,
}

impl<'a> Reservation<'a> {
    /// Commit to the send: mark the controls busy and hand the lock to a
    /// permit.
    pub fn engage(mut self, view: &'a dyn ChatView) -> SendPermit<'a> {
        self.engaged = true;
        view.set_controls(ControlState::Busy);
        SendPermit {
            lock: self.lock,
            view,
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.engaged {
            self.lock.release();
        }
    }
}

/// Proof that the holder is the one in-flight send.
pub struct SendPermit<'a> {
    lock: &'a SendLock,
    view: &'a dyn ChatView,
}

impl SendPermit<'_> {
    /// Release explicitly; equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for SendPermit<'_> {
    fn drop(&mut self) {
        self.lock.release();
        self.view.set_controls(ControlState::Enabled);
    }
}

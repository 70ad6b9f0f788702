use spin::Mutex;

use super::{Outcome, Retransmit, SendError, Window};
use crate::socket::PollAt;
use crate::time::Instant;
use crate::wire::{TcpRepr, TcpSeqNumber};

/// A [Window] that the receive path, the retransmission timer and the sender may
/// share.
///
/// Every method holds the connection's lock for the whole call, so each mutation is
/// observed either completely or not at all. Nothing blocks while the lock is held.
#[derive(Debug)]
pub struct Connection<'a> {
    window: Mutex<Window<'a>>,
}

impl<'a> Connection<'a> {
    pub fn new(window: Window<'a>) -> Connection<'a> {
        Connection {
            window: Mutex::new(window),
        }
    }

    /// See [Window::process].
    pub fn process(&self, now: Instant, repr: &TcpRepr) -> Outcome {
        self.window.lock().process(now, repr)
    }

    /// See [Window::send].
    pub fn send(&self, now: Instant, len: usize) -> Result<TcpSeqNumber, SendError> {
        self.window.lock().send(now, len)
    }

    pub fn poll_at(&self, now: Instant) -> PollAt {
        self.window.lock().poll_at(now)
    }

    /// The segment the retransmission timer should resend at `now`, if any.
    pub fn poll_retransmit(&self, now: Instant) -> Option<Retransmit> {
        self.window.lock().peek_retransmit(now)
    }

    /// See [Window::dispatch]. `emit` runs with the lock held.
    pub fn dispatch<F, E>(&self, now: Instant, emit: F) -> Result<(), E>
    where
        F: FnOnce(Retransmit) -> Result<(), E>,
    {
        self.window.lock().dispatch(now, emit)
    }

    pub fn teardown(&self) {
        self.window.lock().teardown()
    }

    /// Run `f` on the window with the lock held.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Window<'a>) -> R,
    {
        f(&mut self.window.lock())
    }

    pub fn into_inner(self) -> Window<'a> {
        self.window.into_inner()
    }
}

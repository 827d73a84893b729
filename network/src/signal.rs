//! One-shot shutdown broadcast shared by everything an environment creates.
//!
//! A [Stopper] owns the sending side. Every connector holds a [Signal] and races its backoff
//! sleeps and dials against it, so calling [Stopper::stop] interrupts work in progress instead of
//! letting it run to completion against a closed transport.
//!
//! _Note: a [Signal] must not be polled again after it has resolved. Clone it for every wait._

use crate::Error;
use futures::{
    channel::oneshot,
    future::{select, Either, Shared},
    FutureExt,
};
use std::{
    future::Future,
    pin::{pin, Pin},
    task::{Context, Poll},
};

/// Future that resolves once shutdown has been signaled.
#[derive(Clone)]
pub enum Signal {
    /// Shutdown has not been observed yet.
    Open(Shared<oneshot::Receiver<()>>),
    /// Shutdown was already signaled when the signal was created.
    Closed,
}

impl Signal {
    /// Returns whether some clone of the signal has already observed shutdown.
    pub fn is_stopped(&self) -> bool {
        match self {
            Self::Open(receiver) => receiver.peek().is_some(),
            Self::Closed => true,
        }
    }
}

impl Future for Signal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut *self {
            // A dropped signaler means nobody can stop us anymore, which only happens at teardown
            Self::Open(receiver) => Pin::new(receiver).poll(cx).map(|_| ()),
            Self::Closed => Poll::Ready(()),
        }
    }
}

/// Run `operation` unless `stop` resolves first, in which case it fails with [Error::Closed].
///
/// A resolved signal wins over an operation that is ready at the same time.
pub async fn unless_stopped<T>(
    stop: Signal,
    operation: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match select(stop, pin!(operation)).await {
        Either::Left(_) => Err(Error::Closed),
        Either::Right((result, _)) => result,
    }
}

/// Sending side of a [Signal].
pub struct Signaler {
    sender: oneshot::Sender<()>,
}

impl Signaler {
    /// Create a new [Signaler] and the [Signal] it resolves.
    pub fn new() -> (Self, Signal) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, Signal::Open(receiver.shared()))
    }

    /// Resolve every clone of the [Signal].
    pub fn signal(self) {
        let _ = self.sender.send(());
    }
}

/// Idempotent owner of a [Signaler].
pub enum Stopper {
    /// Stop has not been called yet.
    Running {
        signaler: Option<Signaler>,
        signal: Signal,
    },
    /// Stop has been called.
    Stopped,
}

impl Stopper {
    /// Create a new stopper in running mode.
    pub fn new() -> Self {
        let (signaler, signal) = Signaler::new();
        Self::Running {
            signaler: Some(signaler),
            signal,
        }
    }

    /// Returns a [Signal] that resolves once [Stopper::stop] is called.
    pub fn stopped(&self) -> Signal {
        match self {
            Self::Running { signal, .. } => signal.clone(),
            Self::Stopped => Signal::Closed,
        }
    }

    /// Signal shutdown.
    ///
    /// Returns `true` the first time and `false` on every later call.
    pub fn stop(&mut self) -> bool {
        let Self::Running { signaler, .. } = self else {
            return false;
        };
        if let Some(signaler) = signaler.take() {
            signaler.signal();
        }
        *self = Self::Stopped;
        true
    }

    /// Returns whether [Stopper::stop] has been called.
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

//! Reconnect state machine for a single remote endpoint.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                   |    ^
//!                   v    |
//!              Backoff(delay)
//!                   |
//!                   v
//!                Failed (terminal)
//! ```
//!
//! A failed dial moves the connector into [Status::Backoff] for the delay prescribed by its
//! [Backoff] policy and then dials again. When retries are disabled or exhausted the connector
//! moves to [Status::Failed] and stays there. Shutdown of the environment interrupts both the
//! dial and the sleep and leaves the connector [Status::Disconnected].

use crate::{
    backoff::{Backoff, Schedule},
    metrics::ConnectionMetrics,
    signal::Signal,
    Clock, Error, Transport,
};
use futures::{
    future::{select, Either},
    FutureExt,
};
use std::{net::SocketAddr, pin::pin, time::Duration};
use tracing::{debug, info, warn};

/// Progress of a [Connector].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Backoff(Duration),
    Failed,
}

/// Retry settings for a [Connector].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Delay between attempts.
    pub backoff: Backoff,
    /// Maximum number of retries after the first failure (`None` for unbounded).
    pub max_retries: Option<u32>,
}

impl From<&crate::config::Config> for Config {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            backoff: cfg.backoff(),
            max_retries: cfg.max_connection_retries(),
        }
    }
}

/// Drives connection attempts to one peer through a [Transport].
pub struct Connector<C: Clock, T: Transport> {
    peer: SocketAddr,
    clock: C,
    transport: Option<T>,
    schedule: Schedule,
    stop: Signal,
    status: Status,
    dials: u64,
    metrics: ConnectionMetrics,
}

impl<C: Clock, T: Transport> Connector<C, T> {
    /// Create a connector for `peer`.
    ///
    /// If `transport` is `None`, every connection attempt fails with
    /// [Error::TransportUnavailable].
    pub fn new(peer: SocketAddr, clock: C, transport: Option<T>, cfg: Config, stop: Signal) -> Self {
        Self::with_metrics(peer, clock, transport, cfg, stop, ConnectionMetrics::default())
    }

    pub(crate) fn with_metrics(
        peer: SocketAddr,
        clock: C,
        transport: Option<T>,
        cfg: Config,
        stop: Signal,
        metrics: ConnectionMetrics,
    ) -> Self {
        Self {
            peer,
            clock,
            transport,
            schedule: cfg.backoff.schedule(cfg.max_retries),
            stop,
            status: Status::Disconnected,
            dials: 0,
            metrics,
        }
    }

    /// Returns the peer this connector dials.
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns the current status.
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Returns the number of dials made since the connector was created.
    pub const fn dials(&self) -> u64 {
        self.dials
    }

    /// Returns the number of retries made since the last successful connection.
    pub const fn retries(&self) -> u32 {
        self.schedule.attempt()
    }

    /// Dial the peer, retrying on failure until connected, failed, or shut down.
    ///
    /// # Errors
    ///
    /// - [Error::ConnectionFailed]: retries are disabled or exhausted (or were already)
    /// - [Error::NotDisconnected]: the connector is already connected
    /// - [Error::TransportUnavailable]: the environment has no transport
    /// - [Error::ShutDown]: the environment shut down while connecting
    pub async fn connect(&mut self) -> Result<T::Connection, Error> {
        match self.status {
            Status::Failed => return Err(Error::ConnectionFailed(self.peer)),
            Status::Connected => return Err(Error::NotDisconnected(self.peer)),
            _ => {}
        }
        let transport = self.transport.clone().ok_or(Error::TransportUnavailable)?;

        loop {
            if self.stop.clone().now_or_never().is_some() {
                self.status = Status::Disconnected;
                return Err(Error::ShutDown);
            }

            // Dial
            self.status = Status::Connecting;
            self.dials += 1;
            self.metrics.attempt(&self.peer, self.schedule.attempt() > 0);
            let dial = pin!(transport.connect(self.peer));
            let err = match select(dial, self.stop.clone()).await {
                Either::Left((Ok(connection), _)) => {
                    if self.schedule.attempt() > 0 {
                        info!(peer = %self.peer, retries = self.schedule.attempt(), "connected after retries");
                    } else {
                        debug!(peer = %self.peer, "connected");
                    }
                    self.schedule.reset();
                    self.status = Status::Connected;
                    return Ok(connection);
                }
                Either::Left((Err(err), _)) => err,
                Either::Right(_) => {
                    debug!(peer = %self.peer, "dial interrupted by shutdown");
                    self.status = Status::Disconnected;
                    return Err(Error::ShutDown);
                }
            };

            // Decide whether to try again
            let Some(delay) = self.schedule.next_delay() else {
                warn!(peer = %self.peer, dials = self.dials, error = ?err, "connection failed");
                self.metrics.failure(&self.peer);
                self.status = Status::Failed;
                return Err(Error::ConnectionFailed(self.peer));
            };
            debug!(peer = %self.peer, error = ?err, ?delay, "dial failed, backing off");
            self.status = Status::Backoff(delay);
            let sleep = pin!(self.clock.sleep(delay));
            if let Either::Right(_) = select(sleep, self.stop.clone()).await {
                debug!(peer = %self.peer, "backoff interrupted by shutdown");
                self.status = Status::Disconnected;
                return Err(Error::ShutDown);
            }
        }
    }

    /// Mark an established connection as closed so the next [Connector::connect] starts over.
    ///
    /// Has no effect on a failed connector.
    pub fn disconnect(&mut self) {
        if self.status == Status::Failed {
            return;
        }
        self.status = Status::Disconnected;
    }
}

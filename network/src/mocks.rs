//! Deterministic collaborators for testing code built on the environment.
//!
//! - [Clock] completes every sleep immediately (or never) and records what was asked of it.
//! - [Transport] fails a scripted number of dials before succeeding and routes connections to
//!   in-process [Listener]s.
//! - [Spiller] keeps spilled blocks in memory.

use crate::{
    config::TransportConfig,
    signal::{unless_stopped, Stopper},
    utils::lock,
    Error,
};
use bytes::Bytes;
use futures::{
    channel::mpsc,
    future::{self, Either},
    SinkExt, StreamExt,
};
use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// Clock that never waits.
#[derive(Clone, Default)]
pub struct Clock {
    stalled: bool,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl Clock {
    /// Create a clock whose sleeps never complete.
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Default::default()
        }
    }

    /// Returns every duration slept so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }
}

impl crate::Clock for Clock {
    fn current(&self) -> SystemTime {
        let elapsed: Duration = lock(&self.sleeps).iter().sum();
        SystemTime::UNIX_EPOCH + elapsed
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        lock(&self.sleeps).push(duration);
        if self.stalled {
            Either::Left(future::pending())
        } else {
            Either::Right(future::ready(()))
        }
    }
}

#[derive(Default)]
struct Script {
    /// Dials left to fail before succeeding.
    failures: usize,
    /// Whether every dial fails.
    unreachable: bool,
    /// Whether dials never complete.
    hang: bool,
    /// Whether [crate::Transport::init] fails.
    fail_init: bool,
}

#[derive(Default)]
struct TransportState {
    script: Script,
    initialized: Option<TransportConfig>,
    dials: Vec<SocketAddr>,
    shutdowns: usize,
    listeners: HashMap<SocketAddr, mpsc::UnboundedSender<(SocketAddr, Connection)>>,
}

/// Scripted in-process transport.
#[derive(Clone, Default)]
pub struct Transport {
    state: Arc<Mutex<TransportState>>,
    stopper: Arc<Mutex<Stopper>>,
}

impl Transport {
    fn scripted(script: Script) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                script,
                ..Default::default()
            })),
            stopper: Arc::default(),
        }
    }

    /// Create a transport whose first `failures` dials fail.
    pub fn failing(failures: usize) -> Self {
        Self::scripted(Script {
            failures,
            ..Default::default()
        })
    }

    /// Create a transport whose dials always fail.
    pub fn unreachable() -> Self {
        Self::scripted(Script {
            unreachable: true,
            ..Default::default()
        })
    }

    /// Create a transport whose dials never complete.
    pub fn hanging() -> Self {
        Self::scripted(Script {
            hang: true,
            ..Default::default()
        })
    }

    /// Create a transport that cannot be initialized.
    pub fn broken() -> Self {
        Self::scripted(Script {
            fail_init: true,
            ..Default::default()
        })
    }

    /// Returns every peer dialed so far, in order.
    pub fn dials(&self) -> Vec<SocketAddr> {
        lock(&self.state).dials.clone()
    }

    /// Returns the configuration the transport was initialized with.
    pub fn initialized(&self) -> Option<TransportConfig> {
        lock(&self.state).initialized.clone()
    }

    /// Returns how many times the transport was shut down.
    pub fn shutdowns(&self) -> usize {
        lock(&self.state).shutdowns
    }
}

impl crate::Transport for Transport {
    type Connection = Connection;
    type Listener = Listener;

    fn init(&self, cfg: &TransportConfig) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if state.script.fail_init {
            return Err(Error::Io(io::Error::from(io::ErrorKind::AddrInUse)));
        }
        if state.initialized.is_some() {
            return Err(Error::TransportInitialized);
        }
        state.initialized = Some(cfg.clone());
        Ok(())
    }

    async fn connect(&self, peer: SocketAddr) -> Result<Connection, Error> {
        let (hang, listener) = {
            let mut state = lock(&self.state);
            state.dials.push(peer);
            if state.shutdowns > 0 {
                return Err(Error::TransportUnavailable);
            }
            if state.script.unreachable {
                return Err(Error::ConnectionFailed(peer));
            }
            if state.script.failures > 0 {
                state.script.failures -= 1;
                return Err(Error::ConnectionFailed(peer));
            }
            (state.script.hang, state.listeners.get(&peer).cloned())
        };
        if hang {
            future::pending::<()>().await;
        }

        // Route to a listener if one is bound, otherwise talk to ourselves
        let Some(mut listener) = listener else {
            let (sender, receiver) = mpsc::unbounded();
            return Ok(Connection {
                peer,
                sender,
                receiver,
                stopper: self.stopper.clone(),
            });
        };
        let (local, remote) = Connection::pair(peer, &self.stopper);
        listener
            .send((peer, remote))
            .await
            .map_err(|_| Error::ConnectionFailed(peer))?;
        Ok(local)
    }

    async fn listen(&self, local: SocketAddr) -> Result<Listener, Error> {
        let (sender, receiver) = mpsc::unbounded();
        let mut state = lock(&self.state);
        if state.listeners.contains_key(&local) {
            return Err(Error::Io(io::Error::from(io::ErrorKind::AddrInUse)));
        }
        state.listeners.insert(local, sender);
        Ok(Listener {
            local,
            receiver,
            stopper: self.stopper.clone(),
        })
    }

    fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.shutdowns += 1;
        state.listeners.clear();
        lock(&self.stopper).stop();
    }
}

/// In-process connection.
pub struct Connection {
    peer: SocketAddr,
    sender: mpsc::UnboundedSender<Bytes>,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    stopper: Arc<Mutex<Stopper>>,
}

impl Connection {
    fn pair(peer: SocketAddr, stopper: &Arc<Mutex<Stopper>>) -> (Self, Self) {
        let (local_sender, remote_receiver) = mpsc::unbounded();
        let (remote_sender, local_receiver) = mpsc::unbounded();
        (
            Self {
                peer,
                sender: local_sender,
                receiver: local_receiver,
                stopper: stopper.clone(),
            },
            Self {
                peer,
                sender: remote_sender,
                receiver: remote_receiver,
                stopper: stopper.clone(),
            },
        )
    }
}

impl crate::Connection for Connection {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        let stop = lock(&self.stopper).stopped();
        let send = async { self.sender.send(frame).await.map_err(|_| Error::Closed) };
        unless_stopped(stop, send).await
    }

    async fn recv(&mut self) -> Result<Bytes, Error> {
        let stop = lock(&self.stopper).stopped();
        let recv = async { self.receiver.next().await.ok_or(Error::Closed) };
        unless_stopped(stop, recv).await
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// In-process listener.
pub struct Listener {
    local: SocketAddr,
    receiver: mpsc::UnboundedReceiver<(SocketAddr, Connection)>,
    stopper: Arc<Mutex<Stopper>>,
}

impl crate::Listener for Listener {
    type Connection = Connection;

    async fn accept(&mut self) -> Result<(SocketAddr, Connection), Error> {
        let stop = lock(&self.stopper).stopped();
        let accept = async { self.receiver.next().await.ok_or(Error::Closed) };
        unless_stopped(stop, accept).await
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.local)
    }
}

#[derive(Default)]
struct SpillerState {
    next: u64,
    blocks: HashMap<u64, Bytes>,
    fail_writes: bool,
}

/// Spiller that keeps blocks in memory.
#[derive(Clone, Default)]
pub struct Spiller {
    state: Arc<Mutex<SpillerState>>,
}

impl Spiller {
    /// Create a spiller whose writes always fail.
    pub fn full() -> Self {
        Self {
            state: Arc::new(Mutex::new(SpillerState {
                fail_writes: true,
                ..Default::default()
            })),
        }
    }

    /// Returns the number of blocks currently stored.
    pub fn blocks(&self) -> usize {
        lock(&self.state).blocks.len()
    }
}

impl crate::Spiller for Spiller {
    type Handle = u64;

    async fn write_block(&self, block: Bytes) -> Result<u64, Error> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "spill storage full")));
        }
        let handle = state.next;
        state.next += 1;
        state.blocks.insert(handle, block);
        Ok(handle)
    }

    async fn read_block(&self, handle: &u64) -> Result<Bytes, Error> {
        lock(&self.state)
            .blocks
            .get(handle)
            .cloned()
            .ok_or(Error::SpillMissing)
    }

    async fn remove_block(&self, handle: &u64) -> Result<(), Error> {
        lock(&self.state)
            .blocks
            .remove(handle)
            .map(|_| ())
            .ok_or(Error::SpillMissing)
    }
}

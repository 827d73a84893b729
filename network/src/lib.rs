//! Exchange data buffers between tasks with bounded memory and credit-based flow control.
//!
//! A worker process constructs exactly one [environment::Environment] at startup and hands a
//! clone of it to every task it runs. The environment owns a fixed arena of network buffers
//! ([pool::BufferPool]), creates a [gate::Gate] (with its own [credit::CreditManager]) whenever a
//! task opens a consuming endpoint, and creates a [connection::Connector] (driven by a
//! [backoff::Backoff] policy) whenever a task needs to reach a remote peer.
//!
//! Everything the environment does not implement itself is consumed through a trait:
//! - [Transport]: establishes framed [Connection]s to peers and accepts them via a [Listener].
//! - [Spiller]: writes blocks of bytes to secondary storage when memory is scarce.
//! - [Clock]: provides time so retries can be driven deterministically in tests.
//!
//! Production implementations backed by [Tokio](https://tokio.rs) live in [tokio], test
//! implementations live in [mocks].
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use shuffle_network::{
//!     config::Config, dispatcher::Dispatcher, environment::Environment, mocks, ResourceId,
//!     TaskId, ChannelId,
//! };
//!
//! let mut registry = Registry::default();
//! let environment = Environment::new(
//!     mocks::Clock::default(),
//!     mocks::Transport::default(),
//!     mocks::Spiller::default(),
//!     Dispatcher::default(),
//!     &mut registry,
//!     ResourceId::generate(),
//!     Config::default().with_num_network_buffers(64),
//! )
//! .expect("valid configuration");
//!
//! // Open a gate with two input channels for a task
//! let gate = environment
//!     .open_gate(TaskId(1), &[ChannelId(0), ChannelId(1)])
//!     .expect("enough buffers");
//! assert!(gate.consume(ChannelId(0), 2));
//! assert!(!gate.consume(ChannelId(0), 1));
//!
//! environment.shutdown();
//! environment.shutdown();
//! ```

use bytes::Bytes;
use rand::Rng;
use std::{
    fmt::{self, Debug, Display},
    future::Future,
    net::SocketAddr,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod backoff;
pub mod config;
pub mod connection;
pub mod credit;
pub mod dispatcher;
pub mod environment;
pub mod gate;
mod metrics;
pub mod mocks;
pub mod pool;
pub mod signal;
pub mod tokio;
mod utils;

/// Errors that can occur when interacting with the network environment.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to allocate {count} segments of {size} bytes")]
    AllocationFailed { count: usize, size: usize },
    #[error("buffer pool exhausted")]
    Exhausted,
    #[error("requested {requested} buffers but pool only holds {total}")]
    Oversized { requested: usize, total: usize },
    #[error("buffer pool closed")]
    Closed,
    #[error("buffer request aborted")]
    Aborted,
    #[error("stale handle for segment {0}")]
    StaleBuffer(u32),
    #[error("double release of segment {0}")]
    DoubleRelease(u32),
    #[error("write of {requested} bytes exceeds remaining capacity {remaining}")]
    BufferOverflow { requested: usize, remaining: usize },
    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),
    #[error("channel already registered: {0}")]
    ChannelExists(ChannelId),
    #[error("reclaimed {reclaimed} credits on {channel} with only {in_flight} in flight")]
    CreditUnderflow {
        channel: ChannelId,
        in_flight: u32,
        reclaimed: u32,
    },
    #[error("unknown gate: {0}")]
    UnknownGate(GateId),
    #[error("task already registered: {0}")]
    TaskExists(TaskId),
    #[error("connection to {0} failed")]
    ConnectionFailed(SocketAddr),
    #[error("connector for {0} is not disconnected")]
    NotDisconnected(SocketAddr),
    #[error("transport unavailable")]
    TransportUnavailable,
    #[error("transport already initialized")]
    TransportInitialized,
    #[error("frame of {0} bytes exceeds maximum frame size")]
    FrameTooLarge(usize),
    #[error("timeout")]
    Timeout,
    #[error("spill handle not found")]
    SpillMissing,
    #[error("environment shut down")]
    ShutDown,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns whether the error must take down the worker process.
    ///
    /// Configuration and allocation failures can only occur during construction. Double releases
    /// and credit underflows indicate a defect in the caller. Every other error is local to the
    /// channel, gate, or connection that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::AllocationFailed { .. }
                | Self::DoubleRelease(_)
                | Self::CreditUnderflow { .. }
        )
    }
}

/// Identity of a task running on the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identity of a consuming endpoint that aggregates several channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GateId(pub u64);

impl Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gate-{}", self.0)
    }
}

/// Identity of an ordered data path between one producer and one consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Identity of the worker process in the cluster.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId([u8; 16]);

impl ResourceId {
    /// Generate a random identifier.
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// Create an identifier from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the identifier.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({self})")
    }
}

/// Interface that provides time-based operations.
///
/// It is necessary to mock time to test retry schedules without waiting for them.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current time.
    fn current(&self) -> SystemTime;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;
}

/// Interface that any transport must implement to exchange frames with remote peers.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Connection established by [Transport::connect] or accepted by a [Listener].
    type Connection: Connection;

    /// Listener returned by [Transport::listen].
    type Listener: Listener<Connection = Self::Connection>;

    /// Prepare the transport for use with the given configuration.
    ///
    /// Called exactly once while the environment is being constructed.
    fn init(&self, cfg: &config::TransportConfig) -> Result<(), Error>;

    /// Dial the given peer.
    fn connect(
        &self,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<Self::Connection, Error>> + Send;

    /// Bind to the given local address.
    fn listen(
        &self,
        local: SocketAddr,
    ) -> impl Future<Output = Result<Self::Listener, Error>> + Send;

    /// Close the transport. Subsequent dials fail, and every [Connection] and [Listener] it
    /// produced fails its pending and future operations with [Error::Closed].
    ///
    /// Only the first call has an effect.
    fn shutdown(&self);
}

/// Interface that any transport must implement to accept incoming connections.
pub trait Listener: Send + 'static {
    /// Connection yielded for every accepted peer.
    type Connection: Connection;

    /// Accept an incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<(SocketAddr, Self::Connection), Error>> + Send;

    /// Returns the local address of the listener.
    fn local_addr(&self) -> Result<SocketAddr, Error>;
}

/// Interface to exchange frames over an established connection.
pub trait Connection: Send + 'static {
    /// Send a single frame.
    fn send(&mut self, frame: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Receive a single frame.
    fn recv(&mut self) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Returns the address of the remote peer.
    fn peer(&self) -> SocketAddr;
}

/// Interface to move blocks of bytes out of memory and back.
pub trait Spiller: Clone + Send + Sync + 'static {
    /// Reference to a block that has been written.
    type Handle: Clone + Debug + Send + Sync + 'static;

    /// Persist a block, returning a handle to read it back.
    fn write_block(&self, block: Bytes)
        -> impl Future<Output = Result<Self::Handle, Error>> + Send;

    /// Read a previously written block.
    fn read_block(&self, handle: &Self::Handle)
        -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Remove a previously written block.
    fn remove_block(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_display() {
        let id = ResourceId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
        assert_eq!(format!("{id:?}"), format!("ResourceId({})", "ab".repeat(16)));
    }

    #[test]
    fn test_resource_id_generate() {
        assert_ne!(ResourceId::generate(), ResourceId::generate());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::InvalidConfig("bad").is_fatal());
        assert!(Error::DoubleRelease(3).is_fatal());
        assert!(Error::CreditUnderflow {
            channel: ChannelId(1),
            in_flight: 0,
            reclaimed: 1
        }
        .is_fatal());
        assert!(!Error::Exhausted.is_fatal());
        assert!(!Error::ConnectionFailed("127.0.0.1:1".parse().unwrap()).is_fatal());
        assert!(!Error::Aborted.is_fatal());
    }
}

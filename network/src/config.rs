//! Tunables of the network environment.

use crate::{backoff::Backoff, Error};
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

/// Configuration of the transport used to reach remote peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Address to accept incoming connections on.
    listen: SocketAddr,
    /// Largest frame (excluding the length prefix) the transport will send or accept.
    max_frame_size: usize,
    /// Maximum time to wait for a dial to complete.
    connect_timeout: Duration,
    /// Read timeout for connections, after which the connection will be closed.
    read_timeout: Duration,
    /// Write timeout for connections, after which the connection will be closed.
    write_timeout: Duration,
    /// Whether or not to disable Nagle's algorithm.
    ///
    /// If `None`, the operating system default is kept.
    tcp_nodelay: Option<bool>,
}

impl TransportConfig {
    // Setters
    /// See [TransportConfig]
    pub const fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
    /// See [TransportConfig]
    pub const fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
    /// See [TransportConfig]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
    /// See [TransportConfig]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
    /// See [TransportConfig]
    pub const fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
    /// See [TransportConfig]
    pub const fn with_tcp_nodelay(mut self, tcp_nodelay: Option<bool>) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    // Getters
    /// See [TransportConfig]
    pub const fn listen(&self) -> SocketAddr {
        self.listen
    }
    /// See [TransportConfig]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
    /// See [TransportConfig]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
    /// See [TransportConfig]
    pub const fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
    /// See [TransportConfig]
    pub const fn write_timeout(&self) -> Duration {
        self.write_timeout
    }
    /// See [TransportConfig]
    pub const fn tcp_nodelay(&self) -> Option<bool> {
        self.tcp_nodelay
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            max_frame_size: 1024 * 1024, // 1 MB
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
            tcp_nodelay: None,
        }
    }
}

/// Configuration of the network environment.
///
/// A [Config] is an immutable value once handed to [crate::environment::Environment::new],
/// which calls [Config::validate] before acquiring any resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of segments in the buffer pool.
    num_network_buffers: usize,
    /// Size of each segment in bytes.
    ///
    /// Must fit in a single transport frame.
    network_buffer_size: usize,
    /// Exclusive buffers (and guaranteed credits) per input channel.
    network_buffers_per_channel: u32,
    /// Floating buffers (and credits) shared by all channels of a gate.
    floating_network_buffers_per_gate: u32,
    /// Whether gates use credit-based flow control.
    ///
    /// If `false`, each channel may hold at most `network_buffers_per_channel` unacknowledged
    /// buffers and floating credits are never granted.
    credit_based: bool,
    /// Delay before the first retry of a failed partition request.
    partition_request_initial_backoff: Duration,
    /// Upper bound on the delay between retries.
    ///
    /// Zero means no cap above the initial delay. A zero initial delay disables retries.
    partition_request_max_backoff: Duration,
    /// Growth factor applied to the delay after every failed attempt.
    backoff_multiplier: u32,
    /// Maximum number of retries before a connection is declared failed.
    ///
    /// If `None`, retries continue until the connection succeeds or the environment shuts down.
    max_connection_retries: Option<u32>,
    /// Floating credits a channel keeps after its in-flight buffers are reclaimed.
    ///
    /// Surplus floating credits are returned to the gate immediately.
    floating_retention: u32,
    /// Maximum time a blocking buffer request may wait.
    ///
    /// If `None`, requests wait until satisfied, aborted, or the pool is destroyed.
    request_timeout: Option<Duration>,
    /// Whether to export per-channel and per-peer metrics.
    network_detailed_metrics: bool,
    /// Transport configuration.
    ///
    /// If `None`, the environment is local-only and cannot reach remote peers.
    transport: Option<TransportConfig>,
}

impl Config {
    // Setters
    /// See [Config]
    pub const fn with_num_network_buffers(mut self, num_network_buffers: usize) -> Self {
        self.num_network_buffers = num_network_buffers;
        self
    }
    /// See [Config]
    pub const fn with_network_buffer_size(mut self, network_buffer_size: usize) -> Self {
        self.network_buffer_size = network_buffer_size;
        self
    }
    /// See [Config]
    pub const fn with_network_buffers_per_channel(mut self, buffers: u32) -> Self {
        self.network_buffers_per_channel = buffers;
        self
    }
    /// See [Config]
    pub const fn with_floating_network_buffers_per_gate(mut self, buffers: u32) -> Self {
        self.floating_network_buffers_per_gate = buffers;
        self
    }
    /// See [Config]
    pub const fn with_credit_based(mut self, credit_based: bool) -> Self {
        self.credit_based = credit_based;
        self
    }
    /// See [Config]
    pub const fn with_partition_request_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.partition_request_initial_backoff = initial;
        self.partition_request_max_backoff = max;
        self
    }
    /// See [Config]
    pub const fn with_backoff_multiplier(mut self, backoff_multiplier: u32) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }
    /// See [Config]
    pub const fn with_max_connection_retries(mut self, retries: Option<u32>) -> Self {
        self.max_connection_retries = retries;
        self
    }
    /// See [Config]
    pub const fn with_floating_retention(mut self, floating_retention: u32) -> Self {
        self.floating_retention = floating_retention;
        self
    }
    /// See [Config]
    pub const fn with_request_timeout(mut self, request_timeout: Option<Duration>) -> Self {
        self.request_timeout = request_timeout;
        self
    }
    /// See [Config]
    pub const fn with_network_detailed_metrics(mut self, detailed: bool) -> Self {
        self.network_detailed_metrics = detailed;
        self
    }
    /// See [Config]
    pub fn with_transport(mut self, transport: Option<TransportConfig>) -> Self {
        self.transport = transport;
        self
    }

    // Getters
    /// See [Config]
    pub const fn num_network_buffers(&self) -> usize {
        self.num_network_buffers
    }
    /// See [Config]
    pub const fn network_buffer_size(&self) -> usize {
        self.network_buffer_size
    }
    /// See [Config]
    pub const fn network_buffers_per_channel(&self) -> u32 {
        self.network_buffers_per_channel
    }
    /// See [Config]
    pub const fn floating_network_buffers_per_gate(&self) -> u32 {
        self.floating_network_buffers_per_gate
    }
    /// See [Config]
    pub const fn credit_based(&self) -> bool {
        self.credit_based
    }
    /// See [Config]
    pub const fn partition_request_initial_backoff(&self) -> Duration {
        self.partition_request_initial_backoff
    }
    /// See [Config]
    pub const fn partition_request_max_backoff(&self) -> Duration {
        self.partition_request_max_backoff
    }
    /// See [Config]
    pub const fn backoff_multiplier(&self) -> u32 {
        self.backoff_multiplier
    }
    /// See [Config]
    pub const fn max_connection_retries(&self) -> Option<u32> {
        self.max_connection_retries
    }
    /// See [Config]
    pub const fn floating_retention(&self) -> u32 {
        self.floating_retention
    }
    /// See [Config]
    pub const fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
    /// See [Config]
    pub const fn network_detailed_metrics(&self) -> bool {
        self.network_detailed_metrics
    }
    /// See [Config]
    pub const fn transport(&self) -> Option<&TransportConfig> {
        self.transport.as_ref()
    }

    /// Returns the retry policy described by the backoff settings.
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(
            self.partition_request_initial_backoff,
            self.partition_request_max_backoff,
            self.backoff_multiplier,
        )
    }

    /// Returns the number of bytes the buffer pool will allocate.
    pub const fn arena_size(&self) -> Option<usize> {
        self.num_network_buffers.checked_mul(self.network_buffer_size)
    }

    /// Check that the configuration can be used to build an environment.
    ///
    /// Whether the pool holds enough buffers for every channel is not checked here: exhaustion is
    /// reported when a gate is opened.
    pub fn validate(&self) -> Result<(), Error> {
        if self.network_buffer_size == 0 {
            return Err(Error::InvalidConfig("network buffer size must be positive"));
        }
        if self.arena_size().is_none() {
            return Err(Error::InvalidConfig("buffer pool size overflows"));
        }
        if u32::try_from(self.num_network_buffers).is_err() {
            return Err(Error::InvalidConfig("too many network buffers"));
        }
        if let Some(transport) = &self.transport {
            if self.network_buffer_size > transport.max_frame_size {
                return Err(Error::InvalidConfig(
                    "network buffer size exceeds maximum frame size",
                ));
            }
        }

        // The range is only checked when both ends are set
        let initial = self.partition_request_initial_backoff;
        let max = self.partition_request_max_backoff;
        if !initial.is_zero() && !max.is_zero() && initial > max {
            return Err(Error::InvalidConfig(
                "initial backoff must not exceed maximum backoff",
            ));
        }
        if self.backoff_multiplier == 0 {
            return Err(Error::InvalidConfig("backoff multiplier must be at least 1"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_network_buffers: 1024,
            network_buffer_size: 32 * 1024, // 32 KB
            network_buffers_per_channel: 2,
            floating_network_buffers_per_gate: 8,
            credit_based: true,
            partition_request_initial_backoff: Duration::ZERO,
            partition_request_max_backoff: Duration::ZERO,
            backoff_multiplier: 2,
            max_connection_retries: None,
            floating_retention: 0,
            request_timeout: None,
            network_detailed_metrics: false,
            transport: None,
        }
    }
}

//! Production collaborators backed by the [tokio] runtime.
//!
//! - [Clock] uses the wall clock and [tokio::time::sleep].
//! - [Transport] exchanges length-prefixed frames over TCP.
//! - [Spiller] writes spilled blocks to files in a directory.
//!
//! # Framing
//!
//! Every frame is sent as a 4-byte big-endian length followed by the payload. Frames larger than
//! the configured maximum are rejected on both ends with [Error::FrameTooLarge].
//!
//! # Shutdown
//!
//! Shutting down the [Transport] interrupts every pending and future operation on the
//! [Connection]s and [Listener]s it produced with [Error::Closed].

use crate::{
    config::TransportConfig,
    signal::{unless_stopped, Signal, Stopper},
    utils::lock,
    Error, ResourceId,
};
use bytes::{BufMut as _, Bytes, BytesMut};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    fs,
    io::{AsyncReadExt as _, AsyncWriteExt as _, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    time::timeout,
};
use tracing::{debug, warn};

/// Size of the read buffer of every connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Implementation of [crate::Clock] for the [tokio] runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct Clock;

impl crate::Clock for Clock {
    fn current(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        tokio::time::sleep(duration)
    }
}

/// Implementation of [crate::Transport] over TCP.
#[derive(Clone, Default)]
pub struct Transport {
    cfg: Arc<OnceLock<TransportConfig>>,
    stopper: Arc<Mutex<Stopper>>,
}

impl Transport {
    fn config(&self) -> Result<&TransportConfig, Error> {
        if lock(&self.stopper).is_stopped() {
            return Err(Error::TransportUnavailable);
        }
        self.cfg.get().ok_or(Error::TransportUnavailable)
    }
}

/// Resolves once the owning [Transport] shuts down.
fn stopped(stopper: &Mutex<Stopper>) -> Signal {
    lock(stopper).stopped()
}

fn set_nodelay(stream: &TcpStream, tcp_nodelay: Option<bool>) {
    if let Some(tcp_nodelay) = tcp_nodelay {
        if let Err(err) = stream.set_nodelay(tcp_nodelay) {
            warn!(?err, "failed to set TCP_NODELAY");
        }
    }
}

impl crate::Transport for Transport {
    type Connection = Connection;
    type Listener = Listener;

    fn init(&self, cfg: &TransportConfig) -> Result<(), Error> {
        self.cfg
            .set(cfg.clone())
            .map_err(|_| Error::TransportInitialized)
    }

    async fn connect(&self, peer: SocketAddr) -> Result<Connection, Error> {
        let cfg = self.config()?;

        // Time out if the peer takes too long to answer
        let stream = timeout(cfg.connect_timeout(), TcpStream::connect(peer))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|err| {
                debug!(%peer, ?err, "dial failed");
                Error::ConnectionFailed(peer)
            })?;
        set_nodelay(&stream, cfg.tcp_nodelay());
        Ok(Connection::new(stream, peer, cfg, self.stopper.clone()))
    }

    async fn listen(&self, local: SocketAddr) -> Result<Listener, Error> {
        let cfg = self.config()?.clone();
        let listener = TcpListener::bind(local).await?;
        Ok(Listener {
            cfg,
            listener,
            stopper: self.stopper.clone(),
        })
    }

    fn shutdown(&self) {
        if lock(&self.stopper).stop() {
            debug!("transport shut down");
        }
    }
}

/// Implementation of [crate::Connection] over a TCP stream.
pub struct Connection {
    peer: SocketAddr,
    max_frame_size: usize,
    read_timeout: Duration,
    write_timeout: Duration,
    sink: OwnedWriteHalf,
    stream: BufReader<OwnedReadHalf>,
    stopper: Arc<Mutex<Stopper>>,
}

impl Connection {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        cfg: &TransportConfig,
        stopper: Arc<Mutex<Stopper>>,
    ) -> Self {
        let (read_half, sink) = stream.into_split();
        Self {
            peer,
            max_frame_size: cfg.max_frame_size(),
            read_timeout: cfg.read_timeout(),
            write_timeout: cfg.write_timeout(),
            sink,
            stream: BufReader::with_capacity(READ_BUFFER_SIZE, read_half),
            stopper,
        }
    }

    async fn read_frame(&mut self) -> Result<Bytes, Error> {
        let len = self.stream.read_u32().await? as usize;
        if len > self.max_frame_size {
            return Err(Error::FrameTooLarge(len));
        }
        let mut frame = vec![0; len];
        self.stream.read_exact(&mut frame).await?;
        Ok(Bytes::from(frame))
    }
}

impl crate::Connection for Connection {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        if frame.len() > self.max_frame_size {
            return Err(Error::FrameTooLarge(frame.len()));
        }
        let len = u32::try_from(frame.len()).map_err(|_| Error::FrameTooLarge(frame.len()))?;
        let mut buf = BytesMut::with_capacity(4 + frame.len());
        buf.put_u32(len);
        buf.extend_from_slice(&frame);

        // Time out if we take too long to write
        let stop = stopped(&self.stopper);
        let write = async {
            timeout(self.write_timeout, self.sink.write_all(&buf))
                .await
                .map_err(|_| Error::Timeout)??;
            Ok::<_, Error>(())
        };
        unless_stopped(stop, write).await
    }

    async fn recv(&mut self) -> Result<Bytes, Error> {
        // Time out if we take too long to read
        let stop = stopped(&self.stopper);
        let read = async {
            match timeout(self.read_timeout, self.read_frame()).await {
                Ok(Err(Error::Io(err))) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    Err(Error::Closed)
                }
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            }
        };
        unless_stopped(stop, read).await
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Implementation of [crate::Listener] over a TCP listener.
pub struct Listener {
    cfg: TransportConfig,
    listener: TcpListener,
    stopper: Arc<Mutex<Stopper>>,
}

impl crate::Listener for Listener {
    type Connection = Connection;

    async fn accept(&mut self) -> Result<(SocketAddr, Connection), Error> {
        let stop = stopped(&self.stopper);
        let accept = async { self.listener.accept().await.map_err(|_| Error::Closed) };
        let (stream, addr) = unless_stopped(stop, accept).await?;
        set_nodelay(&stream, self.cfg.tcp_nodelay());
        let connection = Connection::new(stream, addr, &self.cfg, self.stopper.clone());
        Ok((addr, connection))
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }
}

/// Implementation of [crate::Spiller] that stores each block in its own file.
///
/// File names are unique per [Spiller], so several spillers may share a directory.
#[derive(Clone)]
pub struct Spiller {
    directory: PathBuf,
    prefix: ResourceId,
    next: Arc<AtomicU64>,
}

impl Spiller {
    /// Create a spiller writing to `directory`, which is created on first use.
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            prefix: ResourceId::generate(),
            next: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the directory blocks are written to.
    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }
}

fn missing(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        return Error::SpillMissing;
    }
    Error::Io(err)
}

impl crate::Spiller for Spiller {
    type Handle = PathBuf;

    async fn write_block(&self, block: Bytes) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.directory).await?;
        let sequence = self.next.fetch_add(1, Ordering::Relaxed);
        let path = self
            .directory
            .join(format!("{}-{sequence:016x}.spill", self.prefix));
        fs::write(&path, &block).await?;
        Ok(path)
    }

    async fn read_block(&self, handle: &PathBuf) -> Result<Bytes, Error> {
        fs::read(handle).await.map(Bytes::from).map_err(missing)
    }

    async fn remove_block(&self, handle: &PathBuf) -> Result<(), Error> {
        fs::remove_file(handle).await.map_err(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config, dispatcher::Dispatcher, environment::Environment, Clock as _,
        Connection as _, Listener as _, Spiller as _, TaskId, Transport as _,
    };
    use prometheus_client::registry::Registry;

    fn local() -> TransportConfig {
        TransportConfig::default().with_listen("127.0.0.1:0".parse().unwrap())
    }

    fn temp_directory(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shuffle-network-{name}-{}", ResourceId::generate()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_sleep() {
        let clock = Clock;
        let start = tokio::time::Instant::now();
        clock.sleep(Duration::from_secs(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(clock.current() > SystemTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_frames() {
        let transport = Transport::default();
        transport.init(&local()).unwrap();
        let mut listener = transport.listen(local().listen()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Exchange frames both ways
        let mut dialer = transport.connect(addr).await.unwrap();
        assert_eq!(dialer.peer(), addr);
        let (_, mut accepted) = listener.accept().await.unwrap();
        dialer.send(Bytes::from_static(b"hello")).await.unwrap();
        dialer.send(Bytes::new()).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(accepted.recv().await.unwrap(), Bytes::new());
        accepted.send(Bytes::from(vec![7u8; 4096])).await.unwrap();
        assert_eq!(dialer.recv().await.unwrap(), Bytes::from(vec![7u8; 4096]));

        // Closing one end is observed by the other
        drop(accepted);
        assert!(matches!(dialer.recv().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let cfg = local().with_max_frame_size(8);
        let transport = Transport::default();
        transport.init(&cfg).unwrap();
        let mut listener = transport.listen(cfg.listen()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Oversized frames are not sent
        let mut dialer = transport.connect(addr).await.unwrap();
        assert!(matches!(
            dialer.send(Bytes::from_static(b"too many bytes")).await,
            Err(Error::FrameTooLarge(14))
        ));

        // Nor accepted
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (_, _) = listener.accept().await.unwrap();
        let (_, mut accepted) = listener.accept().await.unwrap();
        raw.write_u32(100).await.unwrap();
        assert!(matches!(
            accepted.recv().await,
            Err(Error::FrameTooLarge(100))
        ));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let cfg = local().with_read_timeout(Duration::from_millis(50));
        let transport = Transport::default();
        transport.init(&cfg).unwrap();
        let mut listener = transport.listen(cfg.listen()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _dialer = transport.connect(addr).await.unwrap();
        let (_, mut accepted) = listener.accept().await.unwrap();
        assert!(matches!(accepted.recv().await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = Transport::default();
        transport.init(&local()).unwrap();

        // Find a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        assert!(matches!(
            transport.connect(addr).await,
            Err(Error::ConnectionFailed(peer)) if peer == addr
        ));
    }

    #[tokio::test]
    async fn test_transport_lifecycle() {
        let transport = Transport::default();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        // Unusable before init
        assert!(matches!(
            transport.connect(addr).await,
            Err(Error::TransportUnavailable)
        ));

        // Init only once
        transport.init(&local()).unwrap();
        assert!(matches!(
            transport.init(&local()),
            Err(Error::TransportInitialized)
        ));

        // Unusable after shutdown, from any clone
        transport.clone().shutdown();
        assert!(matches!(
            transport.listen(local().listen()).await,
            Err(Error::TransportUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_spiller() {
        let directory = temp_directory("spiller");
        let spiller = Spiller::new(directory.clone());

        // Blocks survive the round trip through the filesystem
        let first = spiller
            .write_block(Bytes::from_static(b"first"))
            .await
            .unwrap();
        let second = spiller.write_block(Bytes::new()).await.unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(spiller.directory()));
        assert_eq!(
            spiller.read_block(&first).await.unwrap(),
            Bytes::from_static(b"first")
        );
        assert_eq!(spiller.read_block(&second).await.unwrap(), Bytes::new());

        // Removed blocks are gone
        spiller.remove_block(&first).await.unwrap();
        assert!(matches!(
            spiller.read_block(&first).await,
            Err(Error::SpillMissing)
        ));
        assert!(matches!(
            spiller.remove_block(&first).await,
            Err(Error::SpillMissing)
        ));

        std::fs::remove_dir_all(&directory).unwrap();
    }

    #[tokio::test]
    async fn test_environment() {
        let directory = temp_directory("environment");
        let transport = Transport::default();
        let mut registry = Registry::default();
        let cfg = Config::default()
            .with_num_network_buffers(8)
            .with_network_buffer_size(1024)
            .with_partition_request_backoff(Duration::from_millis(10), Duration::from_millis(100))
            .with_transport(Some(local()));
        let env = Environment::new(
            Clock,
            transport.clone(),
            Spiller::new(directory.clone()),
            Dispatcher::default(),
            &mut registry,
            ResourceId::generate(),
            cfg,
        )
        .unwrap();

        // Ship a buffer to ourselves
        let mut listener = env.listen().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut connection = env.connector(addr).connect().await.unwrap();
        let (_, mut accepted) = listener.accept().await.unwrap();
        let mut buffer = env
            .request_buffers(TaskId(1), 1)
            .await
            .unwrap()
            .pop()
            .unwrap();
        buffer.write(b"payload").unwrap();
        connection.send(buffer.read().unwrap()).await.unwrap();
        drop(buffer);
        let frame = accepted.recv().await.unwrap();
        assert_eq!(frame, Bytes::from_static(b"payload"));

        // Spill it and read it back
        let mut received = env.try_request_buffers(TaskId(2), 1).unwrap().pop().unwrap();
        received.write(&frame).unwrap();
        let handle = env.spill(received).await.unwrap();
        let restored = env.restore(TaskId(2), &handle).await.unwrap();
        assert_eq!(restored.read().unwrap(), frame);
        assert!(!handle.exists());
        drop(restored);

        // Shutdown closes the transport
        env.shutdown();
        assert!(matches!(
            transport.connect(addr).await,
            Err(Error::TransportUnavailable)
        ));
        std::fs::remove_dir_all(&directory).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let transport = Transport::default();
        let cfg = Config::default()
            .with_num_network_buffers(4)
            .with_transport(Some(local()));
        let env = Environment::new(
            Clock,
            transport,
            Spiller::new(temp_directory("unused")),
            Dispatcher::default(),
            &mut Registry::default(),
            ResourceId::generate(),
            cfg,
        )
        .unwrap();
        let mut listener = env.listen().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut connection = env.connector(addr).connect().await.unwrap();
        let (_, mut accepted) = listener.accept().await.unwrap();
        connection.send(Bytes::from_static(b"before")).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), Bytes::from_static(b"before"));

        // A receive in progress is interrupted
        let waiting = tokio::spawn(async move {
            let result = accepted.recv().await;
            (accepted, result)
        });
        tokio::task::yield_now().await;
        env.shutdown();
        env.shutdown();
        let (mut accepted, result) = waiting.await.unwrap();
        assert!(matches!(result, Err(Error::Closed)));

        // Nothing moves over connections or listeners created before shutdown
        assert!(matches!(
            connection.send(Bytes::from_static(b"after")).await,
            Err(Error::Closed)
        ));
        assert!(matches!(accepted.recv().await, Err(Error::Closed)));
        assert!(matches!(
            accepted.send(Bytes::from_static(b"after")).await,
            Err(Error::Closed)
        ));
        let _pending = TcpStream::connect(addr).await;
        assert!(matches!(listener.accept().await, Err(Error::Closed)));
    }
}

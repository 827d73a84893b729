//! Long-lived owner of the buffer pool, gates, connectors and collaborators of a worker.
//!
//! Exactly one [Environment] is constructed per worker process. Construction validates the
//! [Config], allocates the [BufferPool] and initializes the [Transport]; if any step fails,
//! everything acquired so far is released before the error is returned. The returned handle is
//! cheap to clone and is shared by every task on the worker.
//!
//! [Environment::shutdown] (or dropping the last handle) stops every connector, closes every
//! gate, releases the pool's memory and shuts down the transport, exactly once.

use crate::{
    config::Config,
    connection::{self, Connector},
    credit,
    dispatcher::{Dispatcher, TaskEvent},
    gate::Gate,
    metrics::{ConnectionMetrics, CreditMetrics, EnvironmentMetrics},
    pool::{Buffer, BufferPool},
    signal::Stopper,
    utils::lock,
    ChannelId, Clock, Error, GateId, ResourceId, Spiller, TaskId, Transport,
};
use futures::future::{select, Either};
use prometheus_client::registry::Registry;
use std::{
    collections::HashMap,
    net::SocketAddr,
    pin::pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info, warn};

struct Inner<C: Clock, T: Transport, S: Spiller> {
    cfg: Config,
    location: ResourceId,
    clock: C,
    transport: Option<T>,
    spiller: S,
    dispatcher: Dispatcher,
    pool: BufferPool,
    gates: Mutex<HashMap<GateId, Arc<Gate>>>,
    next_gate: AtomicU64,
    stopper: Mutex<Stopper>,
    shut_down: AtomicBool,
    credit_metrics: CreditMetrics,
    connection_metrics: ConnectionMetrics,
    metrics: EnvironmentMetrics,
}

impl<C: Clock, T: Transport, S: Spiller> Inner<C, T, S> {
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Interrupt connectors before tearing down what they use
        lock(&self.stopper).stop();
        let gates: Vec<_> = lock(&self.gates).drain().map(|(_, gate)| gate).collect();
        for gate in &gates {
            gate.close();
        }
        self.metrics.gates_open.set(0);
        self.pool.destroy();
        if let Some(transport) = &self.transport {
            transport.shutdown();
        }
        self.dispatcher.clear();
        info!(location = %self.location, gates = gates.len(), "network environment shut down");
    }
}

impl<C: Clock, T: Transport, S: Spiller> Drop for Inner<C, T, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shared handle to the network environment of a worker.
pub struct Environment<C: Clock, T: Transport, S: Spiller> {
    inner: Arc<Inner<C, T, S>>,
}

impl<C: Clock, T: Transport, S: Spiller> Clone for Environment<C, T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Clock, T: Transport, S: Spiller> Environment<C, T, S> {
    /// Build the environment of the worker identified by `location`.
    ///
    /// `transport` is initialized with the transport configuration of `cfg`. If `cfg` has none,
    /// the environment is local-only and the transport is never used.
    ///
    /// # Errors
    ///
    /// - [Error::InvalidConfig]: `cfg` does not validate
    /// - [Error::AllocationFailed]: the buffer pool cannot be allocated
    /// - any error returned by [Transport::init]
    pub fn new(
        clock: C,
        transport: T,
        spiller: S,
        dispatcher: Dispatcher,
        registry: &mut Registry,
        location: ResourceId,
        cfg: Config,
    ) -> Result<Self, Error> {
        cfg.validate()?;

        // Allocate the pool
        let pool = BufferPool::new(
            cfg.num_network_buffers(),
            cfg.network_buffer_size(),
            registry,
        )?;

        // Initialize the transport (dropping the pool on failure)
        let transport = match cfg.transport() {
            Some(transport_cfg) => {
                if let Err(err) = transport.init(transport_cfg) {
                    warn!(?err, "failed to initialize transport");
                    pool.destroy();
                    return Err(err);
                }
                Some(transport)
            }
            None => None,
        };

        let credit_metrics = CreditMetrics::new(registry, cfg.network_detailed_metrics());
        let connection_metrics = ConnectionMetrics::new(registry, cfg.network_detailed_metrics());
        let metrics = EnvironmentMetrics::new(registry);
        info!(
            %location,
            buffers = cfg.num_network_buffers(),
            buffer_size = cfg.network_buffer_size(),
            credit_based = cfg.credit_based(),
            remote = transport.is_some(),
            "network environment started"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                location,
                clock,
                transport,
                spiller,
                dispatcher,
                pool,
                gates: Mutex::new(HashMap::new()),
                next_gate: AtomicU64::new(0),
                stopper: Mutex::new(Stopper::new()),
                shut_down: AtomicBool::new(false),
                credit_metrics,
                connection_metrics,
                metrics,
            }),
        })
    }

    /// Returns the configuration the environment was built with.
    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    /// Returns the identity of the worker.
    pub fn location(&self) -> ResourceId {
        self.inner.location
    }

    /// Returns the buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Returns the task event dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Returns whether [Environment::shutdown] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    /// Check out `count` buffers for `task`, waiting at most the configured request timeout.
    pub async fn request_buffers(&self, task: TaskId, count: usize) -> Result<Vec<Buffer>, Error> {
        let request = self.inner.pool.request(task, count);
        let Some(timeout) = self.inner.cfg.request_timeout() else {
            return request.await;
        };
        let sleep = pin!(self.inner.clock.sleep(timeout));
        match select(request, sleep).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => {
                debug!(%task, count, ?timeout, "buffer request timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Check out `count` buffers for `task` without waiting.
    pub fn try_request_buffers(&self, task: TaskId, count: usize) -> Result<Vec<Buffer>, Error> {
        self.inner.pool.try_request(task, count)
    }

    /// Open a gate for `task` over `channels`.
    pub fn open_gate(&self, task: TaskId, channels: &[ChannelId]) -> Result<Arc<Gate>, Error> {
        self.ensure_running()?;
        let id = GateId(self.inner.next_gate.fetch_add(1, Ordering::Relaxed));
        let gate = Arc::new(Gate::with_metrics(
            id,
            task,
            channels,
            self.inner.pool.clone(),
            credit::Config::from(&self.inner.cfg),
            self.inner.credit_metrics.clone(),
        )?);

        // Shutdown drains the map under this lock, so a gate is either drained or never inserted
        let mut gates = lock(&self.inner.gates);
        if self.is_shut_down() {
            drop(gates);
            gate.close();
            return Err(Error::ShutDown);
        }
        gates.insert(id, gate.clone());
        self.inner.metrics.gates_open.inc();
        Ok(gate)
    }

    /// Close a gate, releasing its buffers.
    pub fn close_gate(&self, id: GateId) -> Result<(), Error> {
        let gate = lock(&self.inner.gates)
            .remove(&id)
            .ok_or(Error::UnknownGate(id))?;
        gate.close();
        self.inner.metrics.gates_open.dec();
        Ok(())
    }

    /// Returns the gates currently open for `task`.
    pub fn gates(&self, task: TaskId) -> Vec<Arc<Gate>> {
        lock(&self.inner.gates)
            .values()
            .filter(|gate| gate.task() == task)
            .cloned()
            .collect()
    }

    /// Create a connector to `peer` using the environment's transport and retry policy.
    pub fn connector(&self, peer: SocketAddr) -> Connector<C, T> {
        Connector::with_metrics(
            peer,
            self.inner.clock.clone(),
            self.inner.transport.clone(),
            connection::Config::from(&self.inner.cfg),
            lock(&self.inner.stopper).stopped(),
            self.inner.connection_metrics.clone(),
        )
    }

    /// Accept connections on the configured listen address.
    pub async fn listen(&self) -> Result<T::Listener, Error> {
        self.ensure_running()?;
        let (Some(transport), Some(cfg)) = (&self.inner.transport, self.inner.cfg.transport())
        else {
            return Err(Error::TransportUnavailable);
        };
        transport.listen(cfg.listen()).await
    }

    /// Move the contents of `buffer` to secondary storage.
    ///
    /// The buffer is returned to the pool whether or not the write succeeds.
    pub async fn spill(&self, buffer: Buffer) -> Result<S::Handle, Error> {
        self.ensure_running()?;
        let block = buffer.read()?;
        let owner = buffer.owner();
        drop(buffer);
        let bytes = block.len();
        let handle = self.inner.spiller.write_block(block).await?;
        self.inner.metrics.spilled.inc();
        debug!(task = %owner, bytes, ?handle, "spilled buffer");
        Ok(handle)
    }

    /// Read a spilled block back into a fresh buffer for `task`.
    ///
    /// The block is removed from secondary storage once it has been restored.
    pub async fn restore(&self, task: TaskId, handle: &S::Handle) -> Result<Buffer, Error> {
        self.ensure_running()?;
        let block = self.inner.spiller.read_block(handle).await?;
        let mut buffer = self
            .request_buffers(task, 1)
            .await?
            .pop()
            .ok_or(Error::Exhausted)?;
        buffer.write(&block)?;
        if let Err(err) = self.inner.spiller.remove_block(handle).await {
            warn!(?handle, ?err, "failed to remove restored block");
        }
        self.inner.metrics.restored.inc();
        Ok(buffer)
    }

    /// Cancel `task`: notify it, abort its waiting requests, close its gates and reclaim every
    /// buffer it still holds.
    ///
    /// Returns the number of buffers forcibly reclaimed.
    pub fn cancel_task(&self, task: TaskId) -> usize {
        let notified = self.inner.dispatcher.publish(task, TaskEvent::Cancel);
        let aborted = self.inner.pool.abort(task);
        let gates: Vec<_> = {
            let mut all = lock(&self.inner.gates);
            let ids: Vec<_> = all
                .iter()
                .filter(|(_, gate)| gate.task() == task)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| all.remove(&id)).collect()
        };
        for gate in &gates {
            gate.close();
            self.inner.metrics.gates_open.dec();
        }
        let reclaimed = self.inner.pool.reclaim(Some(task));
        if reclaimed > 0 {
            warn!(%task, reclaimed, "cancelled task still held buffers");
        }
        debug!(%task, notified, aborted, gates = gates.len(), "cancelled task");
        reclaimed
    }

    /// Tear down the environment.
    ///
    /// Safe to call any number of times from any handle: only the first call has an effect.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

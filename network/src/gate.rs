//! Consuming endpoint of a task: a set of input channels sharing one [CreditManager].
//!
//! Opening a gate reserves `per_channel` exclusive buffers for every channel, so the guaranteed
//! credits of a channel are always backed by memory. Floating credits are only granted once the
//! gate has taken matching floating buffers from the pool, and those buffers go back to the pool
//! as soon as the credits are returned.

use crate::{
    credit::{self, CreditManager, CreditState, Grant, Reclaimed},
    metrics::CreditMetrics,
    pool::{Buffer, BufferPool},
    utils::lock,
    ChannelId, Error, GateId, TaskId,
};
use futures::channel::mpsc;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};
use tracing::debug;

#[derive(Default)]
struct Reserved {
    exclusive: Vec<Buffer>,
    floating: Vec<Buffer>,
}

/// Input channels of a task backed by buffers from the pool.
pub struct Gate {
    id: GateId,
    task: TaskId,
    pool: BufferPool,
    credits: CreditManager,
    reserved: Mutex<HashMap<ChannelId, Reserved>>,
    closed: AtomicBool,
}

impl Gate {
    /// Open a gate for `task` over `channels`, reserving exclusive buffers without waiting.
    ///
    /// Fails with [Error::Exhausted] (and reserves nothing) if the pool cannot back every channel.
    pub fn open(
        id: GateId,
        task: TaskId,
        channels: &[ChannelId],
        pool: BufferPool,
        cfg: credit::Config,
    ) -> Result<Self, Error> {
        Self::with_metrics(id, task, channels, pool, cfg, CreditMetrics::default())
    }

    pub(crate) fn with_metrics(
        id: GateId,
        task: TaskId,
        channels: &[ChannelId],
        pool: BufferPool,
        cfg: credit::Config,
        metrics: CreditMetrics,
    ) -> Result<Self, Error> {
        // Reserve everything at once so a partial gate never holds buffers
        let per_channel = cfg.per_channel as usize;
        let needed = per_channel
            .checked_mul(channels.len())
            .ok_or(Error::Exhausted)?;
        let mut exclusive = pool.try_request(task, needed)?;

        let credits = CreditManager::with_metrics(id, cfg, metrics);
        let mut reserved = HashMap::with_capacity(channels.len());
        for &channel in channels {
            credits.register(channel)?;
            let buffers = exclusive.split_off(exclusive.len() - per_channel);
            reserved.insert(
                channel,
                Reserved {
                    exclusive: buffers,
                    floating: Vec::new(),
                },
            );
        }
        debug!(gate = %id, %task, channels = channels.len(), reserved = needed, "opened gate");
        Ok(Self {
            id,
            task,
            pool,
            credits,
            reserved: Mutex::new(reserved),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the identifier of the gate.
    pub const fn id(&self) -> GateId {
        self.id
    }

    /// Returns the task the gate belongs to.
    pub const fn task(&self) -> TaskId {
        self.task
    }

    /// Returns the credit manager of the gate.
    pub const fn credits(&self) -> &CreditManager {
        &self.credits
    }

    /// Returns whether the gate has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Back up to `credits` floating credits on `channel` with buffers from the pool.
    ///
    /// Returns the number of credits granted, which is zero in legacy mode, when the gate's
    /// floating credits are exhausted, or when the pool cannot provide the buffers.
    pub fn grant(&self, channel: ChannelId, credits: u32) -> Result<u32, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let cfg = self.credits.config();
        if !cfg.credit_based {
            return self.credits.grant(channel, credits);
        }
        let wanted = credits.min(self.credits.floating_available());
        if wanted == 0 {
            return self.credits.grant(channel, 0);
        }

        // Take the memory first so no credit is ever announced without a buffer behind it
        let mut buffers = match self.pool.try_request(self.task, wanted as usize) {
            Ok(buffers) => buffers,
            Err(Error::Exhausted) => {
                debug!(gate = %self.id, %channel, wanted, "no floating buffers available");
                return Ok(0);
            }
            Err(err) => return Err(err),
        };
        let granted = self.credits.grant(channel, wanted)?;
        buffers.truncate(granted as usize);
        let mut reserved = lock(&self.reserved);
        reserved.entry(channel).or_default().floating.extend(buffers);
        Ok(granted)
    }

    /// Put `count` buffers in flight on `channel` if credit allows.
    pub fn consume(&self, channel: ChannelId, count: u32) -> bool {
        !self.is_closed() && self.credits.consume(channel, count)
    }

    /// Return `count` buffers on `channel` and release floating buffers no longer needed.
    pub fn reclaim(&self, channel: ChannelId, count: u32) -> Result<Reclaimed, Error> {
        let reclaimed = self.credits.reclaim(channel, count)?;
        if reclaimed.returned > 0 {
            let mut reserved = lock(&self.reserved);
            if let Some(entry) = reserved.get_mut(&channel) {
                let keep = entry
                    .floating
                    .len()
                    .saturating_sub(reclaimed.returned as usize);
                entry.floating.truncate(keep);
            }
        }
        Ok(reclaimed)
    }

    /// Returns the credit state of `channel`.
    pub fn snapshot(&self, channel: ChannelId) -> Option<CreditState> {
        self.credits.snapshot(channel)
    }

    /// Receive every grant issued on `channel`.
    pub fn subscribe(&self, channel: ChannelId) -> Result<mpsc::UnboundedReceiver<Grant>, Error> {
        self.credits.subscribe(channel)
    }

    /// Returns the number of exclusive and floating buffers held by the gate.
    pub fn buffers(&self) -> (usize, usize) {
        lock(&self.reserved)
            .values()
            .fold((0, 0), |(exclusive, floating), entry| {
                (exclusive + entry.exclusive.len(), floating + entry.floating.len())
            })
    }

    /// Release every buffer and unregister every channel.
    ///
    /// Returns `false` if the gate was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for channel in self.credits.channels() {
            let _ = self.credits.unregister(channel);
        }
        self.credits.retire_metrics();
        let reserved = std::mem::take(&mut *lock(&self.reserved));
        drop(reserved);
        debug!(gate = %self.id, task = %self.task, "closed gate");
        true
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.close();
    }
}

//! Fixed arena of network buffers shared by every task on a worker.
//!
//! The pool allocates `count` segments of `size` bytes once, at construction, and never grows.
//! Segments are handed out as [Buffer]s that remember the `(index, generation)` of the slot they
//! were taken from. Every checkout and every forced reclamation bumps the slot's generation, so a
//! handle that outlives its checkout is detected as stale instead of touching memory that now
//! belongs to someone else.
//!
//! # Backpressure
//!
//! [BufferPool::try_request] fails fast with [Error::Exhausted] while [BufferPool::request]
//! returns a [Request] future that resolves once enough segments are free. Waiting requests are
//! served in arrival order and a request is only served when it can be satisfied in full, so a
//! large request is never starved by a stream of small ones. For the same reason,
//! [BufferPool::try_request] does not succeed while any request is waiting.
//!
//! # Locking
//!
//! The free list and wait queue share one lock, each slot has its own lock, and each waiting
//! request has its own mailbox. Locks are always taken in that order.
//!
//! # Conservation
//!
//! At all times `checked_out + available == total`.

use crate::{utils::lock, Error, TaskId};
use bytes::Bytes;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    collections::VecDeque,
    future::Future,
    mem::ManuallyDrop,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    task::{Context, Poll, Waker},
};
use tracing::{debug, error, warn};

/// Metrics for the buffer pool.
struct PoolMetrics {
    /// Number of segments in the pool.
    total: Gauge,
    /// Number of segments on the free list.
    available: Gauge,
    /// Number of segments currently checked out.
    checked_out: Gauge,
    /// Number of requests waiting for segments.
    waiters: Gauge,
    /// Total number of segments checked out.
    allocations_total: Counter,
    /// Total number of non-blocking requests that found the pool exhausted.
    exhausted_total: Counter,
    /// Total number of segments forcibly reclaimed.
    reclaimed_total: Counter,
}

impl PoolMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            total: Gauge::default(),
            available: Gauge::default(),
            checked_out: Gauge::default(),
            waiters: Gauge::default(),
            allocations_total: Counter::default(),
            exhausted_total: Counter::default(),
            reclaimed_total: Counter::default(),
        };

        registry.register(
            "buffers_total",
            "Number of segments in the buffer pool",
            metrics.total.clone(),
        );
        registry.register(
            "buffers_available",
            "Number of segments available in the buffer pool",
            metrics.available.clone(),
        );
        registry.register(
            "buffers_checked_out",
            "Number of segments currently checked out of the buffer pool",
            metrics.checked_out.clone(),
        );
        registry.register(
            "buffer_waiters",
            "Number of requests waiting for segments",
            metrics.waiters.clone(),
        );
        registry.register(
            "buffer_allocations",
            "Total number of segments checked out",
            metrics.allocations_total.clone(),
        );
        registry.register(
            "buffer_exhausted",
            "Total number of non-blocking requests that found the pool exhausted",
            metrics.exhausted_total.clone(),
        );
        registry.register(
            "buffer_reclaimed",
            "Total number of segments forcibly reclaimed",
            metrics.reclaimed_total.clone(),
        );

        metrics
    }
}

/// Snapshot of pool occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub available: usize,
    pub checked_out: usize,
    pub waiters: usize,
}

/// Reference to a checked-out segment that can be stored or sent without owning the [Buffer].
///
/// A handle does not return its segment on drop. It must be turned back into a [Buffer] with
/// [BufferPool::resume] or released with [BufferPool::release_handle], both of which consume it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u64,
}

impl Handle {
    /// Returns the slot index of the segment.
    pub const fn index(&self) -> u32 {
        self.index
    }
}

/// Segment taken from a slot by a checkout.
type Lease = (u32, u64);

struct Slot {
    memory: Box<[u8]>,
    len: usize,
    generation: u64,
    owner: Option<TaskId>,
    /// Held through a [Handle] rather than a [Buffer].
    detached: bool,
}

/// Where a waiting request receives its segments (or the reason it never will).
#[derive(Default)]
struct Mailbox {
    result: Option<Result<Vec<Lease>, Error>>,
    cancelled: bool,
    waker: Option<Waker>,
}

impl Mailbox {
    /// Store the outcome and return the waker to call once all locks are dropped.
    fn deliver(&mut self, result: Result<Vec<Lease>, Error>) -> Option<Waker> {
        self.result = Some(result);
        self.waker.take()
    }
}

struct Waiter {
    owner: TaskId,
    count: usize,
    mailbox: Arc<Mutex<Mailbox>>,
}

struct State {
    free: Vec<u32>,
    waiters: VecDeque<Waiter>,
    checked_out: usize,
    closed: bool,
}

struct Inner {
    size: usize,
    slots: Vec<Mutex<Slot>>,
    state: Mutex<State>,
    destroyed: AtomicBool,
    metrics: PoolMetrics,
}

impl Inner {
    fn total(&self) -> usize {
        self.slots.len()
    }

    /// Take `count` segments off the free list for `owner`.
    ///
    /// The caller must have checked that enough segments are free.
    fn checkout(&self, state: &mut State, owner: TaskId, count: usize) -> Vec<Lease> {
        let mut leases = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(index) = state.free.pop() else {
                break;
            };
            let mut slot = lock(&self.slots[index as usize]);
            slot.generation = slot.generation.wrapping_add(1);
            slot.owner = Some(owner);
            slot.detached = false;
            slot.len = 0;
            leases.push((index, slot.generation));
        }
        state.checked_out += leases.len();
        self.metrics.allocations_total.inc_by(leases.len() as u64);
        leases
    }

    /// Serve waiting requests, in order, for as long as the head of the queue can be satisfied.
    fn serve(&self, state: &mut State, wakers: &mut Vec<Waker>) {
        while let Some(waiter) = state.waiters.front() {
            if lock(&waiter.mailbox).cancelled {
                state.waiters.pop_front();
                continue;
            }
            if state.free.len() < waiter.count {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            let leases = self.checkout(state, waiter.owner, waiter.count);
            if let Some(waker) = lock(&waiter.mailbox).deliver(Ok(leases)) {
                wakers.push(waker);
            };
        }
    }

    fn record(&self, state: &State) {
        self.metrics.available.set(state.free.len() as i64);
        self.metrics.checked_out.set(state.checked_out as i64);
        self.metrics.waiters.set(state.waiters.len() as i64);
    }

    /// Return a segment to the free list.
    fn release(&self, index: u32, generation: u64) -> Result<(), Error> {
        let Some(slot) = self.slots.get(index as usize) else {
            return Err(Error::StaleBuffer(index));
        };
        let mut wakers = Vec::new();
        let result = {
            let mut state = lock(&self.state);
            let mut slot = lock(slot);
            if slot.generation != generation {
                Err(Error::StaleBuffer(index))
            } else if slot.owner.is_none() {
                Err(Error::DoubleRelease(index))
            } else {
                slot.owner = None;
                slot.len = 0;
                drop(slot);
                state.checked_out -= 1;
                state.free.push(index);
                self.serve(&mut state, &mut wakers);
                self.record(&state);
                Ok(())
            }
        };
        wakers.into_iter().for_each(Waker::wake);

        if let Err(Error::DoubleRelease(index)) = &result {
            error!(index, "segment released twice");
            if cfg!(debug_assertions) {
                panic!("segment {index} released twice");
            }
        }
        result
    }

    /// Withdraw a waiting request and hand back anything delivered to it.
    fn withdraw(&self, mailbox: &Arc<Mutex<Mailbox>>) {
        let delivered = {
            let mut mailbox = lock(mailbox);
            mailbox.cancelled = true;
            mailbox.result.take()
        };

        // Removing the head of the queue may unblock the requests behind it
        let mut wakers = Vec::new();
        {
            let mut state = lock(&self.state);
            state
                .waiters
                .retain(|waiter| !Arc::ptr_eq(&waiter.mailbox, mailbox));
            self.serve(&mut state, &mut wakers);
            self.record(&state);
        }
        wakers.into_iter().for_each(Waker::wake);

        if let Some(Ok(leases)) = delivered {
            for (index, generation) in leases {
                let _ = self.release(index, generation);
            }
        }
    }
}

/// Fixed-size pool of network buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("size", &self.inner.size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    /// Allocate `count` segments of `size` bytes.
    ///
    /// Fails with [Error::AllocationFailed] if the memory cannot be reserved. Nothing is retained
    /// on failure.
    pub fn new(count: usize, size: usize, registry: &mut Registry) -> Result<Self, Error> {
        let failed = || Error::AllocationFailed { count, size };
        if u32::try_from(count).is_err() {
            return Err(failed());
        }

        // Reserve every segment up front
        let mut slots = Vec::new();
        slots.try_reserve_exact(count).map_err(|_| failed())?;
        for _ in 0..count {
            let mut memory = Vec::new();
            memory.try_reserve_exact(size).map_err(|_| failed())?;
            memory.resize(size, 0);
            slots.push(Mutex::new(Slot {
                memory: memory.into_boxed_slice(),
                len: 0,
                generation: 0,
                owner: None,
                detached: false,
            }));
        }

        // Hand out low indices first
        let free = (0..count as u32).rev().collect();

        let metrics = PoolMetrics::new(registry);
        metrics.total.set(count as i64);
        metrics.available.set(count as i64);
        Ok(Self {
            inner: Arc::new(Inner {
                size,
                slots,
                state: Mutex::new(State {
                    free,
                    waiters: VecDeque::new(),
                    checked_out: 0,
                    closed: false,
                }),
                destroyed: AtomicBool::new(false),
                metrics,
            }),
        })
    }

    /// Returns the size of each segment in bytes.
    pub fn segment_size(&self) -> usize {
        self.inner.size
    }

    /// Returns the number of segments in the pool.
    pub fn total(&self) -> usize {
        self.inner.total()
    }

    fn buffers(&self, owner: TaskId, leases: Vec<Lease>) -> Vec<Buffer> {
        leases
            .into_iter()
            .map(|(index, generation)| Buffer {
                index,
                generation,
                owner,
                size: self.inner.size,
                pool: Arc::downgrade(&self.inner),
            })
            .collect()
    }

    /// Check out `count` segments for `owner` without waiting.
    ///
    /// # Errors
    ///
    /// - [Error::Closed]: the pool has been destroyed
    /// - [Error::Oversized]: `count` exceeds the size of the pool
    /// - [Error::Exhausted]: fewer than `count` segments are free, or requests are waiting
    pub fn try_request(&self, owner: TaskId, count: usize) -> Result<Vec<Buffer>, Error> {
        let total = self.total();
        let leases = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(Error::Closed);
            }
            if count > total {
                return Err(Error::Oversized {
                    requested: count,
                    total,
                });
            }
            if !state.waiters.is_empty() || state.free.len() < count {
                self.inner.metrics.exhausted_total.inc();
                return Err(Error::Exhausted);
            }
            let leases = self.inner.checkout(&mut state, owner, count);
            self.inner.record(&state);
            leases
        };
        Ok(self.buffers(owner, leases))
    }

    /// Check out `count` segments for `owner`, waiting until they are free.
    ///
    /// Dropping the returned [Request] before it resolves withdraws it.
    pub fn request(&self, owner: TaskId, count: usize) -> Request {
        let total = self.total();
        let mailbox = Arc::new(Mutex::new(Mailbox::default()));
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                lock(&mailbox).deliver(Err(Error::Closed));
            } else if count > total {
                lock(&mailbox).deliver(Err(Error::Oversized {
                    requested: count,
                    total,
                }));
            } else if state.waiters.is_empty() && state.free.len() >= count {
                let leases = self.inner.checkout(&mut state, owner, count);
                lock(&mailbox).deliver(Ok(leases));
            } else {
                debug!(%owner, count, "waiting for buffers");
                state.waiters.push_back(Waiter {
                    owner,
                    count,
                    mailbox: mailbox.clone(),
                });
            }
            self.inner.record(&state);
        }
        Request {
            owner,
            mailbox,
            pool: self.clone(),
            done: false,
        }
    }

    /// Release a segment referenced by a [Handle].
    pub fn release_handle(&self, handle: Handle) -> Result<(), Error> {
        self.inner.release(handle.index, handle.generation)
    }

    /// Turn a [Handle] back into a [Buffer].
    pub fn resume(&self, handle: Handle) -> Result<Buffer, Error> {
        let slot = self
            .inner
            .slots
            .get(handle.index as usize)
            .ok_or(Error::StaleBuffer(handle.index))?;
        let mut slot = lock(slot);
        if slot.generation != handle.generation || !slot.detached {
            return Err(Error::StaleBuffer(handle.index));
        }
        let owner = slot.owner.ok_or(Error::StaleBuffer(handle.index))?;
        slot.detached = false;
        Ok(Buffer {
            index: handle.index,
            generation: handle.generation,
            owner,
            size: self.inner.size,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Fail every request `owner` is waiting on with [Error::Aborted].
    ///
    /// Returns the number of requests aborted.
    pub fn abort(&self, owner: TaskId) -> usize {
        let mut wakers = Vec::new();
        let aborted = {
            let mut state = lock(&self.inner.state);
            let before = state.waiters.len();
            state.waiters.retain(|waiter| {
                if waiter.owner != owner {
                    return true;
                }
                if let Some(waker) = lock(&waiter.mailbox).deliver(Err(Error::Aborted)) {
                    wakers.push(waker);
                };
                false
            });
            let aborted = before - state.waiters.len();
            self.inner.serve(&mut state, &mut wakers);
            self.inner.record(&state);
            aborted
        };
        wakers.into_iter().for_each(Waker::wake);
        aborted
    }

    /// Forcibly return every segment held by `owner` (or by anyone, if `None`).
    ///
    /// Buffers and handles to reclaimed segments become stale. Returns the number of segments
    /// reclaimed.
    pub fn reclaim(&self, owner: Option<TaskId>) -> usize {
        let mut wakers = Vec::new();
        let reclaimed = {
            let mut state = lock(&self.inner.state);
            let mut reclaimed = 0;
            for (index, slot) in self.inner.slots.iter().enumerate() {
                let mut slot = lock(slot);
                let Some(holder) = slot.owner else {
                    continue;
                };
                if owner.is_some_and(|owner| owner != holder) {
                    continue;
                }
                slot.generation = slot.generation.wrapping_add(1);
                slot.owner = None;
                slot.len = 0;
                state.free.push(index as u32);
                reclaimed += 1;
            }
            state.checked_out -= reclaimed;
            self.inner.serve(&mut state, &mut wakers);
            self.inner.record(&state);
            reclaimed
        };
        wakers.into_iter().for_each(Waker::wake);

        if reclaimed > 0 {
            self.inner.metrics.reclaimed_total.inc_by(reclaimed as u64);
            match owner {
                Some(owner) => warn!(%owner, reclaimed, "reclaimed buffers"),
                None => warn!(reclaimed, "reclaimed buffers"),
            }
        }
        reclaimed
    }

    /// Returns the number of segments currently held by `owner`.
    pub fn held_by(&self, owner: TaskId) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| lock(slot).owner == Some(owner))
            .count()
    }

    /// Close the pool and release its memory.
    ///
    /// Waiting requests fail with [Error::Closed], outstanding buffers become stale and new
    /// requests are rejected. Calling this more than once has no further effect.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut wakers = Vec::new();
        {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            for waiter in state.waiters.drain(..) {
                if let Some(waker) = lock(&waiter.mailbox).deliver(Err(Error::Closed)) {
                    wakers.push(waker);
                };
            }
            state.free.clear();
            for (index, slot) in self.inner.slots.iter().enumerate() {
                let mut slot = lock(slot);
                if slot.owner.take().is_some() {
                    slot.generation = slot.generation.wrapping_add(1);
                }
                slot.len = 0;
                slot.memory = Box::default();
                state.free.push(index as u32);
            }
            state.checked_out = 0;
            self.inner.record(&state);
        }
        wakers.into_iter().for_each(Waker::wake);
        debug!(total = self.total(), "destroyed buffer pool");
    }

    /// Returns whether [BufferPool::destroy] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Returns a snapshot of pool occupancy.
    pub fn stats(&self) -> Stats {
        let state = lock(&self.inner.state);
        let stats = Stats {
            total: self.total(),
            available: state.free.len(),
            checked_out: state.checked_out,
            waiters: state.waiters.len(),
        };
        debug_assert_eq!(stats.available + stats.checked_out, stats.total);
        stats
    }
}

/// Pending checkout returned by [BufferPool::request].
pub struct Request {
    owner: TaskId,
    mailbox: Arc<Mutex<Mailbox>>,
    pool: BufferPool,
    done: bool,
}

impl Request {
    /// Returns the task the request was made for.
    pub const fn owner(&self) -> TaskId {
        self.owner
    }
}

impl Future for Request {
    type Output = Result<Vec<Buffer>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(Error::Closed));
        }
        let result = {
            let mut mailbox = lock(&this.mailbox);
            match mailbox.result.take() {
                Some(result) => result,
                None => {
                    mailbox.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        };
        this.done = true;
        Poll::Ready(result.map(|leases| this.pool.buffers(this.owner, leases)))
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.done {
            self.pool.inner.withdraw(&self.mailbox);
        }
    }
}

/// Checked-out segment of the pool.
///
/// The segment is returned to the pool when the buffer is dropped.
pub struct Buffer {
    index: u32,
    generation: u64,
    owner: TaskId,
    size: usize,
    pool: Weak<Inner>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Buffer {
    /// Returns the slot index of the segment.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the task holding the segment.
    pub const fn owner(&self) -> TaskId {
        self.owner
    }

    /// Returns the size of the segment in bytes.
    pub const fn capacity(&self) -> usize {
        self.size
    }

    /// Run `f` against the slot if this buffer still owns it.
    fn with_slot<R>(&self, f: impl FnOnce(&mut Slot) -> Result<R, Error>) -> Result<R, Error> {
        let pool = self.pool.upgrade().ok_or(Error::Closed)?;
        let mut slot = lock(&pool.slots[self.index as usize]);
        if slot.generation != self.generation || slot.owner.is_none() {
            return Err(Error::StaleBuffer(self.index));
        }
        f(&mut slot)
    }

    /// Returns the number of bytes written.
    pub fn len(&self) -> Result<usize, Error> {
        self.with_slot(|slot| Ok(slot.len))
    }

    /// Returns whether nothing has been written.
    pub fn is_empty(&self) -> Result<bool, Error> {
        self.len().map(|len| len == 0)
    }

    /// Append `data` to the segment.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.with_slot(|slot| {
            let remaining = slot.memory.len() - slot.len;
            if data.len() > remaining {
                return Err(Error::BufferOverflow {
                    requested: data.len(),
                    remaining,
                });
            }
            let start = slot.len;
            slot.memory[start..start + data.len()].copy_from_slice(data);
            slot.len += data.len();
            Ok(())
        })
    }

    /// Copy out the bytes written so far.
    pub fn read(&self) -> Result<Bytes, Error> {
        self.with_slot(|slot| Ok(Bytes::copy_from_slice(&slot.memory[..slot.len])))
    }

    /// Discard the bytes written so far.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.with_slot(|slot| {
            slot.len = 0;
            Ok(())
        })
    }

    /// Return the segment to the pool, surfacing any error.
    pub fn release(self) -> Result<(), Error> {
        let me = ManuallyDrop::new(self);
        let pool = me.pool.upgrade().ok_or(Error::Closed)?;
        pool.release(me.index, me.generation)
    }

    /// Give up ownership of the buffer in exchange for a [Handle] that does not release on drop.
    pub fn into_handle(self) -> Handle {
        let me = ManuallyDrop::new(self);
        if let Some(pool) = me.pool.upgrade() {
            if let Some(slot) = pool.slots.get(me.index as usize) {
                let mut slot = lock(slot);
                if slot.generation == me.generation {
                    slot.detached = true;
                }
            }
        }
        Handle {
            index: me.index,
            generation: me.generation,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if let Err(err) = pool.release(self.index, self.generation) {
            debug!(index = self.index, ?err, "dropped buffer was not returned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{executor::block_on, task::noop_waker_ref, FutureExt};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{collections::HashSet, thread};

    fn test_pool(count: usize, size: usize) -> BufferPool {
        let mut registry = Registry::default();
        BufferPool::new(count, size, &mut registry).unwrap()
    }

    fn poll(request: &mut Request) -> Poll<Result<Vec<Buffer>, Error>> {
        let mut cx = Context::from_waker(noop_waker_ref());
        request.poll_unpin(&mut cx)
    }

    fn assert_conserved(pool: &BufferPool) {
        let stats = pool.stats();
        assert_eq!(stats.available + stats.checked_out, stats.total);
    }

    #[test]
    fn test_request_and_release() {
        let pool = test_pool(4, 64);
        let owner = TaskId(1);

        // Check out and write
        let mut buffers = pool.try_request(owner, 3).unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(pool.stats().checked_out, 3);
        assert_eq!(pool.held_by(owner), 3);
        buffers[0].write(b"hello").unwrap();
        buffers[0].write(b" world").unwrap();
        assert_eq!(buffers[0].read().unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(buffers[0].len().unwrap(), 11);
        buffers[0].clear().unwrap();
        assert!(buffers[0].is_empty().unwrap());

        // Release explicitly and by drop
        let first = buffers.pop().unwrap();
        first.release().unwrap();
        assert_eq!(pool.stats().available, 2);
        drop(buffers);
        assert_eq!(pool.stats().available, 4);
        assert_eq!(pool.held_by(owner), 0);
        assert_conserved(&pool);
    }

    #[test]
    fn test_write_overflow() {
        let pool = test_pool(1, 8);
        let mut buffer = pool.try_request(TaskId(1), 1).unwrap().pop().unwrap();
        assert_eq!(buffer.capacity(), 8);
        buffer.write(&[1; 6]).unwrap();
        assert!(matches!(
            buffer.write(&[2; 3]),
            Err(Error::BufferOverflow {
                requested: 3,
                remaining: 2
            })
        ));
        assert_eq!(buffer.len().unwrap(), 6);
    }

    #[test]
    fn test_fresh_checkout_is_empty() {
        let pool = test_pool(1, 8);
        let mut buffer = pool.try_request(TaskId(1), 1).unwrap().pop().unwrap();
        buffer.write(b"stale").unwrap();
        drop(buffer);

        let buffer = pool.try_request(TaskId(2), 1).unwrap().pop().unwrap();
        assert!(buffer.is_empty().unwrap());
        assert_eq!(buffer.owner(), TaskId(2));
    }

    #[test]
    fn test_try_request_errors() {
        let pool = test_pool(2, 8);
        assert!(matches!(
            pool.try_request(TaskId(1), 3),
            Err(Error::Oversized {
                requested: 3,
                total: 2
            })
        ));
        let _held = pool.try_request(TaskId(1), 2).unwrap();
        assert!(matches!(
            pool.try_request(TaskId(1), 1),
            Err(Error::Exhausted)
        ));

        // Zero is always satisfiable
        assert!(pool.try_request(TaskId(1), 0).unwrap().is_empty());
        pool.destroy();
        assert!(matches!(pool.try_request(TaskId(1), 0), Err(Error::Closed)));
    }

    #[test]
    fn test_handle_round_trip() {
        let pool = test_pool(2, 16);
        let mut buffer = pool.try_request(TaskId(7), 1).unwrap().pop().unwrap();
        buffer.write(b"payload").unwrap();

        // Handles do not release on drop
        let handle = buffer.into_handle();
        assert_eq!(pool.stats().checked_out, 1);

        let buffer = pool.resume(handle).unwrap();
        assert_eq!(buffer.owner(), TaskId(7));
        assert_eq!(buffer.read().unwrap(), Bytes::from_static(b"payload"));
        let handle = buffer.into_handle();
        let stale = Handle {
            index: handle.index,
            generation: handle.generation,
        };
        pool.release_handle(handle).unwrap();
        assert_eq!(pool.stats().checked_out, 0);

        // Once released, the handle can no longer be resumed
        assert!(matches!(pool.resume(stale), Err(Error::StaleBuffer(_))));
    }

    #[test]
    fn test_resume_yields_one_buffer() {
        let pool = test_pool(2, 16);
        let handle = pool
            .try_request(TaskId(1), 1)
            .unwrap()
            .pop()
            .unwrap()
            .into_handle();
        let duplicate = Handle {
            index: handle.index,
            generation: handle.generation,
        };

        // The first resume takes the segment back
        let mut buffer = pool.resume(handle).unwrap();
        buffer.write(b"owned").unwrap();

        // A second resume of the same segment is refused while the buffer is live
        assert!(matches!(pool.resume(duplicate), Err(Error::StaleBuffer(0))));
        assert_eq!(pool.stats().checked_out, 1);

        // The live buffer still returns its segment exactly once
        drop(buffer);
        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.available, 2);
    }

    #[test]
    fn test_handle_of_live_buffer_refused() {
        let pool = test_pool(1, 16);
        let buffer = pool.try_request(TaskId(1), 1).unwrap().pop().unwrap();

        // A handle matching a buffer that was never detached cannot mint a second buffer
        let forged = Handle {
            index: buffer.index,
            generation: buffer.generation,
        };
        assert!(matches!(pool.resume(forged), Err(Error::StaleBuffer(0))));
        buffer.release().unwrap();
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_stale_handle_after_recycle() {
        let pool = test_pool(1, 16);
        let handle = pool
            .try_request(TaskId(1), 1)
            .unwrap()
            .pop()
            .unwrap()
            .into_handle();
        let stale = Handle {
            index: handle.index,
            generation: handle.generation,
        };
        pool.release_handle(handle).unwrap();

        // The slot is handed out again under a new generation
        let _buffer = pool.try_request(TaskId(2), 1).unwrap();
        assert!(matches!(
            pool.release_handle(stale),
            Err(Error::StaleBuffer(0))
        ));
        assert_eq!(pool.stats().checked_out, 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "released twice")]
    fn test_double_release_panics() {
        let pool = test_pool(2, 16);
        let handle = pool
            .try_request(TaskId(1), 1)
            .unwrap()
            .pop()
            .unwrap()
            .into_handle();
        let again = Handle {
            index: handle.index,
            generation: handle.generation,
        };
        pool.release_handle(handle).unwrap();
        let _ = pool.release_handle(again);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_release_errors() {
        let pool = test_pool(2, 16);
        let handle = pool
            .try_request(TaskId(1), 1)
            .unwrap()
            .pop()
            .unwrap()
            .into_handle();
        let again = Handle {
            index: handle.index,
            generation: handle.generation,
        };
        pool.release_handle(handle).unwrap();
        assert!(matches!(
            pool.release_handle(again),
            Err(Error::DoubleRelease(_))
        ));
        assert_conserved(&pool);
    }

    #[test]
    fn test_request_waits_fifo() {
        let pool = test_pool(5, 8);

        // First request is satisfied immediately
        let mut a = pool.request(TaskId(1), 3);
        let held = match poll(&mut a) {
            Poll::Ready(Ok(buffers)) => buffers,
            _ => panic!("first request should be ready"),
        };

        // Second waits for three, third waits behind it even though two are free
        let mut b = pool.request(TaskId(2), 3);
        let mut c = pool.request(TaskId(3), 2);
        assert!(poll(&mut b).is_pending());
        assert!(poll(&mut c).is_pending());
        assert_eq!(pool.stats().waiters, 2);
        assert!(matches!(
            pool.try_request(TaskId(4), 1),
            Err(Error::Exhausted)
        ));

        // Releasing the first checkout serves both in order
        drop(held);
        let b = match poll(&mut b) {
            Poll::Ready(Ok(buffers)) => buffers,
            _ => panic!("second request should be ready"),
        };
        let c = match poll(&mut c) {
            Poll::Ready(Ok(buffers)) => buffers,
            _ => panic!("third request should be ready"),
        };
        assert_eq!(b.len(), 3);
        assert_eq!(c.len(), 2);

        // No segment is handed out twice
        let indices: HashSet<_> = b.iter().chain(c.iter()).map(Buffer::index).collect();
        assert_eq!(indices.len(), 5);
        assert_eq!(pool.stats().available, 0);
        assert_conserved(&pool);
    }

    #[test]
    fn test_dropped_request_is_withdrawn() {
        let pool = test_pool(2, 8);
        let held = pool.try_request(TaskId(1), 2).unwrap();

        // A large waiter blocks a small one behind it
        let mut big = pool.request(TaskId(2), 2);
        let mut small = pool.request(TaskId(3), 1);
        assert!(poll(&mut big).is_pending());
        assert!(poll(&mut small).is_pending());

        // Free one segment: still not enough for the head of the queue
        let mut held = held;
        drop(held.pop());
        assert!(poll(&mut small).is_pending());

        // Withdrawing the head unblocks the request behind it
        drop(big);
        assert!(matches!(poll(&mut small), Poll::Ready(Ok(ref b)) if b.len() == 1));
        assert_eq!(pool.stats().waiters, 0);
        assert_conserved(&pool);
    }

    #[test]
    fn test_delivered_then_dropped_request_returns_buffers() {
        let pool = test_pool(2, 8);
        let held = pool.try_request(TaskId(1), 2).unwrap();
        let mut request = pool.request(TaskId(2), 2);
        assert!(poll(&mut request).is_pending());

        // Segments are delivered to the mailbox, but the request is dropped before it is polled
        drop(held);
        assert_eq!(pool.stats().checked_out, 2);
        drop(request);
        assert_eq!(pool.stats().checked_out, 0);
        assert_eq!(pool.held_by(TaskId(2)), 0);
    }

    #[test]
    fn test_abort() {
        let pool = test_pool(1, 8);
        let _held = pool.try_request(TaskId(1), 1).unwrap();
        let mut a = pool.request(TaskId(2), 1);
        let mut b = pool.request(TaskId(3), 1);
        assert!(poll(&mut a).is_pending());
        assert!(poll(&mut b).is_pending());

        assert_eq!(pool.abort(TaskId(2)), 1);
        assert!(matches!(poll(&mut a), Poll::Ready(Err(Error::Aborted))));
        assert!(poll(&mut b).is_pending());
        assert_eq!(pool.stats().waiters, 1);
    }

    #[test]
    fn test_reclaim_by_owner() {
        let pool = test_pool(4, 8);
        let mut mine = pool.try_request(TaskId(1), 2).unwrap();
        let theirs = pool.try_request(TaskId(2), 1).unwrap();

        // A waiter for three is served once the owner's segments come back
        let mut waiting = pool.request(TaskId(3), 3);
        assert!(poll(&mut waiting).is_pending());
        assert_eq!(pool.reclaim(Some(TaskId(1))), 2);
        let served = match poll(&mut waiting) {
            Poll::Ready(Ok(buffers)) => buffers,
            _ => panic!("waiting request should be served"),
        };
        assert_eq!(served.len(), 3);

        // Reclaimed buffers are stale and dropping them is harmless
        assert!(matches!(mine[0].write(b"x"), Err(Error::StaleBuffer(_))));
        assert!(matches!(
            mine.pop().unwrap().release(),
            Err(Error::StaleBuffer(_))
        ));
        drop(mine);
        assert_eq!(pool.held_by(TaskId(2)), 1);
        assert_eq!(pool.stats().checked_out, 4);
        assert_conserved(&pool);
        drop(served);
        drop(theirs);
        assert_eq!(pool.stats().available, 4);
    }

    #[test]
    fn test_destroy_idempotent() {
        let pool = test_pool(2, 8);
        let mut held = pool.try_request(TaskId(1), 2).unwrap();
        let mut waiting = pool.request(TaskId(2), 1);
        assert!(poll(&mut waiting).is_pending());

        pool.destroy();
        pool.destroy();
        assert!(pool.is_destroyed());
        assert!(matches!(poll(&mut waiting), Poll::Ready(Err(Error::Closed))));
        assert!(matches!(held[0].write(b"x"), Err(Error::StaleBuffer(_))));
        held.clear();

        // New requests are rejected
        let mut late = pool.request(TaskId(3), 1);
        assert!(matches!(poll(&mut late), Poll::Ready(Err(Error::Closed))));
        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.waiters, 0);
        assert_conserved(&pool);
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let pool = test_pool(1, 8);
        let buffer = pool.try_request(TaskId(1), 1).unwrap().pop().unwrap();
        drop(pool);
        assert!(matches!(buffer.read(), Err(Error::Closed)));
        drop(buffer);
    }

    #[test]
    fn test_oversized_request() {
        let pool = test_pool(2, 8);
        let mut request = pool.request(TaskId(1), 3);
        assert!(matches!(
            poll(&mut request),
            Poll::Ready(Err(Error::Oversized { .. }))
        ));
    }

    #[test]
    fn test_conservation_random() {
        let pool = test_pool(16, 8);
        let mut rng = StdRng::seed_from_u64(42);
        let mut held: Vec<Buffer> = Vec::new();
        let mut handles: Vec<Handle> = Vec::new();
        for _ in 0..2_000 {
            match rng.gen_range(0..4) {
                0 => {
                    let owner = TaskId(rng.gen_range(0..4));
                    let count = rng.gen_range(0..6);
                    if let Ok(buffers) = pool.try_request(owner, count) {
                        held.extend(buffers);
                    }
                }
                1 if !held.is_empty() => {
                    let index = rng.gen_range(0..held.len());
                    held.swap_remove(index).release().unwrap();
                }
                2 if !held.is_empty() => {
                    let index = rng.gen_range(0..held.len());
                    handles.push(held.swap_remove(index).into_handle());
                }
                3 if !handles.is_empty() => {
                    let index = rng.gen_range(0..handles.len());
                    held.push(pool.resume(handles.swap_remove(index)).unwrap());
                }
                _ => {}
            }

            // Every segment is either free or accounted for by exactly one holder
            let stats = pool.stats();
            assert_eq!(stats.available + stats.checked_out, stats.total);
            assert_eq!(stats.checked_out, held.len() + handles.len());
        }
    }

    #[test]
    fn test_concurrent_oversubscription() {
        let pool = test_pool(8, 8);
        let granted = Arc::new(Mutex::new(Vec::new()));

        // Ten threads each want three segments: at most two can hold them at once
        let mut threads = Vec::new();
        for task in 0..10 {
            let pool = pool.clone();
            let granted = granted.clone();
            threads.push(thread::spawn(move || {
                let buffers = block_on(pool.request(TaskId(task), 3)).unwrap();
                {
                    let mut granted = granted.lock().unwrap();
                    let indices: Vec<_> = buffers.iter().map(Buffer::index).collect();
                    granted.push(indices);
                }
                let stats = pool.stats();
                assert!(stats.checked_out <= 8);
                assert_eq!(stats.available + stats.checked_out, stats.total);
                drop(buffers);
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        // Every thread was eventually served and everything came back
        assert_eq!(granted.lock().unwrap().len(), 10);
        let stats = pool.stats();
        assert_eq!(stats.available, 8);
        assert_eq!(stats.waiters, 0);
    }

    #[test]
    fn test_metrics_registered() {
        let mut registry = Registry::default();
        let pool = BufferPool::new(4, 8, &mut registry).unwrap();
        let _held = pool.try_request(TaskId(1), 3).unwrap();
        let _ = pool.try_request(TaskId(1), 2);

        let mut encoded = String::new();
        prometheus_client::encoding::text::encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("buffers_total 4"));
        assert!(encoded.contains("buffers_available 1"));
        assert!(encoded.contains("buffers_checked_out 3"));
        assert!(encoded.contains("buffer_allocations_total 3"));
        assert!(encoded.contains("buffer_exhausted_total 1"));
    }
}

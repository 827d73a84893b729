//! Credit accounting for the channels of a single gate.
//!
//! A producer may only put a buffer in flight on a channel when the consumer has announced a
//! credit for it. Every channel starts with `per_channel` guaranteed credits (backed by the
//! gate's exclusive buffers). In credit-based mode, a channel that needs more can borrow from a
//! floating pool shared by the gate: borrowed credits stay with the channel while they back
//! buffers in flight and are handed back once those buffers are reclaimed (keeping at most
//! `floating_retention` idle). In legacy mode, nothing is shared and each channel is capped at
//! `per_channel` buffers in flight.
//!
//! [CreditManager::consume] never blocks. When it returns `false`, the caller waits for the next
//! [Grant] delivered to a [CreditManager::subscribe]r. Grants for a channel are delivered in the
//! order they were issued and carry a sequence number to make that checkable.

use crate::{
    metrics::CreditMetrics,
    utils::{lock, read, write},
    ChannelId, Error, GateId,
};
use futures::channel::mpsc;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
};
use tracing::{debug, error};

/// Configuration for a [CreditManager].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Guaranteed credits for every channel.
    pub per_channel: u32,
    /// Credits shared by all channels of the gate.
    pub floating_per_gate: u32,
    /// Whether floating credits may be granted.
    pub credit_based: bool,
    /// Idle floating credits a channel keeps after reclaiming buffers.
    pub floating_retention: u32,
}

impl From<&crate::config::Config> for Config {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            per_channel: cfg.network_buffers_per_channel(),
            floating_per_gate: if cfg.credit_based() {
                cfg.floating_network_buffers_per_gate()
            } else {
                0
            },
            credit_based: cfg.credit_based(),
            floating_retention: cfg.floating_retention(),
        }
    }
}

/// Credit state of one channel.
///
/// Always satisfies `in_flight <= guaranteed + floating`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreditState {
    pub guaranteed: u32,
    pub floating: u32,
    pub in_flight: u32,
}

impl CreditState {
    /// Returns the number of buffers the channel may have in flight.
    pub const fn limit(&self) -> u32 {
        self.guaranteed.saturating_add(self.floating)
    }

    /// Returns the number of credits not backing a buffer in flight.
    pub const fn available(&self) -> u32 {
        self.limit().saturating_sub(self.in_flight)
    }

    /// Returns the number of floating credits backing buffers in flight.
    const fn floating_in_use(&self) -> u32 {
        self.in_flight.saturating_sub(self.guaranteed)
    }

    /// Returns the number of floating credits not backing a buffer in flight.
    const fn floating_idle(&self) -> u32 {
        self.floating - self.floating_in_use()
    }
}

/// Announcement of new credit on a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Grant {
    pub channel: ChannelId,
    pub credits: u32,
    pub sequence: u64,
}

/// Outcome of [CreditManager::reclaim].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Credits made available to the producer again.
    pub restored: u32,
    /// Floating credits handed back to the gate.
    pub returned: u32,
}

struct ChannelCredit {
    state: CreditState,
    sequence: u64,
    subscribers: Vec<mpsc::UnboundedSender<Grant>>,
}

impl ChannelCredit {
    fn notify(&mut self, channel: ChannelId, credits: u32) {
        if credits == 0 {
            return;
        }
        self.sequence += 1;
        let grant = Grant {
            channel,
            credits,
            sequence: self.sequence,
        };
        self.subscribers
            .retain(|subscriber| subscriber.unbounded_send(grant).is_ok());
    }
}

/// Credit accounting for the channels of one gate.
pub struct CreditManager {
    gate: GateId,
    cfg: Config,
    floating: AtomicU32,
    channels: RwLock<HashMap<ChannelId, Arc<Mutex<ChannelCredit>>>>,
    metrics: CreditMetrics,
}

impl CreditManager {
    /// Create a manager for `gate` without any channels.
    pub fn new(gate: GateId, cfg: Config) -> Self {
        Self::with_metrics(gate, cfg, CreditMetrics::default())
    }

    pub(crate) fn with_metrics(gate: GateId, cfg: Config, metrics: CreditMetrics) -> Self {
        let floating = if cfg.credit_based {
            cfg.floating_per_gate
        } else {
            0
        };
        metrics.floating(gate, floating);
        Self {
            gate,
            cfg,
            floating: AtomicU32::new(floating),
            channels: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Returns the gate the manager accounts for.
    pub const fn gate(&self) -> GateId {
        self.gate
    }

    /// Returns the configuration of the manager.
    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    fn channel(&self, channel: ChannelId) -> Result<Arc<Mutex<ChannelCredit>>, Error> {
        read(&self.channels)
            .get(&channel)
            .cloned()
            .ok_or(Error::UnknownChannel(channel))
    }

    /// Take up to `credits` from the floating pool.
    fn borrow_floating(&self, credits: u32) -> u32 {
        let previous = self
            .floating
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                Some(available - available.min(credits))
            })
            .unwrap_or_else(|available| available);
        let taken = previous.min(credits);
        self.metrics.floating(self.gate, previous - taken);
        taken
    }

    fn return_floating(&self, credits: u32) {
        if credits == 0 {
            return;
        }
        let available = self.floating.fetch_add(credits, Ordering::AcqRel) + credits;
        debug_assert!(available <= self.cfg.floating_per_gate);
        self.metrics.floating(self.gate, available);
    }

    /// Start accounting for `channel` with its guaranteed credits.
    pub fn register(&self, channel: ChannelId) -> Result<(), Error> {
        let mut channels = write(&self.channels);
        if channels.contains_key(&channel) {
            return Err(Error::ChannelExists(channel));
        }
        channels.insert(
            channel,
            Arc::new(Mutex::new(ChannelCredit {
                state: CreditState {
                    guaranteed: self.cfg.per_channel,
                    floating: 0,
                    in_flight: 0,
                },
                sequence: 0,
                subscribers: Vec::new(),
            })),
        );
        Ok(())
    }

    /// Stop accounting for `channel`, returning all of its floating credits to the gate.
    ///
    /// Subscribers of the channel are disconnected.
    pub fn unregister(&self, channel: ChannelId) -> Result<CreditState, Error> {
        let removed = write(&self.channels)
            .remove(&channel)
            .ok_or(Error::UnknownChannel(channel))?;
        let state = {
            let mut credit = lock(&removed);
            credit.subscribers.clear();
            credit.state
        };
        self.return_floating(state.floating);
        self.metrics.remove_channel(self.gate, channel);
        Ok(state)
    }

    /// Drop the gate-level series once the gate is closed.
    pub(crate) fn retire_metrics(&self) {
        self.metrics.remove_gate(self.gate);
    }

    /// Returns the channels currently registered.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = read(&self.channels).keys().copied().collect();
        channels.sort();
        channels
    }

    /// Lend up to `credits` floating credits to `channel`.
    ///
    /// Returns the number of credits actually granted, which is zero in legacy mode or when the
    /// floating pool is empty.
    pub fn grant(&self, channel: ChannelId, credits: u32) -> Result<u32, Error> {
        let entry = self.channel(channel)?;
        if !self.cfg.credit_based || credits == 0 {
            return Ok(0);
        }
        let mut credit = lock(&entry);
        let granted = self.borrow_floating(credits);
        if granted == 0 {
            return Ok(0);
        }
        credit.state.floating += granted;
        credit.notify(channel, granted);
        drop(credit);

        self.metrics.granted(self.gate, channel, granted);
        debug!(gate = %self.gate, %channel, granted, "granted floating credits");
        Ok(granted)
    }

    /// Take back up to `credits` idle floating credits from `channel`.
    ///
    /// Returns the number of credits returned to the gate.
    pub fn revoke(&self, channel: ChannelId, credits: u32) -> Result<u32, Error> {
        let entry = self.channel(channel)?;
        let revoked = {
            let mut credit = lock(&entry);
            let revoked = credit.state.floating_idle().min(credits);
            credit.state.floating -= revoked;
            revoked
        };
        self.return_floating(revoked);
        Ok(revoked)
    }

    /// Put `count` buffers in flight on `channel` if enough credit is available.
    ///
    /// Never blocks. Returns `false` (and changes nothing) when the channel is unknown or lacks
    /// credit.
    pub fn consume(&self, channel: ChannelId, count: u32) -> bool {
        let Ok(entry) = self.channel(channel) else {
            debug!(gate = %self.gate, %channel, "consume on unknown channel");
            return false;
        };
        let mut credit = lock(&entry);
        if count > credit.state.available() {
            drop(credit);
            self.metrics.denied(self.gate, channel);
            return false;
        }
        credit.state.in_flight += count;
        debug_assert!(credit.state.in_flight <= credit.state.limit());
        drop(credit);

        self.metrics.consumed(self.gate, channel, count);
        true
    }

    /// Mark `count` buffers on `channel` as no longer in flight.
    ///
    /// Floating credits freed by the reclaimed buffers are handed back to the gate, except for
    /// the `floating_retention` the channel may keep idle. The remaining credits are announced
    /// to subscribers.
    pub fn reclaim(&self, channel: ChannelId, count: u32) -> Result<Reclaimed, Error> {
        let entry = self.channel(channel)?;
        let mut credit = lock(&entry);
        let in_flight = credit.state.in_flight;
        if count > in_flight {
            drop(credit);
            error!(gate = %self.gate, %channel, in_flight, count, "reclaimed more credits than in flight");
            if cfg!(debug_assertions) {
                panic!("reclaimed {count} credits on {channel} with only {in_flight} in flight");
            }
            return Err(Error::CreditUnderflow {
                channel,
                in_flight,
                reclaimed: count,
            });
        }

        let before = credit.state.floating_in_use();
        credit.state.in_flight -= count;
        let freed = before - credit.state.floating_in_use();
        let surplus = credit
            .state
            .floating_idle()
            .saturating_sub(self.cfg.floating_retention);
        let returned = freed.min(surplus);
        credit.state.floating -= returned;
        let restored = count - returned;
        credit.notify(channel, restored);
        drop(credit);

        self.return_floating(returned);
        Ok(Reclaimed { restored, returned })
    }

    /// Returns the number of buffers `channel` may still put in flight.
    pub fn available(&self, channel: ChannelId) -> u32 {
        self.snapshot(channel)
            .map(|state| state.available())
            .unwrap_or(0)
    }

    /// Returns the credit state of `channel`.
    pub fn snapshot(&self, channel: ChannelId) -> Option<CreditState> {
        let entry = self.channel(channel).ok()?;
        let state = lock(&entry).state;
        Some(state)
    }

    /// Returns the number of floating credits not lent to any channel.
    pub fn floating_available(&self) -> u32 {
        self.floating.load(Ordering::Acquire)
    }

    /// Receive every [Grant] issued on `channel` from now on.
    pub fn subscribe(&self, channel: ChannelId) -> Result<mpsc::UnboundedReceiver<Grant>, Error> {
        let entry = self.channel(channel)?;
        let (sender, receiver) = mpsc::unbounded();
        lock(&entry).subscribers.push(sender);
        Ok(receiver)
    }
}

use crate::{ChannelId, GateId};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::net::SocketAddr;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Peer {
    pub peer: String,
}

impl Peer {
    pub fn new(peer: &SocketAddr) -> Self {
        Self {
            peer: peer.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Gate {
    pub gate: u64,
}

impl Gate {
    pub const fn new(gate: GateId) -> Self {
        Self { gate: gate.0 }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Channel {
    pub gate: u64,
    pub channel: u64,
}

impl Channel {
    pub const fn new(gate: GateId, channel: ChannelId) -> Self {
        Self {
            gate: gate.0,
            channel: channel.0,
        }
    }
}

/// Credit accounting shared by every gate of an environment.
#[derive(Clone, Default)]
pub struct CreditMetrics {
    pub granted: Counter,
    pub consumed: Counter,
    pub denied: Counter,
    /// Per-channel and per-gate breakdowns, only kept with detailed metrics.
    pub detailed: Option<DetailedCreditMetrics>,
}

#[derive(Clone, Default)]
pub struct DetailedCreditMetrics {
    pub granted: Family<Channel, Counter>,
    pub consumed: Family<Channel, Counter>,
    pub denied: Family<Channel, Counter>,
    pub floating_available: Family<Gate, Gauge>,
}

impl CreditMetrics {
    pub fn new(registry: &mut Registry, detailed: bool) -> Self {
        let metrics = Self {
            detailed: detailed.then(DetailedCreditMetrics::default),
            ..Default::default()
        };
        registry.register(
            "credits_granted",
            "Total number of credits granted to producers",
            metrics.granted.clone(),
        );
        registry.register(
            "credits_consumed",
            "Total number of credits consumed by buffers in flight",
            metrics.consumed.clone(),
        );
        registry.register(
            "credits_denied",
            "Total number of consume attempts rejected for lack of credit",
            metrics.denied.clone(),
        );
        if let Some(detailed) = &metrics.detailed {
            registry.register(
                "channel_credits_granted",
                "Total number of credits granted per channel",
                detailed.granted.clone(),
            );
            registry.register(
                "channel_credits_consumed",
                "Total number of credits consumed per channel",
                detailed.consumed.clone(),
            );
            registry.register(
                "channel_credits_denied",
                "Total number of consume attempts rejected per channel",
                detailed.denied.clone(),
            );
            registry.register(
                "floating_credits_available",
                "Number of floating credits left in each gate",
                detailed.floating_available.clone(),
            );
        }
        metrics
    }

    pub fn granted(&self, gate: GateId, channel: ChannelId, credits: u32) {
        self.granted.inc_by(credits as u64);
        if let Some(detailed) = &self.detailed {
            detailed
                .granted
                .get_or_create(&Channel::new(gate, channel))
                .inc_by(credits as u64);
        }
    }

    pub fn consumed(&self, gate: GateId, channel: ChannelId, credits: u32) {
        self.consumed.inc_by(credits as u64);
        if let Some(detailed) = &self.detailed {
            detailed
                .consumed
                .get_or_create(&Channel::new(gate, channel))
                .inc_by(credits as u64);
        }
    }

    pub fn denied(&self, gate: GateId, channel: ChannelId) {
        self.denied.inc();
        if let Some(detailed) = &self.detailed {
            detailed
                .denied
                .get_or_create(&Channel::new(gate, channel))
                .inc();
        }
    }

    pub fn floating(&self, gate: GateId, available: u32) {
        if let Some(detailed) = &self.detailed {
            detailed
                .floating_available
                .get_or_create(&Gate::new(gate))
                .set(available as i64);
        }
    }

    /// Drop the series of a channel that is no longer registered.
    pub fn remove_channel(&self, gate: GateId, channel: ChannelId) {
        if let Some(detailed) = &self.detailed {
            let label = Channel::new(gate, channel);
            detailed.granted.remove(&label);
            detailed.consumed.remove(&label);
            detailed.denied.remove(&label);
        }
    }

    /// Drop the series of a closed gate.
    pub fn remove_gate(&self, gate: GateId) {
        if let Some(detailed) = &self.detailed {
            detailed.floating_available.remove(&Gate::new(gate));
        }
    }
}

/// Connection attempts shared by every connector of an environment.
#[derive(Clone, Default)]
pub struct ConnectionMetrics {
    pub attempts: Counter,
    pub retries: Counter,
    pub failures: Counter,
    /// Per-peer breakdowns, only kept with detailed metrics.
    pub detailed: Option<DetailedConnectionMetrics>,
}

#[derive(Clone, Default)]
pub struct DetailedConnectionMetrics {
    pub attempts: Family<Peer, Counter>,
    pub failures: Family<Peer, Counter>,
}

impl ConnectionMetrics {
    pub fn new(registry: &mut Registry, detailed: bool) -> Self {
        let metrics = Self {
            detailed: detailed.then(DetailedConnectionMetrics::default),
            ..Default::default()
        };
        registry.register(
            "connection_attempts",
            "Total number of dials made to peers",
            metrics.attempts.clone(),
        );
        registry.register(
            "connection_retries",
            "Total number of dials made after a failure",
            metrics.retries.clone(),
        );
        registry.register(
            "connection_failures",
            "Total number of connections declared failed",
            metrics.failures.clone(),
        );
        if let Some(detailed) = &metrics.detailed {
            registry.register(
                "peer_connection_attempts",
                "Total number of dials made per peer",
                detailed.attempts.clone(),
            );
            registry.register(
                "peer_connection_failures",
                "Total number of connections declared failed per peer",
                detailed.failures.clone(),
            );
        }
        metrics
    }

    pub fn attempt(&self, peer: &SocketAddr, retry: bool) {
        self.attempts.inc();
        if retry {
            self.retries.inc();
        }
        if let Some(detailed) = &self.detailed {
            detailed.attempts.get_or_create(&Peer::new(peer)).inc();
        }
    }

    pub fn failure(&self, peer: &SocketAddr) {
        self.failures.inc();
        if let Some(detailed) = &self.detailed {
            detailed.failures.get_or_create(&Peer::new(peer)).inc();
        }
    }
}

/// Lifecycle of gates and spilled blocks.
#[derive(Clone, Default)]
pub struct EnvironmentMetrics {
    pub gates_open: Gauge,
    pub spilled: Counter,
    pub restored: Counter,
}

impl EnvironmentMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "gates_open",
            "Number of gates currently open",
            metrics.gates_open.clone(),
        );
        registry.register(
            "spilled_blocks",
            "Total number of buffers written to secondary storage",
            metrics.spilled.clone(),
        );
        registry.register(
            "restored_blocks",
            "Total number of buffers read back from secondary storage",
            metrics.restored.clone(),
        );
        metrics
    }
}

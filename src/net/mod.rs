//! Unreliable message transport seen by a client session.
//!
//! The session only needs "send without blocking" and "poll without
//! blocking"; anything that can do both is a [`NetChannel`].

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::game::world::{WorldError, WorldHandle};
use crate::ws::protocol::{InputMessage, ServerMsg, SnapshotMessage};

/// Non-blocking, possibly lossy, message pipe
pub trait NetChannel {
    type Outgoing;
    type Incoming;

    /// Hand a message to the transport; delivery is not guaranteed
    fn send(&mut self, message: Self::Outgoing) -> Result<(), ChannelError>;

    /// Next delivered message, if any
    fn try_recv(&mut self) -> Option<Self::Incoming>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Channel full")]
    Full,
}

impl From<WorldError> for ChannelError {
    fn from(err: WorldError) -> Self {
        match err {
            WorldError::Busy | WorldError::Full(_) => ChannelError::Full,
            WorldError::Closed => ChannelError::Closed,
        }
    }
}

/// One end of an in-process link
pub struct MemoryChannel<Out, In> {
    tx: mpsc::UnboundedSender<Out>,
    rx: mpsc::UnboundedReceiver<In>,
}

/// Two connected in-process endpoints
pub fn memory_link<A, B>() -> (MemoryChannel<A, B>, MemoryChannel<B, A>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel { tx: a_tx, rx: b_rx },
        MemoryChannel { tx: b_tx, rx: a_rx },
    )
}

impl<Out, In> NetChannel for MemoryChannel<Out, In> {
    type Outgoing = Out;
    type Incoming = In;

    fn send(&mut self, message: Out) -> Result<(), ChannelError> {
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }

    fn try_recv(&mut self) -> Option<In> {
        self.rx.try_recv().ok()
    }
}

/// Per-message probabilities applied by [`LossyChannel`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossProfile {
    pub drop_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
}

impl LossProfile {
    pub fn new(drop_rate: f64, duplicate_rate: f64, reorder_rate: f64) -> Self {
        Self {
            drop_rate: clamp_rate(drop_rate),
            duplicate_rate: clamp_rate(duplicate_rate),
            reorder_rate: clamp_rate(reorder_rate),
        }
    }

    pub fn perfect() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Message counters for a [`LossyChannel`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossStats {
    pub sent_dropped: u64,
    pub sent_duplicated: u64,
    pub received_dropped: u64,
    pub received_duplicated: u64,
    pub received_reordered: u64,
}

/// Wraps a channel and drops, duplicates and reorders traffic in both
/// directions with a seeded RNG, so runs are reproducible.
pub struct LossyChannel<C: NetChannel> {
    inner: C,
    profile: LossProfile,
    rng: ChaCha8Rng,
    delivered: VecDeque<C::Incoming>,
    stats: LossStats,
}

impl<C: NetChannel> LossyChannel<C> {
    pub fn new(inner: C, profile: LossProfile, seed: u64) -> Self {
        Self {
            inner,
            profile,
            rng: ChaCha8Rng::seed_from_u64(seed),
            delivered: VecDeque::new(),
            stats: LossStats::default(),
        }
    }

    pub fn stats(&self) -> LossStats {
        self.stats
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C> NetChannel for LossyChannel<C>
where
    C: NetChannel,
    C::Outgoing: Clone,
    C::Incoming: Clone,
{
    type Outgoing = C::Outgoing;
    type Incoming = C::Incoming;

    fn send(&mut self, message: Self::Outgoing) -> Result<(), ChannelError> {
        if self.rng.gen_bool(self.profile.drop_rate) {
            self.stats.sent_dropped += 1;
            return Ok(());
        }
        if self.rng.gen_bool(self.profile.duplicate_rate) {
            self.stats.sent_duplicated += 1;
            self.inner.send(message.clone())?;
        }
        self.inner.send(message)
    }

    fn try_recv(&mut self) -> Option<Self::Incoming> {
        while let Some(message) = self.inner.try_recv() {
            if self.rng.gen_bool(self.profile.drop_rate) {
                self.stats.received_dropped += 1;
                continue;
            }
            if self.rng.gen_bool(self.profile.duplicate_rate) {
                self.stats.received_duplicated += 1;
                self.delivered.push_back(message.clone());
            }
            if !self.delivered.is_empty() && self.rng.gen_bool(self.profile.reorder_rate) {
                self.stats.received_reordered += 1;
                let before_last = self.delivered.len() - 1;
                self.delivered.insert(before_last, message);
            } else {
                self.delivered.push_back(message);
            }
        }
        self.delivered.pop_front()
    }
}

/// In-process client link to a running world: inputs go through the world's
/// command queue, snapshot batches come from its broadcast.
pub struct LocalLink {
    owner: Uuid,
    world: WorldHandle,
    updates: broadcast::Receiver<ServerMsg>,
    pending: VecDeque<SnapshotMessage>,
}

impl LocalLink {
    pub fn new(owner: Uuid, world: WorldHandle) -> Self {
        let updates = world.subscribe();
        Self {
            owner,
            world,
            updates,
            pending: VecDeque::new(),
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

impl NetChannel for LocalLink {
    type Outgoing = InputMessage;
    type Incoming = SnapshotMessage;

    fn send(&mut self, message: InputMessage) -> Result<(), ChannelError> {
        self.world.send_input(self.owner, message)?;
        Ok(())
    }

    fn try_recv(&mut self) -> Option<SnapshotMessage> {
        loop {
            if let Some(snapshot) = self.pending.pop_front() {
                return Some(snapshot);
            }
            match self.updates.try_recv() {
                Ok(ServerMsg::Snapshot { actors, .. }) => self.pending.extend(actors),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(owner = %self.owner, skipped, "Local link lagged behind world");
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    debug!(owner = %self.owner, "World broadcast closed");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_link_delivers_in_order() {
        let (mut a, mut b) = memory_link::<u32, &'static str>();
        a.send(1).unwrap();
        a.send(2).unwrap();
        b.send("pong").unwrap();

        assert_eq!(b.try_recv(), Some(1));
        assert_eq!(b.try_recv(), Some(2));
        assert_eq!(b.try_recv(), None);
        assert_eq!(a.try_recv(), Some("pong"));
    }

    #[test]
    fn closed_link_reports_an_error() {
        let (mut a, b) = memory_link::<u32, u32>();
        drop(b);
        assert_eq!(a.send(1), Err(ChannelError::Closed));
    }

    #[test]
    fn perfect_profile_is_transparent() {
        let (a, mut b) = memory_link::<u32, u32>();
        let mut lossy = LossyChannel::new(a, LossProfile::perfect(), 1);

        for n in 0..20 {
            b.send(n).unwrap();
        }
        let received: Vec<u32> = std::iter::from_fn(|| lossy.try_recv()).collect();
        assert_eq!(received, (0..20).collect::<Vec<_>>());
        assert_eq!(lossy.stats(), LossStats::default());
    }

    #[test]
    fn total_loss_delivers_nothing() {
        let (a, mut b) = memory_link::<u32, u32>();
        let mut lossy = LossyChannel::new(a, LossProfile::new(1.0, 0.0, 0.0), 7);

        lossy.send(5).unwrap();
        b.send(6).unwrap();

        assert_eq!(b.try_recv(), None);
        assert_eq!(lossy.try_recv(), None);
        assert_eq!(lossy.stats().sent_dropped, 1);
        assert_eq!(lossy.stats().received_dropped, 1);
    }

    #[test]
    fn lossy_runs_are_reproducible() {
        let run = |seed| {
            let (a, mut b) = memory_link::<u32, u32>();
            let mut lossy = LossyChannel::new(a, LossProfile::new(0.2, 0.1, 0.3), seed);
            for n in 0..100 {
                b.send(n).unwrap();
            }
            std::iter::from_fn(|| lossy.try_recv()).collect::<Vec<u32>>()
        };

        let first = run(42);
        assert_eq!(first, run(42));
        assert!(first.len() < 110);
    }

    #[test]
    fn rates_are_clamped() {
        let profile = LossProfile::new(2.0, -1.0, f64::NAN);
        assert_eq!(profile, LossProfile::new(1.0, 0.0, 0.0));
    }
}
